/* HID transport core: report framing/reassembly, the OS HID collaborator,
 * and the session-level transport (INIT handshake, send/receive, the raw
 * Ping/Apdu/Wink/Lock commands). Everything above this module (`token`,
 * `discovery`) talks to a `Session`, never to raw reports. */

pub mod device_io;
pub mod report;
pub mod transport;

pub use device_io::{DeviceDescriptor, HidDevice, HidapiDevice};
pub use transport::Session;
