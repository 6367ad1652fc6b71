/* Static (VID, PID) -> human-readable device name lookup, extensible at
 * runtime. Unlike the teacher's `.device` file database (which keys on
 * bus type + vid + pid because the same mouse can show up over USB or
 * Bluetooth), FIDO U2F authenticators are USB-HID only, so the key here
 * is just (vid, pid). */

use std::collections::HashMap;
use std::sync::OnceLock;
use std::sync::RwLock;

/// Known (VID, PID) -> name pairs, seeded at compile time. Extend at
/// runtime with `register_device_name`.
const BUILTIN_DEVICES: &[(u16, u16, &str)] = &[
    (0x1050, 0x0120, "Yubico YubiKey NEO"),
    (0x1050, 0x0200, "Yubico YubiKey U2F"),
    (0x1050, 0x0402, "Yubico YubiKey 4"),
    (0x1050, 0x0407, "Yubico YubiKey 4 Nano"),
    (0x1050, 0x0410, "Yubico Security Key"),
    (0x096E, 0x0850, "Feitian ePass FIDO"),
    (0x2581, 0xF1D0, "Plug-Up U2F Security Key"),
    (0x18D1, 0x5026, "Google Titan Security Key"),
    (0x20A0, 0x4287, "Nitrokey FIDO U2F"),
];

fn runtime_overrides() -> &'static RwLock<HashMap<(u16, u16), String>> {
    static OVERRIDES: OnceLock<RwLock<HashMap<(u16, u16), String>>> = OnceLock::new();
    OVERRIDES.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Register or override a device name for a given VID/PID, for devices
/// not in the built-in table. Downstream crates can call this at
/// startup to teach the library about additional hardware.
pub fn register_device_name(vid: u16, pid: u16, name: impl Into<String>) {
    runtime_overrides()
        .write()
        .expect("device name registry poisoned")
        .insert((vid, pid), name.into());
}

/// Look up a human-readable name for a (VID, PID) pair. Returns `None`
/// for unknown devices, per spec §6 ("unknown devices expose a null
/// name").
pub fn lookup(vid: u16, pid: u16) -> Option<String> {
    if let Some(name) = runtime_overrides()
        .read()
        .expect("device name registry poisoned")
        .get(&(vid, pid))
    {
        return Some(name.clone());
    }

    BUILTIN_DEVICES
        .iter()
        .find(|(v, p, _)| *v == vid && *p == pid)
        .map(|(_, _, name)| name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_device_resolves() {
        assert_eq!(lookup(0x1050, 0x0410), Some("Yubico Security Key".into()));
    }

    #[test]
    fn unknown_device_is_none() {
        assert_eq!(lookup(0xFFFF, 0xFFFF), None);
    }

    #[test]
    fn runtime_registration_overrides_lookup() {
        register_device_name(0xABCD, 0x1234, "Test Authenticator");
        assert_eq!(lookup(0xABCD, 0x1234), Some("Test Authenticator".into()));
    }
}
