/* HID report framing: splitting a logical message into 64-byte initial
 * + continuation frames, and reassembling a stream of received frames
 * back into a logical message.
 *
 * This module only knows about the generic U2FHID envelope (channel id,
 * command/seq byte, length, payload). It has no idea what an APDU or a
 * U2F instruction is — that lives in `token`. */

use crate::buffer::ByteBuffer;
use crate::constants::{command, COMMAND_FLAG, HID_REPORT_SIZE};
use crate::error::{ErrorKind, FidoError};

// 64 - 4 (channel) - 1 (type) - 2 (length)
const INITIAL_PAYLOAD_MAX: usize = HID_REPORT_SIZE - 7;
// 64 - 4 (channel) - 1 (seq)
const CONTINUATION_PAYLOAD_MAX: usize = HID_REPORT_SIZE - 5;

/// Split `payload` into one initial frame and as many continuation
/// frames as needed, addressed to `channel` and carrying `command` in
/// the initial frame's type byte. Every frame is exactly
/// `HID_REPORT_SIZE` bytes, zero-padded.
pub fn build_frames(channel: u32, command: u8, payload: &[u8]) -> Vec<[u8; HID_REPORT_SIZE]> {
    let mut frames = Vec::new();

    let first_len = payload.len().min(INITIAL_PAYLOAD_MAX);
    let mut buf = ByteBuffer::with_capacity(HID_REPORT_SIZE);
    buf.extend(&channel.to_be_bytes());
    buf.push(command | COMMAND_FLAG);
    buf.push_u16_be(payload.len() as u16);
    buf.extend(&payload[..first_len]);
    buf.zero_pad_to(HID_REPORT_SIZE);
    frames.push(to_array(buf.into_vec()));

    let mut sent = first_len;
    let mut seq: u8 = 0;
    while sent < payload.len() {
        let chunk_len = (payload.len() - sent).min(CONTINUATION_PAYLOAD_MAX);
        let mut buf = ByteBuffer::with_capacity(HID_REPORT_SIZE);
        buf.extend(&channel.to_be_bytes());
        buf.push(seq & 0x7F);
        buf.extend(&payload[sent..sent + chunk_len]);
        buf.zero_pad_to(HID_REPORT_SIZE);
        frames.push(to_array(buf.into_vec()));

        sent += chunk_len;
        seq = seq.wrapping_add(1);
    }

    frames
}

fn to_array(v: Vec<u8>) -> [u8; HID_REPORT_SIZE] {
    let mut arr = [0u8; HID_REPORT_SIZE];
    let n = v.len().min(HID_REPORT_SIZE);
    arr[..n].copy_from_slice(&v[..n]);
    arr
}

// Result of feeding one raw HID report into a Reassembler. Ignored: wrong
// channel or too short, sequence state unchanged. NeedMore: accepted, not
// complete. Done: complete message. ErrorFrame: device sent an ERROR
// frame, byte is the device error code, mapped to an ErrorKind by the caller.
#[derive(Debug)]
pub enum FeedOutcome {
    Ignored,
    NeedMore,
    Done(Vec<u8>),
    ErrorFrame(u8),
}

enum State {
    AwaitingInitial,
    AwaitingContinuation {
        expected_len: usize,
        received: Vec<u8>,
        next_seq: u8,
    },
    Done,
}

// Reassembles a stream of 64-byte HID reports addressed to one channel
// back into a logical message, enforcing the channel filter and
// sequence-number invariants.
pub struct Reassembler {
    channel: u32,
    expected_command: u8,
    state: State,
}

impl Reassembler {
    pub fn new(channel: u32, expected_command: u8) -> Self {
        Self {
            channel,
            expected_command,
            state: State::AwaitingInitial,
        }
    }

    // Reports under 5 bytes and those addressed to a different channel
    // are discarded.
    pub fn feed(&mut self, frame: &[u8]) -> Result<FeedOutcome, FidoError> {
        if matches!(self.state, State::Done) {
            return Ok(FeedOutcome::Ignored);
        }

        if frame.len() < 5 {
            return Ok(FeedOutcome::Ignored);
        }

        let channel = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        if channel != self.channel {
            return Ok(FeedOutcome::Ignored);
        }

        let type_or_seq = frame[4];

        match &mut self.state {
            State::AwaitingInitial => {
                if type_or_seq == (command::ERROR | COMMAND_FLAG) {
                    let code = frame.get(7).copied().unwrap_or(0);
                    self.state = State::Done;
                    return Ok(FeedOutcome::ErrorFrame(code));
                }

                let expected = self.expected_command | COMMAND_FLAG;
                if type_or_seq != expected {
                    return Err(FidoError::new(
                        ErrorKind::ProtocolViolation,
                        format!(
                            "unexpected initial frame command 0x{type_or_seq:02X}, expected 0x{expected:02X}"
                        ),
                    ));
                }

                if frame.len() < 7 {
                    return Err(FidoError::new(
                        ErrorKind::ProtocolViolation,
                        "initial frame too short to carry a length field",
                    ));
                }

                let expected_len = u16::from_be_bytes([frame[5], frame[6]]) as usize;
                let available = &frame[7..];
                let take = expected_len.min(available.len()).min(INITIAL_PAYLOAD_MAX);
                let mut received = Vec::with_capacity(expected_len);
                received.extend_from_slice(&available[..take]);

                if received.len() >= expected_len {
                    self.state = State::Done;
                    return Ok(FeedOutcome::Done(received));
                }

                self.state = State::AwaitingContinuation {
                    expected_len,
                    received,
                    next_seq: 0,
                };
                Ok(FeedOutcome::NeedMore)
            }
            State::AwaitingContinuation {
                expected_len,
                received,
                next_seq,
            } => {
                if type_or_seq == (command::ERROR | COMMAND_FLAG) {
                    let code = frame.get(7).copied().unwrap_or(0);
                    self.state = State::Done;
                    return Ok(FeedOutcome::ErrorFrame(code));
                }

                if type_or_seq & COMMAND_FLAG != 0 {
                    return Err(FidoError::new(
                        ErrorKind::ProtocolViolation,
                        format!(
                            "unexpected command frame 0x{type_or_seq:02X} during reassembly"
                        ),
                    ));
                }

                if type_or_seq != *next_seq {
                    return Err(FidoError::new(
                        ErrorKind::ProtocolViolation,
                        format!(
                            "continuation sequence mismatch: expected {next_seq}, got {type_or_seq}"
                        ),
                    ));
                }

                let remaining = *expected_len - received.len();
                let available = &frame[5..];
                let take = remaining.min(available.len()).min(CONTINUATION_PAYLOAD_MAX);
                received.extend_from_slice(&available[..take]);
                *next_seq = next_seq.wrapping_add(1);

                if received.len() >= *expected_len {
                    let out = std::mem::take(received);
                    self.state = State::Done;
                    return Ok(FeedOutcome::Done(out));
                }

                Ok(FeedOutcome::NeedMore)
            }
            State::Done => Ok(FeedOutcome::Ignored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_count(n: usize) -> usize {
        if n <= INITIAL_PAYLOAD_MAX {
            1
        } else {
            1 + (n - INITIAL_PAYLOAD_MAX).div_ceil(CONTINUATION_PAYLOAD_MAX)
        }
    }

    #[test]
    fn fragment_count_matches_formula() {
        for n in [0usize, 1, 57, 58, 116, 7609] {
            let frames = build_frames(0x1234_5678, command::PING, &vec![0xABu8; n]);
            assert_eq!(frames.len(), frame_count(n), "n={n}");
        }
    }

    #[test]
    fn round_trip_various_lengths() {
        for n in [0usize, 1, 56, 57, 58, 100, 200, 7609] {
            let payload: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
            let frames = build_frames(0xAABBCCDD, command::PING, &payload);

            let mut reasm = Reassembler::new(0xAABBCCDD, command::PING);
            let mut result = None;
            for frame in &frames {
                match reasm.feed(frame).unwrap() {
                    FeedOutcome::Done(bytes) => {
                        result = Some(bytes);
                        break;
                    }
                    FeedOutcome::NeedMore => {}
                    other => panic!("unexpected outcome for n={n}: {other:?}"),
                }
            }
            assert_eq!(result.unwrap(), payload, "n={n}");
        }
    }

    #[test]
    fn fragmented_ping_100_bytes_matches_spec_example() {
        let payload = vec![0xABu8; 100];
        let frames = build_frames(0x0102_0304, command::PING, &payload);
        assert_eq!(frames.len(), 2);

        assert_eq!(&frames[0][0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(frames[0][4], command::PING | 0x80);
        assert_eq!(&frames[0][5..7], &[0x00, 0x64]);
        assert!(frames[0][7..64].iter().all(|&b| b == 0xAB));

        assert_eq!(&frames[1][0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(frames[1][4], 0x00);
        assert!(frames[1][5..5 + 43].iter().all(|&b| b == 0xAB));
        assert!(frames[1][5 + 43..].iter().all(|&b| b == 0x00));
    }

    #[test]
    fn channel_filter_ignores_without_advancing_state() {
        let payload = vec![0x11u8; 120];
        let frames = build_frames(0x1111_1111, command::PING, &payload);

        let mut reasm = Reassembler::new(0x1111_1111, command::PING);
        // Feed the first frame from a foreign channel before the real one.
        let mut foreign = frames[0];
        foreign[0..4].copy_from_slice(&0x2222_2222u32.to_be_bytes());
        assert!(matches!(reasm.feed(&foreign).unwrap(), FeedOutcome::Ignored));

        // The real initial frame should still be accepted as the first frame.
        assert!(matches!(
            reasm.feed(&frames[0]).unwrap(),
            FeedOutcome::NeedMore
        ));
        assert!(matches!(
            reasm.feed(&frames[1]).unwrap(),
            FeedOutcome::Done(_)
        ));
    }

    #[test]
    fn sequence_gap_is_protocol_violation() {
        let payload = vec![0x22u8; 200];
        let frames = build_frames(0x5555_5555, command::PING, &payload);
        let mut reasm = Reassembler::new(0x5555_5555, command::PING);
        reasm.feed(&frames[0]).unwrap();
        // Skip frames[1] (seq 0) and feed frames[2] (seq 1) directly.
        let err = reasm.feed(&frames[2]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
    }

    #[test]
    fn error_frame_mid_reassembly_is_reported() {
        let payload = vec![0x33u8; 200];
        let frames = build_frames(0x6666_6666, command::PING, &payload);
        let mut reasm = Reassembler::new(0x6666_6666, command::PING);
        reasm.feed(&frames[0]).unwrap();

        let mut error_frame = [0u8; HID_REPORT_SIZE];
        error_frame[0..4].copy_from_slice(&0x6666_6666u32.to_be_bytes());
        error_frame[4] = command::ERROR | 0x80;
        error_frame[5] = 0x00;
        error_frame[6] = 0x01;
        error_frame[7] = crate::constants::device_error::CHANNEL_BUSY;

        match reasm.feed(&error_frame).unwrap() {
            FeedOutcome::ErrorFrame(code) => {
                assert_eq!(code, crate::constants::device_error::CHANNEL_BUSY)
            }
            other => panic!("expected ErrorFrame, got {other:?}"),
        }
    }
}
