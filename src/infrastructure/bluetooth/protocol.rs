//! CARTA Protocol
//!
//! Frame layouts and UUIDs for talking to the CARTA atomizer. Command frames
//! are exactly 12 bytes; telemetry is at least 12, with the closing marker on
//! the last byte:
//!
//! ```text
//! [0]     : Marker (command opcode outbound, 0xBB inbound)
//! [1]     : 0x00
//! [2]     : Frame family (0x0C session/mode, 0x0A hit counters)
//! [3-10]  : Payload
//! [11]    : Marker again (last byte of longer telemetry)
//! ```

use crate::domain::error::FrameError;
use crate::domain::models::{AtomizerMode, TelemetryFrame};
use uuid::Uuid;

/// CARTA BLE Service UUID
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x1011123e_8535_b5a0_7140_a304d2495cb7);

/// Read Characteristic UUID - telemetry is delivered here once notifications are on
pub const READ_CHAR_UUID: Uuid = Uuid::from_u128(0x1011123e_8535_b5a0_7140_a304d2495cb8);

/// Write Characteristic UUID - where command frames are sent
pub const WRITE_CHAR_UUID: Uuid = Uuid::from_u128(0x1011123e_8535_b5a0_7140_a304d2495cb9);

/// Notify Characteristic UUID
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0x1011123e_8535_b5a0_7140_a304d2495cba);

/// Advertised name of the device we auto-connect to
pub const DEVICE_NAME: &str = "CARTA";

pub const FRAME_LEN: usize = 12;

pub const OPCODE_SYNC_TIME: u8 = 0xEE;
pub const OPCODE_SESSION: u8 = 0xCC;

const TELEMETRY_MARKER: u8 = 0xBB;
const FAMILY_SESSION: u8 = 0x0C;
const FAMILY_COUNTS: u8 = 0x0A;
const MODE_DAB: u8 = 0x55;
const MODE_FLOWER: u8 = 0xA5;
/// Byte 9 of a start frame
const START_FLAG: u8 = 0x55;

const IDLE_CONCENTRATE: [u8; FRAME_LEN] = [
    0xBB, 0x00, 0x0C, 0x55, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xBB,
];
const IDLE_FLOWER: [u8; FRAME_LEN] = [
    0xBB, 0x00, 0x0C, 0xA5, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xBB,
];

/// An outbound command frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFrame([u8; FRAME_LEN]);

impl CommandFrame {
    fn with_payload(opcode: u8, payload: [u8; 8]) -> Self {
        let mut bytes = [0u8; FRAME_LEN];
        bytes[0] = opcode;
        bytes[2] = FAMILY_SESSION;
        bytes[3..11].copy_from_slice(&payload);
        bytes[11] = opcode;
        Self(bytes)
    }

    pub fn sync_time() -> Self {
        Self::with_payload(OPCODE_SYNC_TIME, [0; 8])
    }

    pub fn start_session(temp_index: u8, seconds: u8) -> Self {
        Self::with_payload(
            OPCODE_SESSION,
            [temp_index, 0, 0, seconds, 0, 0, START_FLAG, 0],
        )
    }

    pub fn end_session() -> Self {
        Self::with_payload(OPCODE_SESSION, [0; 8])
    }

    pub fn opcode(&self) -> u8 {
        self.0[0]
    }

    pub fn as_bytes(&self) -> &[u8; FRAME_LEN] {
        &self.0
    }
}

pub fn encode_sync_time() -> [u8; FRAME_LEN] {
    *CommandFrame::sync_time().as_bytes()
}

pub fn encode_start_session(temp_index: u8, seconds: u8) -> [u8; FRAME_LEN] {
    *CommandFrame::start_session(temp_index, seconds).as_bytes()
}

pub fn encode_end_session() -> [u8; FRAME_LEN] {
    *CommandFrame::end_session().as_bytes()
}

/// Build a start frame from a preset index and an "M:SS" duration label.
///
/// Both values travel in a single byte; anything above 255 is rejected rather
/// than truncated.
pub fn start_session_frame(temp_index: usize, duration: &str) -> Result<CommandFrame, FrameError> {
    let temp = u8::try_from(temp_index).map_err(|_| FrameError::TempIndexOutOfRange(temp_index))?;
    let seconds = parse_duration(duration)?;
    let seconds = u8::try_from(seconds).map_err(|_| FrameError::DurationOutOfRange { seconds })?;
    Ok(CommandFrame::start_session(temp, seconds))
}

/// Convert an "M:SS" label to total seconds
pub fn parse_duration(label: &str) -> Result<u32, FrameError> {
    let invalid = || FrameError::InvalidDuration(label.to_string());

    let (minutes, seconds) = label.trim().split_once(':').ok_or_else(invalid)?;
    let minutes: u32 = minutes.parse().map_err(|_| invalid())?;
    let seconds: u32 = seconds.parse().map_err(|_| invalid())?;
    if seconds >= 60 {
        return Err(invalid());
    }

    minutes
        .checked_mul(60)
        .and_then(|m| m.checked_add(seconds))
        .ok_or_else(invalid)
}

/// Render a countdown as "M:SS"
pub fn format_remaining(seconds: f32) -> String {
    let total = seconds.max(0.0).round() as u32;
    format!("{}:{:02}", total / 60, total % 60)
}

/// Lower-case hex rendering for diagnostics
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Classify an inbound frame. Total: every input maps to exactly one variant.
///
/// Frames shorter than 12 bytes are never classified. Longer ones are read
/// by prefix, with the closing marker taken from the last byte.
pub fn decode(bytes: &[u8]) -> TelemetryFrame {
    let Some(&last) = bytes.last().filter(|_| bytes.len() >= FRAME_LEN) else {
        return TelemetryFrame::Unrecognized(bytes.to_vec());
    };

    if bytes == IDLE_CONCENTRATE.as_slice() {
        return TelemetryFrame::IdleConcentrate;
    }
    if bytes == IDLE_FLOWER.as_slice() {
        return TelemetryFrame::IdleFlower;
    }

    let frame = bytes;
    let framed = frame[0] == TELEMETRY_MARKER && frame[1] == 0x00 && last == TELEMETRY_MARKER;
    if !framed {
        return TelemetryFrame::Unrecognized(bytes.to_vec());
    }

    match frame[2] {
        FAMILY_COUNTS => TelemetryFrame::HitCounts {
            wax: u16::from_be_bytes([frame[3], frame[4]]),
            herb: u16::from_be_bytes([frame[5], frame[6]]),
        },
        FAMILY_SESSION => TelemetryFrame::ActiveSession {
            mode: match frame[3] {
                MODE_DAB => Some(AtomizerMode::Dab),
                MODE_FLOWER => Some(AtomizerMode::Flower),
                _ => None,
            },
            temp_index: frame[4],
            seconds_remaining: frame[6],
        },
        _ => TelemetryFrame::Unrecognized(bytes.to_vec()),
    }
}

/// Encode a telemetry frame the way the device sends it
pub fn encode_telemetry(frame: &TelemetryFrame) -> Vec<u8> {
    let mut bytes = vec![0u8; FRAME_LEN];
    bytes[0] = TELEMETRY_MARKER;
    bytes[11] = TELEMETRY_MARKER;
    match frame {
        TelemetryFrame::IdleConcentrate => return IDLE_CONCENTRATE.to_vec(),
        TelemetryFrame::IdleFlower => return IDLE_FLOWER.to_vec(),
        TelemetryFrame::HitCounts { wax, herb } => {
            bytes[2] = FAMILY_COUNTS;
            bytes[3..5].copy_from_slice(&wax.to_be_bytes());
            bytes[5..7].copy_from_slice(&herb.to_be_bytes());
        }
        TelemetryFrame::ActiveSession {
            mode,
            temp_index,
            seconds_remaining,
        } => {
            bytes[2] = FAMILY_SESSION;
            bytes[3] = match mode {
                Some(AtomizerMode::Dab) => MODE_DAB,
                Some(AtomizerMode::Flower) => MODE_FLOWER,
                None => 0x00,
            };
            bytes[4] = *temp_index;
            bytes[6] = *seconds_remaining;
        }
        TelemetryFrame::Unrecognized(raw) => return raw.clone(),
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_time_frame() {
        assert_eq!(
            encode_sync_time(),
            [0xEE, 0x00, 0x0C, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xEE]
        );
    }

    #[test]
    fn test_start_session_frame() {
        assert_eq!(
            encode_start_session(2, 30),
            [0xCC, 0, 0x0C, 2, 0, 0, 30, 0, 0, 0x55, 0, 0xCC]
        );
    }

    #[test]
    fn test_end_session_frame() {
        assert_eq!(
            encode_end_session(),
            [0xCC, 0x00, 0x0C, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xCC]
        );
    }

    #[test]
    fn test_first_and_last_byte_match_opcode() {
        for frame in [
            CommandFrame::sync_time(),
            CommandFrame::start_session(7, 255),
            CommandFrame::end_session(),
        ] {
            let bytes = frame.as_bytes();
            assert_eq!(bytes[0], frame.opcode());
            assert_eq!(bytes[11], frame.opcode());
        }
    }

    #[test]
    fn test_start_session_from_label() {
        let frame = start_session_frame(2, "0:30").unwrap();
        assert_eq!(frame.as_bytes(), &encode_start_session(2, 30));

        let frame = start_session_frame(1, "4:15").unwrap();
        assert_eq!(frame.as_bytes()[6], 255);
    }

    #[test]
    fn test_long_duration_rejected() {
        assert_eq!(
            start_session_frame(1, "4:16"),
            Err(FrameError::DurationOutOfRange { seconds: 256 })
        );
        assert_eq!(
            start_session_frame(300, "0:30"),
            Err(FrameError::TempIndexOutOfRange(300))
        );
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1:30"), Ok(90));
        assert_eq!(parse_duration("0:05"), Ok(5));
        assert!(parse_duration("90").is_err());
        assert!(parse_duration("a:10").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("1:75").is_err());
    }

    #[test]
    fn test_format_remaining() {
        assert_eq!(format_remaining(0.0), "0:00");
        assert_eq!(format_remaining(9.0), "0:09");
        assert_eq!(format_remaining(75.0), "1:15");
        assert_eq!(format_remaining(-3.0), "0:00");
        assert_eq!(format_remaining(59.6), "1:00");
        assert_eq!(format_remaining(119.5), "2:00");
        assert_eq!(format_remaining(61.4), "1:01");
    }

    #[test]
    fn test_decode_idle_frames() {
        assert_eq!(
            decode(&[0xBB, 0x00, 0x0C, 0x55, 0, 0, 0, 0, 0, 0, 0, 0xBB]),
            TelemetryFrame::IdleConcentrate
        );
        assert_eq!(
            decode(&[0xBB, 0x00, 0x0C, 0xA5, 0, 0, 0, 0, 0, 0, 0, 0xBB]),
            TelemetryFrame::IdleFlower
        );
    }

    #[test]
    fn test_decode_hit_counts() {
        assert_eq!(
            decode(&[0xBB, 0x00, 0x0A, 0x00, 0x05, 0x00, 0x03, 0, 0, 0, 0, 0xBB]),
            TelemetryFrame::HitCounts { wax: 5, herb: 3 }
        );
        assert_eq!(
            decode(&[0xBB, 0x00, 0x0A, 0x01, 0x02, 0x10, 0x00, 0, 0, 0, 0, 0xBB]),
            TelemetryFrame::HitCounts {
                wax: 258,
                herb: 4096
            }
        );
    }

    #[test]
    fn test_decode_active_session() {
        assert_eq!(
            decode(&[0xBB, 0x00, 0x0C, 0x55, 0x02, 0x00, 0x1E, 0, 0, 0, 0, 0xBB]),
            TelemetryFrame::ActiveSession {
                mode: Some(AtomizerMode::Dab),
                temp_index: 2,
                seconds_remaining: 30,
            }
        );
        assert_eq!(
            decode(&[0xBB, 0x00, 0x0C, 0x42, 0x03, 0x00, 0x10, 0, 0, 0, 0, 0xBB]),
            TelemetryFrame::ActiveSession {
                mode: None,
                temp_index: 3,
                seconds_remaining: 16,
            }
        );
    }

    #[test]
    fn test_decode_longer_frames() {
        assert_eq!(
            decode(&[0xBB, 0x00, 0x0A, 0x00, 0x05, 0x00, 0x03, 0, 0, 0, 0, 0, 0xBB]),
            TelemetryFrame::HitCounts { wax: 5, herb: 3 }
        );
        assert_eq!(
            decode(&[0xBB, 0x00, 0x0C, 0xA5, 0x04, 0x00, 0x3C, 0, 0, 0, 0, 0, 0, 0xBB]),
            TelemetryFrame::ActiveSession {
                mode: Some(AtomizerMode::Flower),
                temp_index: 4,
                seconds_remaining: 60,
            }
        );
        // idle frames only match at their exact length
        assert_eq!(
            decode(&[0xBB, 0x00, 0x0C, 0x55, 0, 0, 0, 0, 0, 0, 0, 0, 0xBB]),
            TelemetryFrame::ActiveSession {
                mode: Some(AtomizerMode::Dab),
                temp_index: 0,
                seconds_remaining: 0,
            }
        );

        let wrong_suffix = [0xBB, 0x00, 0x0A, 0x00, 0x05, 0x00, 0x03, 0, 0, 0, 0, 0xBB, 0x00];
        assert!(matches!(decode(&wrong_suffix), TelemetryFrame::Unrecognized(_)));
    }

    #[test]
    fn test_decode_is_total() {
        for len in 0..=16 {
            for fill in [0x00u8, 0xBB, 0xFF] {
                let bytes = vec![fill; len];
                let _ = decode(&bytes);
            }
        }

        let short = [0xBB, 0x00, 0x0A, 0x00, 0x05];
        assert_eq!(decode(&short), TelemetryFrame::Unrecognized(short.to_vec()));

        let wrong_suffix = [0xBB, 0x00, 0x0A, 0x00, 0x05, 0x00, 0x03, 0, 0, 0, 0, 0xCC];
        assert!(matches!(decode(&wrong_suffix), TelemetryFrame::Unrecognized(_)));

        let sync_echo = encode_sync_time();
        assert!(matches!(decode(&sync_echo), TelemetryFrame::Unrecognized(_)));
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0xBB, 0x00, 0x0C]), "bb000c");
    }
}
