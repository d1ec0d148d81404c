// DDSM115 / DDSM210 serial protocol codec
//
// Every frame is exactly 10 bytes, no header or length prefix:
// [ID, CMD, DATA0..DATA6, CRC8]
// CRC8 is CRC-8/MAXIM (reflected poly 0x8C, init 0x00) over the first 9 bytes.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

pub const FRAME_LEN: usize = 10;
pub const PAYLOAD_LEN: usize = 7;

/// Reflected form of x^8 + x^5 + x^4 + 1
const CRC8_POLY: u8 = 0x8C;

/// DDSM115 velocity limit (rpm)
pub const MAX_RPM: f32 = 143.0;
/// Current limit (A), sent in 0.01 A units
pub const MAX_CURRENT: f32 = 8.0;
/// Full-turn scale of the 16-bit position field
pub const POSITION_SCALE: f32 = 32767.0;
/// Highest id accepted by the id-assignment frame
pub const MAX_DEVICE_ID: u8 = 10;

pub type Frame = [u8; FRAME_LEN];

/// Codec-level failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Checksum mismatch: computed 0x{computed:02X}, received 0x{received:02X}")]
    ChecksumMismatch { computed: u8, received: u8 },

    #[error("Expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Response from device {actual}, expected {expected}")]
    DeviceIdMismatch { expected: u8, actual: u8 },

    #[error("{field} does not fit in a byte")]
    FieldOutOfRange { field: &'static str },
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// DDSM115 command codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandCode {
    EmergencyStop = 0x05,
    ModeSwitch = 0xA0,
    Drive = 0x64, // velocity, current and position share this; the mode decides
    FeedbackRequest = 0x74,
    SetDeviceId = 0x53,
    QueryId = 0xAA,
    Brake = 0x90,
    ReleaseBrake = 0x91,
    Enable = 0x88,
    Disable = 0x93,
    PositionCalibration = 0x94,
}

impl From<CommandCode> for u8 {
    fn from(code: CommandCode) -> Self {
        code as u8
    }
}

/// Control loop the motor is running
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    Current = 0x01,
    Velocity = 0x02,
    Position = 0x03,
}

impl ControlMode {
    pub fn from_byte(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Current),
            0x02 => Some(Self::Velocity),
            0x03 => Some(Self::Position),
            _ => None,
        }
    }
}

/// CRC-8/MAXIM-DOW
pub fn crc8(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |crc, &byte| {
        let mut crc = crc ^ byte;
        for _ in 0..8 {
            crc = if crc & 0x01 != 0 {
                (crc >> 1) ^ CRC8_POLY
            } else {
                crc >> 1
            };
        }
        crc
    })
}

/// Append the checksum to 9 bytes of frame body
pub fn seal(body: [u8; FRAME_LEN - 1]) -> Frame {
    let mut frame = [0u8; FRAME_LEN];
    frame[..FRAME_LEN - 1].copy_from_slice(&body);
    frame[FRAME_LEN - 1] = crc8(&body);
    frame
}

/// Build a checksummed frame; a short payload is zero-padded.
pub fn encode<I, C>(device_id: I, command: C, payload: &[u8]) -> Result<Frame>
where
    I: TryInto<u8>,
    C: TryInto<u8>,
{
    let device_id = device_id
        .try_into()
        .map_err(|_| ProtocolError::FieldOutOfRange { field: "device id" })?;
    let command = command
        .try_into()
        .map_err(|_| ProtocolError::FieldOutOfRange {
            field: "command code",
        })?;
    Packet::new(device_id, command, payload).map(|packet| packet.to_bytes())
}

/// A decoded frame. In responses `command` carries the motor's active mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Packet {
    pub device_id: u8,
    pub command: u8,
    pub payload: [u8; PAYLOAD_LEN],
}

impl Packet {
    pub fn new(device_id: u8, command: impl Into<u8>, payload: &[u8]) -> Result<Self> {
        if payload.len() > PAYLOAD_LEN {
            return Err(ProtocolError::InvalidLength {
                expected: PAYLOAD_LEN,
                actual: payload.len(),
            });
        }
        let mut data = [0u8; PAYLOAD_LEN];
        data[..payload.len()].copy_from_slice(payload);
        Ok(Self {
            device_id,
            command: command.into(),
            payload: data,
        })
    }

    pub fn to_bytes(&self) -> Frame {
        let mut body = [0u8; FRAME_LEN - 1];
        body[0] = self.device_id;
        body[1] = self.command;
        body[2..].copy_from_slice(&self.payload);
        seal(body)
    }

    /// Parse and verify a 10-byte frame, optionally requiring a device id
    pub fn decode(bytes: &[u8], expected_id: Option<u8>) -> Result<Self> {
        if bytes.len() != FRAME_LEN {
            return Err(ProtocolError::InvalidLength {
                expected: FRAME_LEN,
                actual: bytes.len(),
            });
        }

        let computed = crc8(&bytes[..FRAME_LEN - 1]);
        let received = bytes[FRAME_LEN - 1];
        if computed != received {
            return Err(ProtocolError::ChecksumMismatch { computed, received });
        }

        if let Some(expected) = expected_id {
            if bytes[0] != expected {
                return Err(ProtocolError::DeviceIdMismatch {
                    expected,
                    actual: bytes[0],
                });
            }
        }

        let mut payload = [0u8; PAYLOAD_LEN];
        payload.copy_from_slice(&bytes[2..FRAME_LEN - 1]);
        Ok(Self {
            device_id: bytes[0],
            command: bytes[1],
            payload,
        })
    }
}

// === Value encoding (bytes 2-3 of the frame, i.e. payload[0..2]) ===

fn payload_with(word: [u8; 2]) -> [u8; PAYLOAD_LEN] {
    let mut payload = [0u8; PAYLOAD_LEN];
    payload[..2].copy_from_slice(&word);
    payload
}

/// Signed rpm, clamped to ±143
pub fn velocity_payload(rpm: f32) -> [u8; PAYLOAD_LEN] {
    let rpm = rpm.clamp(-MAX_RPM, MAX_RPM) as i16;
    payload_with(rpm.to_be_bytes())
}

/// Signed current in 0.01 A units, clamped to ±8 A
pub fn current_payload(amps: f32) -> [u8; PAYLOAD_LEN] {
    let raw = (amps.clamp(-MAX_CURRENT, MAX_CURRENT) * 100.0) as i16;
    payload_with(raw.to_be_bytes())
}

/// Unsigned 0..=32767 for 0..=360 degrees
pub fn position_payload(degrees: f32) -> [u8; PAYLOAD_LEN] {
    let raw = (degrees.clamp(0.0, 360.0) / 360.0 * POSITION_SCALE) as u16;
    payload_with(raw.to_be_bytes())
}

/// Mode switch: ID A0 00 00 00 00 00 00 00 MODE
///
/// The firmware expects the mode value in the last byte, where other frames
/// carry the checksum.
pub fn mode_frame(device_id: u8, mode: ControlMode) -> Frame {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = device_id;
    frame[1] = CommandCode::ModeSwitch as u8;
    frame[FRAME_LEN - 1] = mode as u8;
    frame
}

/// Id assignment: AA 55 53 NEW_ID 00 00 00 00 00 00
///
/// Addressed to whichever single motor is on the bus.
pub fn set_id_frame(new_id: u8) -> Frame {
    let mut frame = [0u8; FRAME_LEN];
    frame[0] = CommandCode::QueryId as u8;
    frame[1] = 0x55;
    frame[2] = CommandCode::SetDeviceId as u8;
    frame[3] = new_id;
    frame
}

// === Feedback ===

/// Which of the two reply layouts a response uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseLayout {
    /// Reply to drive/enable/etc: u16 position in bytes 6-7, no temperature
    Standard,
    /// Reply to 0x74: temperature in byte 6, u8 position in byte 7
    FeedbackRequest,
}

impl ResponseLayout {
    /// Layout of the reply to the given command code
    pub fn for_command(code: Option<u8>) -> Self {
        match code {
            Some(c) if c == CommandCode::FeedbackRequest as u8 => Self::FeedbackRequest,
            _ => Self::Standard,
        }
    }
}

/// Telemetry from one motor
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Feedback {
    /// rpm
    pub velocity: f32,
    /// degrees, 0-360
    pub position: f32,
    /// amps
    pub torque: f32,
    /// °C, 0 when the layout has no temperature
    pub temperature: u8,
    /// Mode reported in byte 1, if it is a known value
    pub mode: Option<ControlMode>,
    pub error_code: u8,
    pub raw: Frame,
    pub timestamp: SystemTime,
}

impl Feedback {
    /// Decode a verified reply
    pub fn decode(raw: &Frame, layout: ResponseLayout) -> Self {
        let torque = i16::from_be_bytes([raw[2], raw[3]]) as f32 / 100.0;
        let velocity = i16::from_be_bytes([raw[4], raw[5]]) as f32;

        let (position, temperature) = match layout {
            ResponseLayout::Standard => {
                let pos = u16::from_be_bytes([raw[6], raw[7]]) as f32;
                (pos / POSITION_SCALE * 360.0, 0)
            }
            ResponseLayout::FeedbackRequest => (raw[7] as f32 / 255.0 * 360.0, raw[6]),
        };

        Self {
            velocity,
            position,
            torque,
            temperature,
            mode: ControlMode::from_byte(raw[1]),
            error_code: raw[8],
            raw: *raw,
            timestamp: SystemTime::now(),
        }
    }

    /// Feedback made up from what was last commanded, for motors that report nothing
    pub fn synthesized(velocity: f32, mode: Option<ControlMode>, raw: Frame) -> Self {
        Self {
            velocity,
            position: 0.0,
            torque: 0.0,
            temperature: 0,
            mode,
            error_code: 0,
            raw,
            timestamp: SystemTime::now(),
        }
    }
}

/// DDSM210 frames. Single motor, fixed id 1, velocity only.
pub mod ddsm210 {
    use super::{ControlMode, Frame, seal};

    pub const FIXED_ID: u8 = 0x01;
    /// Velocity limit (rpm); the wire unit is 0.1 rpm
    pub const MAX_RPM: f32 = 210.0;

    const MODE_SWITCH: u8 = 0xA0;
    const DRIVE: u8 = 0x64;
    const MODE_QUERY: u8 = 0x75;
    const ID_QUERY: u8 = 0xC8;
    const ID_SETTING: u8 = 0xAA;
    const BRAKE: u8 = 0xFF;

    pub fn velocity_mode_frame() -> Frame {
        seal([FIXED_ID, MODE_SWITCH, ControlMode::Velocity as u8, 0, 0, 0, 0, 0, 0])
    }

    pub fn velocity_frame(rpm: f32) -> Frame {
        let units = (rpm.clamp(-MAX_RPM, MAX_RPM) * 10.0) as i16;
        let [hi, lo] = units.to_be_bytes();
        seal([FIXED_ID, DRIVE, hi, lo, 0, 0, 0, 0, 0])
    }

    /// Drive frame with the brake flag in data[5]
    pub fn brake_frame() -> Frame {
        seal([FIXED_ID, DRIVE, 0, 0, 0, 0, 0, BRAKE, 0])
    }

    pub fn mode_query_frame() -> Frame {
        seal([FIXED_ID, MODE_QUERY, 0, 0, 0, 0, 0, 0, 0])
    }

    /// Broadcast id query, used as the presence probe
    pub fn id_query_frame() -> Frame {
        seal([ID_QUERY, DRIVE, 0, 0, 0, 0, 0, 0, 0])
    }

    /// Pins the motor to id 1; sent five times during init
    pub fn id_assign_frame() -> Frame {
        seal([ID_SETTING, 0x55, 0x53, FIXED_ID, 0, 0, 0, 0, 0])
    }

    /// Mode reported by a mode-query or mode-switch reply
    pub fn reply_mode(reply: &Frame) -> Option<ControlMode> {
        match reply[1] {
            MODE_QUERY | MODE_SWITCH => ControlMode::from_byte(reply[2]),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_of_zero_body_is_zero() {
        assert_eq!(crc8(&[0u8; 9]), 0x00);
    }

    #[test]
    fn test_crc_matches_datasheet_example() {
        // -50 rpm to motor 1: 01 64 FF CE 00 00 00 00 00 DA
        let frame = encode(1u8, CommandCode::Drive, &velocity_payload(-50.0)).unwrap();
        assert_eq!(frame, [0x01, 0x64, 0xFF, 0xCE, 0, 0, 0, 0, 0, 0xDA]);
    }

    #[test]
    fn test_encode_pads_payload() {
        let frame = encode(2u8, CommandCode::FeedbackRequest, &[]).unwrap();
        assert_eq!(frame[..9], [0x02, 0x74, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(frame[9], 0xF1);
    }

    #[test]
    fn test_encode_rejects_out_of_range_fields() {
        assert_eq!(
            encode(256u16, 0x64u8, &[]),
            Err(ProtocolError::FieldOutOfRange { field: "device id" })
        );
        assert_eq!(
            encode(1u8, -1i32, &[]),
            Err(ProtocolError::FieldOutOfRange {
                field: "command code"
            })
        );
        assert!(matches!(
            encode(1u8, 0x64u8, &[0; 8]),
            Err(ProtocolError::InvalidLength { .. })
        ));
    }

    #[test]
    fn test_single_bit_flip_is_detected() {
        let body = [0x07, 0x64, 0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE];
        let frame = seal(body);
        assert!(Packet::decode(&frame, None).is_ok());

        for byte in 0..FRAME_LEN {
            for bit in 0..8 {
                let mut corrupted = frame;
                corrupted[byte] ^= 1 << bit;
                assert!(
                    Packet::decode(&corrupted, None).is_err(),
                    "flip of byte {} bit {} went unnoticed",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_decode_checks_length_and_id() {
        let frame = encode(3u8, CommandCode::Drive, &[]).unwrap();
        assert_eq!(
            Packet::decode(&frame[..9], None),
            Err(ProtocolError::InvalidLength {
                expected: 10,
                actual: 9
            })
        );
        assert_eq!(
            Packet::decode(&frame, Some(4)),
            Err(ProtocolError::DeviceIdMismatch {
                expected: 4,
                actual: 3
            })
        );
        let packet = Packet::decode(&frame, Some(3)).unwrap();
        assert_eq!(packet.command, 0x64);
    }

    #[test]
    fn test_velocity_clamping() {
        assert_eq!(velocity_payload(999.0)[..2], [0x00, 0x8F]);
        assert_eq!(velocity_payload(-999.0)[..2], [0xFF, 0x71]);
        assert_eq!(velocity_payload(0.0)[..2], [0x00, 0x00]);
    }

    #[test]
    fn test_current_and_position_scaling() {
        assert_eq!(current_payload(1.5)[..2], 150i16.to_be_bytes());
        assert_eq!(current_payload(-20.0)[..2], (-800i16).to_be_bytes());
        assert_eq!(position_payload(180.0)[..2], [0x3F, 0xFF]);
        assert_eq!(position_payload(720.0)[..2], [0x7F, 0xFF]);
        assert_eq!(position_payload(-5.0)[..2], [0x00, 0x00]);
    }

    #[test]
    fn test_mode_frame_carries_mode_in_last_byte() {
        let frame = mode_frame(5, ControlMode::Position);
        assert_eq!(frame, [0x05, 0xA0, 0, 0, 0, 0, 0, 0, 0, 0x03]);
    }

    #[test]
    fn test_feedback_layouts() {
        // mode=velocity, torque=1.00A, velocity=50rpm, bytes 6-7 = 0x3F 0xFF
        let raw = seal([0x01, 0x02, 0x00, 0x64, 0x00, 0x32, 0x3F, 0xFF, 0x00]);

        let standard = Feedback::decode(&raw, ResponseLayout::Standard);
        assert_eq!(standard.torque, 1.0);
        assert_eq!(standard.velocity, 50.0);
        assert!((standard.position - 180.0).abs() < 0.01);
        assert_eq!(standard.temperature, 0);
        assert_eq!(standard.mode, Some(ControlMode::Velocity));

        let polled = Feedback::decode(&raw, ResponseLayout::FeedbackRequest);
        assert_eq!(polled.temperature, 0x3F);
        assert_eq!(polled.position, 360.0);
    }

    #[test]
    fn test_layout_follows_last_command() {
        assert_eq!(
            ResponseLayout::for_command(Some(0x74)),
            ResponseLayout::FeedbackRequest
        );
        assert_eq!(
            ResponseLayout::for_command(Some(0x64)),
            ResponseLayout::Standard
        );
        assert_eq!(ResponseLayout::for_command(None), ResponseLayout::Standard);
    }

    #[test]
    fn test_ddsm210_frames() {
        use super::ddsm210::*;
        assert_eq!(id_query_frame()[9], 0xDE);
        assert_eq!(mode_query_frame()[9], 0x47);
        assert_eq!(brake_frame()[9], 0xD1);
        assert_eq!(id_assign_frame()[9], 0xCB);
        assert_eq!(velocity_mode_frame()[9], 0xE4);

        let fast = velocity_frame(500.0);
        assert_eq!(fast[2..4], 2100i16.to_be_bytes());
        let reverse = velocity_frame(-210.0);
        assert_eq!(reverse[2..4], [0xF7, 0xCC]);
    }
}
