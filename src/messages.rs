// Message types exchanged over zenoh

use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};

use crate::motor::{ControlMode, Feedback};

// Command from teleop/scripts -> runtime
// Tagged by "cmd", e.g. {"cmd":"set_velocity","id":1,"rpm":30.0}
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum MotorCommand {
    SetVelocity { id: u8, rpm: f32 },
    SetCurrent { id: u8, amps: f32 },
    SetPosition { id: u8, degrees: f32 },
    SetMode { id: u8, mode: ControlMode },
    Enable { id: u8 },
    Disable { id: u8 },
    Stop { id: u8 },
    Brake { id: u8 },
    ReleaseBrake { id: u8 },
    CalibratePosition { id: u8 },
    RequestFeedback { id: u8 },
}

impl MotorCommand {
    pub fn device_id(&self) -> u8 {
        match *self {
            Self::SetVelocity { id, .. }
            | Self::SetCurrent { id, .. }
            | Self::SetPosition { id, .. }
            | Self::SetMode { id, .. }
            | Self::Enable { id }
            | Self::Disable { id }
            | Self::Stop { id }
            | Self::Brake { id }
            | Self::ReleaseBrake { id }
            | Self::CalibratePosition { id }
            | Self::RequestFeedback { id } => id,
        }
    }

    /// Whether this command keeps the motor turning until told otherwise
    pub fn sets_motion(&self) -> Option<bool> {
        match *self {
            Self::SetVelocity { rpm, .. } => Some(rpm != 0.0),
            Self::SetCurrent { amps, .. } => Some(amps != 0.0),
            Self::Stop { .. }
            | Self::Brake { .. }
            | Self::Disable { .. }
            | Self::SetPosition { .. } => Some(false),
            _ => None,
        }
    }
}

// Telemetry from runtime -> clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackMessage {
    pub id: u8,
    pub velocity: f32,
    pub position: f32,
    pub torque: f32,
    pub temperature: u8,
    pub mode: Option<ControlMode>,
    pub error_code: u8,
    /// Milliseconds since the Unix epoch
    pub timestamp_ms: u64,
}

impl FeedbackMessage {
    pub fn new(id: u8, feedback: &Feedback) -> Self {
        let timestamp_ms = feedback
            .timestamp
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            id,
            velocity: feedback.velocity,
            position: feedback.position,
            torque: feedback.torque,
            temperature: feedback.temperature,
            mode: feedback.mode,
            error_code: feedback.error_code,
            timestamp_ms,
        }
    }
}

/// Health status published by runtime
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeHealth {
    Ok,
    CmdStale,
    Disconnected,
}
