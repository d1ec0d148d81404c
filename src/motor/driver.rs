// Common driver interface for both motor firmwares
//
// A controller picks one implementation at connect time and keeps it for the
// whole connection. Every operation resolves to bool/Option: bus trouble is the
// normal way a missing motor shows up, so nothing here returns an error.

use std::fmt;
use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::error::MotorError;
use super::protocol::{ControlMode, Feedback};

/// Motor firmware family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    /// Multi-id, current/velocity/position, full telemetry
    Ddsm115,
    /// Fixed id 1, velocity only, no telemetry
    Ddsm210,
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ddsm115 => write!(f, "DDSM115"),
            Self::Ddsm210 => write!(f, "DDSM210"),
        }
    }
}

/// Which variant(s) a controller may connect as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum VariantPreference {
    #[default]
    Auto,
    Ddsm115,
    Ddsm210,
}

impl VariantPreference {
    /// Variants to try, in order, for a port
    pub fn detection_order(self, port_name: &str) -> Vec<Variant> {
        match self {
            Self::Ddsm115 => vec![Variant::Ddsm115],
            Self::Ddsm210 => vec![Variant::Ddsm210],
            // DDSM210 adapters enumerate as CDC-ACM
            Self::Auto if port_name.contains("ttyACM") => {
                vec![Variant::Ddsm210, Variant::Ddsm115]
            }
            Self::Auto => vec![Variant::Ddsm115, Variant::Ddsm210],
        }
    }
}

/// What the host believes about one motor
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceState {
    /// `None` until a mode switch was sent or a reply reported one
    pub mode: Option<ControlMode>,
    pub last_feedback: Option<Feedback>,
}

/// Capability set shared by both firmware drivers
pub trait MotorDriver: Send {
    fn variant(&self) -> Variant;

    /// Open the link
    fn connect(&mut self) -> bool;

    /// Check that a motor of this variant answers on the open link
    fn probe(&mut self) -> bool;

    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Ids in `ids` that answer
    fn scan(&mut self, ids: RangeInclusive<u8>) -> Vec<u8>;

    /// Send a mode switch and assume it took effect
    fn set_mode(&mut self, id: u8, mode: ControlMode) -> bool;

    fn set_velocity(&mut self, id: u8, rpm: f32) -> bool;

    fn set_current(&mut self, id: u8, amps: f32) -> bool;

    fn set_position(&mut self, id: u8, degrees: f32) -> bool;

    fn enable(&mut self, id: u8) -> bool;

    fn disable(&mut self, id: u8) -> bool;

    fn brake(&mut self, id: u8) -> bool;

    fn release_brake(&mut self, id: u8) -> bool;

    fn calibrate_position(&mut self, id: u8) -> bool;

    fn request_feedback(&mut self, id: u8) -> Option<Feedback>;

    /// Stop as hard as the firmware allows, then leave the motor at zero velocity
    fn emergency_stop(&mut self, id: u8) -> bool;

    fn set_device_id(&mut self, old_id: u8, new_id: u8) -> bool;

    fn mode(&self, id: u8) -> Option<ControlMode>;

    /// Overwrite the assumed mode with one observed on the bus
    fn reconcile_mode(&mut self, id: u8, mode: ControlMode);

    fn last_feedback(&self, id: u8) -> Option<Feedback>;

    /// Minimum spacing between feedback polls of one motor
    fn poll_interval(&self) -> Duration;

    /// Messages worth surfacing to the user, collected since the last call
    fn take_diagnostics(&mut self) -> Vec<String>;
}

/// Collects driver failures for later delivery, outside the bus lock
#[derive(Debug, Default)]
pub(crate) struct Diagnostics {
    suppress_transient: bool,
    pending: Vec<String>,
}

impl Diagnostics {
    pub(crate) fn new(suppress_transient: bool) -> Self {
        Self {
            suppress_transient,
            pending: Vec::new(),
        }
    }

    /// Record a failed operation
    pub(crate) fn note(&mut self, context: &str, err: &MotorError) {
        if err.is_discarded_frame() {
            trace!("{}: discarded frame: {}", context, err);
            return;
        }
        if err.is_transient() {
            trace!("{}: {}", context, err);
            if self.suppress_transient {
                return;
            }
        } else {
            debug!("{}: {}", context, err);
        }
        self.pending.push(format!("{}: {}", context, err));
    }

    pub(crate) fn take(&mut self) -> Vec<String> {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::protocol::ProtocolError;

    #[test]
    fn test_detection_order() {
        assert_eq!(
            VariantPreference::Auto.detection_order("/dev/ttyACM0"),
            vec![Variant::Ddsm210, Variant::Ddsm115]
        );
        assert_eq!(
            VariantPreference::Auto.detection_order("/dev/ttyUSB0"),
            vec![Variant::Ddsm115, Variant::Ddsm210]
        );
        assert_eq!(
            VariantPreference::Ddsm115.detection_order("/dev/ttyACM0"),
            vec![Variant::Ddsm115]
        );
    }

    #[test]
    fn test_diagnostics_filtering() {
        let mut quiet = Diagnostics::new(true);
        quiet.note("feedback 3", &MotorError::Timeout);
        quiet.note(
            "feedback 3",
            &MotorError::from(ProtocolError::ChecksumMismatch {
                computed: 0,
                received: 1,
            }),
        );
        assert!(quiet.take().is_empty());

        quiet.note("write", &MotorError::NotConnected);
        assert_eq!(quiet.take(), vec!["write: Link is not open".to_string()]);

        let mut verbose = Diagnostics::new(false);
        verbose.note("feedback 3", &MotorError::Timeout);
        assert_eq!(verbose.take().len(), 1);
    }
}
