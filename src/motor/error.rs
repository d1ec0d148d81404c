use super::protocol::{ControlMode, ProtocolError};

/// Error types for motor bus communication
#[derive(Debug, thiserror::Error)]
pub enum MotorError {
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout waiting for a response")]
    Timeout,

    #[error("Link is not open")]
    NotConnected,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Motor {id} reports {observed:?} mode, expected {expected:?}")]
    ModeNotConfirmed {
        id: u8,
        expected: ControlMode,
        observed: ControlMode,
    },

    #[error("Motor {id} does not support {mode:?} mode")]
    UnsupportedMode { id: u8, mode: ControlMode },

    #[error("{0} is not supported by this motor")]
    Unsupported(&'static str),

    #[error("Invalid motor id {0}")]
    InvalidId(u8),

    #[error("Motor {0} emergency stopped but zero velocity was not confirmed")]
    StopNotConfirmed(u8),
}

impl MotorError {
    /// Timeouts and "no data" reads: a missing motor looks exactly like this,
    /// so these are expected during scans and polling.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout => true,
            Self::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::ResourceBusy
            ),
            _ => false,
        }
    }

    /// Corrupt or foreign frames: dropped without telling anyone
    pub fn is_discarded_frame(&self) -> bool {
        matches!(
            self,
            Self::Protocol(
                ProtocolError::ChecksumMismatch { .. }
                    | ProtocolError::DeviceIdMismatch { .. }
                    | ProtocolError::InvalidLength { .. }
            )
        )
    }
}

pub type Result<T> = std::result::Result<T, MotorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(MotorError::Timeout.is_transient());
        assert!(MotorError::Io(std::io::ErrorKind::TimedOut.into()).is_transient());
        assert!(!MotorError::NotConnected.is_transient());

        let corrupt = MotorError::from(ProtocolError::ChecksumMismatch {
            computed: 1,
            received: 2,
        });
        assert!(corrupt.is_discarded_frame());
        assert!(!corrupt.is_transient());
    }
}
