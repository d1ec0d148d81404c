// Timeouts, pacing, topics, motor configuration
use std::ops::RangeInclusive;
use std::time::Duration;

use crate::motor::VariantPreference;

// Serial link
pub const DEFAULT_PORT: &str = "/dev/ttyUSB0";
pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const SERIAL_TIMEOUT: Duration = Duration::from_millis(200);

// Request/response windows
pub const FEEDBACK_READ_TIMEOUT: Duration = Duration::from_millis(100);
pub const ACK_TIMEOUT: Duration = Duration::from_millis(20);

// Settling delays (hardware needs these before it accepts the next frame)
pub const MODE_SETTLE: Duration = Duration::from_millis(10);
pub const ESTOP_GAP: Duration = Duration::from_millis(10);
pub const SET_ID_REPEATS: usize = 5;
pub const SET_ID_GAP: Duration = Duration::from_millis(50);
pub const SET_ID_SETTLE: Duration = Duration::from_millis(100);
pub const SCAN_GAP: Duration = Duration::from_millis(10);

// DDSM210 init sequence
pub const DDSM210_INIT_GAP: Duration = Duration::from_millis(100);
pub const DDSM210_MODE_SETTLE: Duration = Duration::from_millis(500);

// Feedback polling per device
pub const DDSM115_POLL_INTERVAL: Duration = Duration::from_millis(50);
pub const DDSM210_ACTIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const DDSM210_IDLE_POLL_INTERVAL: Duration = Duration::from_millis(500);

// Command loop pacing
pub const MIN_COMMAND_INTERVAL: Duration = Duration::from_millis(5);
pub const POST_COMMAND_PAUSE: Duration = Duration::from_millis(20);
pub const IDLE_SLEEP: Duration = Duration::from_millis(10);
pub const FEEDBACK_TICK: Duration = Duration::from_millis(10);
pub const NO_DEVICES_SLEEP: Duration = Duration::from_millis(100);

// Backoff after consecutive failures: short below 5, long below 10, then max
pub const BACKOFF_SHORT: Duration = Duration::from_millis(100);
pub const BACKOFF_LONG: Duration = Duration::from_millis(500);
pub const BACKOFF_MAX: Duration = Duration::from_secs(1);

// Position mode entry: ramp down first when spinning faster than this (rpm)
pub const RAMP_VELOCITY_THRESHOLD: f32 = 10.0;
pub const RAMP_SETTLE: Duration = Duration::from_millis(200);

// Feedback entries kept per motor
pub const FEEDBACK_HISTORY_LEN: usize = 100;

// Default scan range for DDSM115 ids
pub const SCAN_START: u8 = 1;
pub const SCAN_END: u8 = 10;

// Runtime loop frequency
pub const LOOP_HZ: u64 = 50;

// Command timeout for watchdog
pub const CMD_TIMEOUT: Duration = Duration::from_millis(250);

// Zenoh topics
pub const TOPIC_CMD: &str = "ddsm/cmd"; // commands
pub const TOPIC_FEEDBACK: &str = "ddsm/state/feedback"; // telemetry
pub const TOPIC_STATS: &str = "ddsm/state/stats"; // queue statistics
pub const TOPIC_HEALTH: &str = "ddsm/state/health"; // health status

/// Timing knobs of a device driver.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub read_timeout: Duration,
    pub ack_timeout: Duration,
    pub mode_settle: Duration,
    pub estop_gap: Duration,
    pub set_id_gap: Duration,
    pub set_id_settle: Duration,
    pub scan_gap: Duration,
    pub init_gap: Duration,
    pub init_mode_settle: Duration,
    /// Ids probed by DDSM115 auto-detection.
    pub probe_ids: RangeInclusive<u8>,
    /// When set, timeouts and "no data" reads are only traced, never reported.
    pub suppress_transient_errors: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            read_timeout: FEEDBACK_READ_TIMEOUT,
            ack_timeout: ACK_TIMEOUT,
            mode_settle: MODE_SETTLE,
            estop_gap: ESTOP_GAP,
            set_id_gap: SET_ID_GAP,
            set_id_settle: SET_ID_SETTLE,
            scan_gap: SCAN_GAP,
            init_gap: DDSM210_INIT_GAP,
            init_mode_settle: DDSM210_MODE_SETTLE,
            probe_ids: SCAN_START..=SCAN_END,
            suppress_transient_errors: true,
        }
    }
}

impl DriverConfig {
    /// Same behaviour with every delay removed (simulated links answer instantly).
    pub fn instant() -> Self {
        Self {
            read_timeout: Duration::ZERO,
            ack_timeout: Duration::ZERO,
            mode_settle: Duration::ZERO,
            estop_gap: Duration::ZERO,
            set_id_gap: Duration::ZERO,
            set_id_settle: Duration::ZERO,
            scan_gap: Duration::ZERO,
            init_gap: Duration::ZERO,
            init_mode_settle: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Pacing of the command and feedback loops.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub min_command_interval: Duration,
    pub post_command_pause: Duration,
    pub idle_sleep: Duration,
    pub feedback_tick: Duration,
    pub no_devices_sleep: Duration,
    pub ramp_threshold: f32,
    pub ramp_settle: Duration,
    pub backoff: [Duration; 3],
    pub history_len: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_command_interval: MIN_COMMAND_INTERVAL,
            post_command_pause: POST_COMMAND_PAUSE,
            idle_sleep: IDLE_SLEEP,
            feedback_tick: FEEDBACK_TICK,
            no_devices_sleep: NO_DEVICES_SLEEP,
            ramp_threshold: RAMP_VELOCITY_THRESHOLD,
            ramp_settle: RAMP_SETTLE,
            backoff: [BACKOFF_SHORT, BACKOFF_LONG, BACKOFF_MAX],
            history_len: FEEDBACK_HISTORY_LEN,
        }
    }
}

impl QueueConfig {
    pub fn instant() -> Self {
        Self {
            min_command_interval: Duration::ZERO,
            post_command_pause: Duration::from_millis(1),
            idle_sleep: Duration::from_millis(1),
            feedback_tick: Duration::from_millis(1),
            no_devices_sleep: Duration::from_millis(1),
            ramp_settle: Duration::ZERO,
            backoff: [Duration::from_millis(1); 3],
            ..Self::default()
        }
    }
}

/// Everything a `MotorController` needs besides its connector.
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    pub variant: VariantPreference,
    pub driver: DriverConfig,
    pub queue: QueueConfig,
}
