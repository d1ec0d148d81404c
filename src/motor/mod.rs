// Motor bus access for DDSM115 and DDSM210 hub motors
//
// Provides:
// - The 10-byte frame codec shared by both firmwares
// - Serial and simulated links
// - One driver per firmware behind a common trait

pub mod ddsm115;
pub mod ddsm210;
mod driver;
pub mod error;
pub mod link;
pub mod protocol;
pub mod sim;

pub use ddsm115::Ddsm115;
pub use ddsm210::Ddsm210;
pub use driver::{DeviceState, MotorDriver, Variant, VariantPreference};
pub use error::MotorError;
pub use link::{Connector, Link, SerialConnector, SerialLink};
pub use protocol::{ControlMode, Feedback, ProtocolError};
pub use sim::SimBus;

use std::sync::Arc;

use crate::config::DriverConfig;

/// Build the (unconnected) driver for one variant
pub fn driver_for(
    variant: Variant,
    connector: Arc<dyn Connector>,
    config: DriverConfig,
) -> Box<dyn MotorDriver> {
    match variant {
        Variant::Ddsm115 => Box::new(Ddsm115::new(connector, config)),
        Variant::Ddsm210 => Box::new(Ddsm210::new(connector, config)),
    }
}
