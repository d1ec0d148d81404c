// DDSM115 / DDSM210 hub motor runtime
//
// Protocol codec, drivers, command queue and controller facade, plus the
// zenoh bridge used by the binary.

pub mod config;
pub mod controller;
pub mod hooks;
pub mod messages;
pub mod motor;
pub mod queue;
pub mod registry;
pub mod runtime;

pub use controller::MotorController;
pub use queue::{Command, Outcome, QueueStats};
pub use registry::ControllerRegistry;
