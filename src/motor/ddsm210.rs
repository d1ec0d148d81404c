// DDSM210 driver
//
// One motor per bus, pinned to id 1 during init. Velocity is the only mode and
// the firmware sends no telemetry back, so feedback is built from the last
// commanded velocity plus the mode-query reply.

use std::ops::RangeInclusive;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::driver::{DeviceState, Diagnostics, MotorDriver, Variant};
use super::error::{MotorError, Result};
use super::link::{Connector, Link};
use super::protocol::{ControlMode, Feedback, Frame, ddsm210};
use crate::config::{
    DDSM210_ACTIVE_POLL_INTERVAL, DDSM210_IDLE_POLL_INTERVAL, DriverConfig, SET_ID_REPEATS,
};

const FIXED_ID: u8 = ddsm210::FIXED_ID;

pub struct Ddsm210 {
    connector: Arc<dyn Connector>,
    link: Option<Box<dyn Link>>,
    config: DriverConfig,
    initialized: bool,
    state: DeviceState,
    commanded_rpm: f32,
    diagnostics: Diagnostics,
}

impl Ddsm210 {
    pub fn new(connector: Arc<dyn Connector>, config: DriverConfig) -> Self {
        let diagnostics = Diagnostics::new(config.suppress_transient_errors);
        Self {
            connector,
            link: None,
            config,
            initialized: false,
            state: DeviceState::default(),
            commanded_rpm: 0.0,
            diagnostics,
        }
    }

    fn link(&mut self) -> Result<&mut Box<dyn Link>> {
        self.link.as_mut().ok_or(MotorError::NotConnected)
    }

    fn check_id(id: u8) -> Result<()> {
        if id == FIXED_ID {
            Ok(())
        } else {
            Err(MotorError::InvalidId(id))
        }
    }

    fn transmit(&mut self, frame: &Frame) -> Result<()> {
        let link = self.link()?;
        link.clear_input()?;
        link.write_frame(frame)
    }

    /// Write and wait for a reply; the reply checksum is not verified
    fn exchange(&mut self, frame: &Frame, timeout: Duration) -> Result<Frame> {
        self.transmit(frame)?;
        self.link()?.read_frame(timeout)
    }

    /// Pin the id and enter velocity mode
    fn initialize(&mut self) -> Result<()> {
        info!("Initializing DDSM210");
        let assign = ddsm210::id_assign_frame();
        for _ in 0..SET_ID_REPEATS {
            self.transmit(&assign)?;
            sleep(self.config.init_gap);
        }

        self.transmit(&ddsm210::velocity_mode_frame())?;
        sleep(self.config.init_mode_settle);

        self.initialized = true;
        self.state.mode = Some(ControlMode::Velocity);
        Ok(())
    }

    fn try_set_velocity(&mut self, id: u8, rpm: f32) -> Result<()> {
        Self::check_id(id)?;
        let rpm = rpm.clamp(-ddsm210::MAX_RPM, ddsm210::MAX_RPM);
        self.transmit(&ddsm210::velocity_frame(rpm))?;
        self.commanded_rpm = rpm;

        let ack_timeout = self.config.ack_timeout;
        if let Err(e) = self.link()?.read_frame(ack_timeout) {
            self.diagnostics.note("DDSM210 velocity reply", &e);
        }
        Ok(())
    }

    fn try_request_feedback(&mut self, id: u8) -> Result<Feedback> {
        Self::check_id(id)?;
        let reply = self.exchange(&ddsm210::mode_query_frame(), self.config.read_timeout)?;

        let mode = ddsm210::reply_mode(&reply).or(Some(ControlMode::Velocity));
        let feedback = Feedback::synthesized(self.commanded_rpm, mode, reply);
        self.state.last_feedback = Some(feedback);
        Ok(feedback)
    }

    fn unsupported(&mut self, what: &'static str) -> bool {
        self.diagnostics
            .note("DDSM210", &MotorError::Unsupported(what));
        false
    }
}

impl MotorDriver for Ddsm210 {
    fn variant(&self) -> Variant {
        Variant::Ddsm210
    }

    fn connect(&mut self) -> bool {
        self.link = None;
        self.initialized = false;
        match self.connector.open() {
            Ok(link) => {
                info!("DDSM210 link open on {}", self.connector.port_name());
                self.link = Some(link);
                true
            }
            Err(e) => {
                self.diagnostics
                    .note(&format!("Connection to {}", self.connector.port_name()), &e);
                false
            }
        }
    }

    fn probe(&mut self) -> bool {
        let result = self
            .exchange(&ddsm210::id_query_frame(), self.config.read_timeout)
            .and_then(|reply| {
                debug!("DDSM210 id query reply {:02X?}", reply);
                if self.initialized {
                    Ok(())
                } else {
                    self.initialize()
                }
            });

        match result {
            Ok(()) => true,
            Err(e) => {
                self.diagnostics.note("DDSM210 probe", &e);
                false
            }
        }
    }

    fn disconnect(&mut self) {
        if self.link.take().is_some() {
            info!("DDSM210 link on {} closed", self.connector.port_name());
        }
        self.initialized = false;
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn scan(&mut self, ids: RangeInclusive<u8>) -> Vec<u8> {
        if ids.contains(&FIXED_ID) && self.probe() {
            vec![FIXED_ID]
        } else {
            Vec::new()
        }
    }

    fn set_mode(&mut self, id: u8, mode: ControlMode) -> bool {
        if let Err(e) = Self::check_id(id) {
            self.diagnostics.note("DDSM210 mode switch", &e);
            return false;
        }
        if mode != ControlMode::Velocity {
            self.diagnostics
                .note("DDSM210 mode switch", &MotorError::UnsupportedMode { id, mode });
            return false;
        }
        if self.initialized {
            return true;
        }

        match self.transmit(&ddsm210::velocity_mode_frame()) {
            Ok(()) => {
                sleep(self.config.mode_settle);
                self.state.mode = Some(ControlMode::Velocity);
                true
            }
            Err(e) => {
                self.diagnostics.note("DDSM210 mode switch", &e);
                false
            }
        }
    }

    fn set_velocity(&mut self, id: u8, rpm: f32) -> bool {
        let in_velocity_mode = self.state.mode == Some(ControlMode::Velocity);
        if !in_velocity_mode && !self.set_mode(id, ControlMode::Velocity) {
            return false;
        }
        match self.try_set_velocity(id, rpm) {
            Ok(()) => true,
            Err(e) => {
                self.diagnostics.note("DDSM210 velocity", &e);
                false
            }
        }
    }

    fn set_current(&mut self, _id: u8, _amps: f32) -> bool {
        self.unsupported("Current control")
    }

    fn set_position(&mut self, _id: u8, _degrees: f32) -> bool {
        self.unsupported("Position control")
    }

    fn enable(&mut self, _id: u8) -> bool {
        self.unsupported("Enable")
    }

    fn disable(&mut self, _id: u8) -> bool {
        self.unsupported("Disable")
    }

    fn brake(&mut self, id: u8) -> bool {
        self.emergency_stop(id)
    }

    fn release_brake(&mut self, id: u8) -> bool {
        self.set_velocity(id, 0.0)
    }

    fn calibrate_position(&mut self, _id: u8) -> bool {
        self.unsupported("Position calibration")
    }

    fn request_feedback(&mut self, id: u8) -> Option<Feedback> {
        match self.try_request_feedback(id) {
            Ok(feedback) => Some(feedback),
            Err(e) => {
                self.diagnostics.note("DDSM210 feedback", &e);
                None
            }
        }
    }

    fn emergency_stop(&mut self, id: u8) -> bool {
        if let Err(e) = Self::check_id(id) {
            self.diagnostics.note("DDSM210 brake", &e);
            return false;
        }
        warn!("DDSM210 emergency brake");
        match self.transmit(&ddsm210::brake_frame()) {
            Ok(()) => {
                self.commanded_rpm = 0.0;
                true
            }
            Err(e) => {
                self.diagnostics.note("DDSM210 brake", &e);
                false
            }
        }
    }

    fn set_device_id(&mut self, _old_id: u8, _new_id: u8) -> bool {
        self.unsupported("Id change")
    }

    fn mode(&self, id: u8) -> Option<ControlMode> {
        if id == FIXED_ID { self.state.mode } else { None }
    }

    fn reconcile_mode(&mut self, id: u8, mode: ControlMode) {
        if id == FIXED_ID {
            self.state.mode = Some(mode);
        }
    }

    fn last_feedback(&self, id: u8) -> Option<Feedback> {
        if id == FIXED_ID {
            self.state.last_feedback
        } else {
            None
        }
    }

    fn poll_interval(&self) -> Duration {
        if self.commanded_rpm != 0.0 {
            DDSM210_ACTIVE_POLL_INTERVAL
        } else {
            DDSM210_IDLE_POLL_INTERVAL
        }
    }

    fn take_diagnostics(&mut self) -> Vec<String> {
        self.diagnostics.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::sim::SimBus;

    fn initialized(bus: &SimBus) -> Ddsm210 {
        let mut driver = Ddsm210::new(bus.connector("/dev/ttyACM0"), DriverConfig::instant());
        assert!(driver.connect());
        assert!(driver.probe());
        driver
    }

    #[test]
    fn test_probe_runs_init_once() {
        let bus = SimBus::ddsm210();
        let mut driver = initialized(&bus);

        let frames = bus.sent_frames();
        assert_eq!(frames[0], ddsm210::id_query_frame());
        let assigns = frames
            .iter()
            .filter(|f| **f == ddsm210::id_assign_frame())
            .count();
        assert_eq!(assigns, 5);
        assert_eq!(frames.last(), Some(&ddsm210::velocity_mode_frame()));
        assert_eq!(driver.mode(1), Some(ControlMode::Velocity));

        bus.clear_log();
        assert!(driver.probe());
        assert_eq!(bus.sent_frames(), vec![ddsm210::id_query_frame()]);
    }

    #[test]
    fn test_probe_fails_without_motor() {
        let bus = SimBus::ddsm115(&[1]);
        let mut driver = Ddsm210::new(bus.connector("/dev/ttyUSB0"), DriverConfig::instant());
        assert!(driver.connect());
        assert!(!driver.probe());
        assert_eq!(driver.mode(1), None);
    }

    #[test]
    fn test_velocity_and_synthesized_feedback() {
        let bus = SimBus::ddsm210();
        let mut driver = initialized(&bus);
        assert_eq!(driver.poll_interval(), DDSM210_IDLE_POLL_INTERVAL);

        assert!(driver.set_velocity(1, 500.0));
        assert_eq!(bus.velocity_of(1), Some(210.0));
        assert_eq!(driver.poll_interval(), DDSM210_ACTIVE_POLL_INTERVAL);

        let feedback = driver.request_feedback(1).unwrap();
        assert_eq!(feedback.velocity, 210.0);
        assert_eq!(feedback.mode, Some(ControlMode::Velocity));
        assert_eq!(feedback.temperature, 0);
    }

    #[test]
    fn test_only_id_one_and_velocity_mode() {
        let bus = SimBus::ddsm210();
        let mut driver = initialized(&bus);

        assert!(!driver.set_velocity(2, 10.0));
        assert!(driver.request_feedback(2).is_none());
        assert!(!driver.set_mode(1, ControlMode::Position));
        assert!(!driver.set_position(1, 90.0));
        assert!(!driver.set_current(1, 1.0));
        assert!(!driver.set_device_id(1, 3));
        assert!(driver.set_mode(1, ControlMode::Velocity));
        assert!(!driver.take_diagnostics().is_empty());
    }

    #[test]
    fn test_emergency_stop_brakes() {
        let bus = SimBus::ddsm210();
        let mut driver = initialized(&bus);
        assert!(driver.set_velocity(1, 60.0));

        assert!(driver.emergency_stop(1));
        assert_eq!(bus.sent_frames().last(), Some(&ddsm210::brake_frame()));
        assert_eq!(bus.velocity_of(1), Some(0.0));
        assert_eq!(driver.request_feedback(1).unwrap().velocity, 0.0);
    }

    #[test]
    fn test_scan() {
        let bus = SimBus::ddsm210();
        let mut driver = initialized(&bus);
        assert_eq!(driver.scan(1..=10), vec![1]);
        assert!(driver.scan(2..=10).is_empty());
    }
}
