// DDSM115 driver
//
// Up to ten motors share one RS485 bus, each with its own id. The motor answers
// every checksummed frame with a 10-byte status reply; which of the two reply
// layouts it uses depends on the command, so the last command sent to each id
// is remembered.

use std::collections::HashMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::driver::{DeviceState, Diagnostics, MotorDriver, Variant};
use super::error::{MotorError, Result};
use super::link::{Connector, Link};
use super::protocol::{
    self, CommandCode, ControlMode, Feedback, Frame, MAX_DEVICE_ID, PAYLOAD_LEN, Packet,
    ResponseLayout,
};
use crate::config::{DDSM115_POLL_INTERVAL, DriverConfig, SET_ID_REPEATS};

#[derive(Debug, Default)]
struct Device {
    state: DeviceState,
    last_command: Option<u8>,
}

pub struct Ddsm115 {
    connector: Arc<dyn Connector>,
    link: Option<Box<dyn Link>>,
    config: DriverConfig,
    devices: HashMap<u8, Device>,
    diagnostics: Diagnostics,
}

impl Ddsm115 {
    pub fn new(connector: Arc<dyn Connector>, config: DriverConfig) -> Self {
        let diagnostics = Diagnostics::new(config.suppress_transient_errors);
        Self {
            connector,
            link: None,
            config,
            devices: HashMap::new(),
            diagnostics,
        }
    }

    fn link(&mut self) -> Result<&mut Box<dyn Link>> {
        self.link.as_mut().ok_or(MotorError::NotConnected)
    }

    fn device(&mut self, id: u8) -> &mut Device {
        self.devices.entry(id).or_default()
    }

    /// Write a frame on a clean input buffer
    fn transmit(&mut self, frame: &Frame) -> Result<()> {
        let link = self.link()?;
        link.clear_input()?;
        link.write_frame(frame)
    }

    /// Send a checksummed command and remember it for reply decoding
    fn send_command(&mut self, id: u8, code: CommandCode, payload: &[u8]) -> Result<()> {
        let frame = protocol::encode(id, code, payload)?;
        self.transmit(&frame)?;
        self.device(id).last_command = Some(code as u8);
        Ok(())
    }

    /// Read and decode one reply from `id`
    fn read_reply(&mut self, id: u8, timeout: Duration) -> Result<Feedback> {
        let raw = self.link()?.read_frame(timeout)?;
        Packet::decode(&raw, Some(id))?;

        let layout = ResponseLayout::for_command(self.device(id).last_command);
        let feedback = Feedback::decode(&raw, layout);
        self.device(id).state.last_feedback = Some(feedback);
        Ok(feedback)
    }

    /// Command whose status reply is welcome but not required
    fn command(&mut self, id: u8, code: CommandCode, payload: &[u8]) -> bool {
        if let Err(e) = self.send_command(id, code, payload) {
            self.diagnostics.note(&format!("{:?} to motor {}", code, id), &e);
            return false;
        }
        if let Err(e) = self.read_reply(id, self.config.ack_timeout) {
            self.diagnostics
                .note(&format!("{:?} reply from motor {}", code, id), &e);
        }
        true
    }

    /// Switch mode first when the motor is not already in `mode`
    fn ensure_mode(&mut self, id: u8, mode: ControlMode) -> bool {
        if self.mode(id) == Some(mode) {
            return true;
        }
        self.set_mode(id, mode)
    }

    fn drive(&mut self, id: u8, mode: ControlMode, payload: [u8; PAYLOAD_LEN]) -> bool {
        if !self.ensure_mode(id, mode) {
            return false;
        }
        self.command(id, CommandCode::Drive, &payload)
    }

    fn try_request_feedback(&mut self, id: u8) -> Result<Feedback> {
        self.send_command(id, CommandCode::FeedbackRequest, &[])?;
        self.read_reply(id, self.config.read_timeout)
    }

    fn try_set_device_id(&mut self, old_id: u8, new_id: u8) -> Result<bool> {
        if !(1..=MAX_DEVICE_ID).contains(&new_id) {
            return Err(MotorError::InvalidId(new_id));
        }

        info!("Changing motor id {} -> {}", old_id, new_id);
        let frame = protocol::set_id_frame(new_id);

        // The firmware only accepts the change after five copies
        for i in 0..SET_ID_REPEATS {
            self.transmit(&frame)?;
            debug!("Id assignment frame {}/{} sent", i + 1, SET_ID_REPEATS);
            sleep(self.config.set_id_gap);
        }
        sleep(self.config.set_id_settle);

        // The old entry stays until the motor answers under its new id
        if self.request_feedback(new_id).is_none() {
            return Ok(false);
        }
        if let Some(old) = self.devices.remove(&old_id) {
            let device = self.device(new_id);
            device.state.mode = device.state.mode.or(old.state.mode);
        }
        Ok(true)
    }
}

impl MotorDriver for Ddsm115 {
    fn variant(&self) -> Variant {
        Variant::Ddsm115
    }

    fn connect(&mut self) -> bool {
        self.link = None;
        match self.connector.open() {
            Ok(link) => {
                info!("DDSM115 link open on {}", self.connector.port_name());
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
        let ids = self.config.probe_ids.clone();
        for id in ids {
            if self.request_feedback(id).is_some() {
                debug!("DDSM115 probe answered by motor {}", id);
                return true;
            }
        }
        false
    }

    fn disconnect(&mut self) {
        if self.link.take().is_some() {
            info!("DDSM115 link on {} closed", self.connector.port_name());
        }
    }

    fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    fn scan(&mut self, ids: RangeInclusive<u8>) -> Vec<u8> {
        let mut found = Vec::new();
        for id in ids {
            if self.request_feedback(id).is_some() {
                found.push(id);
                sleep(self.config.scan_gap);
            }
        }
        info!("Scan found motors {:?}", found);
        found
    }

    fn set_mode(&mut self, id: u8, mode: ControlMode) -> bool {
        let frame = protocol::mode_frame(id, mode);
        if let Err(e) = self.transmit(&frame) {
            self.diagnostics
                .note(&format!("Mode switch of motor {}", id), &e);
            return false;
        }

        let device = self.device(id);
        device.last_command = Some(CommandCode::ModeSwitch as u8);
        sleep(self.config.mode_settle);

        // Not confirmed; the next feedback poll corrects it if the motor disagrees
        self.device(id).state.mode = Some(mode);
        debug!("Motor {} switched to {:?}", id, mode);
        true
    }

    fn set_velocity(&mut self, id: u8, rpm: f32) -> bool {
        self.drive(id, ControlMode::Velocity, protocol::velocity_payload(rpm))
    }

    fn set_current(&mut self, id: u8, amps: f32) -> bool {
        self.drive(id, ControlMode::Current, protocol::current_payload(amps))
    }

    fn set_position(&mut self, id: u8, degrees: f32) -> bool {
        self.drive(id, ControlMode::Position, protocol::position_payload(degrees))
    }

    fn enable(&mut self, id: u8) -> bool {
        self.command(id, CommandCode::Enable, &[])
    }

    fn disable(&mut self, id: u8) -> bool {
        self.command(id, CommandCode::Disable, &[])
    }

    fn brake(&mut self, id: u8) -> bool {
        self.command(id, CommandCode::Brake, &[])
    }

    fn release_brake(&mut self, id: u8) -> bool {
        self.command(id, CommandCode::ReleaseBrake, &[])
    }

    fn calibrate_position(&mut self, id: u8) -> bool {
        self.command(id, CommandCode::PositionCalibration, &[])
    }

    fn request_feedback(&mut self, id: u8) -> Option<Feedback> {
        match self.try_request_feedback(id) {
            Ok(feedback) => Some(feedback),
            Err(e) => {
                self.diagnostics.note(&format!("Feedback from motor {}", id), &e);
                None
            }
        }
    }

    fn emergency_stop(&mut self, id: u8) -> bool {
        warn!("Emergency stop of motor {}", id);
        if !self.command(id, CommandCode::EmergencyStop, &[]) {
            return false;
        }
        sleep(self.config.estop_gap);
        let mode_ok = self.set_mode(id, ControlMode::Velocity);
        sleep(self.config.estop_gap);
        let zero_ok = self.set_velocity(id, 0.0);
        // The halt itself went out; the follow-up only leaves a diagnostic
        if !(mode_ok && zero_ok) {
            self.diagnostics
                .note(&format!("Emergency stop of motor {}", id), &MotorError::StopNotConfirmed(id));
        }
        true
    }

    fn set_device_id(&mut self, old_id: u8, new_id: u8) -> bool {
        match self.try_set_device_id(old_id, new_id) {
            Ok(verified) => verified,
            Err(e) => {
                self.diagnostics
                    .note(&format!("Id change {} -> {}", old_id, new_id), &e);
                false
            }
        }
    }

    fn mode(&self, id: u8) -> Option<ControlMode> {
        self.devices.get(&id).and_then(|d| d.state.mode)
    }

    fn reconcile_mode(&mut self, id: u8, mode: ControlMode) {
        self.device(id).state.mode = Some(mode);
    }

    fn last_feedback(&self, id: u8) -> Option<Feedback> {
        self.devices.get(&id).and_then(|d| d.state.last_feedback)
    }

    fn poll_interval(&self) -> Duration {
        DDSM115_POLL_INTERVAL
    }

    fn take_diagnostics(&mut self) -> Vec<String> {
        self.diagnostics.take()
    }
}
