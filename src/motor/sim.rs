// In-memory motor bus
//
// Answers frames the way the two firmwares do, so drivers, the queue and the
// bridge can run without hardware (tests and `--simulate`). Every written frame
// is logged for inspection.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::trace;

use super::driver::Variant;
use super::error::{MotorError, Result};
use super::link::{Connector, Link};
use super::protocol::{self, CommandCode, ControlMode, FRAME_LEN, Frame, ddsm210};

#[derive(Debug, Clone)]
struct SimMotor {
    mode: ControlMode,
    velocity: f32,
    reported_velocity: Option<f32>,
    current: i16,
    position: u16,
    temperature: u8,
    enabled: bool,
}

impl Default for SimMotor {
    fn default() -> Self {
        Self {
            mode: ControlMode::Velocity,
            velocity: 0.0,
            reported_velocity: None,
            current: 0,
            position: 0,
            temperature: 25,
            enabled: true,
        }
    }
}

impl SimMotor {
    fn reported_velocity(&self) -> i16 {
        self.reported_velocity.unwrap_or(self.velocity) as i16
    }
}

#[derive(Debug)]
struct SimState {
    variant: Variant,
    motors: BTreeMap<u8, SimMotor>,
    sent: Vec<Frame>,
    reply: Option<Frame>,
    corrupt_next_reply: bool,
    write_failure: bool,
    /// Writes still accepted before they start failing
    writes_left: Option<usize>,
    open_failure: bool,
}

impl SimState {
    fn handle(&mut self, frame: &Frame) {
        let reply = match self.variant {
            Variant::Ddsm115 => self.handle_ddsm115(frame),
            Variant::Ddsm210 => self.handle_ddsm210(frame),
        };
        self.reply = match reply {
            Some(mut reply) if std::mem::take(&mut self.corrupt_next_reply) => {
                reply[FRAME_LEN - 1] ^= 0xFF;
                Some(reply)
            }
            other => other,
        };
    }

    fn handle_ddsm115(&mut self, frame: &Frame) -> Option<Frame> {
        // Raw frames first: neither carries a checksum
        if frame[..3] == [CommandCode::QueryId as u8, 0x55, CommandCode::SetDeviceId as u8] {
            let new_id = frame[3];
            if self.motors.len() == 1 && !self.motors.contains_key(&new_id) {
                let (_, motor) = self.motors.pop_first()?;
                self.motors.insert(new_id, motor);
            }
            return None;
        }
        if frame[1] == CommandCode::ModeSwitch as u8 {
            let mode = ControlMode::from_byte(frame[FRAME_LEN - 1])?;
            self.motors.get_mut(&frame[0])?.mode = mode;
            return None;
        }

        if protocol::crc8(&frame[..FRAME_LEN - 1]) != frame[FRAME_LEN - 1] {
            return None;
        }
        let id = frame[0];
        let motor = self.motors.get_mut(&id)?;
        let value = [frame[2], frame[3]];

        match frame[1] {
            c if c == CommandCode::FeedbackRequest as u8 => {
                let [t0, t1] = motor.current.to_be_bytes();
                let [v0, v1] = motor.reported_velocity().to_be_bytes();
                let pos = (motor.position as u32 * 255 / 32767) as u8;
                return Some(protocol::seal([
                    id,
                    motor.mode as u8,
                    t0,
                    t1,
                    v0,
                    v1,
                    motor.temperature,
                    pos,
                    0,
                ]));
            }
            c if c == CommandCode::Drive as u8 && motor.enabled => match motor.mode {
                ControlMode::Velocity => motor.velocity = i16::from_be_bytes(value) as f32,
                ControlMode::Current => motor.current = i16::from_be_bytes(value),
                ControlMode::Position => motor.position = u16::from_be_bytes(value),
            },
            c if c == CommandCode::EmergencyStop as u8 || c == CommandCode::Brake as u8 => {
                motor.velocity = 0.0
            }
            c if c == CommandCode::Enable as u8 => motor.enabled = true,
            c if c == CommandCode::Disable as u8 => motor.enabled = false,
            c if c == CommandCode::Drive as u8 || c == CommandCode::ReleaseBrake as u8 => {}
            c if c == CommandCode::PositionCalibration as u8 => motor.position = 0,
            _ => return None,
        }

        let [t0, t1] = motor.current.to_be_bytes();
        let [v0, v1] = motor.reported_velocity().to_be_bytes();
        let [p0, p1] = motor.position.to_be_bytes();
        Some(protocol::seal([
            id,
            motor.mode as u8,
            t0,
            t1,
            v0,
            v1,
            p0,
            p1,
            0,
        ]))
    }

    fn handle_ddsm210(&mut self, frame: &Frame) -> Option<Frame> {
        if protocol::crc8(&frame[..FRAME_LEN - 1]) != frame[FRAME_LEN - 1] {
            return None;
        }
        if *frame == ddsm210::id_query_frame() {
            return Some(protocol::seal([ddsm210::FIXED_ID, 0x64, 0, 0, 0, 0, 0, 0, 0]));
        }
        if *frame == ddsm210::id_assign_frame() {
            return None;
        }

        let motor = self.motors.get_mut(&ddsm210::FIXED_ID)?;
        if frame[0] != ddsm210::FIXED_ID {
            return None;
        }
        match frame[1] {
            0xA0 => {
                motor.mode = ControlMode::from_byte(frame[2])?;
                Some(protocol::seal([frame[0], 0xA0, motor.mode as u8, 0, 0, 0, 0, 0, 0]))
            }
            0x75 => Some(protocol::seal([frame[0], 0x75, motor.mode as u8, 0, 0, 0, 0, 0, 0])),
            0x64 => {
                motor.velocity = if frame[7] == 0xFF {
                    0.0
                } else {
                    i16::from_be_bytes([frame[2], frame[3]]) as f32 / 10.0
                };
                Some(protocol::seal([frame[0], 0x64, frame[2], frame[3], 0, 0, 0, 0, 0]))
            }
            _ => None,
        }
    }
}

/// Handle to a simulated bus; clones share the same motors.
#[derive(Debug, Clone)]
pub struct SimBus {
    state: Arc<Mutex<SimState>>,
}

impl SimBus {
    fn new(variant: Variant, ids: &[u8]) -> Self {
        let motors = ids.iter().map(|&id| (id, SimMotor::default())).collect();
        Self {
            state: Arc::new(Mutex::new(SimState {
                variant,
                motors,
                sent: Vec::new(),
                reply: None,
                corrupt_next_reply: false,
                write_failure: false,
                writes_left: None,
                open_failure: false,
            })),
        }
    }

    /// DDSM115 motors at the given ids
    pub fn ddsm115(ids: &[u8]) -> Self {
        Self::new(Variant::Ddsm115, ids)
    }

    /// One DDSM210 motor
    pub fn ddsm210() -> Self {
        Self::new(Variant::Ddsm210, &[ddsm210::FIXED_ID])
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connector(&self, port_name: &str) -> Arc<dyn Connector> {
        Arc::new(SimConnector {
            port_name: port_name.to_string(),
            bus: self.clone(),
        })
    }

    /// Every frame written since creation or the last `clear_log`
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.lock().sent.clone()
    }

    pub fn clear_log(&self) {
        self.lock().sent.clear();
    }

    /// Raw value words (bytes 2-3) of every drive frame sent to `id`
    pub fn drive_values(&self, id: u8) -> Vec<[u8; 2]> {
        self.lock()
            .sent
            .iter()
            .filter(|f| f[0] == id && f[1] == CommandCode::Drive as u8)
            .map(|f| [f[2], f[3]])
            .collect()
    }

    pub fn motor_ids(&self) -> Vec<u8> {
        self.lock().motors.keys().copied().collect()
    }

    pub fn velocity_of(&self, id: u8) -> Option<f32> {
        self.lock().motors.get(&id).map(|m| m.velocity)
    }

    pub fn mode_of(&self, id: u8) -> Option<ControlMode> {
        self.lock().motors.get(&id).map(|m| m.mode)
    }

    /// Change the mode behind the host's back
    pub fn set_motor_mode(&self, id: u8, mode: ControlMode) {
        if let Some(motor) = self.lock().motors.get_mut(&id) {
            motor.mode = mode;
        }
    }

    /// Report this velocity regardless of what was commanded
    pub fn set_reported_velocity(&self, id: u8, rpm: f32) {
        if let Some(motor) = self.lock().motors.get_mut(&id) {
            motor.reported_velocity = Some(rpm);
        }
    }

    pub fn set_temperature(&self, id: u8, celsius: u8) {
        if let Some(motor) = self.lock().motors.get_mut(&id) {
            motor.temperature = celsius;
        }
    }

    pub fn corrupt_next_reply(&self) {
        self.lock().corrupt_next_reply = true;
    }

    pub fn set_write_failure(&self, fail: bool) {
        self.lock().write_failure = fail;
    }

    /// Accept `count` more writes, then fail every one after
    pub fn fail_writes_after(&self, count: usize) {
        self.lock().writes_left = Some(count);
    }

    pub fn set_open_failure(&self, fail: bool) {
        self.lock().open_failure = fail;
    }
}

struct SimConnector {
    port_name: String,
    bus: SimBus,
}

impl Connector for SimConnector {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn open(&self) -> Result<Box<dyn Link>> {
        if self.bus.lock().open_failure {
            return Err(serialport::Error::new(
                serialport::ErrorKind::NoDevice,
                format!("{} unavailable", self.port_name),
            )
            .into());
        }
        Ok(Box::new(SimLink {
            bus: self.bus.clone(),
        }))
    }
}

struct SimLink {
    bus: SimBus,
}

impl Link for SimLink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let mut state = self.bus.lock();
        if state.write_failure || state.writes_left == Some(0) {
            return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe).into());
        }
        if let Some(left) = state.writes_left.as_mut() {
            *left -= 1;
        }
        trace!("SIM TX {:02X?}", frame);
        state.sent.push(*frame);
        state.handle(frame);
        Ok(())
    }

    fn read_frame(&mut self, _timeout: Duration) -> Result<Frame> {
        self.bus.lock().reply.take().ok_or(MotorError::Timeout)
    }

    fn clear_input(&mut self) -> Result<()> {
        self.bus.lock().reply = None;
        Ok(())
    }
}
