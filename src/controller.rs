// Motor controller facade
//
// Detects which firmware is on the port, then routes every call through the
// command queue of that connection. Calls made while disconnected return
// false/None instead of failing.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::{info, warn};

use crate::config::ControllerConfig;
use crate::hooks::{CommandCallback, FeedbackCallback, SharedHooks};
use crate::motor::{
    self, Connector, ControlMode, Feedback, MotorDriver, SerialConnector, Variant,
    VariantPreference,
};
use crate::queue::{Command, CommandQueue, QueueStats};
use crate::registry::ControllerRegistry;

struct Session {
    variant: Variant,
    queue: Arc<CommandQueue>,
}

pub struct MotorController {
    connector: Arc<dyn Connector>,
    config: ControllerConfig,
    hooks: SharedHooks,
    session: RwLock<Option<Session>>,
    registry: Option<(Arc<ControllerRegistry>, u64)>,
}

impl MotorController {
    pub fn new(connector: Arc<dyn Connector>, config: ControllerConfig) -> Arc<Self> {
        Arc::new(Self::build(connector, config, None))
    }

    /// Controller on a serial port with default settings
    pub fn serial(port: &str) -> Arc<Self> {
        Self::new(Arc::new(SerialConnector::new(port)), ControllerConfig::default())
    }

    /// Controller that `registry.shutdown_all()` can reach
    pub fn with_registry(
        connector: Arc<dyn Connector>,
        config: ControllerConfig,
        registry: &Arc<ControllerRegistry>,
    ) -> Arc<Self> {
        let key = registry.next_key();
        let controller = Arc::new(Self::build(
            connector,
            config,
            Some((Arc::clone(registry), key)),
        ));
        registry.register(key, Arc::downgrade(&controller));
        controller
    }

    fn build(
        connector: Arc<dyn Connector>,
        config: ControllerConfig,
        registry: Option<(Arc<ControllerRegistry>, u64)>,
    ) -> Self {
        Self {
            connector,
            config,
            hooks: SharedHooks::default(),
            session: RwLock::new(None),
            registry,
        }
    }

    pub fn port_name(&self) -> &str {
        self.connector.port_name()
    }

    fn queue(&self) -> Option<Arc<CommandQueue>> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| Arc::clone(&s.queue))
    }

    fn take_session(&self) -> Option<Session> {
        self.session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    // === Connection ===

    /// Open the port and pin the driver for this connection
    pub fn connect(&self) -> bool {
        if self.is_connected() {
            return true;
        }

        let preference = self.config.variant;
        for variant in preference.detection_order(self.port_name()) {
            let Some(driver) = self.open_driver(variant, preference == VariantPreference::Auto)
            else {
                continue;
            };

            let queue = Arc::new(CommandQueue::new(
                driver,
                self.config.queue.clone(),
                self.hooks.clone(),
            ));
            if let Err(e) = queue.start() {
                queue.close();
                self.hooks
                    .error(&format!("Could not start command queue: {}", e));
                return false;
            }

            let raced = {
                let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
                if session.is_some() {
                    true
                } else {
                    *session = Some(Session {
                        variant,
                        queue: Arc::clone(&queue),
                    });
                    false
                }
            };
            if raced {
                // Another caller connected while we were detecting
                queue.close();
            } else {
                info!("Connected to {} on {}", variant, self.port_name());
            }
            return true;
        }

        let wanted = match preference {
            VariantPreference::Auto => "DDSM115 or DDSM210".to_string(),
            VariantPreference::Ddsm115 => Variant::Ddsm115.to_string(),
            VariantPreference::Ddsm210 => Variant::Ddsm210.to_string(),
        };
        self.hooks
            .error(&format!("No {} motor answered on {}", wanted, self.port_name()));
        false
    }

    /// Connect a driver; during auto-detection a motor must also answer
    fn open_driver(&self, variant: Variant, detect: bool) -> Option<Box<dyn MotorDriver>> {
        let mut driver =
            motor::driver_for(variant, Arc::clone(&self.connector), self.config.driver.clone());

        if !driver.connect() {
            self.report(driver.as_mut());
            return None;
        }

        if detect {
            if !driver.probe() {
                info!("No {} answered on {}", variant, self.port_name());
                driver.disconnect();
                // Silence from the wrong firmware is expected here
                driver.take_diagnostics();
                return None;
            }
        } else if variant == Variant::Ddsm210 && !driver.probe() {
            // Init runs on the first answer; keep the link so it can run later
            warn!("DDSM210 did not answer on {}", self.port_name());
        }

        self.report(driver.as_mut());
        Some(driver)
    }

    fn report(&self, driver: &mut dyn MotorDriver) {
        for message in driver.take_diagnostics() {
            self.hooks.error(&message);
        }
    }

    /// Zero every registered motor and close the port
    pub fn disconnect(&self) {
        if let Some(session) = self.take_session() {
            session.queue.close();
            info!("Disconnected from {}", self.port_name());
        }
    }

    pub fn is_connected(&self) -> bool {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Variant pinned for the current connection
    pub fn variant(&self) -> Option<Variant> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.variant)
    }

    /// Emergency-stop every known motor and close the port
    pub fn shutdown(&self) {
        let Some(session) = self.take_session() else {
            return;
        };
        // DDSM115 motors may sit at ids nobody registered
        let extra: Vec<u8> = match session.variant {
            Variant::Ddsm115 => self.config.driver.probe_ids.clone().collect(),
            Variant::Ddsm210 => vec![motor::protocol::ddsm210::FIXED_ID],
        };
        session.queue.emergency_close(&extra);
    }

    // === Devices ===

    /// Ids in `start..=end` that answer; each one is registered for polling
    pub fn scan(&self, start: u8, end: u8) -> Vec<u8> {
        match self.queue() {
            Some(queue) => queue.scan(start..=end),
            None => Vec::new(),
        }
    }

    /// Poll a motor in the feedback loop without scanning for it
    pub fn register_device(&self, id: u8) -> bool {
        match self.queue() {
            Some(queue) => {
                queue.register_device(id);
                true
            }
            None => false,
        }
    }

    pub fn set_device_id(&self, old_id: u8, new_id: u8, callback: Option<CommandCallback>) -> bool {
        let ok = self.queue().is_some_and(|q| q.set_device_id(old_id, new_id));
        if let Some(callback) = callback {
            self.hooks.guarded("command callback", || callback(ok));
        }
        ok
    }

    // === Commands ===

    fn submit(&self, id: u8, command: Command, callback: Option<CommandCallback>) -> bool {
        match self.queue() {
            Some(queue) => {
                queue.enqueue(id, command, callback);
                true
            }
            None => false,
        }
    }

    pub fn set_velocity(&self, id: u8, rpm: f32, callback: Option<CommandCallback>) -> bool {
        self.submit(id, Command::SetVelocity(rpm), callback)
    }

    pub fn set_current(&self, id: u8, amps: f32, callback: Option<CommandCallback>) -> bool {
        self.submit(id, Command::SetCurrent(amps), callback)
    }

    pub fn set_position(&self, id: u8, degrees: f32, callback: Option<CommandCallback>) -> bool {
        self.submit(id, Command::SetPosition(degrees), callback)
    }

    pub fn set_mode(&self, id: u8, mode: ControlMode, callback: Option<CommandCallback>) -> bool {
        self.submit(id, Command::SetMode(mode), callback)
    }

    pub fn enable(&self, id: u8, callback: Option<CommandCallback>) -> bool {
        self.submit(id, Command::Enable, callback)
    }

    pub fn disable(&self, id: u8, callback: Option<CommandCallback>) -> bool {
        self.submit(id, Command::Disable, callback)
    }

    /// Stop now, ahead of and instead of anything queued for the motor
    pub fn stop(&self, id: u8, callback: Option<CommandCallback>) -> bool {
        match self.queue() {
            Some(queue) => queue.stop(id, callback),
            None => false,
        }
    }

    /// Like `stop`, but handed to the command loop instead of blocking
    pub fn request_stop(&self, id: u8, callback: Option<CommandCallback>) -> bool {
        self.submit(id, Command::Stop, callback)
    }

    /// Run a one-off driver call with the bus held, outside the queue
    fn direct(
        &self,
        callback: Option<CommandCallback>,
        f: impl FnOnce(&mut dyn MotorDriver) -> bool,
    ) -> bool {
        let ok = self.queue().is_some_and(|q| q.exclusive(f));
        if let Some(callback) = callback {
            self.hooks.guarded("command callback", || callback(ok));
        }
        ok
    }

    /// Hold the motor in place; on a DDSM210 this is its emergency brake
    pub fn brake(&self, id: u8, callback: Option<CommandCallback>) -> bool {
        self.direct(callback, |d| d.brake(id))
    }

    pub fn release_brake(&self, id: u8, callback: Option<CommandCallback>) -> bool {
        self.direct(callback, |d| d.release_brake(id))
    }

    /// Make the current shaft angle the zero position (DDSM115 only)
    pub fn calibrate_position(&self, id: u8, callback: Option<CommandCallback>) -> bool {
        self.direct(callback, |d| d.calibrate_position(id))
    }

    // === Telemetry ===

    /// Poll a motor immediately, outside the queue
    pub fn request_feedback(&self, id: u8, callback: Option<FeedbackCallback>) -> Option<Feedback> {
        let feedback = self.queue()?.request_feedback(id)?;
        if let Some(callback) = callback {
            self.hooks.guarded("feedback callback", || callback(&feedback));
        }
        Some(feedback)
    }

    pub fn get_last_feedback(&self, id: u8) -> Option<Feedback> {
        self.queue()?.last_feedback(id)
    }

    pub fn device_mode(&self, id: u8) -> Option<ControlMode> {
        self.queue()?.device_mode(id)
    }

    /// Recent polled feedback for a motor, oldest first
    pub fn feedback_history(&self, id: u8) -> Vec<Feedback> {
        self.queue().map(|q| q.feedback_history(id)).unwrap_or_default()
    }

    /// Forget recorded feedback for one motor, or for all with `None`
    pub fn clear_feedback_history(&self, id: Option<u8>) {
        if let Some(queue) = self.queue() {
            queue.clear_feedback_history(id);
        }
    }

    /// Registered motor ids
    pub fn devices(&self) -> Vec<u8> {
        self.queue().map(|q| q.devices()).unwrap_or_default()
    }

    pub fn get_stats(&self) -> QueueStats {
        self.queue().map(|q| q.stats()).unwrap_or_default()
    }

    // === Hooks ===

    pub fn on_feedback(&self, hook: impl Fn(u8, &Feedback) + Send + Sync + 'static) {
        self.hooks.set_on_feedback(Arc::new(hook));
    }

    pub fn on_error(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.hooks.set_on_error(Arc::new(hook));
    }

    pub fn on_command_sent(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.set_on_command_sent(Arc::new(hook));
    }
}

impl Drop for MotorController {
    fn drop(&mut self) {
        if let Some((registry, key)) = &self.registry {
            registry.deregister(*key);
        }
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriverConfig, QueueConfig};
    use crate::motor::SimBus;
    use crate::motor::protocol::{self, CommandCode, ddsm210};
    use std::sync::Mutex;
    use std::sync::mpsc;
    use std::time::Duration;

    fn config(variant: VariantPreference) -> ControllerConfig {
        ControllerConfig {
            variant,
            driver: DriverConfig::instant(),
            queue: QueueConfig::instant(),
        }
    }

    fn auto(bus: &SimBus, port: &str) -> Arc<MotorController> {
        MotorController::new(bus.connector(port), config(VariantPreference::Auto))
    }

    #[test]
    fn test_detects_ddsm115_on_usb_port() {
        let bus = SimBus::ddsm115(&[1]);
        let controller = auto(&bus, "/dev/ttyUSB0");

        for _ in 0..3 {
            assert!(controller.connect());
            assert_eq!(controller.variant(), Some(Variant::Ddsm115));
            controller.disconnect();
            assert!(!controller.is_connected());
            assert_eq!(controller.variant(), None);
        }
    }

    #[test]
    fn test_detects_ddsm210_on_acm_port() {
        let bus = SimBus::ddsm210();
        let controller = auto(&bus, "/dev/ttyACM0");

        for _ in 0..3 {
            assert!(controller.connect());
            assert_eq!(controller.variant(), Some(Variant::Ddsm210));
            controller.disconnect();
        }
        // B is tried first on ACM ports: no DDSM115 request ever went out
        assert!(
            !bus.sent_frames()
                .iter()
                .any(|f| f[1] == CommandCode::FeedbackRequest as u8)
        );
    }

    #[test]
    fn test_detection_falls_back() {
        let bus = SimBus::ddsm115(&[2]);
        let controller = auto(&bus, "/dev/ttyACM0");
        assert!(controller.connect());
        assert_eq!(controller.variant(), Some(Variant::Ddsm115));
        assert_eq!(bus.sent_frames()[0], ddsm210::id_query_frame());

        let bus = SimBus::ddsm210();
        let controller = auto(&bus, "/dev/ttyUSB0");
        assert!(controller.connect());
        assert_eq!(controller.variant(), Some(Variant::Ddsm210));
    }

    #[test]
    fn test_connect_fails_without_motors() {
        let bus = SimBus::ddsm115(&[]);
        let controller = auto(&bus, "/dev/ttyUSB0");
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        controller.on_error(move |msg| sink.lock().unwrap().push(msg.to_string()));

        assert!(!controller.connect());
        assert!(errors.lock().unwrap().last().unwrap().contains("No DDSM115 or DDSM210"));

        bus.set_open_failure(true);
        assert!(!controller.connect());
    }

    #[test]
    fn test_explicit_variant_skips_detection() {
        let bus = SimBus::ddsm115(&[]);
        let controller = MotorController::new(
            bus.connector("/dev/ttyACM0"),
            config(VariantPreference::Ddsm115),
        );
        assert!(controller.connect());
        assert_eq!(controller.variant(), Some(Variant::Ddsm115));
        assert!(bus.sent_frames().is_empty());
    }

    #[test]
    fn test_disconnected_calls_are_refused() {
        let bus = SimBus::ddsm115(&[1]);
        let controller = auto(&bus, "/dev/ttyUSB0");

        assert!(!controller.set_velocity(1, 10.0, None));
        assert!(!controller.stop(1, None));
        assert!(!controller.request_stop(1, None));
        assert!(!controller.register_device(1));
        assert!(!controller.brake(1, None));
        assert!(controller.request_feedback(1, None).is_none());
        assert!(controller.feedback_history(1).is_empty());
        assert!(controller.scan(1, 10).is_empty());
        assert_eq!(controller.get_stats(), QueueStats::default());
    }

    #[test]
    fn test_commands_reach_the_motor() {
        let bus = SimBus::ddsm115(&[1, 2]);
        let controller = auto(&bus, "/dev/ttyUSB0");
        assert!(controller.connect());
        assert_eq!(controller.scan(1, 10), vec![1, 2]);
        assert_eq!(controller.devices(), vec![1, 2]);

        let (tx, rx) = mpsc::channel();
        assert!(controller.set_velocity(
            2,
            999.0,
            Some(Box::new(move |ok: bool| {
                let _ = tx.send(ok);
            }))
        ));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(true));
        assert_eq!(bus.drive_values(2), vec![[0x00, 0x8F]]);
        assert_eq!(controller.device_mode(2), Some(ControlMode::Velocity));

        assert!(controller.stop(2, None));
        assert_eq!(bus.velocity_of(2), Some(0.0));
        assert!(controller.get_stats().processed >= 2);
    }

    #[test]
    fn test_request_feedback_with_callback() {
        let bus = SimBus::ddsm115(&[3]);
        bus.set_temperature(3, 37);
        let controller = auto(&bus, "/dev/ttyUSB0");
        assert!(controller.connect());

        let (tx, rx) = mpsc::channel();
        let feedback = controller
            .request_feedback(
                3,
                Some(Box::new(move |f: &Feedback| {
                    let _ = tx.send(f.temperature);
                })),
            )
            .unwrap();
        assert_eq!(feedback.temperature, 37);
        assert_eq!(rx.try_recv(), Ok(37));
        assert_eq!(controller.get_last_feedback(3).map(|f| f.temperature), Some(37));
    }

    #[test]
    fn test_brake_and_calibrate() {
        let bus = SimBus::ddsm115(&[1]);
        let controller = auto(&bus, "/dev/ttyUSB0");
        assert!(controller.connect());
        assert!(controller.set_position(1, 180.0, None));
        assert!(controller.set_velocity(1, 30.0, None));
        for _ in 0..200 {
            if bus.velocity_of(1) == Some(30.0) {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(bus.velocity_of(1), Some(30.0));

        let (tx, rx) = mpsc::channel();
        assert!(controller.brake(
            1,
            Some(Box::new(move |ok: bool| {
                let _ = tx.send(ok);
            }))
        ));
        assert_eq!(rx.try_recv(), Ok(true));
        assert_eq!(bus.velocity_of(1), Some(0.0));
        assert!(controller.release_brake(1, None));
        assert!(controller.request_feedback(1, None).unwrap().position > 0.0);
        assert!(controller.calibrate_position(1, None));

        let codes: Vec<u8> = bus.sent_frames().iter().map(|f| f[1]).collect();
        for code in [
            CommandCode::Brake,
            CommandCode::ReleaseBrake,
            CommandCode::PositionCalibration,
        ] {
            assert!(codes.contains(&(code as u8)));
        }
        let feedback = controller.request_feedback(1, None).unwrap();
        assert_eq!(feedback.position, 0.0);
    }

    #[test]
    fn test_ddsm210_cannot_calibrate() {
        let bus = SimBus::ddsm210();
        let controller = auto(&bus, "/dev/ttyACM0");
        assert!(controller.connect());
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        controller.on_error(move |msg| sink.lock().unwrap().push(msg.to_string()));

        let (tx, rx) = mpsc::channel();
        assert!(!controller.calibrate_position(
            1,
            Some(Box::new(move |ok: bool| {
                let _ = tx.send(ok);
            }))
        ));
        assert_eq!(rx.try_recv(), Ok(false));
        assert!(
            errors
                .lock()
                .unwrap()
                .iter()
                .any(|e| e.contains("Position calibration"))
        );
        assert!(controller.brake(1, None));
        assert_eq!(bus.velocity_of(1), Some(0.0));
    }

    #[test]
    fn test_feedback_history_follows_polls() {
        let bus = SimBus::ddsm115(&[3]);
        let controller = auto(&bus, "/dev/ttyUSB0");
        assert!(controller.connect());

        for celsius in [30, 31] {
            bus.set_temperature(3, celsius);
            assert!(controller.request_feedback(3, None).is_some());
        }
        let temperatures: Vec<u8> = controller
            .feedback_history(3)
            .iter()
            .map(|f| f.temperature)
            .collect();
        // The feedback loop may add polls of its own in between
        assert_eq!(temperatures.first(), Some(&30));
        assert_eq!(temperatures.last(), Some(&31));

        controller.clear_feedback_history(Some(3));
        assert!(
            controller
                .feedback_history(3)
                .iter()
                .all(|f| f.temperature == 31)
        );
    }

    #[test]
    fn test_set_device_id() {
        let bus = SimBus::ddsm115(&[1]);
        let controller = auto(&bus, "/dev/ttyUSB0");
        assert!(controller.connect());
        assert_eq!(controller.scan(1, 10), vec![1]);

        let (tx, rx) = mpsc::channel();
        assert!(controller.set_device_id(
            1,
            7,
            Some(Box::new(move |ok: bool| {
                let _ = tx.send(ok);
            }))
        ));
        assert_eq!(rx.try_recv(), Ok(true));
        assert_eq!(bus.motor_ids(), vec![7]);
        assert_eq!(controller.devices(), vec![7]);

        let assignments = bus
            .sent_frames()
            .iter()
            .filter(|f| **f == protocol::set_id_frame(7))
            .count();
        assert_eq!(assignments, 5);
    }

    #[test]
    fn test_ddsm210_rejects_position() {
        let bus = SimBus::ddsm210();
        let controller = auto(&bus, "/dev/ttyACM0");
        assert!(controller.connect());
        assert_eq!(controller.scan(1, 10), vec![1]);

        let (tx, rx) = mpsc::channel();
        controller.set_position(
            1,
            90.0,
            Some(Box::new(move |ok: bool| {
                let _ = tx.send(ok);
            })),
        );
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(false));
        assert!(controller.get_stats().failed >= 1);
    }

    #[test]
    fn test_shutdown_emergency_stops() {
        let bus = SimBus::ddsm115(&[1]);
        let controller = auto(&bus, "/dev/ttyUSB0");
        assert!(controller.connect());
        controller.shutdown();

        assert!(!controller.is_connected());
        let stopped: Vec<u8> = bus
            .sent_frames()
            .iter()
            .filter(|f| f[1] == CommandCode::EmergencyStop as u8)
            .map(|f| f[0])
            .collect();
        assert_eq!(stopped, (1..=10).collect::<Vec<u8>>());
    }
}
