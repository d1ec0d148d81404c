// 50 Hz zenoh bridge with a per-motor watchdog
// Note: a motor told to turn keeps turning; if the teleop client dies mid-command,
// the watchdog stops every motor whose last motion command is older than CMD_TIMEOUT

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::config::{CMD_TIMEOUT, LOOP_HZ, TOPIC_CMD, TOPIC_FEEDBACK, TOPIC_HEALTH, TOPIC_STATS};
use crate::controller::MotorController;
use crate::messages::{FeedbackMessage, MotorCommand, RuntimeHealth};

pub struct Runtime {
    controller: Arc<MotorController>,
    /// Last motion command per motor, while it is commanded to move
    moving: HashMap<u8, Instant>,
    cmd_received_at: Option<Instant>,
    health: RuntimeHealth,
}

impl Runtime {
    pub fn new(controller: Arc<MotorController>) -> Self {
        Self {
            controller,
            moving: HashMap::new(),
            cmd_received_at: None,
            health: RuntimeHealth::CmdStale, // Start stale until first cmd
        }
    }

    pub fn health(&self) -> RuntimeHealth {
        self.health
    }

    /// Process incoming command
    fn on_command(&mut self, cmd: MotorCommand, now: Instant) {
        debug!("Received command: {:?}", cmd);
        self.cmd_received_at = Some(now);

        let id = cmd.device_id();
        match cmd.sets_motion() {
            Some(true) => {
                self.moving.insert(id, now);
            }
            Some(false) => {
                self.moving.remove(&id);
            }
            None => {}
        }

        let controller = &self.controller;
        let accepted = match cmd {
            MotorCommand::SetVelocity { id, rpm } => controller.set_velocity(id, rpm, None),
            MotorCommand::SetCurrent { id, amps } => controller.set_current(id, amps, None),
            MotorCommand::SetPosition { id, degrees } => {
                controller.set_position(id, degrees, None)
            }
            MotorCommand::SetMode { id, mode } => controller.set_mode(id, mode, None),
            MotorCommand::Enable { id } => controller.enable(id, None),
            MotorCommand::Disable { id } => controller.disable(id, None),
            // These block on the bus; run them off the async loop
            MotorCommand::Stop { id } => {
                let controller = Arc::clone(controller);
                tokio::task::spawn_blocking(move || controller.stop(id, None));
                true
            }
            MotorCommand::Brake { id } => {
                let controller = Arc::clone(controller);
                tokio::task::spawn_blocking(move || controller.brake(id, None));
                true
            }
            MotorCommand::ReleaseBrake { id } => {
                let controller = Arc::clone(controller);
                tokio::task::spawn_blocking(move || controller.release_brake(id, None));
                true
            }
            MotorCommand::CalibratePosition { id } => {
                let controller = Arc::clone(controller);
                tokio::task::spawn_blocking(move || controller.calibrate_position(id, None));
                true
            }
            MotorCommand::RequestFeedback { id } => {
                let controller = Arc::clone(controller);
                tokio::task::spawn_blocking(move || controller.request_feedback(id, None));
                true
            }
        };
        if !accepted {
            warn!("Command {:?} rejected: controller not connected", cmd);
        }
    }

    /// Watchdog: queue a stop for every motor whose motion command went stale
    fn check_watchdog(&mut self, now: Instant) -> Vec<u8> {
        let stale: Vec<u8> = self
            .moving
            .iter()
            .filter(|(_, at)| now.saturating_duration_since(**at) > CMD_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();

        for &id in &stale {
            warn!("Motor {} command stale, stopping", id);
            self.moving.remove(&id);
            self.controller.request_stop(id, None);
        }
        stale
    }

    fn update_health(&mut self, now: Instant) {
        let fresh = self
            .cmd_received_at
            .is_some_and(|at| now.saturating_duration_since(at) <= CMD_TIMEOUT);

        let health = if !self.controller.is_connected() {
            RuntimeHealth::Disconnected
        } else if fresh {
            RuntimeHealth::Ok
        } else {
            RuntimeHealth::CmdStale
        };
        if health != self.health {
            info!("Runtime health: {:?}", health);
        }
        self.health = health;
    }
}

pub async fn run(
    controller: Arc<MotorController>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    info!("Opening Zenoh session...");
    let session = zenoh::open(zenoh::Config::default()).await?;

    info!("Setting up publishers and subscribers...");
    let subscriber = session.declare_subscriber(TOPIC_CMD).await?;
    let pub_feedback = session.declare_publisher(TOPIC_FEEDBACK).await?;
    let pub_stats = session.declare_publisher(TOPIC_STATS).await?;
    let pub_health = session.declare_publisher(TOPIC_HEALTH).await?;

    // Feedback arrives on the queue's thread; hand it over to the async loop
    let (feedback_tx, mut feedback_rx) = mpsc::unbounded_channel();
    controller.on_feedback(move |id, feedback| {
        let _ = feedback_tx.send(FeedbackMessage::new(id, feedback));
    });

    let mut runtime = Runtime::new(controller);
    let mut tick = interval(Duration::from_millis(1000 / LOOP_HZ));
    let mut ticks: u64 = 0;

    info!(
        "Runtime started: {}Hz loop, {}ms watchdog timeout",
        LOOP_HZ,
        CMD_TIMEOUT.as_millis()
    );
    info!("Subscribed to: {}", TOPIC_CMD);
    info!(
        "Publishing to: {}, {}, {}",
        TOPIC_FEEDBACK, TOPIC_STATS, TOPIC_HEALTH
    );

    loop {
        tick.tick().await;
        ticks += 1;

        // 1. Drain all pending commands (non-blocking), in order
        while let Ok(Some(sample)) = subscriber.try_recv() {
            let payload = sample.payload().to_bytes();
            match serde_json::from_slice::<MotorCommand>(&payload) {
                Ok(cmd) => runtime.on_command(cmd, Instant::now()),
                Err(e) => warn!("Failed to parse command: {}", e),
            }
        }

        // 2. Watchdog
        let now = Instant::now();
        runtime.check_watchdog(now);
        runtime.update_health(now);

        // 3. Publish feedback collected since the last tick
        while let Ok(message) = feedback_rx.try_recv() {
            pub_feedback.put(serde_json::to_string(&message)?).await?;
        }

        // 4. Publish stats once a second
        if ticks % LOOP_HZ == 0 {
            let stats_json = serde_json::to_string(&runtime.controller.get_stats())?;
            pub_stats.put(stats_json).await?;
        }

        // 5. Publish health
        let health_json = serde_json::to_string(&runtime.health)?;
        pub_health.put(health_json).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ControllerConfig, DriverConfig, QueueConfig};
    use crate::motor::SimBus;

    fn connected_runtime(bus: &SimBus) -> Runtime {
        let config = ControllerConfig {
            driver: DriverConfig::instant(),
            queue: QueueConfig::instant(),
            ..Default::default()
        };
        let controller = MotorController::new(bus.connector("/dev/ttyUSB0"), config);
        assert!(controller.connect());
        Runtime::new(controller)
    }

    #[test]
    fn test_watchdog_stops_stale_motors_once() {
        let bus = SimBus::ddsm115(&[1, 2]);
        let mut runtime = connected_runtime(&bus);
        let t0 = Instant::now();

        runtime.on_command(MotorCommand::SetVelocity { id: 1, rpm: 30.0 }, t0);
        runtime.on_command(MotorCommand::SetVelocity { id: 2, rpm: 0.0 }, t0);

        assert!(runtime.check_watchdog(t0 + Duration::from_millis(100)).is_empty());
        assert_eq!(
            runtime.check_watchdog(t0 + Duration::from_millis(300)),
            vec![1]
        );
        assert!(runtime.check_watchdog(t0 + Duration::from_millis(600)).is_empty());

        // The queued stop reaches the motor through the command loop
        for _ in 0..200 {
            if runtime.controller.get_stats().queue_size == 0
                && bus.drive_values(1).last() == Some(&[0, 0])
            {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(bus.drive_values(1).last(), Some(&[0, 0]));
        assert_eq!(bus.velocity_of(1), Some(0.0));
    }

    #[test]
    fn test_fresh_command_keeps_motor_alive() {
        let bus = SimBus::ddsm115(&[1]);
        let mut runtime = connected_runtime(&bus);
        let t0 = Instant::now();

        runtime.on_command(MotorCommand::SetVelocity { id: 1, rpm: 30.0 }, t0);
        let t1 = t0 + Duration::from_millis(200);
        runtime.on_command(MotorCommand::SetVelocity { id: 1, rpm: 35.0 }, t1);
        assert!(runtime.check_watchdog(t0 + Duration::from_millis(400)).is_empty());
    }

    #[test]
    fn test_health_transitions() {
        let bus = SimBus::ddsm115(&[1]);
        let mut runtime = connected_runtime(&bus);
        let t0 = Instant::now();

        runtime.update_health(t0);
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);

        runtime.on_command(MotorCommand::Enable { id: 1 }, t0);
        runtime.update_health(t0 + Duration::from_millis(10));
        assert_eq!(runtime.health(), RuntimeHealth::Ok);

        runtime.update_health(t0 + Duration::from_millis(500));
        assert_eq!(runtime.health(), RuntimeHealth::CmdStale);

        runtime.controller.disconnect();
        runtime.update_health(t0);
        assert_eq!(runtime.health(), RuntimeHealth::Disconnected);
    }
}
