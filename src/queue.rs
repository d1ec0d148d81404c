// Command queue and bus scheduler
//
// Two worker threads share the driver: the command loop dispatches coalesced
// commands (urgent stops first), the feedback loop polls registered motors.
// `stop` bypasses both and talks to the driver directly.
//
// Locks: the driver mutex is the bus critical section, the state mutex guards
// everything else. When both are needed the driver is always taken first.
// Callbacks and hooks run with neither held.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::config::QueueConfig;
use crate::hooks::{CommandCallback, SharedHooks};
use crate::motor::{ControlMode, DeviceState, Feedback, MotorDriver, MotorError};

/// A logical motor command
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    SetVelocity(f32),
    SetCurrent(f32),
    SetPosition(f32),
    SetMode(ControlMode),
    Enable,
    Disable,
    Stop,
}

/// Coalescing class of a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandKind {
    SetVelocity,
    SetCurrent,
    SetPosition,
    SetMode,
    Enable,
    Disable,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal = 1,
    High = 2,
    Emergency = 3,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::SetVelocity(_) => CommandKind::SetVelocity,
            Self::SetCurrent(_) => CommandKind::SetCurrent,
            Self::SetPosition(_) => CommandKind::SetPosition,
            Self::SetMode(_) => CommandKind::SetMode,
            Self::Enable => CommandKind::Enable,
            Self::Disable => CommandKind::Disable,
            Self::Stop => CommandKind::Stop,
        }
    }

    pub fn priority(&self) -> Priority {
        match self {
            Self::Stop => Priority::Emergency,
            Self::SetMode(_) => Priority::High,
            _ => Priority::Normal,
        }
    }
}

struct PendingCommand {
    device_id: u8,
    command: Command,
    callback: Option<CommandCallback>,
    priority: Priority,
    enqueued_at: Instant,
    seq: u64,
    /// Stop epoch of the device when enqueued; a later stop supersedes this command
    epoch: u64,
}

/// Heap entry: highest priority first, then oldest
struct Urgent(PendingCommand);

impl PartialEq for Urgent {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Urgent {}

impl PartialOrd for Urgent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Urgent {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.seq.cmp(&self.0.seq))
    }
}

/// Queue counters, plus depth and success rate (percent)
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub processed: u64,
    pub failed: u64,
    pub dropped: u64,
    pub feedback_count: u64,
    pub queue_size: usize,
    pub pending_commands: usize,
    pub success_rate: f64,
}

/// What became of one dispatched command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    /// A stop for the motor came first; nothing was sent
    Superseded,
}

/// Shared view of one registered motor
#[derive(Debug, Default)]
struct TrackedDevice {
    state: DeviceState,
    /// Oldest first, capped at `QueueConfig::history_len`
    history: VecDeque<Feedback>,
}

#[derive(Default)]
struct QueueState {
    coalesced: HashMap<(u8, CommandKind), PendingCommand>,
    urgent: BinaryHeap<Urgent>,
    devices: BTreeMap<u8, TrackedDevice>,
    epochs: HashMap<u8, u64>,
    last_poll: HashMap<u8, Instant>,
    last_dispatch: Option<Instant>,
    next_seq: u64,
    processed: u64,
    failed: u64,
    dropped: u64,
    feedback_count: u64,
}

impl QueueState {
    fn epoch(&self, id: u8) -> u64 {
        self.epochs.get(&id).copied().unwrap_or(0)
    }

    /// Discard everything pending for `id` and supersede anything in flight
    fn purge(&mut self, id: u8) -> usize {
        let before = self.coalesced.len() + self.urgent.len();
        self.coalesced.retain(|(device, _), _| *device != id);
        self.urgent.retain(|entry| entry.0.device_id != id);
        let purged = before - self.coalesced.len() - self.urgent.len();

        self.dropped += purged as u64;
        *self.epochs.entry(id).or_insert(0) += 1;
        purged
    }

    fn pop(&mut self) -> Option<PendingCommand> {
        if let Some(Urgent(command)) = self.urgent.pop() {
            return Some(command);
        }
        let key = self
            .coalesced
            .iter()
            .min_by_key(|(_, pending)| pending.seq)
            .map(|(key, _)| *key)?;
        self.coalesced.remove(&key)
    }

    fn stats(&self) -> QueueStats {
        let total = self.processed + self.failed;
        let success_rate = if total > 0 {
            self.processed as f64 / total as f64 * 100.0
        } else {
            0.0
        };
        QueueStats {
            processed: self.processed,
            failed: self.failed,
            dropped: self.dropped,
            feedback_count: self.feedback_count,
            queue_size: self.coalesced.len() + self.urgent.len(),
            pending_commands: self.coalesced.len(),
            success_rate,
        }
    }
}

/// Consecutive-failure backoff
#[derive(Debug)]
struct Backoff {
    steps: [Duration; 3],
    failures: u32,
}

impl Backoff {
    fn new(steps: [Duration; 3]) -> Self {
        Self { steps, failures: 0 }
    }

    fn failure(&mut self) -> Duration {
        self.failures += 1;
        match self.failures {
            0..5 => self.steps[0],
            5..10 => self.steps[1],
            _ => {
                self.failures = 0;
                self.steps[2]
            }
        }
    }

    fn reset(&mut self) {
        self.failures = 0;
    }
}

pub struct CommandQueue {
    driver: Mutex<Box<dyn MotorDriver>>,
    state: Mutex<QueueState>,
    hooks: SharedHooks,
    config: QueueConfig,
    running: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl CommandQueue {
    /// Wrap a connected driver; no threads run until `start`
    pub fn new(driver: Box<dyn MotorDriver>, config: QueueConfig, hooks: SharedHooks) -> Self {
        Self {
            driver: Mutex::new(driver),
            state: Mutex::new(QueueState::default()),
            hooks,
            config,
            running: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
        }
    }

    fn lock_driver(&self) -> MutexGuard<'_, Box<dyn MotorDriver>> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the command and feedback threads
    pub fn start(self: &Arc<Self>) -> std::io::Result<()> {
        if self.running.swap(true, AtomicOrdering::SeqCst) {
            return Ok(());
        }

        let command_queue = Arc::clone(self);
        let command = thread::Builder::new()
            .name("ddsm-commands".into())
            .spawn(move || command_queue.command_loop())?;
        let feedback_queue = Arc::clone(self);
        let feedback = thread::Builder::new()
            .name("ddsm-feedback".into())
            .spawn(move || feedback_queue.feedback_loop())?;

        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        workers.push(command);
        workers.push(feedback);
        info!("Command queue started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::SeqCst)
    }

    // === Submission ===

    pub fn enqueue(&self, device_id: u8, command: Command, callback: Option<CommandCallback>) {
        let mut state = self.lock_state();
        let seq = state.next_seq;
        state.next_seq += 1;

        let pending = PendingCommand {
            device_id,
            command,
            callback,
            priority: command.priority(),
            enqueued_at: Instant::now(),
            seq,
            epoch: state.epoch(device_id),
        };

        if pending.priority >= Priority::Emergency {
            state.urgent.push(Urgent(pending));
            return;
        }

        // Last write wins; the replaced callback is dropped unanswered
        if state
            .coalesced
            .insert((device_id, command.kind()), pending)
            .is_some()
        {
            state.dropped += 1;
            trace!("Motor {} {:?} replaced before dispatch", device_id, command.kind());
        }
    }

    /// Out-of-band stop: purge everything pending for the motor, then drive it to zero
    pub fn stop(&self, device_id: u8, callback: Option<CommandCallback>) -> bool {
        let ok = self.stop_now(device_id);
        self.finish(ok, callback);
        ok
    }

    /// Queue a stop ahead of every other command without blocking on the bus
    pub fn request_stop(&self, device_id: u8, callback: Option<CommandCallback>) {
        self.enqueue(device_id, Command::Stop, callback);
    }

    fn stop_now(&self, device_id: u8) -> bool {
        let mut driver = self.lock_driver();
        let purged = self.lock_state().purge(device_id);
        if purged > 0 {
            debug!("Stop of motor {} discarded {} pending commands", device_id, purged);
        }

        let mode_ok = driver.set_mode(device_id, ControlMode::Velocity);
        let velocity_ok = driver.set_velocity(device_id, 0.0);
        self.sync_device(driver.as_ref(), device_id);

        let diagnostics = driver.take_diagnostics();
        drop(driver);
        self.report(diagnostics);
        mode_ok && velocity_ok
    }

    // === Command loop ===

    fn command_loop(self: Arc<Self>) {
        let mut backoff = Backoff::new(self.config.backoff);
        while self.is_running() {
            match self.dispatch_next() {
                None => thread::sleep(self.config.idle_sleep),
                Some(Outcome::Succeeded) => {
                    backoff.reset();
                    thread::sleep(self.config.post_command_pause);
                }
                Some(Outcome::Failed) => {
                    let delay = backoff.failure();
                    thread::sleep(self.config.post_command_pause + delay);
                }
                Some(Outcome::Superseded) => thread::sleep(self.config.post_command_pause),
            }
        }
        debug!("Command loop exited");
    }

    /// Execute the next pending command; `None` when nothing is pending
    pub fn dispatch_next(&self) -> Option<Outcome> {
        self.pace();
        let pending = self.lock_state().pop()?;
        self.lock_state().last_dispatch = Some(Instant::now());
        Some(self.execute(pending))
    }

    fn pace(&self) {
        let last = self.lock_state().last_dispatch;
        if let Some(last) = last {
            let wait = self.config.min_command_interval.saturating_sub(last.elapsed());
            if !wait.is_zero() {
                thread::sleep(wait);
            }
        }
    }

    fn execute(&self, pending: PendingCommand) -> Outcome {
        let PendingCommand {
            device_id: id,
            command,
            callback,
            enqueued_at,
            epoch,
            ..
        } = pending;
        trace!(
            "Dispatching {:?} to motor {} after {:?}",
            command,
            id,
            enqueued_at.elapsed()
        );

        let outcome = match command {
            Command::Stop => Some(self.stop_now(id)),
            Command::SetPosition(degrees) => self.execute_position(id, epoch, degrees),
            Command::SetVelocity(rpm) => self.with_driver(id, epoch, |d| d.set_velocity(id, rpm)),
            Command::SetCurrent(amps) => self.with_driver(id, epoch, |d| d.set_current(id, amps)),
            Command::SetMode(mode) => self.with_driver(id, epoch, |d| d.set_mode(id, mode)),
            Command::Enable => self.with_driver(id, epoch, |d| d.enable(id)),
            Command::Disable => self.with_driver(id, epoch, |d| d.disable(id)),
        };

        match outcome {
            Some(ok) => {
                self.finish(ok, callback);
                if ok {
                    Outcome::Succeeded
                } else {
                    Outcome::Failed
                }
            }
            None => {
                debug!("{:?} for motor {} superseded by a stop", command, id);
                self.lock_state().dropped += 1;
                Outcome::Superseded
            }
        }
    }

    /// Position entry: spin down first when the motor is still turning
    fn execute_position(&self, id: u8, epoch: u64, degrees: f32) -> Option<bool> {
        let threshold = self.config.ramp_threshold;
        let ramp = self.with_driver(id, epoch, |driver| {
            let spinning = driver
                .last_feedback(id)
                .is_some_and(|f| f.velocity.abs() >= threshold);
            match driver.mode(id) {
                Some(ControlMode::Velocity | ControlMode::Current) if spinning => {
                    debug!("Motor {} still turning, ramping to zero first", id);
                    // Sent even when velocity mode is assumed; the assumption can be stale
                    let switched = driver.set_mode(id, ControlMode::Velocity);
                    Some(switched && driver.set_velocity(id, 0.0))
                }
                _ => None,
            }
        })?;

        match ramp {
            Some(false) => return Some(false),
            Some(true) => thread::sleep(self.config.ramp_settle),
            None => {}
        }
        self.with_driver(id, epoch, |driver| driver.set_position(id, degrees))
    }

    /// Run `f` on the bus unless a stop for `id` happened since `epoch`
    fn with_driver<R>(
        &self,
        id: u8,
        epoch: u64,
        f: impl FnOnce(&mut dyn MotorDriver) -> R,
    ) -> Option<R> {
        let mut driver = self.lock_driver();
        if self.lock_state().epoch(id) != epoch {
            return None;
        }

        let result = f(driver.as_mut());
        self.sync_device(driver.as_ref(), id);

        let diagnostics = driver.take_diagnostics();
        drop(driver);
        self.report(diagnostics);
        Some(result)
    }

    fn finish(&self, ok: bool, callback: Option<CommandCallback>) {
        {
            let mut state = self.lock_state();
            if ok {
                state.processed += 1;
            } else {
                state.failed += 1;
            }
        }
        if let Some(callback) = callback {
            self.hooks.guarded("command callback", || callback(ok));
        }
        if ok {
            self.hooks.command_sent();
        }
    }

    // === Feedback loop ===

    fn feedback_loop(self: Arc<Self>) {
        let mut backoff = Backoff::new(self.config.backoff);
        while self.is_running() {
            match self.poll_feedback_once() {
                None => thread::sleep(self.config.no_devices_sleep),
                Some((polled, answered)) => {
                    if polled > 0 && answered == 0 {
                        thread::sleep(backoff.failure());
                    } else if answered > 0 {
                        backoff.reset();
                    }
                    thread::sleep(self.config.feedback_tick);
                }
            }
        }
        debug!("Feedback loop exited");
    }

    /// Poll every registered motor that is due; `(polled, answered)`, or
    /// `None` when no motor is registered
    pub fn poll_feedback_once(&self) -> Option<(usize, usize)> {
        let interval = self.lock_driver().poll_interval();
        let due: Vec<u8> = {
            let state = self.lock_state();
            if state.devices.is_empty() {
                return None;
            }
            state
                .devices
                .keys()
                .copied()
                .filter(|id| {
                    state
                        .last_poll
                        .get(id)
                        .is_none_or(|last| last.elapsed() >= interval)
                })
                .collect()
        };

        let answered = due
            .iter()
            .filter(|&&id| self.request_feedback(id).is_some())
            .count();
        Some((due.len(), answered))
    }

    /// Poll one motor now, bypassing coalescing and pacing
    pub fn request_feedback(&self, id: u8) -> Option<Feedback> {
        let mut driver = self.lock_driver();
        let feedback = driver.request_feedback(id);

        let mut mismatch = None;
        if let Some(observed) = feedback.and_then(|f| f.mode) {
            let assumed = driver.mode(id);
            if let Some(expected) = assumed.filter(|&m| m != observed) {
                mismatch = Some(MotorError::ModeNotConfirmed {
                    id,
                    expected,
                    observed,
                });
            }
            if assumed != Some(observed) {
                driver.reconcile_mode(id, observed);
            }
        }

        {
            let mut state = self.lock_state();
            state.last_poll.insert(id, Instant::now());
            if let Some(feedback) = feedback {
                state.feedback_count += 1;
                let device = state.devices.entry(id).or_default();
                device.history.push_back(feedback);
                while device.history.len() > self.config.history_len {
                    device.history.pop_front();
                }
            }
        }
        self.sync_device(driver.as_ref(), id);

        let diagnostics = driver.take_diagnostics();
        drop(driver);
        self.report(diagnostics);
        if let Some(err) = mismatch {
            self.hooks.error(&err.to_string());
        }
        if let Some(feedback) = &feedback {
            self.hooks.feedback(id, feedback);
        }
        feedback
    }

    // === Device table ===

    /// Add a motor to the feedback loop
    pub fn register_device(&self, id: u8) {
        let driver = self.lock_driver();
        self.lock_state().devices.entry(id).or_default();
        self.sync_device(driver.as_ref(), id);
    }

    pub fn devices(&self) -> Vec<u8> {
        self.lock_state().devices.keys().copied().collect()
    }

    /// Copy what the driver knows about a registered motor into the shared table
    fn sync_device(&self, driver: &dyn MotorDriver, id: u8) {
        let mut state = self.lock_state();
        if let Some(device) = state.devices.get_mut(&id) {
            device.state.mode = driver.mode(id);
            device.state.last_feedback = driver.last_feedback(id);
        }
    }

    pub fn last_feedback(&self, id: u8) -> Option<Feedback> {
        self.lock_state()
            .devices
            .get(&id)
            .and_then(|d| d.state.last_feedback)
    }

    /// Feedback recorded for a motor, oldest first
    pub fn feedback_history(&self, id: u8) -> Vec<Feedback> {
        self.lock_state()
            .devices
            .get(&id)
            .map(|d| d.history.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Forget the recorded feedback of one motor, or of every motor
    pub fn clear_feedback_history(&self, id: Option<u8>) {
        let mut state = self.lock_state();
        match id {
            Some(id) => {
                if let Some(device) = state.devices.get_mut(&id) {
                    device.history.clear();
                }
            }
            None => state.devices.values_mut().for_each(|d| d.history.clear()),
        }
    }

    pub fn device_mode(&self, id: u8) -> Option<ControlMode> {
        self.lock_state().devices.get(&id).and_then(|d| d.state.mode)
    }

    pub fn stats(&self) -> QueueStats {
        self.lock_state().stats()
    }

    // === Exclusive bus access ===

    /// Scan ids and register every motor that answers
    pub fn scan(&self, ids: RangeInclusive<u8>) -> Vec<u8> {
        let found = self.exclusive(|driver| driver.scan(ids));
        for &id in &found {
            self.register_device(id);
        }
        found
    }

    /// Reassign a motor id; the device table follows the motor
    pub fn set_device_id(&self, old_id: u8, new_id: u8) -> bool {
        let mut driver = self.lock_driver();
        let ok = driver.set_device_id(old_id, new_id);
        if ok {
            let mut state = self.lock_state();
            state.purge(old_id);
            if let Some(device) = state.devices.remove(&old_id) {
                state.devices.insert(new_id, device);
            }
        }
        self.sync_device(driver.as_ref(), new_id);

        let diagnostics = driver.take_diagnostics();
        drop(driver);
        self.report(diagnostics);
        ok
    }

    /// Run `f` with the bus to itself
    pub fn exclusive<R>(&self, f: impl FnOnce(&mut dyn MotorDriver) -> R) -> R {
        let mut driver = self.lock_driver();
        let result = f(driver.as_mut());
        let diagnostics = driver.take_diagnostics();
        drop(driver);
        self.report(diagnostics);
        result
    }

    fn report(&self, diagnostics: Vec<String>) {
        for message in diagnostics {
            self.hooks.error(&message);
        }
    }

    // === Shutdown ===

    fn stop_workers(&self) {
        self.running.store(false, AtomicOrdering::SeqCst);
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        let current = thread::current().id();
        for handle in workers {
            // A hook may close the queue from one of its own threads
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("Queue worker panicked");
            }
        }
    }

    /// Stop the loops, zero every registered motor, close the link
    pub fn close(&self) {
        self.stop_workers();
        let ids = self.devices();

        let mut driver = self.lock_driver();
        if driver.is_connected() {
            for &id in &ids {
                driver.set_velocity(id, 0.0);
            }
        }
        driver.disconnect();
        let diagnostics = driver.take_diagnostics();
        drop(driver);
        self.report(diagnostics);
        info!("Command queue closed");
    }

    /// Stop the loops, emergency-stop every registered motor and `extra_ids`,
    /// close the link
    pub fn emergency_close(&self, extra_ids: &[u8]) {
        self.stop_workers();
        let mut ids = self.devices();
        for &id in extra_ids {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }

        let mut driver = self.lock_driver();
        if driver.is_connected() {
            for &id in &ids {
                driver.emergency_stop(id);
            }
        }
        driver.disconnect();
        let diagnostics = driver.take_diagnostics();
        drop(driver);
        warn!("Emergency stop issued to motors {:?}", ids);
        self.report(diagnostics);
    }
}
