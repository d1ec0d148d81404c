// Live controllers, for process-wide emergency shutdown
//
// Owned by the entry point and handed to each controller, which registers on
// construction and deregisters when dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{info, warn};

use crate::controller::MotorController;

#[derive(Default)]
pub struct ControllerRegistry {
    controllers: Mutex<HashMap<u64, Weak<MotorController>>>,
    next_key: AtomicU64,
}

impl ControllerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Weak<MotorController>>> {
        self.controllers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn next_key(&self) -> u64 {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, key: u64, controller: Weak<MotorController>) {
        self.lock().insert(key, controller);
    }

    pub(crate) fn deregister(&self, key: u64) {
        self.lock().remove(&key);
    }

    /// Controllers still alive
    pub fn len(&self) -> usize {
        self.lock().values().filter(|c| c.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Emergency-stop every live, connected controller; returns how many were stopped
    pub fn shutdown_all(&self) -> usize {
        // Upgrade first so no controller runs its shutdown under our lock
        let live: Vec<Arc<MotorController>> =
            self.lock().values().filter_map(Weak::upgrade).collect();

        let mut stopped = 0;
        for controller in live {
            if controller.is_connected() {
                warn!("Emergency shutdown of controller on {}", controller.port_name());
                controller.shutdown();
                stopped += 1;
            }
        }
        info!("Emergency shutdown stopped {} controller(s)", stopped);
        stopped
    }
}
