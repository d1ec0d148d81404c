// User callbacks
//
// Hooks are registered on the controller and shared with the queue threads.
// They are always called with no lock held; a panicking hook is caught and
// reported through the error hook instead of killing the loop that called it.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{error, warn};

use crate::motor::Feedback;

pub type FeedbackHook = Arc<dyn Fn(u8, &Feedback) + Send + Sync>;
pub type ErrorHook = Arc<dyn Fn(&str) + Send + Sync>;
pub type CommandSentHook = Arc<dyn Fn() + Send + Sync>;

/// Completion of one queued command: `true` when the motor accepted it
pub type CommandCallback = Box<dyn FnOnce(bool) + Send>;
/// Receives the reply to a one-off feedback request
pub type FeedbackCallback = Box<dyn FnOnce(&Feedback) + Send>;

#[derive(Clone, Default)]
pub struct Hooks {
    pub on_feedback: Option<FeedbackHook>,
    pub on_error: Option<ErrorHook>,
    pub on_command_sent: Option<CommandSentHook>,
}

/// Hook set shared between the facade and the worker threads
#[derive(Clone, Default)]
pub struct SharedHooks {
    inner: Arc<RwLock<Hooks>>,
}

impl SharedHooks {
    pub fn set_on_feedback(&self, hook: FeedbackHook) {
        self.write(|h| h.on_feedback = Some(hook));
    }

    pub fn set_on_error(&self, hook: ErrorHook) {
        self.write(|h| h.on_error = Some(hook));
    }

    pub fn set_on_command_sent(&self, hook: CommandSentHook) {
        self.write(|h| h.on_command_sent = Some(hook));
    }

    fn write(&self, f: impl FnOnce(&mut Hooks)) {
        let mut hooks = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut hooks);
    }

    fn snapshot(&self) -> Hooks {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn feedback(&self, id: u8, feedback: &Feedback) {
        if let Some(hook) = self.snapshot().on_feedback {
            self.guarded("feedback hook", || hook(id, feedback));
        }
    }

    pub fn error(&self, message: &str) {
        warn!("{}", message);
        if let Some(hook) = self.snapshot().on_error {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| hook(message))) {
                error!("Error hook panicked: {}", panic_message(&*panic));
            }
        }
    }

    pub fn command_sent(&self) {
        if let Some(hook) = self.snapshot().on_command_sent {
            self.guarded("command-sent hook", || hook());
        }
    }

    /// Run a user callback, turning a panic into an error report
    pub fn guarded(&self, what: &str, f: impl FnOnce()) {
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(f)) {
            self.error(&format!("{} panicked: {}", what, panic_message(&*panic)));
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_panicking_hook_is_reported() {
        let hooks = SharedHooks::default();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        hooks.set_on_error(Arc::new(move |msg: &str| sink.lock().unwrap().push(msg.to_string())));
        hooks.set_on_command_sent(Arc::new(|| panic!("boom")));

        hooks.command_sent();

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("boom"));
    }

    #[test]
    fn test_formatted_panic_message_is_kept() {
        let hooks = SharedHooks::default();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        hooks.set_on_error(Arc::new(move |msg: &str| sink.lock().unwrap().push(msg.to_string())));

        let id = 7;
        hooks.guarded("command callback", || panic!("motor {} vanished", id));

        let errors = errors.lock().unwrap();
        assert_eq!(errors.as_slice(), ["command callback panicked: motor 7 vanished"]);
        assert_eq!(panic_message(&42u32), "unknown panic");
    }

    #[test]
    fn test_missing_hooks_are_no_ops() {
        let hooks = SharedHooks::default();
        hooks.command_sent();
        hooks.error("nobody listening");
    }
}
