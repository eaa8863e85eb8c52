//! Fire-and-forget crash report sink.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error};

/// Receives unexpected failures. Implementations must never fail or block.
pub trait CrashReporter: Send + Sync {
    fn report(&self, context: &str, message: &str);

    fn set_enabled(&self, enabled: bool);
}

/// Default sink: reports go to the log.
#[derive(Debug)]
pub struct TracingCrashReporter {
    enabled: AtomicBool,
}

impl TracingCrashReporter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }
}

impl CrashReporter for TracingCrashReporter {
    fn report(&self, context: &str, message: &str) {
        if self.enabled.load(Ordering::Relaxed) {
            error!(context, message, "Crash report");
        } else {
            debug!(context, message, "Crash report (reporting disabled)");
        }
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }
}
