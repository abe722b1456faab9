//! Adaptive-backoff schedule for `cell_update` polling.
//!
//! The poller only decides *when* the next check happens; the session
//! performs the check and reports back what the server said. It is active
//! exactly while the running queue is non-empty.

use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::settings::PollerSettings;

/// What to do after a failed check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Try again after the error delay.
    Retry,
    /// Too many failures; polling has stopped.
    Abort,
}

#[derive(Debug, Clone)]
pub struct UpdatePoller {
    deltas: Vec<Duration>,
    falloff_threshold: u32,
    error_delay: Duration,
    error_threshold: u32,

    active: bool,
    level: usize,
    update_count: u32,
    error_count: u32,
    delay: Duration,
    last_check: Option<Instant>,
}

impl Default for UpdatePoller {
    fn default() -> Self {
        Self::new(&PollerSettings::default())
    }
}

impl UpdatePoller {
    pub fn new(settings: &PollerSettings) -> Self {
        let deltas = settings.falloff_delays();
        let delay = deltas[0];
        Self {
            deltas,
            falloff_threshold: settings.falloff_threshold,
            error_delay: settings.error_delay(),
            error_threshold: settings.error_threshold,
            active: false,
            level: 0,
            update_count: 0,
            error_count: 0,
            delay,
            last_check: None,
        }
    }

    /// Begin polling. The first check is due immediately. Returns false if
    /// already active.
    pub fn start(&mut self) -> bool {
        if self.active {
            return false;
        }
        debug!("[poller] Starting update checks");
        self.active = true;
        self.level = 0;
        self.update_count = 0;
        self.delay = self.deltas[0];
        self.last_check = None;
        true
    }

    pub fn stop(&mut self) {
        if self.active {
            debug!("[poller] Stopping update checks");
        }
        self.active = false;
        self.last_check = None;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Current delay between checks.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Time left before the next check, or `None` when idle.
    pub fn time_until_next(&self, now: Instant) -> Option<Duration> {
        if !self.active {
            return None;
        }
        Some(match self.last_check {
            None => Duration::ZERO,
            Some(last) => self.delay.saturating_sub(now.saturating_duration_since(last)),
        })
    }

    /// A check is being issued at `now`.
    pub fn record_check(&mut self, now: Instant) {
        self.last_check = Some(now);
    }

    /// The check failed at the transport level or the body was unreadable.
    pub fn on_transport_failure(&mut self) -> FailureAction {
        if self.error_count > self.error_threshold {
            warn!(
                "[poller] Giving up after {} failed update checks",
                self.error_count
            );
            self.stop();
            return FailureAction::Abort;
        }
        self.delay = self.error_delay;
        self.error_count += 1;
        FailureAction::Retry
    }

    /// A response arrived; recover from any earlier failures.
    pub fn on_success(&mut self) {
        if self.error_count > 0 {
            debug!("[poller] Recovered after {} failures", self.error_count);
            self.error_count = 0;
            self.update_count = 0;
            self.level = 1.min(self.deltas.len() - 1);
            self.delay = self.deltas[self.level];
        }
    }

    /// The polled cell is still working (or nothing new yet).
    pub fn on_working(&mut self) {
        if self.update_count > self.falloff_threshold && self.level + 1 < self.deltas.len() {
            self.level += 1;
            self.update_count = 0;
            self.delay = self.deltas[self.level];
            debug!("[poller] Backing off to {:?}", self.delay);
        } else {
            self.update_count += 1;
        }
    }

    /// The polled cell finished.
    pub fn on_done(&mut self) {
        self.update_count = 0;
        self.level = 0;
        self.delay = self.deltas[0];
    }
}
