//! Start/stop supervision with exponential backoff.
//!
//! Discovery backends often fail transiently, for example when started too
//! soon after a stop. A [`Supervisor`] invokes a start (or stop) operation,
//! waits for the backend to confirm it, and retries with a growing delay
//! until it is confirmed or the attempt limit is reached. A role that runs
//! out of attempts stays stopped until `start` is called again.

use crate::config::BackoffConfig;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Supervised operation, invoked with the 1-based attempt number
pub type Operation = Arc<dyn Fn(u32) + Send + Sync>;

/// Hook run on a confirmed transition
pub type Hook = Arc<dyn Fn() + Send + Sync>;

/// Lifecycle phase of a supervised role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Not running
    Stopped,
    /// Start requested, not yet confirmed
    Starting,
    /// Start confirmed
    Started,
    /// Stop requested, not yet confirmed
    Stopping,
}

#[derive(Debug, Clone, Copy)]
struct State {
    phase: Phase,
    attempt: u32,
    /// Bumped on every transition so stale retry loops can tell they are done
    generation: u64,
}

/// Wraps a start/stop pair with confirmation tracking and retries
#[derive(Clone)]
pub struct Supervisor {
    name: String,
    backoff: BackoffConfig,
    state: Arc<watch::Sender<State>>,
    start: Operation,
    stop: Operation,
    on_started: Option<Hook>,
    on_stopped: Option<Hook>,
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = *self.state.borrow();
        f.debug_struct("Supervisor")
            .field("name", &self.name)
            .field("phase", &state.phase)
            .field("attempt", &state.attempt)
            .finish()
    }
}

impl Supervisor {
    /// Create a stopped supervisor
    pub fn new(name: impl Into<String>, backoff: BackoffConfig, start: Operation, stop: Operation) -> Self {
        let (state, _) = watch::channel(State {
            phase: Phase::Stopped,
            attempt: 0,
            generation: 0,
        });
        Self {
            name: name.into(),
            backoff,
            state: Arc::new(state),
            start,
            stop,
            on_started: None,
            on_stopped: None,
        }
    }

    /// Run a hook whenever a start is confirmed
    pub fn on_started(mut self, hook: Hook) -> Self {
        self.on_started = Some(hook);
        self
    }

    /// Run a hook whenever a stop is confirmed
    pub fn on_stopped(mut self, hook: Hook) -> Self {
        self.on_stopped = Some(hook);
        self
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.state.borrow().phase
    }

    /// Attempts made in the current transition (0 once confirmed)
    pub fn attempt(&self) -> u32 {
        self.state.borrow().attempt
    }

    /// Start unless already started or starting
    pub fn start(&self) {
        self.begin(Phase::Starting, &[Phase::Started, Phase::Starting]);
    }

    /// Stop unless already stopped or stopping
    pub fn stop(&self) {
        self.begin(Phase::Stopping, &[Phase::Stopped, Phase::Stopping]);
    }

    /// The backend reports that it started
    pub fn confirm_started(&self) -> bool {
        self.confirm(Phase::Started, self.on_started.as_ref())
    }

    /// The backend reports that it stopped
    pub fn confirm_stopped(&self) -> bool {
        self.confirm(Phase::Stopped, self.on_stopped.as_ref())
    }

    fn confirm(&self, phase: Phase, hook: Option<&Hook>) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if state.phase == phase {
                return false;
            }
            state.phase = phase;
            state.attempt = 0;
            state.generation += 1;
            true
        });
        if changed {
            info!("{} {:?}", self.name, phase);
            if let Some(hook) = hook {
                hook();
            }
        }
        changed
    }

    fn begin(&self, pending: Phase, skip: &[Phase]) {
        let mut generation = 0;
        let begun = self.state.send_if_modified(|state| {
            if skip.contains(&state.phase) {
                return false;
            }
            state.phase = pending;
            state.attempt = 0;
            state.generation += 1;
            generation = state.generation;
            true
        });
        if begun {
            tokio::spawn(self.clone().retry(pending, generation));
        }
    }

    async fn retry(self, pending: Phase, generation: u64) {
        let operation = if pending == Phase::Starting {
            self.start.clone()
        } else {
            self.stop.clone()
        };
        let mut changes = self.state.subscribe();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let current = self.state.send_if_modified(|state| {
                if state.generation != generation {
                    return false;
                }
                state.attempt = attempt;
                true
            });
            if !current {
                return;
            }

            debug!("{} {:?} attempt {}", self.name, pending, attempt);
            operation(attempt);

            let delay = self.backoff.delay_for(attempt);
            let _ = tokio::time::timeout(
                delay,
                changes.wait_for(|state| state.generation != generation),
            )
            .await;

            if self.state.borrow().generation != generation {
                return;
            }
            if attempt >= self.backoff.max_attempts {
                warn!("{} gave up after {} attempts", self.name, attempt);
                self.state.send_modify(|state| {
                    // A failed start leaves the role stopped; a failed stop
                    // leaves it running so stop can be retried
                    state.phase = if pending == Phase::Starting {
                        Phase::Stopped
                    } else {
                        Phase::Started
                    };
                    state.attempt = 0;
                    state.generation += 1;
                });
                return;
            }
        }
    }
}
