use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::browser::{BrowserError, BrowserSession};
use crate::credential::CredentialStore;
use crate::events::{EventHub, ProxyEvent};

#[derive(Debug, Clone)]
pub struct RotationConfig {
    /// Queue a switch after this many generative requests; 0 disables.
    pub switch_on_uses: u32,
    /// Queue a switch after this many terminal upstream errors; 0 disables.
    pub failure_threshold: u32,
    /// Upstream statuses that queue a switch regardless of the counters.
    pub immediate_switch_status_codes: Vec<u16>,
}

#[derive(Debug, Clone)]
pub struct RotationSnapshot {
    pub current_index: u32,
    pub usage_count: u32,
    pub failure_count: u32,
    pub pending_switch: bool,
    pub auth_switching: bool,
    pub system_busy: bool,
    pub unavailable: bool,
    pub active_requests: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    #[error("rotating accounts")]
    Rotating,
    #[error("proxy unavailable, manual account switch required")]
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    Completed { from: u32, to: u32 },
    /// Requests are still in flight; the switch runs when they drain.
    Deferred { target: Option<u32> },
    AlreadyInProgress,
}

#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    #[error("no other credential bundle available")]
    NoCredentials,
    #[error("switch failed, rolled back to previous account: {0}")]
    RolledBack(String),
    #[error("switch and rollback both failed, proxy unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug)]
struct RotationState {
    current_index: u32,
    usage_count: u32,
    failure_count: u32,
    pending_switch: bool,
    pending_target: Option<u32>,
    auth_switching: bool,
    system_busy: bool,
    unavailable: bool,
    active_requests: u32,
}

/// Owns every piece of rotation state behind one mutex and exposes small
/// guarded transitions. The browser call itself never runs under the lock;
/// `auth_switching`/`system_busy` serialise it instead.
pub struct RotationController {
    state: Mutex<RotationState>,
    config: RotationConfig,
    store: Arc<CredentialStore>,
    browser: Arc<dyn BrowserSession>,
    events: EventHub,
}

impl RotationController {
    pub fn new(
        config: RotationConfig,
        store: Arc<CredentialStore>,
        browser: Arc<dyn BrowserSession>,
        events: EventHub,
        initial_index: u32,
    ) -> Arc<Self> {
        let current_index = if store.contains(initial_index) {
            initial_index
        } else {
            let fallback = store.available_indices()[0];
            tracing::warn!(
                requested = initial_index,
                using = fallback,
                "initial auth index not available"
            );
            fallback
        };

        Arc::new(Self {
            state: Mutex::new(RotationState {
                current_index,
                usage_count: 0,
                failure_count: 0,
                pending_switch: false,
                pending_target: None,
                auth_switching: false,
                system_busy: false,
                unavailable: false,
                active_requests: 0,
            }),
            config,
            store,
            browser,
            events,
        })
    }

    pub fn config(&self) -> &RotationConfig {
        &self.config
    }

    pub fn snapshot(&self) -> RotationSnapshot {
        let state = self.lock();
        RotationSnapshot {
            current_index: state.current_index,
            usage_count: state.usage_count,
            failure_count: state.failure_count,
            pending_switch: state.pending_switch,
            auth_switching: state.auth_switching,
            system_busy: state.system_busy,
            unavailable: state.unavailable,
            active_requests: state.active_requests,
        }
    }

    pub fn current_index(&self) -> u32 {
        self.lock().current_index
    }

    pub fn is_system_busy(&self) -> bool {
        self.lock().system_busy
    }

    /// Admission gate. A granted accept must be balanced by exactly one
    /// `finalize` call.
    pub fn try_accept(&self, generative: bool) -> Result<(), AcceptError> {
        let mut state = self.lock();
        if state.unavailable {
            return Err(AcceptError::Unavailable);
        }
        if state.pending_switch || state.auth_switching {
            return Err(AcceptError::Rotating);
        }

        state.active_requests += 1;
        if generative && self.config.switch_on_uses > 0 {
            state.usage_count += 1;
            if state.usage_count >= self.config.switch_on_uses && !state.pending_switch {
                state.pending_switch = true;
                drop(state);
                self.events.emit(ProxyEvent::RotationPending {
                    reason: format!("usage threshold {} reached", self.config.switch_on_uses),
                });
            }
        }
        Ok(())
    }

    /// Record a terminal upstream error. Immediate-status and threshold
    /// triggers both queue a switch; an already-queued or running switch
    /// makes additional triggers no-ops.
    pub fn record_failure(&self, status: u16) {
        let reason = {
            let mut state = self.lock();
            state.failure_count += 1;

            let immediate = self
                .config
                .immediate_switch_status_codes
                .contains(&status);
            let threshold = self.config.failure_threshold > 0
                && state.failure_count >= self.config.failure_threshold;

            if (immediate || threshold) && !state.pending_switch && !state.auth_switching {
                state.pending_switch = true;
                Some(if immediate {
                    format!("upstream status {status}")
                } else {
                    format!("failure threshold {} reached", self.config.failure_threshold)
                })
            } else {
                None
            }
        };

        if let Some(reason) = reason {
            self.events.emit(ProxyEvent::RotationPending { reason });
        }
    }

    /// First success after a failure clears the failure counter.
    pub fn record_success(&self) {
        let mut state = self.lock();
        if state.failure_count > 0 {
            state.failure_count = 0;
        }
    }

    /// Balance one accept. When the last in-flight request drains with a
    /// switch queued, the switch runs on a background task.
    pub fn finalize(self: &Arc<Self>) {
        let run_switch = {
            let mut state = self.lock();
            state.active_requests = state.active_requests.saturating_sub(1);
            state.active_requests == 0 && state.pending_switch && !state.auth_switching
        };

        if run_switch {
            let controller = Arc::clone(self);
            tokio::spawn(async move {
                controller.run_pending_switch().await;
            });
        }
    }

    async fn run_pending_switch(self: Arc<Self>) {
        let target = {
            let mut state = self.lock();
            if state.active_requests != 0 || !state.pending_switch || state.auth_switching {
                return;
            }
            state.pending_target.take()
        };
        if let Err(error) = self.switch_to(target).await {
            tracing::error!(%error, "queued account switch failed");
        }
    }

    /// Admin entry point: run now when idle, queue otherwise.
    pub async fn manual_switch(
        self: &Arc<Self>,
        target: Option<u32>,
    ) -> Result<SwitchOutcome, RotationError> {
        {
            let mut state = self.lock();
            if state.auth_switching {
                return Ok(SwitchOutcome::AlreadyInProgress);
            }
            if state.active_requests > 0 {
                state.pending_switch = true;
                state.pending_target = target;
                drop(state);
                self.events.emit(ProxyEvent::RotationPending {
                    reason: "manual switch queued behind in-flight requests".to_string(),
                });
                return Ok(SwitchOutcome::Deferred { target });
            }
        }
        self.switch_to(target).await
    }

    /// Execute a switch to `target` (or the next index cyclically). Success
    /// resets both counters and clears any queued switch; failure attempts a
    /// rollback, and a failed rollback latches the unavailable state until a
    /// manual switch succeeds.
    pub async fn switch_to(&self, target: Option<u32>) -> Result<SwitchOutcome, RotationError> {
        let (previous, target) = {
            let mut state = self.lock();
            if state.auth_switching {
                return Ok(SwitchOutcome::AlreadyInProgress);
            }
            let previous = state.current_index;
            let target = match target {
                Some(index) => index,
                None => self
                    .store
                    .next_index_after(previous)
                    .ok_or(RotationError::NoCredentials)?,
            };
            state.auth_switching = true;
            state.system_busy = true;
            (previous, target)
        };

        self.events.emit(ProxyEvent::RotationStarted {
            from: previous,
            to: target,
        });

        match self.browser.switch_to(target).await {
            Ok(()) => {
                {
                    let mut state = self.lock();
                    state.current_index = target;
                    state.usage_count = 0;
                    state.failure_count = 0;
                    state.pending_switch = false;
                    state.pending_target = None;
                    state.auth_switching = false;
                    state.system_busy = false;
                    state.unavailable = false;
                }
                self.events
                    .emit(ProxyEvent::RotationCompleted { index: target });
                Ok(SwitchOutcome::Completed {
                    from: previous,
                    to: target,
                })
            }
            Err(switch_error) => self.rollback(previous, switch_error).await,
        }
    }

    async fn rollback(
        &self,
        previous: u32,
        switch_error: BrowserError,
    ) -> Result<SwitchOutcome, RotationError> {
        self.events.emit(ProxyEvent::RotationFailed {
            message: switch_error.to_string(),
        });

        match self.browser.switch_to(previous).await {
            Ok(()) => {
                {
                    let mut state = self.lock();
                    state.pending_switch = false;
                    state.pending_target = None;
                    state.auth_switching = false;
                    state.system_busy = false;
                }
                self.events.emit(ProxyEvent::RotationRolledBack {
                    index: previous,
                    message: switch_error.to_string(),
                });
                Err(RotationError::RolledBack(switch_error.to_string()))
            }
            Err(rollback_error) => {
                {
                    let mut state = self.lock();
                    state.unavailable = true;
                    state.pending_switch = false;
                    state.pending_target = None;
                    state.auth_switching = false;
                    state.system_busy = false;
                }
                let message =
                    format!("switch: {switch_error}; rollback: {rollback_error}");
                self.events.emit(ProxyEvent::RotationFailed {
                    message: message.clone(),
                });
                Err(RotationError::Unavailable(message))
            }
        }
    }

    /// Reattach the relay by reloading the current bundle. Used when a
    /// request arrives with no relay connected; a no-op while any browser
    /// lifecycle operation is already running.
    pub async fn recover(&self) -> Result<(), BrowserError> {
        let current = {
            let mut state = self.lock();
            if state.system_busy {
                return Ok(());
            }
            state.system_busy = true;
            state.current_index
        };

        let result = self.browser.switch_to(current).await;
        self.lock().system_busy = false;

        match &result {
            Ok(()) => self
                .events
                .emit(ProxyEvent::Notice(format!("relay reattached on {current}"))),
            Err(error) => self.events.emit(ProxyEvent::Notice(format!(
                "relay reattach on {current} failed: {error}"
            ))),
        }
        result
    }

    fn lock(&self) -> MutexGuard<'_, RotationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
