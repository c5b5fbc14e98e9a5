//! Throttled action invocation
//!
//! A [`RateLimiter`] wraps an action that may be triggered far more often
//! than it is useful to run it (status broadcasts, save notifications). The
//! action runs at most `max_rate` times per second: an activation inside the
//! quiet window schedules a single deferred run at the earliest legal
//! instant, and further activations before that run are coalesced into it.

use std::borrow::Cow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{LinkError, Result};

type Action = Box<dyn Fn() + Send + Sync>;

struct State {
    last_run: Option<Instant>,
    pending: Option<JoinHandle<()>>,
}

struct Inner {
    min_interval: Duration,
    action: Action,
    state: Mutex<State>,
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn run(&self) {
        self.state().last_run = Some(Instant::now());
        (self.action)();
    }
}

/// Coalescing rate limiter for a single action
///
/// Deferred runs are spawned on the current tokio runtime.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Arc<Inner>,
}

impl RateLimiter {
    /// Create a limiter running `action` at most `max_rate` times per second
    ///
    /// # Errors
    ///
    /// Returns `LinkError::InvalidConfig` if `max_rate` is not a positive
    /// finite number or is too small to express as an interval.
    pub fn new<F>(max_rate: f64, action: F) -> Result<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        if !max_rate.is_finite() || max_rate <= 0.0 {
            return Err(LinkError::InvalidConfig(Cow::Borrowed(
                "max_rate must be a positive number",
            )));
        }
        let min_interval = Duration::try_from_secs_f64(1.0 / max_rate).map_err(|_| {
            LinkError::InvalidConfig(Cow::Owned(format!("max_rate {max_rate} is too small")))
        })?;
        Ok(Self {
            inner: Arc::new(Inner {
                min_interval,
                action: Box::new(action),
                state: Mutex::new(State {
                    last_run: None,
                    pending: None,
                }),
            }),
        })
    }

    /// Minimum time between two runs
    #[must_use]
    pub fn min_interval(&self) -> Duration {
        self.inner.min_interval
    }

    /// Run the action now if allowed, otherwise make sure exactly one
    /// deferred run is scheduled
    pub fn activate(&self) {
        let now = Instant::now();
        let run_at = {
            let state = self.inner.state();
            if state.pending.as_ref().is_some_and(|h| !h.is_finished()) {
                return;
            }
            let next_allowed = state
                .last_run
                .and_then(|last| last.checked_add(self.inner.min_interval));
            match next_allowed {
                Some(next) if now < next => next,
                _ => {
                    drop(state);
                    self.inner.run();
                    return;
                }
            }
        };

        let delay = run_at.saturating_duration_since(now);
        tracing::trace!(
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Deferring rate limited action"
        );
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(run_at).await;
            inner.state().pending = None;
            inner.run();
        });
        self.inner.state().pending = Some(handle);
    }

    /// Abort a scheduled deferred run
    pub fn cancel(&self) {
        if let Some(handle) = self.inner.state().pending.take() {
            handle.abort();
            tracing::trace!("Cancelled deferred action");
        }
    }

    /// Returns true while a deferred run is scheduled
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.inner
            .state()
            .pending
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("min_interval", &self.inner.min_interval)
            .field("pending", &self.is_pending())
            .finish()
    }
}
