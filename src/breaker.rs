//! Detecting a cluster which has stopped accepting operations.

use std::{
    fmt::Debug,
    sync::atomic::{AtomicBool, AtomicU64, Ordering},
    time::Duration,
};

use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Tracks the health of the cluster from the outcomes of operations.
pub trait CircuitBreaker: Debug + Send + Sync {
    /// An operation succeeded. Must be called for every success.
    fn success(&self);

    /// An operation failed, for the given reason.
    fn failure(&self, detail: &str);

    /// The current state.
    fn state(&self) -> State;
}

/// Health of the cluster, as judged by a [CircuitBreaker].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Operations are succeeding.
    Closed,
    /// Nothing has succeeded for a while; the cluster may be having trouble.
    HalfOpen,
    /// Nothing has succeeded for so long that the client should give up.
    Open,
}

/// A breaker driven only by the time since the last success.
///
/// Half-opens once nothing has succeeded for `grace`, and opens once nothing has succeeded for
/// `doom`. Failures alone do not move it, and the clock starts when the breaker is created.
#[derive(Debug)]
pub struct GracePeriodCircuitBreaker {
    grace: Duration,
    doom: Duration,

    epoch: Instant,
    /// Nanoseconds since `epoch`.
    last_success: AtomicU64,
    /// Nanoseconds since `epoch` of the first failure since the last success, or `NEVER`.
    failing_since: AtomicU64,

    half_open: AtomicBool,
    open: AtomicBool,
}

impl GracePeriodCircuitBreaker {
    const NEVER: u64 = u64::MAX;

    #[allow(missing_docs)]
    pub fn new(grace: Duration, doom: Duration) -> Self {
        if doom <= grace {
            warn!(?grace, ?doom, "circuit breaker doom should exceed its grace period");
        }
        Self {
            grace,
            doom,

            epoch: Instant::now(),
            last_success: AtomicU64::new(0),
            failing_since: AtomicU64::new(Self::NEVER),

            half_open: AtomicBool::new(false),
            open: AtomicBool::new(false),
        }
    }

    fn now(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(Self::NEVER - 1)
    }

    fn since_success(&self) -> Duration {
        Duration::from_nanos(
            self.now()
                .saturating_sub(self.last_success.load(Ordering::Acquire)),
        )
    }
}

impl CircuitBreaker for GracePeriodCircuitBreaker {
    fn success(&self) {
        self.last_success.fetch_max(self.now(), Ordering::AcqRel);
        self.failing_since.store(Self::NEVER, Ordering::Release);

        let was_open = self.open.swap(false, Ordering::AcqRel);
        let was_half_open = self.half_open.swap(false, Ordering::AcqRel);
        if was_open || was_half_open {
            info!("circuit breaker is now closed, after an operation succeeded");
        }
    }

    fn failure(&self, detail: &str) {
        let now = self.now();
        if self
            .failing_since
            .compare_exchange(Self::NEVER, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(detail, "first failure since the last success");
        }
    }

    fn state(&self) -> State {
        let since_success = self.since_success();
        let state = if since_success >= self.doom {
            State::Open
        } else if since_success >= self.grace {
            State::HalfOpen
        } else {
            State::Closed
        };

        // The latches only make each transition log once.
        if state != State::Closed
            && self
                .half_open
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            info!(
                ?since_success,
                "circuit breaker is now half-open, nothing has succeeded for the grace period"
            );
        }
        if state == State::Open
            && self
                .open
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            warn!(
                ?since_success,
                "circuit breaker is now open, nothing has succeeded for the doom period"
            );
        }

        state
    }
}
