//! Orchestrating operations: per-document ordering, admission, dispatch, retries and health.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    sync::Notify,
    task::JoinHandle,
    time::{sleep_until, timeout, timeout_at, Instant},
};
use tracing::{debug, info, warn};

pub use retry::{DefaultRetryStrategy, RetryStrategy};

use crate::{
    breaker::{CircuitBreaker, State},
    cluster::Cluster,
    operation::ResultType,
    ordering::{DocumentGate, Waiting},
    stats::StatsCollector,
    throttle::{Sample, Throttler},
    transport::{HttpRequest, HttpResponse},
    DocumentId, FeedError, OperationResult, OperationStats, OperationType, TransportError,
};

use error_rate::ErrorRate;
use slot::Admission;

mod error_rate;
mod retry;
mod slot;

/// An attempt with less time than this left is not sent.
const MIN_REMAINING: Duration = Duration::from_millis(1);

/// Feeds operations to a [Cluster], keeping it from being overloaded.
///
/// - Operations on the same document are executed one at a time, in the order they were
///   enqueued. Operations on different documents run concurrently.
/// - At most [Throttler::target_inflight()] operations are in flight at once.
/// - Throttling responses, server errors and I/O errors are retried, according to the
///   [RetryStrategy].
/// - Once the error rate is too high, or the [CircuitBreaker] opens, the strategy
///   [has failed](Self::has_failed()) and stops retrying. Closing the client is up to the caller.
///
/// Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct RequestStrategy {
    inner: Arc<Inner>,
}

/// Tuning for a [RequestStrategy].
#[derive(Debug, Clone, Copy)]
pub struct Settings {
    retry_delay: Duration,
    max_pending: usize,
}

/// The eventual result of an enqueued operation.
///
/// The operation runs whether or not the handle is polled.
#[derive(Debug)]
pub struct OperationHandle {
    id: DocumentId,
    task: JoinHandle<OperationResult>,
}

#[derive(Debug)]
struct Inner {
    cluster: Box<dyn Cluster>,
    throttler: Box<dyn Throttler>,
    breaker: Box<dyn CircuitBreaker>,
    retry: Box<dyn RetryStrategy>,
    settings: Settings,

    gate: DocumentGate,
    admission: Arc<Admission>,
    error_rate: ErrorRate,
    stats: StatsCollector,

    /// Operations enqueued and not yet completed.
    pending: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
    /// Latched once the error rate crosses the threshold.
    failed: AtomicBool,
}

/// Counts an operation as pending until dropped.
struct Pending(Arc<Inner>);

/// How a response or transport error is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    ConditionNotMet,
    /// The cluster is overloaded; back off and retry.
    Throttled,
    /// A server error which is hopefully temporary.
    Transient,
    Fatal,
}

/// What to do after an attempt.
#[derive(Debug)]
enum Verdict {
    Done(ResultType, Option<String>),
    Retry(String),
    Fail(String),
}

impl Settings {
    const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);
    const DEFAULT_MAX_PENDING: usize = 16_384;

    /// Delay before retrying a failed attempt.
    pub fn with_retry_delay(self, delay: Duration) -> Self {
        Self {
            retry_delay: delay,
            ..self
        }
    }

    /// Operations which may be pending before [enqueue](RequestStrategy::enqueue()) rejects more.
    pub fn with_max_pending(self, max: usize) -> Self {
        assert!(max > 0);
        Self {
            max_pending: max,
            ..self
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            retry_delay: Self::DEFAULT_RETRY_DELAY,
            max_pending: Self::DEFAULT_MAX_PENDING,
        }
    }
}

impl RequestStrategy {
    /// Error rate above which the strategy has failed.
    pub const ERROR_RATE_THRESHOLD: f64 = 0.1;

    /// Feed `cluster`, throttled by `throttler`, with health tracked by `breaker`.
    pub fn new(
        cluster: Box<dyn Cluster>,
        throttler: Box<dyn Throttler>,
        breaker: Box<dyn CircuitBreaker>,
        retry: Box<dyn RetryStrategy>,
        settings: Settings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cluster,
                throttler,
                breaker,
                retry,
                settings,

                gate: DocumentGate::default(),
                admission: Arc::new(Admission::default()),
                error_rate: ErrorRate::default(),
                stats: StatsCollector::default(),

                pending: AtomicUsize::new(0),
                idle: Notify::new(),
                closed: AtomicBool::new(false),
                failed: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueue a request for the document `id`, to complete within `timeout`.
    ///
    /// The operation waits for earlier operations on the same document, then for a free slot,
    /// before being dispatched. Its outcome, including any failure, is delivered through the
    /// returned handle. The only synchronous errors are [FeedError::Overloaded] when too many
    /// operations are pending, and [FeedError::Closed].
    ///
    /// The timeout runs from now, so waiting counts against it. An operation whose time is up
    /// once admitted fails without being sent. `request` builds the request for each attempt
    /// from the time remaining.
    ///
    /// Must be called within a tokio runtime.
    pub fn enqueue<R>(
        &self,
        id: DocumentId,
        operation: OperationType,
        request: R,
        timeout: Duration,
    ) -> Result<OperationHandle, FeedError>
    where
        R: Fn(Duration) -> HttpRequest + Send + 'static,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(FeedError::Closed);
        }

        let limit = self.inner.settings.max_pending;
        if let Err(pending) =
            self.inner
                .pending
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < limit).then_some(n + 1)
                })
        {
            return Err(FeedError::Overloaded { pending, limit });
        }
        let pending = Pending(self.inner.clone());

        let deadline = Instant::now() + timeout;
        let waiting = self.inner.gate.enter(id.clone());

        let inner = self.inner.clone();
        let task = {
            let id = id.clone();
            tokio::spawn(async move {
                let _pending = pending;
                inner
                    .execute(id, operation, request, waiting, deadline, timeout)
                    .await
            })
        };

        Ok(OperationHandle { id, task })
    }

    /// Whether the cluster looks too unhealthy to keep feeding.
    ///
    /// True once the error rate has exceeded [Self::ERROR_RATE_THRESHOLD], or while the circuit
    /// breaker is open. The client should then be closed.
    pub fn has_failed(&self) -> bool {
        self.inner.has_failed()
    }

    /// State of the circuit breaker.
    pub fn circuit_breaker_state(&self) -> State {
        self.inner.breaker.state()
    }

    /// The current estimate of the fraction of attempts failing.
    pub fn error_rate(&self) -> f64 {
        self.inner.error_rate.value()
    }

    /// A snapshot of the counters. Safe to call while operations are running.
    pub fn stats(&self) -> OperationStats {
        self.inner.stats.snapshot(
            self.inner.admission.in_flight(),
            self.inner.throttler.target_inflight(),
        )
    }

    /// Operations enqueued which have not yet completed.
    pub fn pending(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Stop accepting operations, wait up to `grace` for pending ones, then close the cluster.
    ///
    /// Operations still waiting for their turn or for a slot fail. Closing again is a no-op.
    pub async fn close(&self, grace: Duration) -> Result<(), FeedError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(pending = self.pending(), "closing feed client");

        self.inner.admission.close();
        if timeout(grace, self.inner.drained()).await.is_err() {
            warn!(
                pending = self.pending(),
                ?grace,
                "operations still pending after grace period, closing endpoints anyway"
            );
        }

        self.inner.cluster.close()
    }
}

impl Inner {
    async fn execute(
        &self,
        id: DocumentId,
        operation: OperationType,
        request: impl Fn(Duration) -> HttpRequest,
        waiting: Waiting,
        deadline: Instant,
        timeout: Duration,
    ) -> OperationResult {
        // Held until the result is returned, so the next operation on the document waits.
        let _turn = waiting.turn().await;

        let mut attempt = 1;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return OperationResult::failure(id, "feed client was closed");
            }
            if self.failed.load(Ordering::Acquire) {
                return OperationResult::failure(
                    id,
                    "feed client has failed, error rate too high",
                );
            }

            let slot = match timeout_at(
                deadline,
                self.admission.acquire(|| self.throttler.target_inflight()),
            )
            .await
            {
                Ok(Some(slot)) => slot,
                Ok(None) => return OperationResult::failure(id, "feed client was closed"),
                Err(_) => return timed_out(id, timeout),
            };

            // Admission does not wait once a slot is free, even past the deadline.
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining < MIN_REMAINING {
                debug!(%id, attempt, "operation timed out before being sent");
                return timed_out(id, timeout);
            }
            let request = request(remaining);

            let in_flight = slot.in_flight_at_send();
            self.stats.request(request.body_len());
            let start = Instant::now();
            let response = timeout_at(deadline, self.cluster.dispatch(request))
                .await
                .unwrap_or(Err(TransportError::Timeout(timeout)));
            let latency = start.elapsed();

            let verdict = self.record(&response, in_flight, latency).await;
            drop(slot);

            match verdict {
                Verdict::Done(result_type, message) => {
                    return OperationResult::new(result_type, id, message)
                }
                Verdict::Fail(reason) => {
                    debug!(%id, attempt, %reason, "operation failed");
                    return OperationResult::failure(id, reason);
                }
                Verdict::Retry(reason) => {
                    if !self.may_retry(operation, attempt) {
                        debug!(%id, attempt, %reason, "operation failed, not retrying");
                        return OperationResult::failure(id, reason);
                    }
                    debug!(%id, attempt, %reason, "retrying operation");

                    sleep_until(deadline.min(Instant::now() + self.settings.retry_delay)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Feed the outcome of an attempt to the throttler, breaker, error rate and stats.
    async fn record(
        &self,
        response: &Result<HttpResponse, TransportError>,
        in_flight: usize,
        latency: Duration,
    ) -> Verdict {
        let status = response.as_ref().ok().map(|response| response.status);
        self.throttler
            .sent(Sample::new(latency, in_flight, status))
            .await;

        let response = match response {
            Ok(response) => response,
            Err(error) => {
                self.stats.exception();
                let detail = error.to_string();
                self.breaker.failure(&detail);
                self.failed_attempt();
                return if error.is_retryable() {
                    Verdict::Retry(detail)
                } else {
                    Verdict::Fail(detail)
                };
            }
        };

        self.stats
            .response(response.status, response.body.len(), latency);

        let outcome = Outcome::of(response.status);
        match outcome {
            Outcome::Success | Outcome::ConditionNotMet => {
                self.throttler.success();
                self.breaker.success();
                self.error_rate.success();

                let result_type = if outcome == Outcome::Success {
                    ResultType::Success
                } else {
                    ResultType::ConditionNotMet
                };
                let body = response.body_text();
                Verdict::Done(result_type, (!body.is_empty()).then_some(body))
            }
            Outcome::Throttled => {
                let detail = describe(response);
                self.throttler.throttled(self.admission.in_flight());
                self.breaker.failure(&detail);
                Verdict::Retry(detail)
            }
            Outcome::Transient => {
                let detail = describe(response);
                self.breaker.failure(&detail);
                self.failed_attempt();
                Verdict::Retry(detail)
            }
            Outcome::Fatal => {
                let detail = describe(response);
                self.breaker.failure(&detail);
                self.failed_attempt();
                Verdict::Fail(detail)
            }
        }
    }

    fn failed_attempt(&self) {
        let rate = self.error_rate.failure();
        if rate > RequestStrategy::ERROR_RATE_THRESHOLD && !self.failed.swap(true, Ordering::AcqRel)
        {
            warn!(rate, "error rate too high, feed client has failed and should be closed");
        }
    }

    fn may_retry(&self, operation: OperationType, attempt: u32) -> bool {
        attempt <= self.retry.retries()
            && self.retry.retry(operation)
            && !self.closed.load(Ordering::Acquire)
            && !self.has_failed()
    }

    fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire) || self.breaker.state() == State::Open
    }

    async fn drained(&self) {
        loop {
            let idle = self.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            if self.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            idle.await;
        }
    }
}

impl Drop for Pending {
    fn drop(&mut self) {
        if self.0.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl Outcome {
    fn of(status: u16) -> Self {
        match status {
            // A missing document is not a fault of the client.
            200..=299 | 404 => Outcome::Success,
            409 | 412 => Outcome::ConditionNotMet,
            429 | 503 => Outcome::Throttled,
            500 | 502 | 504 => Outcome::Transient,
            _ => Outcome::Fatal,
        }
    }
}

fn timed_out(id: DocumentId, timeout: Duration) -> OperationResult {
    OperationResult::failure(id, TransportError::Timeout(timeout).to_string())
}

fn describe(response: &HttpResponse) -> String {
    let body = response.body_text();
    if body.is_empty() {
        format!("status {}", response.status)
    } else {
        format!("status {}: {body}", response.status)
    }
}

impl Future for OperationHandle {
    type Output = OperationResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.task).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(error)) => Poll::Ready(OperationResult::failure(
                self.id.clone(),
                format!("operation task failed: {error}"),
            )),
        }
    }
}

impl OperationHandle {
    /// The document the operation is for.
    pub fn document_id(&self) -> &DocumentId {
        &self.id
    }
}
