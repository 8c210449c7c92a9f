//! The feed client: the entry point for feeding document operations to a cluster.

use std::{fmt, sync::Arc, time::Duration};

use bytes::Bytes;
use tracing::info;

use crate::{
    breaker::{GracePeriodCircuitBreaker, State},
    cluster::EndpointSet,
    operation::build_request,
    strategy::{DefaultRetryStrategy, OperationHandle, RequestStrategy, RetryStrategy, Settings},
    throttle::{DynamicThrottler, InflightBounds, StaticThrottler, Throttler},
    transport::Transport,
    DocumentId, FeedError, OperationParameters, OperationStats, OperationType,
};

/// Feeds document operations to a cluster.
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use feed_dispatch::{DocumentId, FeedClient, FeedError, OperationParameters, Transport};
/// # async fn feed(connect: impl Fn(&str) -> Arc<dyn Transport>) -> Result<(), FeedError> {
/// let client = FeedClient::builder(["https://node-0:8080", "https://node-1:8080"]).build(connect);
///
/// let id = DocumentId::of("music", "album", "a-head-full-of-dreams");
/// let result = client
///     .put(id, r#"{"fields":{"year":2015}}"#, &OperationParameters::empty())?
///     .await;
/// assert!(result.is_success());
///
/// client.close().await
/// # }
/// ```
///
/// Cheaply cloneable; clones share the same endpoints and state.
#[derive(Debug, Clone)]
pub struct FeedClient {
    strategy: RequestStrategy,
    operation_timeout: Duration,
    close_grace: Duration,
}

/// Configures a [FeedClient].
pub struct FeedClientBuilder {
    endpoints: Vec<String>,
    connections_per_endpoint: usize,
    max_streams_per_connection: usize,
    dynamic_throttling: bool,
    breaker_grace: Duration,
    breaker_doom: Duration,
    retry_strategy: Box<dyn RetryStrategy>,
    retry_delay: Duration,
    operation_timeout: Duration,
    max_pending_operations: usize,
    close_grace: Duration,
}

impl FeedClient {
    /// Start configuring a client for the given endpoint URIs.
    pub fn builder<S: Into<String>>(endpoints: impl IntoIterator<Item = S>) -> FeedClientBuilder {
        FeedClientBuilder::new(endpoints)
    }

    /// Create or replace a document.
    pub fn put(
        &self,
        id: DocumentId,
        document: impl Into<Bytes>,
        parameters: &OperationParameters,
    ) -> Result<OperationHandle, FeedError> {
        self.enqueue(id, OperationType::Put, Some(document.into()), parameters)
    }

    /// Apply a partial update to a document.
    pub fn update(
        &self,
        id: DocumentId,
        update: impl Into<Bytes>,
        parameters: &OperationParameters,
    ) -> Result<OperationHandle, FeedError> {
        self.enqueue(id, OperationType::Update, Some(update.into()), parameters)
    }

    /// Remove a document.
    pub fn remove(
        &self,
        id: DocumentId,
        parameters: &OperationParameters,
    ) -> Result<OperationHandle, FeedError> {
        self.enqueue(id, OperationType::Remove, None, parameters)
    }

    /// Enqueue an operation on a document.
    ///
    /// The operation runs in the background; its outcome is delivered through the returned handle,
    /// never as an `Err`. Errors are returned only when the client is
    /// [overloaded](FeedError::Overloaded) or [closed](FeedError::Closed).
    ///
    /// Must be called within a tokio runtime.
    pub fn enqueue(
        &self,
        id: DocumentId,
        operation: OperationType,
        body: Option<Bytes>,
        parameters: &OperationParameters,
    ) -> Result<OperationHandle, FeedError> {
        let timeout = parameters
            .timeout_duration()
            .unwrap_or(self.operation_timeout);
        let request = {
            let id = id.clone();
            let parameters = parameters.clone();
            move |remaining| build_request(operation, &id, body.clone(), &parameters, remaining)
        };

        self.strategy.enqueue(id, operation, request, timeout)
    }

    /// A snapshot of the operation counters.
    pub fn stats(&self) -> OperationStats {
        self.strategy.stats()
    }

    /// Whether the cluster looks too unhealthy to keep feeding. If so, the client should be closed.
    pub fn has_failed(&self) -> bool {
        self.strategy.has_failed()
    }

    #[allow(missing_docs)]
    pub fn circuit_breaker_state(&self) -> State {
        self.strategy.circuit_breaker_state()
    }

    /// Stop accepting operations, wait for pending ones for up to the close grace period, then
    /// close every endpoint.
    ///
    /// Errors from closing endpoints are aggregated into [FeedError::Close]. Closing an already
    /// closed client does nothing.
    pub async fn close(&self) -> Result<(), FeedError> {
        self.strategy.close(self.close_grace).await
    }
}

impl FeedClientBuilder {
    const DEFAULT_CONNECTIONS_PER_ENDPOINT: usize = 8;
    const DEFAULT_MAX_STREAMS_PER_CONNECTION: usize = 128;
    const DEFAULT_BREAKER_GRACE: Duration = Duration::from_secs(10);
    const DEFAULT_BREAKER_DOOM: Duration = Duration::from_secs(300);
    const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(100);
    const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(300);
    const DEFAULT_MAX_PENDING_OPERATIONS: usize = 16_384;
    const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(10);

    #[allow(missing_docs)]
    pub fn new<S: Into<String>>(endpoints: impl IntoIterator<Item = S>) -> Self {
        let endpoints: Vec<String> = endpoints.into_iter().map(Into::into).collect();
        assert!(!endpoints.is_empty(), "at least one endpoint is required");

        Self {
            endpoints,
            connections_per_endpoint: Self::DEFAULT_CONNECTIONS_PER_ENDPOINT,
            max_streams_per_connection: Self::DEFAULT_MAX_STREAMS_PER_CONNECTION,
            dynamic_throttling: true,
            breaker_grace: Self::DEFAULT_BREAKER_GRACE,
            breaker_doom: Self::DEFAULT_BREAKER_DOOM,
            retry_strategy: Box::new(DefaultRetryStrategy),
            retry_delay: Self::DEFAULT_RETRY_DELAY,
            operation_timeout: Self::DEFAULT_OPERATION_TIMEOUT,
            max_pending_operations: Self::DEFAULT_MAX_PENDING_OPERATIONS,
            close_grace: Self::DEFAULT_CLOSE_GRACE,
        }
    }

    #[allow(missing_docs)]
    pub fn connections_per_endpoint(self, connections: usize) -> Self {
        assert!(connections > 0);
        Self {
            connections_per_endpoint: connections,
            ..self
        }
    }

    #[allow(missing_docs)]
    pub fn max_streams_per_connection(self, streams: usize) -> Self {
        assert!(streams > 0);
        Self {
            max_streams_per_connection: streams,
            ..self
        }
    }

    /// Search for the throughput-maximising concurrency, rather than only backing off when
    /// throttled.
    pub fn dynamic_throttling(self, dynamic: bool) -> Self {
        Self {
            dynamic_throttling: dynamic,
            ..self
        }
    }

    /// Half-open the circuit breaker after `grace` without successes, and open it after `doom`.
    ///
    /// `doom` is expected to be at least `grace`.
    pub fn circuit_breaker(self, grace: Duration, doom: Duration) -> Self {
        Self {
            breaker_grace: grace,
            breaker_doom: doom,
            ..self
        }
    }

    #[allow(missing_docs)]
    pub fn retry_strategy(self, strategy: impl RetryStrategy + 'static) -> Self {
        Self {
            retry_strategy: Box::new(strategy),
            ..self
        }
    }

    /// Delay between a failed attempt and its retry.
    pub fn retry_delay(self, delay: Duration) -> Self {
        Self {
            retry_delay: delay,
            ..self
        }
    }

    /// Time allowed for an operation, including retries, unless its parameters say otherwise.
    pub fn operation_timeout(self, timeout: Duration) -> Self {
        assert!(timeout > Duration::ZERO);
        Self {
            operation_timeout: timeout,
            ..self
        }
    }

    /// Operations which may be pending before more are rejected as
    /// [overloaded](FeedError::Overloaded).
    pub fn max_pending_operations(self, max: usize) -> Self {
        assert!(max > 0);
        Self {
            max_pending_operations: max,
            ..self
        }
    }

    /// How long [FeedClient::close()] waits for pending operations.
    pub fn close_grace(self, grace: Duration) -> Self {
        Self {
            close_grace: grace,
            ..self
        }
    }

    /// Build the client, connecting to each endpoint with `connect`.
    pub fn build(self, connect: impl Fn(&str) -> Arc<dyn Transport>) -> FeedClient {
        let bounds = InflightBounds::new(
            self.endpoints.len(),
            self.connections_per_endpoint,
            self.max_streams_per_connection,
        );
        let throttler: Box<dyn Throttler> = if self.dynamic_throttling {
            Box::new(DynamicThrottler::new(bounds))
        } else {
            Box::new(StaticThrottler::new(bounds))
        };

        info!(
            endpoints = self.endpoints.len(),
            min_inflight = bounds.min(),
            max_inflight = bounds.max(),
            dynamic_throttling = self.dynamic_throttling,
            "building feed client"
        );

        let cluster = EndpointSet::new(self.endpoints.into_iter().map(|uri| {
            let transport = connect(&uri);
            (uri, transport)
        }));

        let settings = Settings::default()
            .with_retry_delay(self.retry_delay)
            .with_max_pending(self.max_pending_operations);

        FeedClient {
            strategy: RequestStrategy::new(
                Box::new(cluster),
                throttler,
                Box::new(GracePeriodCircuitBreaker::new(
                    self.breaker_grace,
                    self.breaker_doom,
                )),
                self.retry_strategy,
                settings,
            ),
            operation_timeout: self.operation_timeout,
            close_grace: self.close_grace,
        }
    }
}

impl fmt::Debug for FeedClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedClientBuilder")
            .field("endpoints", &self.endpoints)
            .field("connections_per_endpoint", &self.connections_per_endpoint)
            .field("max_streams_per_connection", &self.max_streams_per_connection)
            .field("dynamic_throttling", &self.dynamic_throttling)
            .field("breaker_grace", &self.breaker_grace)
            .field("breaker_doom", &self.breaker_doom)
            .field("retry_strategy", &self.retry_strategy)
            .field("operation_timeout", &self.operation_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::{
        future::{self, BoxFuture},
        FutureExt,
    };

    use super::*;
    use crate::{
        transport::{HttpRequest, HttpResponse, Method},
        ResultType, TransportError,
    };

    /// Records requests and answers each with 200.
    #[derive(Debug, Default)]
    struct Recording {
        requests: Mutex<Vec<HttpRequest>>,
    }

    impl Transport for Recording {
        fn send(
            &self,
            request: HttpRequest,
        ) -> BoxFuture<'static, Result<HttpResponse, TransportError>> {
            self.requests.lock().unwrap().push(request);
            future::ready(Ok(HttpResponse::new(200, ""))).boxed()
        }

        fn close(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn client(transport: &Arc<Recording>) -> FeedClient {
        FeedClient::builder(["http://localhost:8080"])
            .operation_timeout(Duration::from_secs(30))
            .build(|_| transport.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn builds_requests_for_each_operation_type() {
        let transport = Arc::new(Recording::default());
        let client = client(&transport);
        let id = DocumentId::of("ns", "music", "a");
        let parameters = OperationParameters::empty();

        let put = client.put(id.clone(), "{}", &parameters).unwrap().await;
        let update = client.update(id.clone(), "{}", &parameters).unwrap().await;
        let remove = client.remove(id, &parameters).unwrap().await;
        assert_eq!(put.result_type(), ResultType::Success);
        assert_eq!(update.result_type(), ResultType::Success);
        assert_eq!(remove.result_type(), ResultType::Success);

        let requests = transport.requests.lock().unwrap();
        let methods: Vec<_> = requests.iter().map(|r| r.method).collect();
        assert_eq!(methods, vec![Method::Post, Method::Put, Method::Delete]);
        assert_eq!(requests[0].path, "/document/v1/ns/music/docid/a?timeout=30000ms");
        assert_eq!(requests[0].body_len(), 2);
        assert_eq!(requests[2].body, None);
    }

    #[tokio::test(start_paused = true)]
    async fn parameter_timeout_overrides_default() {
        let transport = Arc::new(Recording::default());
        let client = client(&transport);

        client
            .remove(
                DocumentId::of("ns", "music", "a"),
                &OperationParameters::empty().timeout(Duration::from_secs(2)),
            )
            .unwrap()
            .await;

        let requests = transport.requests.lock().unwrap();
        assert_eq!(requests[0].path, "/document/v1/ns/music/docid/a?timeout=2000ms");
    }

    #[tokio::test]
    async fn bounds_follow_connection_layout() {
        let transport = Arc::new(Recording::default());
        let client = FeedClient::builder(["http://localhost:8080"])
            .connections_per_endpoint(4)
            .max_streams_per_connection(1024)
            .dynamic_throttling(false)
            .build(|_| transport.clone());

        assert_eq!(client.stats().target_inflight(), 4096);
    }

    #[tokio::test]
    async fn dynamic_throttling_starts_at_min() {
        let transport = Arc::new(Recording::default());
        let client = FeedClient::builder(["http://a:8080", "http://b:8080"])
            .connections_per_endpoint(4)
            .max_streams_per_connection(1024)
            .build(|_| transport.clone());

        assert_eq!(client.stats().target_inflight(), 2 * 4 * 16);
    }

    #[tokio::test]
    async fn breaker_doom_shorter_than_grace_is_accepted() {
        let transport = Arc::new(Recording::default());
        let client = FeedClient::builder(["http://localhost:8080"])
            .circuit_breaker(Duration::from_secs(10), Duration::from_secs(1))
            .build(|_| transport.clone());

        assert_eq!(client.circuit_breaker_state(), State::Closed);
    }

    #[test]
    #[should_panic(expected = "at least one endpoint")]
    fn requires_endpoints() {
        FeedClient::builder(Vec::<String>::new());
    }
}
