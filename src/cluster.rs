//! Spreading requests over the endpoints of a cluster.

use std::{
    fmt::Debug,
    sync::{
        atomic::{self, AtomicBool, AtomicUsize},
        Arc,
    },
};

use futures::{future::BoxFuture, FutureExt};
use tracing::{info, warn};

use crate::{
    error::CloseFailure,
    transport::{HttpRequest, HttpResponse, Transport},
    FeedError, TransportError,
};

/// Somewhere to send requests.
pub trait Cluster: Debug + Send + Sync {
    /// Send a request to some endpoint.
    ///
    /// Never fails synchronously: every failure surfaces through the returned future.
    fn dispatch(
        &self,
        request: HttpRequest,
    ) -> BoxFuture<'static, Result<HttpResponse, TransportError>>;

    /// Close every endpoint. Closing more than once is a no-op.
    fn close(&self) -> Result<(), FeedError>;
}

/// A fixed set of endpoints, each request going to the one with the fewest in flight.
#[derive(Debug)]
pub struct EndpointSet {
    endpoints: Vec<Endpoint>,
    closed: AtomicBool,
}

#[derive(Debug)]
struct Endpoint {
    uri: String,
    transport: Arc<dyn Transport>,
    /// Shared with [InFlight] guards.
    in_flight: Arc<AtomicUsize>,
}

/// Counts a request against its endpoint until dropped, however the request ends.
#[derive(Debug)]
struct InFlight {
    in_flight: Arc<AtomicUsize>,
}

impl EndpointSet {
    /// Create a set from endpoint URIs and their transports.
    ///
    /// `endpoints` must not be empty.
    pub fn new(endpoints: impl IntoIterator<Item = (String, Arc<dyn Transport>)>) -> Self {
        let endpoints: Vec<_> = endpoints
            .into_iter()
            .map(|(uri, transport)| Endpoint {
                uri,
                transport,
                in_flight: Arc::new(AtomicUsize::new(0)),
            })
            .collect();
        assert!(!endpoints.is_empty(), "at least one endpoint is required");

        Self {
            endpoints,
            closed: AtomicBool::new(false),
        }
    }

    /// The number of endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Always false: a set has at least one endpoint.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Requests in flight per endpoint, in the order given at construction.
    pub fn in_flight(&self) -> Vec<(String, usize)> {
        self.endpoints
            .iter()
            .map(|endpoint| (endpoint.uri.clone(), endpoint.load()))
            .collect()
    }

    /// The first of the least loaded endpoints.
    fn least_loaded(&self) -> &Endpoint {
        self.endpoints
            .iter()
            .min_by_key(|endpoint| endpoint.load())
            .expect("endpoints is never empty")
    }
}

impl Cluster for EndpointSet {
    fn dispatch(
        &self,
        request: HttpRequest,
    ) -> BoxFuture<'static, Result<HttpResponse, TransportError>> {
        if self.closed.load(atomic::Ordering::Acquire) {
            return futures::future::ready(Err(TransportError::Closed)).boxed();
        }

        let endpoint = self.least_loaded();
        let guard = InFlight::new(endpoint.in_flight.clone());
        let response = endpoint.transport.send(request);

        async move {
            let _guard = guard;
            response.await
        }
        .boxed()
    }

    fn close(&self) -> Result<(), FeedError> {
        if self.closed.swap(true, atomic::Ordering::AcqRel) {
            return Ok(());
        }

        let failures: Vec<_> = self
            .endpoints
            .iter()
            .filter_map(|endpoint| match endpoint.transport.close() {
                Ok(()) => None,
                Err(error) => {
                    warn!(endpoint = %endpoint.uri, %error, "failed to close endpoint");
                    Some(CloseFailure {
                        endpoint: endpoint.uri.clone(),
                        error,
                    })
                }
            })
            .collect();

        if failures.is_empty() {
            info!(endpoints = self.endpoints.len(), "closed all endpoints");
            Ok(())
        } else {
            Err(FeedError::Close(failures))
        }
    }
}

impl Endpoint {
    fn load(&self) -> usize {
        self.in_flight.load(atomic::Ordering::Acquire)
    }
}

impl InFlight {
    fn new(in_flight: Arc<AtomicUsize>) -> Self {
        in_flight.fetch_add(1, atomic::Ordering::SeqCst);
        Self { in_flight }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, atomic::Ordering::SeqCst);
    }
}
