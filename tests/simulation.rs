//! Feeding a simulated cluster node with limited capacity and Erlang-distributed latency.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use feed_dispatch::{
    DocumentId, FeedClient, HttpRequest, HttpResponse, OperationParameters, OperationStats,
    RetryStrategy, Transport, TransportError,
};
use futures::{future::BoxFuture, FutureExt};
use rand::{prelude::Distribution, rngs::SmallRng, SeedableRng};
use statrs::distribution::Erlang;

/// A node which serves up to `capacity` requests at once, and throttles the rest.
#[derive(Debug)]
struct Node {
    capacity: usize,
    state: Arc<NodeState>,
}

#[derive(Debug)]
struct NodeState {
    /// The time to serve a request: the sum of `tasks` exponentially distributed task times.
    latency: Erlang,
    rng: Mutex<SmallRng>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

/// Decrements the active count however the request ends.
struct Active(Arc<NodeState>);

impl Node {
    fn new(capacity: usize, tasks: u64, task_rate: f64, seed: u64) -> Self {
        Self {
            capacity,
            state: Arc::new(NodeState {
                latency: Erlang::new(tasks, task_rate).unwrap(),
                rng: Mutex::new(SmallRng::seed_from_u64(seed)),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }
}

impl Transport for Node {
    fn send(
        &self,
        _request: HttpRequest,
    ) -> BoxFuture<'static, Result<HttpResponse, TransportError>> {
        let state = self.state.clone();
        let capacity = self.capacity;

        async move {
            let latency = {
                let mut rng = state.rng.lock().unwrap();
                Duration::from_secs_f64(state.latency.sample(&mut *rng))
            };

            let active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
            let _active = Active(state.clone());
            state.peak.fetch_max(active, Ordering::SeqCst);

            if active > capacity {
                tokio::time::sleep(latency / 10).await;
                return Ok(HttpResponse::new(429, "too many requests"));
            }

            tokio::time::sleep(latency).await;
            Ok(HttpResponse::new(200, ""))
        }
        .boxed()
    }

    fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

impl Drop for Active {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct Persistent;

impl RetryStrategy for Persistent {
    fn retries(&self) -> u32 {
        50
    }
}

/// Precondition: time has been paused.
async fn simulate(dynamic_throttling: bool, operations: usize) -> (OperationStats, Arc<NodeState>) {
    let seed = rand::random();
    println!("Seed: {seed}");

    let node = Arc::new(Node::new(64, 2, 100.0, seed));
    let state = node.state.clone();

    let client = FeedClient::builder(["http://node-0:8080"])
        .connections_per_endpoint(1)
        .max_streams_per_connection(256)
        .dynamic_throttling(dynamic_throttling)
        .retry_strategy(Persistent)
        .build(|_| node.clone());

    let handles: Vec<_> = (0..operations)
        .map(|i| {
            client
                .put(
                    DocumentId::of("sim", "doc", i.to_string()),
                    "{}",
                    &OperationParameters::empty(),
                )
                .unwrap()
        })
        .collect();

    for result in futures::future::join_all(handles).await {
        assert!(result.is_success(), "{result:?}");
    }

    let stats = client.stats();
    client.close().await.unwrap();
    (stats, state)
}

#[tokio::test(start_paused = true)]
async fn static_throttling_backs_off_from_max() {
    let (stats, node) = simulate(false, 1000).await;

    assert_eq!(stats.response_codes().get(&200), Some(&1000));
    assert!(
        stats.response_codes().get(&429).is_some(),
        "starting at 256 in flight overloads a node serving 64"
    );
    assert_eq!(stats.requests(), stats.responses());
    assert_eq!(stats.inflight(), 0);
    assert!((16..=256).contains(&stats.target_inflight()));
    assert!(node.peak.load(Ordering::SeqCst) <= 256);
    assert!(stats.min_latency() <= stats.max_latency());
}

#[tokio::test(start_paused = true)]
async fn dynamic_throttling_stays_within_bounds() {
    let (stats, node) = simulate(true, 1000).await;

    assert_eq!(stats.response_codes().get(&200), Some(&1000));
    assert_eq!(stats.requests(), stats.responses());
    assert!((16..=256).contains(&stats.target_inflight()));
    assert!(node.peak.load(Ordering::SeqCst) <= 256);
    assert!(stats.average_latency() > Duration::ZERO);
}
