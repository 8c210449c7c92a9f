//! Adaptive dispatch of document operations to a multi-node cluster.
//!
//! A [FeedClient] spreads operations over a set of endpoints while:
//!
//! - keeping the number of operations in flight within a target chosen by a [Throttler],
//! - executing operations on the same [DocumentId] strictly in the order they were enqueued,
//! - retrying throttled and transient failures, and
//! - tracking the health of the cluster with a [CircuitBreaker].

#![deny(missing_docs)]

#[cfg(doctest)]
use doc_comment::doctest;
#[cfg(doctest)]
doctest!("../README.md");

pub mod breaker;
mod client;
pub mod cluster;
mod error;
mod moving_avg;
mod operation;
mod ordering;
mod stats;
pub mod strategy;
mod sync;
pub mod throttle;
mod transport;

pub use breaker::{CircuitBreaker, GracePeriodCircuitBreaker, State};
pub use client::{FeedClient, FeedClientBuilder};
pub use cluster::{Cluster, EndpointSet};
pub use error::{CloseFailure, FeedError, TransportError};
pub use operation::{
    DocumentId, Group, OperationParameters, OperationResult, OperationType, ResultType,
};
pub use stats::OperationStats;
pub use strategy::{DefaultRetryStrategy, OperationHandle, RequestStrategy, RetryStrategy};
pub use throttle::{DynamicThrottler, InflightBounds, Sample, StaticThrottler, Throttler};
pub use transport::{HttpRequest, HttpResponse, Method, Transport};
