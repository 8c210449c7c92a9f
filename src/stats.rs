//! Counters describing the traffic sent by a client.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Duration,
};

use crate::sync::lock_unpoisoned;

/// A snapshot of the counters of a client.
///
/// Counters only ever grow; use [since()](Self::since()) to get the traffic between two snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperationStats {
    requests: u64,
    responses: u64,
    response_codes: BTreeMap<u16, u64>,
    exceptions: u64,
    inflight: usize,
    target_inflight: usize,
    average_latency: Duration,
    min_latency: Option<Duration>,
    max_latency: Option<Duration>,
    bytes_sent: u64,
    bytes_received: u64,
}

impl OperationStats {
    /// The difference between this snapshot and an earlier one.
    ///
    /// Gauges and latency extremes can't be differenced, so they are carried over from `self`.
    pub fn since(&self, initial: &OperationStats) -> OperationStats {
        let response_codes = self
            .response_codes
            .iter()
            .map(|(&code, &count)| {
                let before = initial.response_codes.get(&code).copied().unwrap_or(0);
                (code, count.saturating_sub(before))
            })
            .filter(|&(_, count)| count > 0)
            .collect();

        let responses = self.responses.saturating_sub(initial.responses);
        let average_latency = if responses == 0 {
            Duration::ZERO
        } else {
            let total = self.average_latency.as_secs_f64() * self.responses as f64
                - initial.average_latency.as_secs_f64() * initial.responses as f64;
            Duration::from_secs_f64((total / responses as f64).max(0.))
        };

        OperationStats {
            requests: self.requests.saturating_sub(initial.requests),
            responses,
            response_codes,
            exceptions: self.exceptions.saturating_sub(initial.exceptions),
            inflight: self.inflight,
            target_inflight: self.target_inflight,
            average_latency,
            min_latency: self.min_latency,
            max_latency: self.max_latency,
            bytes_sent: self.bytes_sent.saturating_sub(initial.bytes_sent),
            bytes_received: self.bytes_received.saturating_sub(initial.bytes_received),
        }
    }

    /// Requests sent, including retries.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Responses received, of any status.
    pub fn responses(&self) -> u64 {
        self.responses
    }

    /// Responses received, by status code.
    pub fn response_codes(&self) -> &BTreeMap<u16, u64> {
        &self.response_codes
    }

    /// Requests which got no response.
    pub fn exceptions(&self) -> u64 {
        self.exceptions
    }

    /// Operations in flight when the snapshot was taken.
    pub fn inflight(&self) -> usize {
        self.inflight
    }

    /// The throttler's target when the snapshot was taken.
    pub fn target_inflight(&self) -> usize {
        self.target_inflight
    }

    /// Average latency of the responses.
    pub fn average_latency(&self) -> Duration {
        self.average_latency
    }

    #[allow(missing_docs)]
    pub fn min_latency(&self) -> Option<Duration> {
        self.min_latency
    }

    #[allow(missing_docs)]
    pub fn max_latency(&self) -> Option<Duration> {
        self.max_latency
    }

    #[allow(missing_docs)]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    #[allow(missing_docs)]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }
}

/// Live counters, updated concurrently by completing operations.
#[derive(Debug, Default)]
pub(crate) struct StatsCollector {
    requests: AtomicU64,
    exceptions: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,

    responses: Mutex<Responses>,
}

#[derive(Debug, Default)]
struct Responses {
    by_code: BTreeMap<u16, u64>,
    count: u64,
    total_latency: Duration,
    min_latency: Option<Duration>,
    max_latency: Option<Duration>,
}

impl StatsCollector {
    pub(crate) fn request(&self, bytes: usize) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(to_u64(bytes), Ordering::Relaxed);
    }

    pub(crate) fn response(&self, status: u16, bytes: usize, latency: Duration) {
        self.bytes_received.fetch_add(to_u64(bytes), Ordering::Relaxed);

        let mut responses = lock_unpoisoned(&self.responses);
        *responses.by_code.entry(status).or_insert(0) += 1;
        responses.count += 1;
        responses.total_latency += latency;
        responses.min_latency = Some(responses.min_latency.map_or(latency, |min| min.min(latency)));
        responses.max_latency = Some(responses.max_latency.map_or(latency, |max| max.max(latency)));
    }

    pub(crate) fn exception(&self) {
        self.exceptions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, inflight: usize, target_inflight: usize) -> OperationStats {
        let responses = lock_unpoisoned(&self.responses);
        let average_latency = if responses.count == 0 {
            Duration::ZERO
        } else {
            responses.total_latency.div_f64(responses.count as f64)
        };

        OperationStats {
            requests: self.requests.load(Ordering::Relaxed),
            responses: responses.count,
            response_codes: responses.by_code.clone(),
            exceptions: self.exceptions.load(Ordering::Relaxed),
            inflight,
            target_inflight,
            average_latency,
            min_latency: responses.min_latency,
            max_latency: responses.max_latency,
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}

fn to_u64(bytes: usize) -> u64 {
    u64::try_from(bytes).unwrap_or(u64::MAX)
}
