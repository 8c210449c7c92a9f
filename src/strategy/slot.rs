use std::sync::{
    atomic::{self, AtomicBool, AtomicUsize},
    Arc,
};

use tokio::sync::Notify;

/// Admits operations while fewer than the target are in flight.
#[derive(Debug, Default)]
pub(crate) struct Admission {
    in_flight: AtomicUsize,
    freed: Notify,
    closed: AtomicBool,
}

/// The right to have one operation in flight.
///
/// Dropping the slot frees it for the next waiting operation.
#[derive(Debug)]
pub(crate) struct Slot {
    admission: Arc<Admission>,
    in_flight_at_send: usize,
}

impl Admission {
    /// Wait until fewer than `target()` operations are in flight, and take a slot.
    ///
    /// Returns `None` once closed.
    pub(crate) async fn acquire(self: &Arc<Self>, target: impl Fn() -> usize) -> Option<Slot> {
        loop {
            // Register for wake-ups before checking, so a slot freed in between isn't missed.
            let freed = self.freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            if self.closed.load(atomic::Ordering::Acquire) {
                return None;
            }

            let target = target();
            let admitted =
                self.in_flight
                    .fetch_update(atomic::Ordering::SeqCst, atomic::Ordering::SeqCst, |n| {
                        (n < target).then_some(n + 1)
                    });
            if let Ok(previous) = admitted {
                return Some(Slot {
                    admission: Arc::clone(self),
                    in_flight_at_send: previous + 1,
                });
            }

            freed.await;
        }
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(atomic::Ordering::Acquire)
    }

    /// Stop admitting, and release everything waiting for a slot.
    pub(crate) fn close(&self) {
        self.closed.store(true, atomic::Ordering::Release);
        self.freed.notify_waiters();
    }
}

impl Slot {
    /// Operations in flight when this slot was taken, including its own.
    pub(crate) fn in_flight_at_send(&self) -> usize {
        self.in_flight_at_send
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.admission
            .in_flight
            .fetch_sub(1, atomic::Ordering::SeqCst);
        self.admission.freed.notify_one();
    }
}
