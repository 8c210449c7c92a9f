//! Serialising operations on the same document.
//!
//! Each document with operations outstanding has a queue. The operation at the head holds the
//! document's [Turn]; when the turn is dropped it passes to the next queued operation, and the
//! queue is removed once empty. Operations on different documents never wait for each other.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use tokio::sync::oneshot;

use crate::{sync::lock_unpoisoned, DocumentId};

/// Hands out turns to operations, one document at a time.
#[derive(Debug, Default, Clone)]
pub(crate) struct DocumentGate {
    queues: Arc<Mutex<HashMap<DocumentId, VecDeque<oneshot::Sender<Turn>>>>>,
}

/// The exclusive right to execute an operation on a document.
///
/// Dropping the turn passes it to the next operation enqueued for the document.
#[derive(Debug)]
pub(crate) struct Turn {
    /// Taken when the turn has been handed back unclaimed, so dropping it passes nothing.
    gate: Option<DocumentGate>,
    id: DocumentId,
}

/// A place in the queue for a document.
#[derive(Debug)]
pub(crate) enum Waiting {
    Ready(Turn),
    Queued(oneshot::Receiver<Turn>),
}

impl DocumentGate {
    /// Join the queue for `id`, behind every operation already enqueued for it.
    pub(crate) fn enter(&self, id: DocumentId) -> Waiting {
        let mut queues = lock_unpoisoned(&self.queues);
        match queues.get_mut(&id) {
            Some(queue) => {
                let (tx, rx) = oneshot::channel();
                queue.push_back(tx);
                Waiting::Queued(rx)
            }
            None => {
                queues.insert(id.clone(), VecDeque::new());
                Waiting::Ready(Turn {
                    gate: Some(self.clone()),
                    id,
                })
            }
        }
    }

    /// The number of documents with operations outstanding.
    #[cfg(test)]
    pub(crate) fn active(&self) -> usize {
        lock_unpoisoned(&self.queues).len()
    }

    fn pass(&self, id: &DocumentId) {
        loop {
            let next = {
                let mut queues = lock_unpoisoned(&self.queues);
                match queues.get_mut(id).map(VecDeque::pop_front) {
                    Some(Some(next)) => next,
                    Some(None) => {
                        queues.remove(id);
                        return;
                    }
                    None => return,
                }
            };

            let turn = Turn {
                gate: Some(self.clone()),
                id: id.clone(),
            };
            match next.send(turn) {
                Ok(()) => return,
                // The waiting operation has gone away. Try the one behind it.
                Err(mut unclaimed) => unclaimed.gate = None,
            }
        }
    }
}

impl Waiting {
    /// Wait for the turn.
    pub(crate) async fn turn(self) -> Turn {
        match self {
            Waiting::Ready(turn) => turn,
            Waiting::Queued(rx) => rx
                .await
                .expect("queued senders are only dropped by passing the turn"),
        }
    }
}

impl Drop for Turn {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.take() {
            gate.pass(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn id(user: &str) -> DocumentId {
        DocumentId::of("ns", "music", user)
    }

    fn is_ready(waiting: &Waiting) -> bool {
        matches!(waiting, Waiting::Ready(_))
    }

    #[tokio::test]
    async fn same_document_waits_for_previous() {
        let gate = DocumentGate::default();

        let first = gate.enter(id("a"));
        let second = gate.enter(id("a"));
        assert!(is_ready(&first));
        assert!(!is_ready(&second));

        let first = first.turn().await;
        let mut second = Box::pin(second.turn());
        assert!(
            timeout(Duration::from_millis(10), &mut second).await.is_err(),
            "second must wait for the first turn"
        );

        drop(first);
        let second = second.await;
        assert_eq!(gate.active(), 1);

        drop(second);
        assert_eq!(gate.active(), 0, "queue is removed once empty");
    }

    #[tokio::test]
    async fn different_documents_proceed_in_parallel() {
        let gate = DocumentGate::default();

        let a = gate.enter(id("a"));
        let b = gate.enter(id("b"));

        assert!(is_ready(&a));
        assert!(is_ready(&b));
        assert_eq!(gate.active(), 2);
    }

    #[tokio::test]
    async fn turns_are_handed_out_in_order() {
        let gate = DocumentGate::default();

        let first = gate.enter(id("a")).turn().await;
        let waiting: Vec<_> = (0..5).map(|_| gate.enter(id("a"))).collect();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for (i, waiting) in waiting.into_iter().enumerate() {
            let tx = tx.clone();
            tokio::spawn(async move {
                let turn = waiting.turn().await;
                tx.send(i).unwrap();
                drop(turn);
            });
        }
        drop(tx);
        drop(first);

        let mut order = vec![];
        while let Some(i) = rx.recv().await {
            order.push(i);
        }
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        assert_eq!(gate.active(), 0);
    }

    #[tokio::test]
    async fn abandoned_waiters_are_skipped() {
        let gate = DocumentGate::default();

        let first = gate.enter(id("a")).turn().await;
        let abandoned = gate.enter(id("a"));
        let third = gate.enter(id("a"));

        drop(abandoned);
        drop(first);

        let third = timeout(Duration::from_millis(10), third.turn())
            .await
            .expect("turn skips the abandoned waiter");
        drop(third);
        assert_eq!(gate.active(), 0);
    }

    #[tokio::test]
    async fn long_runs_of_abandoned_waiters_are_skipped() {
        let gate = DocumentGate::default();

        let first = gate.enter(id("a")).turn().await;
        for _ in 0..100_000 {
            drop(gate.enter(id("a")));
        }
        let last = gate.enter(id("a"));

        drop(first);

        let last = timeout(Duration::from_millis(10), last.turn())
            .await
            .expect("turn reaches the last waiter");
        drop(last);
        assert_eq!(gate.active(), 0);
    }
}
