//! Two bounded, non-blocking-enqueue queues: a general priority queue
//! (integer priority, lower sorts sooner) and a small FIFO emergency
//! queue. Both are the system's primary backpressure mechanism — on
//! `QueueFull` the caller gets an explicit error, nothing is dropped
//! silently.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::error::{Error, Result};
use crate::model::Transaction;

#[derive(Debug, Clone)]
pub struct QueuedTransaction {
    pub transaction: Transaction,
    pub priority: i32,
}

struct HeapEntry {
    priority: i32,
    seq: u64,
    item: QueuedTransaction,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}
impl Eq for HeapEntry {}

// `BinaryHeap` is a max-heap; reverse both fields so `pop()` returns the
// lowest priority first, and within equal priority the earliest-enqueued
// (lowest seq) first — i.e. FIFO within a priority bucket.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Holds both intake queues and the overflow counter the controller
/// reports on `QueueFull`.
pub struct IntakeQueue {
    general: Mutex<BinaryHeap<HeapEntry>>,
    general_capacity: usize,
    emergency: Mutex<VecDeque<QueuedTransaction>>,
    emergency_capacity: usize,
    seq: AtomicU64,
    notify_general: Notify,
    notify_emergency: Notify,
    overflow_count: AtomicU64,
    general_len: AtomicUsize,
    emergency_len: AtomicUsize,
}

impl IntakeQueue {
    pub fn new(general_capacity: usize, emergency_capacity: usize) -> Self {
        Self {
            general: Mutex::new(BinaryHeap::new()),
            general_capacity,
            emergency: Mutex::new(VecDeque::new()),
            emergency_capacity,
            seq: AtomicU64::new(0),
            notify_general: Notify::new(),
            notify_emergency: Notify::new(),
            overflow_count: AtomicU64::new(0),
            general_len: AtomicUsize::new(0),
            emergency_len: AtomicUsize::new(0),
        }
    }

    pub fn enqueue_general(&self, transaction: Transaction, priority: i32) -> Result<()> {
        let mut heap = self.general.lock();
        if heap.len() >= self.general_capacity {
            self.overflow_count.fetch_add(1, AtomicOrdering::Relaxed);
            return Err(Error::QueueFull { queue: "general" });
        }
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        heap.push(HeapEntry {
            priority,
            seq,
            item: QueuedTransaction {
                transaction,
                priority,
            },
        });
        self.general_len.store(heap.len(), AtomicOrdering::Relaxed);
        drop(heap);
        self.notify_general.notify_one();
        Ok(())
    }

    pub fn enqueue_emergency(&self, transaction: Transaction) -> Result<()> {
        let mut q = self.emergency.lock();
        if q.len() >= self.emergency_capacity {
            self.overflow_count.fetch_add(1, AtomicOrdering::Relaxed);
            return Err(Error::QueueFull { queue: "emergency" });
        }
        q.push_back(QueuedTransaction {
            transaction,
            priority: 0,
        });
        self.emergency_len.store(q.len(), AtomicOrdering::Relaxed);
        drop(q);
        self.notify_emergency.notify_one();
        Ok(())
    }

    /// Blocks until an item is available or `poll_timeout` elapses, in
    /// which case it returns `None` so the caller's loop can re-check a
    /// shutdown signal. Uses the notify-before-check pattern so a push
    /// racing with a just-started wait is never missed.
    pub async fn dequeue_general(&self, poll_timeout: Duration) -> Option<QueuedTransaction> {
        loop {
            let notified = self.notify_general.notified();
            {
                let mut heap = self.general.lock();
                if let Some(entry) = heap.pop() {
                    self.general_len.store(heap.len(), AtomicOrdering::Relaxed);
                    return Some(entry.item);
                }
            }
            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep(poll_timeout) => return None,
            }
        }
    }

    pub async fn dequeue_emergency(&self, poll_timeout: Duration) -> Option<QueuedTransaction> {
        loop {
            let notified = self.notify_emergency.notified();
            {
                let mut q = self.emergency.lock();
                if let Some(item) = q.pop_front() {
                    self.emergency_len.store(q.len(), AtomicOrdering::Relaxed);
                    return Some(item);
                }
            }
            tokio::select! {
                _ = notified => continue,
                _ = tokio::time::sleep(poll_timeout) => return None,
            }
        }
    }

    pub fn general_len(&self) -> usize {
        self.general_len.load(AtomicOrdering::Relaxed)
    }

    pub fn emergency_len(&self) -> usize {
        self.emergency_len.load(AtomicOrdering::Relaxed)
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count.load(AtomicOrdering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_tx(id: &str) -> Transaction {
        Transaction {
            id: id.to_string(),
            user_id: "u1".into(),
            amount: dec!(10),
            currency: "USD".into(),
            merchant_id: "m1".into(),
            merchant_category: "retail".into(),
            timestamp: crate::model::now_ts(),
            device_fingerprint: "d1".into(),
            source_ip: "127.0.0.1".into(),
            geo_code: "US".into(),
            cross_border: false,
            decoy_marker: None,
            status: crate::model::TransactionStatus::Pending,
        }
    }

    #[test]
    fn capacity_minus_one_accepts_then_rejects() {
        let q = IntakeQueue::new(10, 100);
        for i in 0..10 {
            q.enqueue_general(sample_tx(&i.to_string()), 5).unwrap();
        }
        let err = q.enqueue_general(sample_tx("overflow"), 5).unwrap_err();
        assert!(matches!(err, Error::QueueFull { queue: "general" }));
        assert_eq!(q.overflow_count(), 1);
    }

    #[test]
    fn emergency_queue_respects_capacity() {
        let q = IntakeQueue::new(10, 2);
        q.enqueue_emergency(sample_tx("e1")).unwrap();
        q.enqueue_emergency(sample_tx("e2")).unwrap();
        assert!(q.enqueue_emergency(sample_tx("e3")).is_err());
    }

    #[tokio::test]
    async fn lower_priority_dequeues_first() {
        let q = IntakeQueue::new(10, 10);
        q.enqueue_general(sample_tx("low"), 10).unwrap();
        q.enqueue_general(sample_tx("high"), 1).unwrap();
        let first = q.dequeue_general(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.transaction.id, "high");
        let second = q.dequeue_general(Duration::from_millis(50)).await.unwrap();
        assert_eq!(second.transaction.id, "low");
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let q = IntakeQueue::new(10, 10);
        q.enqueue_general(sample_tx("first"), 5).unwrap();
        q.enqueue_general(sample_tx("second"), 5).unwrap();
        let first = q.dequeue_general(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.transaction.id, "first");
    }

    #[tokio::test]
    async fn dequeue_times_out_on_empty_queue() {
        let q = IntakeQueue::new(10, 10);
        let result = q.dequeue_general(Duration::from_millis(20)).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn emergency_queue_is_fifo() {
        let q = IntakeQueue::new(10, 10);
        q.enqueue_emergency(sample_tx("e1")).unwrap();
        q.enqueue_emergency(sample_tx("e2")).unwrap();
        let first = q.dequeue_emergency(Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.transaction.id, "e1");
    }
}
