//! Cancellable priority queue with tag accounting.
//!
//! Entries dequeue by ascending priority value, FIFO within a priority level.
//! Cancellation tombstones the heap entry; the dispatcher skips tombstones on
//! pop instead of rebuilding the heap. A tag board counts pending plus
//! in-flight requests per tag so callers can wait for a group to drain.

use crate::context::{RequestContext, RequestId};
use crate::error::{FailureReport, RequestError};
use crate::transport::Response;
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{oneshot, Notify};

/// Terminal outcome delivered on a request's reply channel.
pub type Delivery = Result<Response, FailureReport>;

/// A dequeued request ready for dispatch.
#[derive(Debug)]
pub struct QueueEntry {
    /// Queue-issued identifier.
    pub id: RequestId,
    /// The request to execute.
    pub context: RequestContext,
    /// Channel the terminal outcome must be sent on.
    pub reply: oneshot::Sender<Delivery>,
}

/// Heap key ordering entries by (priority, sequence) ascending.
#[derive(Debug, PartialEq, Eq)]
struct HeapKey {
    priority: u8,
    seq: u64,
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so BinaryHeap pops the smallest key first.
        (other.priority, other.seq).cmp(&(self.priority, self.seq))
    }
}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Pending {
    context: RequestContext,
    reply: oneshot::Sender<Delivery>,
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<HeapKey>,
    pending: HashMap<u64, Pending>,
    tag_counts: HashMap<String, usize>,
    next_seq: u64,
    closed: bool,
}

/// Priority queue shared between submitters and the dispatcher.
#[derive(Debug, Default)]
pub struct RequestQueue {
    inner: Mutex<Inner>,
    work: Notify,
    tags_done: Notify,
}

impl RequestQueue {
    /// Empty open queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a request. Returns its id and the channel its terminal
    /// outcome arrives on. The sequence number doubles as the FIFO tie-break
    /// within a priority level.
    pub fn enqueue(
        &self,
        context: RequestContext,
    ) -> Result<(RequestId, oneshot::Receiver<Delivery>), RequestError> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        if inner.closed {
            return Err(RequestError::QueueClosed);
        }
        let seq = inner.next_seq;
        inner.next_seq += 1;
        for tag in &context.tags {
            *inner.tag_counts.entry(tag.clone()).or_insert(0) += 1;
        }
        inner.heap.push(HeapKey { priority: context.priority.0, seq });
        inner.pending.insert(seq, Pending { context, reply: tx });
        drop(inner);
        self.work.notify_one();
        Ok((RequestId(seq), rx))
    }

    /// Cancel a pending request. Returns `true` if the entry was still
    /// queued; an already-dispatched or unknown id leaves everything
    /// untouched and returns `false`.
    pub fn cancel(&self, id: RequestId) -> bool {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let Some(pending) = inner.pending.remove(&id.0) else {
            return false;
        };
        Self::decrement_tags(&mut inner, &pending.context);
        drop(inner);
        Self::deliver_cancelled(pending);
        self.tags_done.notify_waiters();
        true
    }

    /// Cancel every pending request carrying any of `tags`. Returns how many
    /// entries were removed. In-flight requests are unaffected.
    pub fn cancel_by_tags(&self, tags: &BTreeSet<String>) -> usize {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let victims: Vec<u64> = inner
            .pending
            .iter()
            .filter(|(_, pending)| pending.context.has_any_tag(tags))
            .map(|(seq, _)| *seq)
            .collect();
        let mut removed = Vec::with_capacity(victims.len());
        for seq in victims {
            if let Some(pending) = inner.pending.remove(&seq) {
                Self::decrement_tags(&mut inner, &pending.context);
                removed.push(pending);
            }
        }
        drop(inner);
        let count = removed.len();
        for pending in removed {
            Self::deliver_cancelled(pending);
        }
        if count > 0 {
            self.tags_done.notify_waiters();
        }
        count
    }

    /// Pop the highest-priority live entry, waiting when the queue is empty.
    /// Returns `Err(QueueClosed)` once the queue is closed and drained.
    pub async fn dequeue(&self) -> Result<QueueEntry, RequestError> {
        loop {
            // Arm the notification before re-checking state so a concurrent
            // enqueue between the check and the await is not lost.
            let notified = self.work.notified();
            {
                let mut inner = self.inner.lock().expect("queue lock poisoned");
                while let Some(key) = inner.heap.pop() {
                    // Cancelled entries stay in the heap as tombstones.
                    if let Some(pending) = inner.pending.remove(&key.seq) {
                        return Ok(QueueEntry {
                            id: RequestId(key.seq),
                            context: pending.context,
                            reply: pending.reply,
                        });
                    }
                }
                if inner.closed {
                    return Err(RequestError::QueueClosed);
                }
            }
            notified.await;
        }
    }

    /// Release an in-flight entry's tags. Called exactly once per dispatched
    /// entry after its terminal outcome is decided.
    pub fn mark_complete(&self, context: &RequestContext) {
        if context.tags.is_empty() {
            return;
        }
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        Self::decrement_tags(&mut inner, context);
        drop(inner);
        self.tags_done.notify_waiters();
    }

    /// Wait until no pending or in-flight request carries any of `tags`.
    pub async fn wait_for_tags(&self, tags: &BTreeSet<String>) {
        loop {
            let notified = self.tags_done.notified();
            {
                let inner = self.inner.lock().expect("queue lock poisoned");
                if !tags.iter().any(|tag| inner.tag_counts.contains_key(tag)) {
                    return;
                }
            }
            notified.await;
        }
    }

    /// Pending (not yet dispatched) entry count.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue lock poisoned").pending.len()
    }

    /// Whether no entries are pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pending plus in-flight entries carrying `tag`.
    pub fn pending_for_tag(&self, tag: &str) -> usize {
        self.inner
            .lock()
            .expect("queue lock poisoned")
            .tag_counts
            .get(tag)
            .copied()
            .unwrap_or(0)
    }

    /// Close the queue: refuse new submissions and cancel everything still
    /// pending. Dispatched entries are not touched.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.closed = true;
        inner.heap.clear();
        inner.tag_counts.clear();
        let drained: Vec<Pending> = inner.pending.drain().map(|(_, p)| p).collect();
        drop(inner);
        for pending in drained {
            Self::deliver_cancelled(pending);
        }
        self.work.notify_waiters();
        self.tags_done.notify_waiters();
    }

    fn decrement_tags(inner: &mut Inner, context: &RequestContext) {
        for tag in &context.tags {
            if let Some(count) = inner.tag_counts.get_mut(tag) {
                *count -= 1;
                if *count == 0 {
                    inner.tag_counts.remove(tag);
                }
            }
        }
    }

    fn deliver_cancelled(pending: Pending) {
        let report = FailureReport {
            context: pending.context,
            error: RequestError::Cancelled,
            attempts: 0,
            elapsed: Duration::ZERO,
        };
        // The submitter may have dropped its receiver; that is fine.
        let _ = pending.reply.send(Err(report));
    }
}
