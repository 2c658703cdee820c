//! Priority queue for pending requests.
//!
//! A binary max-heap keyed by priority, with an age-based boost that
//! prevents starvation: a background pass periodically raises the
//! priority of every resident envelope (capped at 100). FIFO order for
//! equal priorities is not promised. Envelopes carry a oneshot
//! continuation; rejection paths (full, paused, cleared, expired) resolve
//! it with a typed error so the waiting client always hears back.

use crate::models::backend::{Capability, Endpoint};
use crate::models::error::OrchestratorError;
use crate::models::settings::QueueConfig;
use ahash::AHashMap;
use log::{debug, warn};
use serde::Serialize;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::oneshot;
use uuid::Uuid;

/// Hard cap on envelope priority, boost included.
pub const MAX_PRIORITY: i32 = 100;

/// A queued request envelope.
///
/// Once dequeued an envelope is never re-inserted; the dequeuer either
/// executes it or resolves its continuation with an error.
#[derive(Debug)]
pub struct QueuedRequest {
    pub id: Uuid,
    pub model: String,
    pub priority: i32,
    pub enqueued_at: Instant,
    pub deadline: Option<Instant>,
    pub endpoint: Endpoint,
    pub capability: Capability,
    pub payload: serde_json::Value,
    pub responder: oneshot::Sender<Result<serde_json::Value, OrchestratorError>>,
}

impl QueuedRequest {
    /// Builds an envelope and the receiver its resolution arrives on.
    pub fn new(
        model: impl Into<String>,
        priority: i32,
        endpoint: Endpoint,
        payload: serde_json::Value,
    ) -> (
        Self,
        oneshot::Receiver<Result<serde_json::Value, OrchestratorError>>,
    ) {
        let (responder, receiver) = oneshot::channel();
        (
            Self {
                id: Uuid::new_v4(),
                model: model.into(),
                priority: priority.min(MAX_PRIORITY),
                enqueued_at: Instant::now(),
                deadline: None,
                endpoint,
                capability: Capability::Native,
                payload,
                responder,
            },
            receiver,
        )
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = capability;
        self
    }

    fn reject(self, error: OrchestratorError) {
        // The receiver may have given up; nothing further to do then.
        let _ = self.responder.send(Err(error));
    }
}

/// Lightweight view of a resident envelope.
#[derive(Serialize, Debug, Clone)]
pub struct QueueEntryInfo {
    pub id: Uuid,
    pub model: String,
    pub priority: i32,
    pub age_ms: u64,
    pub endpoint: Endpoint,
}

/// Queue counters for the stats surface.
#[derive(Serialize, Debug, Clone)]
pub struct QueueStats {
    pub size: usize,
    pub max_size: usize,
    pub paused: bool,
    pub total_enqueued: u64,
    pub total_dropped: u64,
    pub avg_wait_ms: f64,
    pub per_model: AHashMap<String, u64>,
}

struct HeapEntry {
    seq: u64,
    request: QueuedRequest,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.request.priority == other.request.priority && self.seq == other.seq
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.request
            .priority
            .cmp(&other.request.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueInner {
    heap: BinaryHeap<HeapEntry>,
    next_seq: u64,
    paused: bool,
    total_enqueued: u64,
    total_dropped: u64,
    wait_sum_ms: f64,
    dequeued: u64,
    per_model: AHashMap<String, u64>,
}

/// Bounded priority queue with starvation protection.
///
/// # Examples
///
/// ```rust
/// use corral::models::backend::Endpoint;
/// use corral::models::settings::QueueConfig;
/// use corral::services::queue::{QueuedRequest, RequestQueue};
///
/// let queue = RequestQueue::new(QueueConfig::default());
///
/// let (low, _rx1) = QueuedRequest::new("llama3:8b", 1, Endpoint::Chat, serde_json::json!({}));
/// let (high, _rx2) = QueuedRequest::new("llama3:8b", 9, Endpoint::Chat, serde_json::json!({}));
/// assert!(queue.enqueue(low));
/// assert!(queue.enqueue(high));
///
/// let next = queue.dequeue().expect("queued");
/// assert_eq!(next.priority, 9);
/// ```
pub struct RequestQueue {
    inner: Mutex<QueueInner>,
    config: QueueConfig,
}

impl RequestQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                heap: BinaryHeap::new(),
                next_seq: 0,
                paused: false,
                total_enqueued: 0,
                total_dropped: 0,
                wait_sum_ms: 0.0,
                dequeued: 0,
                per_model: AHashMap::new(),
            }),
            config,
        }
    }

    /// Enqueues an envelope.
    ///
    /// Returns `false` and resolves the envelope with `QueueFull` or
    /// `QueuePaused` when the queue cannot accept it.
    pub fn enqueue(&self, request: QueuedRequest) -> bool {
        let mut inner = self.lock();

        if inner.paused {
            inner.total_dropped += 1;
            drop(inner);
            debug!("Rejecting request {}: queue paused", request.id);
            request.reject(OrchestratorError::QueuePaused);
            return false;
        }

        if inner.heap.len() >= self.config.max_size {
            inner.total_dropped += 1;
            drop(inner);
            warn!(
                "Rejecting request {}: queue full ({} entries)",
                request.id, self.config.max_size
            );
            request.reject(OrchestratorError::QueueFull);
            return false;
        }

        inner.total_enqueued += 1;
        *inner.per_model.entry(request.model.clone()).or_insert(0) += 1;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.heap.push(HeapEntry { seq, request });
        true
    }

    /// Removes and returns the highest-priority envelope.
    ///
    /// Allowed while paused. Envelopes whose deadline already passed are
    /// discarded on the way out, each resolved with `DeadlineExceeded`.
    pub fn dequeue(&self) -> Option<QueuedRequest> {
        let mut inner = self.lock();
        let now = Instant::now();

        while let Some(entry) = inner.heap.pop() {
            let request = entry.request;
            Self::note_removed(&mut inner, &request);

            if request.deadline.is_some_and(|d| d < now) {
                inner.total_dropped += 1;
                debug!("Discarding request {}: deadline exceeded", request.id);
                request.reject(OrchestratorError::DeadlineExceeded);
                continue;
            }

            inner.dequeued += 1;
            inner.wait_sum_ms += now.duration_since(request.enqueued_at).as_secs_f64() * 1000.0;
            return Some(request);
        }

        None
    }

    /// Highest-priority envelope without removing it.
    pub fn peek(&self) -> Option<QueueEntryInfo> {
        let inner = self.lock();
        inner.heap.peek().map(|e| Self::info(&e.request))
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    /// Resident envelopes referencing `model`.
    pub fn get_by_model(&self, model: &str) -> Vec<QueueEntryInfo> {
        let inner = self.lock();
        inner
            .heap
            .iter()
            .filter(|e| crate::utils::model_tag::models_match(&e.request.model, model))
            .map(|e| Self::info(&e.request))
            .collect()
    }

    /// Rejects every resident envelope with `QueueCleared`.
    pub fn clear(&self) {
        let mut inner = self.lock();
        let drained: Vec<HeapEntry> = inner.heap.drain().collect();
        inner.per_model.clear();
        inner.total_dropped += drained.len() as u64;
        drop(inner);

        for entry in drained {
            entry.request.reject(OrchestratorError::QueueCleared);
        }
    }

    /// Stops accepting new envelopes. Dequeue keeps working so the
    /// backlog can drain.
    pub fn pause(&self) {
        self.lock().paused = true;
    }

    pub fn resume(&self) {
        self.lock().paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// One starvation-protection pass: every resident envelope gains the
    /// configured boost, capped at [`MAX_PRIORITY`].
    pub fn boost_all(&self) {
        let amount = self.config.priority_boost_amount;
        if amount == 0 {
            return;
        }

        let mut inner = self.lock();
        if inner.heap.is_empty() {
            return;
        }

        let entries: Vec<HeapEntry> = inner.heap.drain().collect();
        inner.heap = entries
            .into_iter()
            .map(|mut e| {
                e.request.priority = (e.request.priority + amount).min(MAX_PRIORITY);
                e
            })
            .collect();
    }

    /// Spawns the periodic boost task. The handle is aborted on shutdown.
    pub fn start_boost_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let queue = Arc::clone(self);
        let interval = self.config.priority_boost_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                queue.boost_all();
            }
        })
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.lock();
        QueueStats {
            size: inner.heap.len(),
            max_size: self.config.max_size,
            paused: inner.paused,
            total_enqueued: inner.total_enqueued,
            total_dropped: inner.total_dropped,
            avg_wait_ms: if inner.dequeued == 0 {
                0.0
            } else {
                inner.wait_sum_ms / inner.dequeued as f64
            },
            per_model: inner.per_model.clone(),
        }
    }

    fn info(request: &QueuedRequest) -> QueueEntryInfo {
        QueueEntryInfo {
            id: request.id,
            model: request.model.clone(),
            priority: request.priority,
            age_ms: request.enqueued_at.elapsed().as_millis() as u64,
            endpoint: request.endpoint,
        }
    }

    fn note_removed(inner: &mut QueueInner, request: &QueuedRequest) {
        if let Some(count) = inner.per_model.get_mut(&request.model) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.per_model.remove(&request.model);
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(model: &str, priority: i32) -> QueuedRequest {
        QueuedRequest::new(model, priority, Endpoint::Generate, json!({})).0
    }

    fn small_queue(max_size: usize) -> RequestQueue {
        RequestQueue::new(QueueConfig {
            max_size,
            ..QueueConfig::default()
        })
    }

    #[test]
    fn dequeue_returns_highest_priority() {
        let queue = small_queue(10);
        queue.enqueue(request("m", 1));
        queue.enqueue(request("m", 5));
        queue.enqueue(request("m", 2));

        assert_eq!(queue.dequeue().expect("entry").priority, 5);
        assert_eq!(queue.dequeue().expect("entry").priority, 2);
        assert_eq!(queue.dequeue().expect("entry").priority, 1);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn overflow_is_rejected_and_counted() {
        let queue = small_queue(3);
        for _ in 0..3 {
            assert!(queue.enqueue(request("m", 1)));
        }

        let (extra, mut rx) = QueuedRequest::new("m", 1, Endpoint::Generate, json!({}));
        assert!(!queue.enqueue(extra));

        let stats = queue.stats();
        assert_eq!(stats.size, 3);
        assert_eq!(stats.total_dropped, 1);
        assert!(matches!(
            rx.try_recv().expect("resolved"),
            Err(OrchestratorError::QueueFull)
        ));
    }

    #[test]
    fn paused_queue_rejects_enqueue_but_allows_dequeue() {
        let queue = small_queue(10);
        queue.enqueue(request("m", 1));
        queue.pause();

        let (rejected, mut rx) = QueuedRequest::new("m", 2, Endpoint::Generate, json!({}));
        assert!(!queue.enqueue(rejected));
        assert!(matches!(
            rx.try_recv().expect("resolved"),
            Err(OrchestratorError::QueuePaused)
        ));

        assert!(queue.dequeue().is_some());
    }

    #[test]
    fn boost_raises_priorities_capped_at_limit() {
        let queue = RequestQueue::new(QueueConfig {
            max_size: 10,
            priority_boost_amount: 5,
            ..QueueConfig::default()
        });
        queue.enqueue(request("m", 1));
        queue.enqueue(request("m", 98));

        queue.boost_all();

        let first = queue.dequeue().expect("entry");
        assert_eq!(first.priority, MAX_PRIORITY);
        let second = queue.dequeue().expect("entry");
        assert_eq!(second.priority, 6);
    }

    #[test]
    fn expired_envelopes_are_discarded_on_dequeue() {
        let queue = small_queue(10);
        let (expired, mut rx) = QueuedRequest::new("m", 9, Endpoint::Generate, json!({}));
        let expired = expired.with_deadline(Instant::now() - std::time::Duration::from_millis(1));
        queue.enqueue(expired);
        queue.enqueue(request("m", 1));

        let next = queue.dequeue().expect("live entry");
        assert_eq!(next.priority, 1);
        assert!(matches!(
            rx.try_recv().expect("resolved"),
            Err(OrchestratorError::DeadlineExceeded)
        ));
    }

    #[test]
    fn clear_rejects_everything() {
        let queue = small_queue(10);
        let (a, mut rx_a) = QueuedRequest::new("m", 1, Endpoint::Generate, json!({}));
        let (b, mut rx_b) = QueuedRequest::new("m", 2, Endpoint::Chat, json!({}));
        queue.enqueue(a);
        queue.enqueue(b);

        queue.clear();

        assert!(queue.is_empty());
        assert!(matches!(
            rx_a.try_recv().expect("resolved"),
            Err(OrchestratorError::QueueCleared)
        ));
        assert!(matches!(
            rx_b.try_recv().expect("resolved"),
            Err(OrchestratorError::QueueCleared)
        ));
    }

    #[test]
    fn per_model_counts_track_residents() {
        let queue = small_queue(10);
        queue.enqueue(request("llama3:8b", 1));
        queue.enqueue(request("llama3:8b", 2));
        queue.enqueue(request("mistral:7b", 1));

        assert_eq!(queue.get_by_model("llama3:8b").len(), 2);

        queue.dequeue();
        let stats = queue.stats();
        assert_eq!(stats.per_model.values().sum::<u64>(), 2);
    }
}
