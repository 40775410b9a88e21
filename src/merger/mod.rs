//! # Event Merger (The Funnel)
//!
//! Merges events from many pre-sorted streams into one stream with globally
//! non-decreasing timestamps.
//!
//! A single priority queue over all events would cost O(log total_events) per
//! operation. Since every stream is already sorted, we instead keep one FIFO
//! per stream and a min-heap over the *front* timestamps: O(log S) per event,
//! where S is the stream count (tens to low hundreds, far below the event
//! count). A binary heap cannot decrease a key in place, so after popping an
//! event the source stream's entry is removed and re-inserted with its new
//! front timestamp.
//!
//! Ordering across streams is only safe because the caller lags real time:
//! everything with a timestamp at or below `now - lateness_window` must have
//! been pushed before `drain_old(now)` is called. Events that still manage to
//! arrive behind the emitted stream are dropped and counted, never dispatched.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::config::DEFAULT_LATENESS_WINDOW_NS;

/// Anything the merger can order. Payloads stay opaque.
pub trait Timestamped {
    /// Monotonic timestamp in nanoseconds.
    fn timestamp_ns(&self) -> u64;
}

/// Downstream consumer of the merged stream. Visitors are invoked in
/// registration order, on the draining thread.
pub trait EventVisitor<E: Timestamped> {
    fn visit(&mut self, event: &E);
}

/// Stable identity of one source stream (in practice: the ring-buffer read
/// fd). Opaque - nothing here depends on the numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(u64);

impl StreamId {
    pub fn from_u64(raw: u64) -> Self {
        StreamId(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

pub struct EventMerger<E: Timestamped> {
    /// A stream's queue is present iff it is non-empty (and thus pinned in
    /// the heap).
    queues: HashMap<StreamId, VecDeque<E>>,
    /// Min-heap of (front timestamp, stream). Each non-empty queue appears
    /// exactly once.
    heap: BinaryHeap<Reverse<(u64, StreamId)>>,
    last_emitted_ts: u64,
    lateness_window_ns: u64,
    visitors: Vec<Box<dyn EventVisitor<E>>>,
    discarded_out_of_order: Option<Arc<AtomicU64>>,
}

impl<E: Timestamped> Default for EventMerger<E> {
    fn default() -> Self {
        Self::new(DEFAULT_LATENESS_WINDOW_NS)
    }
}

impl<E: Timestamped> EventMerger<E> {
    pub fn new(lateness_window_ns: u64) -> Self {
        Self {
            queues: HashMap::new(),
            heap: BinaryHeap::new(),
            last_emitted_ts: 0,
            lateness_window_ns,
            visitors: Vec::new(),
            discarded_out_of_order: None,
        }
    }

    pub fn add_visitor(&mut self, visitor: Box<dyn EventVisitor<E>>) {
        self.visitors.push(visitor);
    }

    pub fn clear_visitors(&mut self) {
        self.visitors.clear();
    }

    /// Install the shared counter bumped when a late event has to be dropped.
    pub fn set_discarded_counter(&mut self, counter: Arc<AtomicU64>) {
        self.discarded_out_of_order = Some(counter);
    }

    /// Enqueue one event from `stream`. Events from the same stream must
    /// arrive in non-decreasing timestamp order.
    ///
    /// An event older than what has already been emitted would break the
    /// output ordering; it is dropped here and counted, not dispatched.
    pub fn push(&mut self, stream: StreamId, event: E) {
        let ts = event.timestamp_ns();
        if ts < self.last_emitted_ts {
            if let Some(counter) = &self.discarded_out_of_order {
                counter.fetch_add(1, Ordering::Relaxed);
            }
            log::warn!(
                "dropping out-of-order event: ts {} behind emitted {}",
                ts,
                self.last_emitted_ts
            );
            return;
        }

        let queue = self.queues.entry(stream).or_default();
        debug_assert!(
            queue.back().map_or(true, |last| last.timestamp_ns() <= ts),
            "stream {:?} pushed a timestamp behind its own tail",
            stream
        );
        if queue.is_empty() {
            self.heap.push(Reverse((ts, stream)));
        }
        queue.push_back(event);
    }

    pub fn has_event(&self) -> bool {
        !self.heap.is_empty()
    }

    /// The globally oldest pending event, if any.
    pub fn top(&self) -> Option<&E> {
        let Reverse((_, stream)) = self.heap.peek()?;
        self.queues.get(stream).and_then(|q| q.front())
    }

    /// Remove and return the oldest pending event, rebalancing the heap.
    pub fn pop(&mut self) -> Option<E> {
        let Reverse((_, stream)) = self.heap.pop()?;
        let queue = self
            .queues
            .get_mut(&stream)
            .expect("heap entry references a missing stream queue");
        let event = queue
            .pop_front()
            .expect("heap entry references an empty stream queue");
        match queue.front() {
            // Decrease-key substitute: re-insert with the new front timestamp.
            Some(next) => self.heap.push(Reverse((next.timestamp_ns(), stream))),
            None => {
                self.queues.remove(&stream);
            }
        }
        Some(event)
    }

    /// Pop and dispatch every event with timestamp at or below `watermark`.
    pub fn process_until(&mut self, watermark: u64) {
        while let Some(front_ts) = self.top().map(|e| e.timestamp_ns()) {
            if front_ts > watermark {
                break;
            }
            let event = self.pop().expect("top() reported a pending event");
            debug_assert!(event.timestamp_ns() >= self.last_emitted_ts);
            self.last_emitted_ts = event.timestamp_ns();
            for visitor in &mut self.visitors {
                visitor.visit(&event);
            }
        }
    }

    /// Dispatch everything currently pending, regardless of lateness.
    pub fn process_all(&mut self) {
        self.process_until(u64::MAX);
    }

    /// Dispatch everything old enough to be safe: timestamps at or below
    /// `now - lateness_window`. The caller must have pushed every event up to
    /// that watermark before calling.
    pub fn drain_old(&mut self, now_ns: u64) {
        self.process_until(now_ns.saturating_sub(self.lateness_window_ns));
    }

    pub fn last_emitted_ts(&self) -> u64 {
        self.last_emitted_ts
    }
}
