use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use silhouette::merger::{EventMerger, EventVisitor, StreamId, Timestamped};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct TestEvent {
    ts: u64,
    tag: &'static str,
}

impl TestEvent {
    fn new(ts: u64, tag: &'static str) -> Self {
        Self { ts, tag }
    }
}

impl Timestamped for TestEvent {
    fn timestamp_ns(&self) -> u64 {
        self.ts
    }
}

struct Collector {
    label: &'static str,
    seen: Arc<Mutex<Vec<(&'static str, TestEvent)>>>,
}

impl EventVisitor<TestEvent> for Collector {
    fn visit(&mut self, event: &TestEvent) {
        self.seen.lock().unwrap().push((self.label, event.clone()));
    }
}

fn merger_with_collector(
    window_ns: u64,
) -> (EventMerger<TestEvent>, Arc<Mutex<Vec<(&'static str, TestEvent)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut merger = EventMerger::new(window_ns);
    merger.add_visitor(Box::new(Collector {
        label: "main",
        seen: seen.clone(),
    }));
    (merger, seen)
}

fn tags(seen: &Arc<Mutex<Vec<(&'static str, TestEvent)>>>) -> Vec<&'static str> {
    seen.lock().unwrap().iter().map(|(_, e)| e.tag).collect()
}

#[test]
fn test_two_stream_merge() {
    let (mut merger, seen) = merger_with_collector(100);
    let a = StreamId::from_u64(3);
    let b = StreamId::from_u64(7);

    merger.push(a, TestEvent::new(10, "a"));
    merger.push(a, TestEvent::new(30, "c"));
    merger.push(b, TestEvent::new(20, "b"));
    merger.push(b, TestEvent::new(40, "d"));

    merger.process_all();
    assert_eq!(tags(&seen), vec!["a", "b", "c", "d"]);
    assert!(!merger.has_event());
}

#[test]
fn test_lateness_window() {
    let (mut merger, seen) = merger_with_collector(100);
    let stream = StreamId::from_u64(1);

    merger.push(stream, TestEvent::new(50, "early"));
    merger.push(stream, TestEvent::new(150, "mid"));
    merger.push(stream, TestEvent::new(210, "late"));

    merger.drain_old(200);
    assert_eq!(tags(&seen), vec!["early"]);
    assert!(merger.has_event());

    merger.drain_old(350);
    assert_eq!(tags(&seen), vec!["early", "mid", "late"]);
    assert!(!merger.has_event());
}

#[test]
fn test_out_of_order_event_is_dropped_and_counted() {
    let (mut merger, seen) = merger_with_collector(100);
    let counter = Arc::new(AtomicU64::new(0));
    merger.set_discarded_counter(counter.clone());

    let a = StreamId::from_u64(1);
    let b = StreamId::from_u64(2);

    merger.push(a, TestEvent::new(100, "x"));
    merger.process_all();
    assert_eq!(tags(&seen), vec!["x"]);

    // Behind the emitted stream: dropped, counted, never dispatched.
    merger.push(b, TestEvent::new(90, "stale"));
    assert!(!merger.has_event());
    assert_eq!(counter.load(Ordering::Relaxed), 1);

    // Equal to the last emitted timestamp is still in order.
    merger.push(b, TestEvent::new(100, "y"));
    merger.push(b, TestEvent::new(110, "z"));
    merger.process_all();
    assert_eq!(tags(&seen), vec!["x", "y", "z"]);
    assert_eq!(counter.load(Ordering::Relaxed), 1);
}

#[test]
fn test_merge_is_a_sorted_permutation_of_the_input() {
    let (mut merger, seen) = merger_with_collector(100);
    let streams = [
        (StreamId::from_u64(10), vec![5u64, 9, 9, 40, 77]),
        (StreamId::from_u64(11), vec![1, 2, 60, 61, 62]),
        (StreamId::from_u64(12), vec![30, 31, 33]),
    ];

    // Interleave pushes across streams.
    let mut pushed = Vec::new();
    let mut cursors = [0usize; 3];
    loop {
        let mut progressed = false;
        for (i, (stream, timestamps)) in streams.iter().enumerate() {
            if cursors[i] < timestamps.len() {
                let event = TestEvent::new(timestamps[cursors[i]], "e");
                pushed.push(event.clone());
                merger.push(*stream, event);
                cursors[i] += 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    merger.process_all();
    let emitted: Vec<TestEvent> = seen.lock().unwrap().iter().map(|(_, e)| e.clone()).collect();
    assert_eq!(emitted.len(), pushed.len());
    assert!(emitted.windows(2).all(|w| w[0].ts <= w[1].ts));

    let mut emitted_sorted = emitted.clone();
    emitted_sorted.sort();
    let mut pushed_sorted = pushed.clone();
    pushed_sorted.sort();
    assert_eq!(emitted_sorted, pushed_sorted);
}

#[test]
fn test_top_and_pop_rebalance() {
    let mut merger: EventMerger<TestEvent> = EventMerger::new(100);
    let a = StreamId::from_u64(1);
    let b = StreamId::from_u64(2);

    merger.push(a, TestEvent::new(1, "a1"));
    merger.push(a, TestEvent::new(5, "a2"));
    merger.push(b, TestEvent::new(3, "b1"));

    assert_eq!(merger.top().unwrap().tag, "a1");
    assert_eq!(merger.pop().unwrap().tag, "a1");
    // Stream a re-enters the heap behind b's front.
    assert_eq!(merger.top().unwrap().tag, "b1");
    assert_eq!(merger.pop().unwrap().tag, "b1");
    assert_eq!(merger.pop().unwrap().tag, "a2");
    assert!(!merger.has_event());
    assert!(merger.pop().is_none());
    assert!(merger.top().is_none());
}

#[test]
fn test_visitors_run_in_insertion_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut merger = EventMerger::new(100);
    merger.add_visitor(Box::new(Collector {
        label: "first",
        seen: seen.clone(),
    }));
    merger.add_visitor(Box::new(Collector {
        label: "second",
        seen: seen.clone(),
    }));

    merger.push(StreamId::from_u64(1), TestEvent::new(10, "a"));
    merger.process_all();

    let labels: Vec<&'static str> = seen.lock().unwrap().iter().map(|(l, _)| *l).collect();
    assert_eq!(labels, vec!["first", "second"]);
}

#[test]
fn test_clear_visitors_stops_dispatch() {
    let (mut merger, seen) = merger_with_collector(100);
    merger.clear_visitors();
    merger.push(StreamId::from_u64(1), TestEvent::new(10, "a"));
    merger.process_all();
    assert!(seen.lock().unwrap().is_empty());
    // The event itself was still consumed in order.
    assert_eq!(merger.last_emitted_ts(), 10);
}
