// tests/batch_engine.rs
//
// The generic engine against an in-memory processor: windows, concurrency
// bound, tally, and that failed items come back on the next run.

use async_trait::async_trait;
use enrichflow::batch::{BatchProcessor, ProcessResult, Processor, ProgressStats};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Ok,
    Skip,
    Fail,
    Panic,
}

#[derive(Clone)]
struct Item {
    id: usize,
    outcome: Outcome,
}

/// Behaves like one enrichment table: an item is pending until it completes.
struct MemoryProcessor {
    items: Vec<Item>,
    done: Mutex<HashSet<usize>>,
    /// Items that fail only on their first attempt.
    flaky: Mutex<HashSet<usize>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    completed: AtomicUsize,
    /// (id, completed count when the item started)
    starts: Mutex<Vec<(usize, usize)>>,
}

impl MemoryProcessor {
    fn new(outcomes: impl IntoIterator<Item = Outcome>) -> Self {
        Self {
            items: outcomes
                .into_iter()
                .enumerate()
                .map(|(id, outcome)| Item { id, outcome })
                .collect(),
            done: Mutex::new(HashSet::new()),
            flaky: Mutex::new(HashSet::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            starts: Mutex::new(Vec::new()),
        }
    }

    fn all_ok(n: usize) -> Self {
        Self::new(std::iter::repeat(Outcome::Ok).take(n))
    }
}

#[async_trait]
impl Processor for MemoryProcessor {
    type Item = Item;

    async fn fetch_pending(&self, limit: i64) -> anyhow::Result<Vec<Item>> {
        let done = self.done.lock().unwrap();
        Ok(self
            .items
            .iter()
            .filter(|i| !done.contains(&i.id))
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn process_one(&self, item: Item) -> ProcessResult {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.starts
            .lock()
            .unwrap()
            .push((item.id, self.completed.load(Ordering::SeqCst)));

        tokio::time::sleep(Duration::from_millis(5)).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);

        if self.flaky.lock().unwrap().remove(&item.id) {
            return ProcessResult::failed("transient");
        }

        match item.outcome {
            Outcome::Ok => {
                self.done.lock().unwrap().insert(item.id);
                ProcessResult::ok()
            }
            Outcome::Skip => {
                self.done.lock().unwrap().insert(item.id);
                ProcessResult::skipped()
            }
            Outcome::Fail => ProcessResult::failed("boom"),
            Outcome::Panic => panic!("item {} blew up", item.id),
        }
    }

    async fn remaining_count(&self) -> anyhow::Result<i64> {
        Ok((self.items.len() - self.done.lock().unwrap().len()) as i64)
    }

    async fn progress(&self) -> anyhow::Result<ProgressStats> {
        let done = self.done.lock().unwrap().len() as i64;
        Ok(ProgressStats::from_counts(self.items.len() as i64, done, 0))
    }
}

#[tokio::test]
async fn empty_pending_set_reports_zeroes() {
    let engine = BatchProcessor::new(MemoryProcessor::all_ok(0), 10);
    let stats = engine.batch_process(100).await.unwrap();
    assert_eq!((stats.success, stats.failed, stats.skipped, stats.remaining), (0, 0, 0, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn processes_limit_in_windows_and_reports_remaining() {
    // 250 pending, limit 200, concurrency 50 -> four windows, 50 left over.
    let engine = BatchProcessor::new(MemoryProcessor::all_ok(250), 50);
    let stats = engine.batch_process(200).await.unwrap();

    assert_eq!(stats.success, 200);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.remaining, 50);

    let p = engine.processor();
    assert!(p.max_in_flight.load(Ordering::SeqCst) <= 50);

    // Window k only starts after windows 0..k have fully finished.
    for (pos, (_, completed_at_start)) in p.starts.lock().unwrap().iter().enumerate() {
        let window = pos / 50;
        assert!(
            *completed_at_start >= window * 50,
            "item #{pos} started with only {completed_at_start} completed"
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_is_never_exceeded() {
    let engine = BatchProcessor::new(MemoryProcessor::all_ok(40), 3);
    engine.batch_process(40).await.unwrap();
    let max = engine.processor().max_in_flight.load(Ordering::SeqCst);
    assert!(max <= 3, "saw {max} items in flight");
    assert!(max >= 1);
}

#[tokio::test]
async fn zero_concurrency_is_treated_as_one() {
    let engine = BatchProcessor::new(MemoryProcessor::all_ok(5), 0);
    assert_eq!(engine.concurrency(), 1);
    let stats = engine.batch_process(5).await.unwrap();
    assert_eq!(stats.success, 5);
    assert_eq!(engine.processor().max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn tally_counts_skipped_only_as_skipped() {
    use Outcome::*;
    let engine = BatchProcessor::new(MemoryProcessor::new([Ok, Skip, Fail, Ok, Skip]), 2);
    let stats = engine.batch_process(10).await.unwrap();

    assert_eq!(stats.success, 2);
    assert_eq!(stats.skipped, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.remaining, 1);
}

#[tokio::test]
async fn panicking_item_counts_as_failed() {
    use Outcome::*;
    let engine = BatchProcessor::new(MemoryProcessor::new([Ok, Panic, Ok]), 3);
    let stats = engine.batch_process(3).await.unwrap();

    assert_eq!(stats.success, 2);
    assert_eq!(stats.failed, 1);
}

#[tokio::test]
async fn failed_items_are_retried_on_later_runs() {
    let processor = MemoryProcessor::all_ok(3);
    processor.flaky.lock().unwrap().insert(1);
    let engine = BatchProcessor::new(processor, 2);

    let first = engine.batch_process(10).await.unwrap();
    assert_eq!((first.success, first.failed, first.remaining), (2, 1, 1));

    let second = engine.batch_process(10).await.unwrap();
    assert_eq!((second.success, second.failed, second.remaining), (1, 0, 0));

    let third = engine.batch_process(10).await.unwrap();
    assert_eq!((third.success, third.failed, third.remaining), (0, 0, 0));
}

#[tokio::test]
async fn remaining_is_stable_without_new_work() {
    use Outcome::*;
    let engine = BatchProcessor::new(MemoryProcessor::new([Fail, Fail]), 2);
    let a = engine.batch_process(10).await.unwrap();
    let b = engine.batch_process(10).await.unwrap();
    assert_eq!(a.remaining, 2);
    assert_eq!(b.remaining, 2);
    assert_eq!(b.failed, 2);
}
