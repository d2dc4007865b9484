// Copyright © 2024 Pathway

//! The top-level merge of the worker outputs.
//!
//! A record can only leave the merge once every worker that hasn't ended
//! has a record in the heap, since any of them could still produce something
//! lower. A worker with an empty output therefore ends the pass, unless the
//! pass is blocking, in which case the merge waits for it.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use crossbeam_channel as channel;
use log::{debug, error};

use super::monitoring::{SorterLogger, SorterStats, WorkerStats};
use super::tuning::{CheckCounter, ChunkTuner};
use super::worker::{Output, WorkerShared};
use super::SortConsumer;
use crate::engine::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PassMode {
    NonBlocking,
    Blocking,
}

pub(crate) struct WorkerLink<R> {
    pub output: channel::Receiver<Output<R>>,
    pub shared: Arc<WorkerShared>,
}

pub(crate) struct Merger<R> {
    workers: Vec<WorkerLink<R>>,
    heap: BinaryHeap<Reverse<(R, usize)>>,
    // Workers that have no record in the heap and haven't ended.
    missing: Vec<usize>,
    counters: Vec<CheckCounter>,
    tuner: ChunkTuner,
    consumer: Box<dyn SortConsumer<R>>,
    last: Option<R>,
    delivered: u64,
    out_of_order: u64,
    finished: bool,
    logger: SorterLogger,
    stats: Arc<ArcSwap<SorterStats>>,
    pushed: Arc<AtomicU64>,
}

impl<R: Record> Merger<R> {
    pub fn new(
        workers: Vec<WorkerLink<R>>,
        tuner: ChunkTuner,
        consumer: Box<dyn SortConsumer<R>>,
        stats: Arc<ArcSwap<SorterStats>>,
        pushed: Arc<AtomicU64>,
    ) -> Self {
        let count = workers.len();
        Self {
            workers,
            heap: BinaryHeap::with_capacity(count),
            missing: (0..count).collect(),
            counters: vec![CheckCounter::default(); count],
            tuner,
            consumer,
            last: None,
            delivered: 0,
            out_of_order: 0,
            finished: false,
            logger: SorterLogger::new(),
            stats,
            pushed,
        }
    }

    /// Tries to get a head from the worker; `false` if its output is empty.
    fn fetch(&mut self, worker: usize, mode: PassMode) -> bool {
        let output = &self.workers[worker].output;
        let received = match mode {
            PassMode::Blocking => Some(output.recv().unwrap_or(Output::End)),
            PassMode::NonBlocking => match output.try_recv() {
                Ok(received) => Some(received),
                Err(channel::TryRecvError::Empty) => None,
                Err(channel::TryRecvError::Disconnected) => Some(Output::End),
            },
        };
        if mode == PassMode::NonBlocking {
            self.counters[worker].record(received.is_some());
        }
        match received {
            Some(Output::Record(record)) => {
                self.heap.push(Reverse((record, worker)));
                true
            }
            Some(Output::End) => {
                debug!("sorter worker {worker} ended");
                true
            }
            None => false,
        }
    }

    fn deliver(&mut self, record: R) {
        if let Some(last) = &self.last {
            if record < *last {
                self.out_of_order += 1;
                error!("sorter delivered {record:?} after {last:?}");
            }
        }
        self.last = Some(record.clone());
        self.delivered += 1;
        self.consumer.consume(record);
    }

    /// Delivers as much as can be delivered in order. Returns `true` once the
    /// stream has ended.
    pub fn pass(&mut self, mode: PassMode) -> bool {
        if self.finished {
            return true;
        }
        let delivered_before = self.delivered;
        loop {
            let missing = std::mem::take(&mut self.missing);
            for worker in missing {
                if !self.fetch(worker, mode) {
                    self.missing.push(worker);
                }
            }
            if !self.missing.is_empty() {
                break;
            }
            let Some(Reverse((record, worker))) = self.heap.pop() else {
                self.finish();
                break;
            };
            self.deliver(record);
            self.missing.push(worker);
        }
        self.logger
            .on_pass(Instant::now(), self.delivered - delivered_before);
        self.publish_stats();
        self.finished
    }

    fn finish(&mut self) {
        self.finished = true;
        self.consumer.end_of_stream();
        self.logger.on_finished(self.delivered);
    }

    pub fn tune(&mut self) {
        for (worker, counter) in self.counters.iter_mut().enumerate() {
            let window = counter.take();
            let chunk_size = &self.workers[worker].shared.chunk_size;
            let current = chunk_size.load(Ordering::Relaxed);
            let advice = self.tuner.advise(&window);
            let adjusted = self.tuner.adjust(current, &advice);
            if adjusted != current {
                debug!(
                    "sorter worker {worker}: {advice:?} after {} checks ({} hits), chunk size {current} -> {adjusted}",
                    window.checks, window.hits
                );
                chunk_size.store(adjusted, Ordering::Relaxed);
            }
        }
    }

    pub fn publish_stats(&self) {
        let workers = self
            .workers
            .iter()
            .map(|worker| WorkerStats {
                inputs: worker.shared.inputs,
                queued: worker.output.len(),
                chunk_size: worker.shared.chunk_size.load(Ordering::Relaxed),
                finished: worker.shared.finished.load(Ordering::Acquire),
                failed: worker.shared.failed.load(Ordering::Acquire),
            })
            .collect();
        self.stats.store(Arc::new(SorterStats {
            pushed: self.pushed.load(Ordering::Relaxed),
            delivered: self.delivered,
            out_of_order: self.out_of_order,
            workers,
            finished: self.finished,
        }));
    }
}
