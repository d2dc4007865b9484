// Copyright © 2024 Pathway

//! Parallel priority sorter.
//!
//! Inputs are spread round-robin over a fixed number of worker threads. Each
//! worker merges its inputs through a local heap into a bounded output
//! queue, and a single merge thread combines the worker outputs into one
//! ordered stream handed to a [`SortConsumer`].
//!
//! Workers wake the merge up every `chunk_size` records, so the chunk size
//! trades latency for merge overhead. It is tuned per worker while running,
//! see [`tuning`].

pub mod config;
pub mod input;
mod merge;
pub mod monitoring;
pub mod tuning;
mod worker;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use crossbeam_channel as channel;
use log::{debug, error, info, warn};
use scopeguard::guard;

use self::merge::{Merger, PassMode, WorkerLink};
use self::monitoring::SorterStats;
use self::tuning::ChunkTuner;
use self::worker::WorkerShared;
use crate::engine::error::{Error, Result};
use crate::engine::Record;

pub use self::config::SorterConfig;
pub use self::input::SortInput;

/// Receives the sorted stream, on the merge thread.
pub trait SortConsumer<R>: Send + 'static {
    fn consume(&mut self, record: R);

    fn end_of_stream(&mut self) {}
}

impl<R, F> SortConsumer<R> for F
where
    F: FnMut(R) + Send + 'static,
{
    fn consume(&mut self, record: R) {
        self(record);
    }
}

struct SorterShared {
    pushed: Arc<AtomicU64>,
    stats: Arc<ArcSwap<SorterStats>>,
    stopped: Mutex<bool>,
    stop_condvar: Condvar,
    shutdown: AtomicBool,
}

impl SorterShared {
    fn mark_stopped(&self) {
        *self.stopped.lock().unwrap() = true;
        self.stop_condvar.notify_all();
    }
}

pub struct PrioritySorter<R: Record> {
    config: SorterConfig,
    inputs: Vec<channel::Receiver<R>>,
    consumer: Option<Box<dyn SortConsumer<R>>>,
    shared: Arc<SorterShared>,
    merger: Option<Arc<Mutex<Merger<R>>>>,
    threads: Vec<JoinHandle<()>>,
}

impl<R: Record> PrioritySorter<R> {
    pub fn new(config: SorterConfig, consumer: impl SortConsumer<R>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            inputs: Vec::new(),
            consumer: Some(Box::new(consumer)),
            shared: Arc::new(SorterShared {
                pushed: Arc::new(AtomicU64::new(0)),
                stats: Arc::new(ArcSwap::from_pointee(SorterStats::default())),
                stopped: Mutex::new(false),
                stop_condvar: Condvar::new(),
                shutdown: AtomicBool::new(false),
            }),
            merger: None,
            threads: Vec::new(),
        })
    }

    /// Adds an input. Inputs can only be added before the sorter starts; up to
    /// `input_capacity` records can be pushed before that.
    pub fn register(&mut self) -> Result<SortInput<R>> {
        if self.is_started() {
            return Err(Error::AlreadyStarted);
        }
        let (sender, receiver) = channel::bounded(self.config.input_capacity);
        let id = self.inputs.len();
        self.inputs.push(receiver);
        Ok(SortInput::new(id, sender, Arc::clone(&self.shared.pushed)))
    }

    pub fn is_started(&self) -> bool {
        self.merger.is_some()
    }

    pub fn start(&mut self) -> Result<()> {
        if self.is_started() {
            return Err(Error::AlreadyStarted);
        }
        if self.inputs.is_empty() {
            return Err(Error::NeedsProducers);
        }
        let Some(consumer) = self.consumer.take() else {
            return Err(Error::AlreadyStarted);
        };

        let worker_count = self.config.parallelism.min(self.inputs.len());
        let mut buckets: Vec<Vec<channel::Receiver<R>>> =
            (0..worker_count).map(|_| Vec::new()).collect();
        for (index, input) in self.inputs.drain(..).enumerate() {
            buckets[index % worker_count].push(input);
        }

        let (signal_sender, signal_receiver) = channel::bounded(1);
        let mut links = Vec::with_capacity(worker_count);
        for (index, inputs) in buckets.into_iter().enumerate() {
            let (output_sender, output_receiver) = channel::bounded(self.config.output_capacity);
            let shared = Arc::new(WorkerShared::new(inputs.len(), self.config.chunk_size));
            self.threads.push(worker::spawn(
                index,
                inputs,
                output_sender,
                signal_sender.clone(),
                Arc::clone(&shared),
            ));
            links.push(WorkerLink {
                output: output_receiver,
                shared,
            });
        }
        drop(signal_sender);

        let merger = Arc::new(Mutex::new(Merger::new(
            links,
            ChunkTuner::new(self.config.chunk_size, self.config.busy_checks),
            consumer,
            Arc::clone(&self.shared.stats),
            Arc::clone(&self.shared.pushed),
        )));
        self.merger = Some(Arc::clone(&merger));

        let shared = Arc::clone(&self.shared);
        let poll_interval = self.config.poll_interval;
        let tuning_interval = self.config.tuning_interval;
        let merge_thread = thread::Builder::new()
            .name("sorter:merge".to_owned())
            .spawn(move || {
                // Waiters are released even if the consumer panics.
                let _stopped = guard(Arc::clone(&shared), |shared| shared.mark_stopped());
                merge_loop(
                    &merger,
                    &signal_receiver,
                    &shared,
                    poll_interval,
                    tuning_interval,
                );
            })
            .expect("sorter merge thread creation failed");
        self.threads.push(merge_thread);
        info!("sorter started with {worker_count} worker(s)");
        Ok(())
    }

    /// Runs a merge pass on the calling thread, unless one is already running.
    pub fn merge_now(&self) -> bool {
        let Some(merger) = &self.merger else {
            return false;
        };
        match merger.try_lock() {
            Ok(mut merger) => {
                merger.pass(PassMode::NonBlocking);
                true
            }
            Err(_) => false,
        }
    }

    /// Waits until the whole stream has been delivered; `false` on timeout.
    pub fn wait_for_stop(&self, timeout: Duration) -> bool {
        let stopped = self.shared.stopped.lock().unwrap();
        let (stopped, _) = self
            .shared
            .stop_condvar
            .wait_timeout_while(stopped, timeout, |stopped| !*stopped)
            .unwrap();
        *stopped
    }

    pub fn is_stopped(&self) -> bool {
        *self.shared.stopped.lock().unwrap()
    }

    pub fn stats(&self) -> Arc<SorterStats> {
        self.shared.stats.load_full()
    }
}

impl<R: Record> Drop for PrioritySorter<R> {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if !self.is_stopped() {
            // Workers may be waiting on inputs that are still alive.
            warn!("sorter dropped before the end of its stream, detaching its threads");
            return;
        }
        for thread in self.threads.drain(..) {
            if let Err(payload) = thread.join() {
                error!(
                    "sorter thread failed: {}",
                    Error::from_panic_payload(payload)
                );
            }
        }
    }
}

fn merge_loop<R: Record>(
    merger: &Mutex<Merger<R>>,
    signal: &channel::Receiver<()>,
    shared: &SorterShared,
    poll_interval: Duration,
    tuning_interval: Duration,
) {
    let mut last_tuning = Instant::now();
    let mut workers_done = false;
    loop {
        if !workers_done {
            // Every worker holds a sender, so disconnection means they have all finished.
            workers_done = matches!(
                signal.recv_timeout(poll_interval),
                Err(channel::RecvTimeoutError::Disconnected)
            );
        }
        if shared.shutdown.load(Ordering::Acquire) {
            debug!("sorter merge thread shutting down");
            break;
        }

        let finished = if workers_done {
            // Final flush: every output is complete, so waiting on it can't hang.
            merger.lock().unwrap().pass(PassMode::Blocking)
        } else {
            match merger.try_lock() {
                Ok(mut merger) => {
                    let finished = merger.pass(PassMode::NonBlocking);
                    if last_tuning.elapsed() >= tuning_interval {
                        merger.tune();
                        last_tuning = Instant::now();
                    }
                    finished
                }
                Err(_) => false,
            }
        };
        if finished {
            shared.mark_stopped();
            break;
        }
    }
}
