// Copyright © 2024 Pathway

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel as channel;
use log::{debug, error};
use scopeguard::guard;

use crate::engine::error::{Error, Result};
use crate::engine::Record;

/// What a worker puts into its output queue.
pub(crate) enum Output<R> {
    Record(R),
    End,
}

/// The part of a worker visible to the merge and the tuning.
#[derive(Debug)]
pub(crate) struct WorkerShared {
    pub inputs: usize,
    pub chunk_size: AtomicUsize,
    pub finished: AtomicBool,
    pub failed: AtomicBool,
}

impl WorkerShared {
    pub fn new(inputs: usize, chunk_size: usize) -> Self {
        Self {
            inputs,
            chunk_size: AtomicUsize::new(chunk_size),
            finished: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }
}

struct Worker<R> {
    index: usize,
    inputs: Vec<channel::Receiver<R>>,
    output: channel::Sender<Output<R>>,
    signal: channel::Sender<()>,
    shared: Arc<WorkerShared>,
}

/// Wakes up the merge. A pending wake-up is enough, so a full channel is fine.
fn notify(signal: &channel::Sender<()>) {
    signal.try_send(()).unwrap_or(());
}

pub(crate) fn spawn<R: Record>(
    index: usize,
    inputs: Vec<channel::Receiver<R>>,
    output: channel::Sender<Output<R>>,
    signal: channel::Sender<()>,
    shared: Arc<WorkerShared>,
) -> JoinHandle<()> {
    let worker = Worker {
        index,
        inputs,
        output,
        signal,
        shared,
    };
    thread::Builder::new()
        .name(format!("sorter:worker-{index}"))
        .spawn(move || worker.run())
        .expect("sorter worker thread creation failed")
}

impl<R: Record> Worker<R> {
    fn run(self) {
        let index = self.index;
        let shared = Arc::clone(&self.shared);
        // Whatever happens, the merge has to learn that this worker is done.
        let _end = guard(
            (self.output.clone(), self.signal.clone(), Arc::clone(&shared)),
            |(output, signal, shared)| {
                output.send(Output::End).unwrap_or(());
                shared.finished.store(true, Ordering::Release);
                notify(&signal);
            },
        );

        let result = catch_unwind(AssertUnwindSafe(|| self.sort()))
            .unwrap_or_else(|payload| Err(Error::from_panic_payload(payload)));
        match result {
            Ok(sorted) => debug!("sorter worker {index} finished after {sorted} records"),
            Err(err) => {
                shared.failed.store(true, Ordering::Release);
                error!("sorter worker {index} stopped: {err}");
            }
        }
    }

    fn refill(
        &self,
        heap: &mut BinaryHeap<Reverse<(R, usize)>>,
        input: usize,
        blocking: bool,
    ) -> Result<bool> {
        let received = if blocking {
            self.inputs[input].recv().ok()
        } else {
            match self.inputs[input].try_recv() {
                Ok(record) => Some(record),
                Err(channel::TryRecvError::Empty) => return Ok(false),
                Err(channel::TryRecvError::Disconnected) => None,
            }
        };
        if let Some(record) = received {
            heap.try_reserve(1)
                .map_err(|err| Error::Other(Box::new(err)))?;
            heap.push(Reverse((record, input)));
        }
        Ok(true)
    }

    fn sort(&self) -> Result<u64> {
        let mut heap = BinaryHeap::new();
        heap.try_reserve(self.inputs.len())
            .map_err(|err| Error::Other(Box::new(err)))?;
        for input in 0..self.inputs.len() {
            self.refill(&mut heap, input, true)?;
        }

        let mut sorted = 0;
        let mut since_signal = 0;
        while let Some(Reverse((record, input))) = heap.pop() {
            match self.output.try_send(Output::Record(record)) {
                Ok(()) => {}
                Err(channel::TrySendError::Full(output)) => {
                    notify(&self.signal);
                    if self.output.send(output).is_err() {
                        return Err(Error::ShutDown);
                    }
                }
                Err(channel::TrySendError::Disconnected(_)) => return Err(Error::ShutDown),
            }
            sorted += 1;
            since_signal += 1;

            // The next record of this input may be lower than anything in the
            // heap, so it has to be known before popping again.
            if !self.refill(&mut heap, input, false)? {
                notify(&self.signal);
                since_signal = 0;
                self.refill(&mut heap, input, true)?;
            }
            if since_signal >= self.shared.chunk_size.load(Ordering::Relaxed) {
                notify(&self.signal);
                since_signal = 0;
            }
        }
        Ok(sorted)
    }
}
