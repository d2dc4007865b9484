// Copyright © 2024 Pathway

//! The analysis-dispatch thread.
//!
//! It owns the rope. The weaving thread hands over every woven batch through
//! a channel, so a slow analysis never holds up weaving or the producers.
//! Truncations requested from inside the analysis are queued behind the
//! running call and applied once it returns.

use std::mem;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use arc_swap::ArcSwap;
use crossbeam_channel as channel;
use log::{debug, error};
use serde::{Deserialize, Serialize};

use super::SplicerHandle;
use crate::engine::error::{DynResult, Error};
use crate::engine::{Record, Rope, SplicerEvent};

/// The client's analysis. It gets the whole visible rope and the number of
/// records removed from its front since the previous call.
pub type Analysis<R> = Box<dyn FnMut(&[R], usize, &SplicerHandle<R>) -> DynResult<()> + Send>;

pub(crate) enum Message<R> {
    Extend(Vec<R>),
    Truncate(R),
    Flush(channel::Sender<()>),
    Snapshot(channel::Sender<Vec<R>>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RopeStats {
    pub len: usize,
    pub appended: u64,
    pub truncated: usize,
    pub analysis_calls: u64,
    pub analysis_failures: u64,
}

struct Dispatcher<R: Record> {
    rope: Rope<R>,
    analysis: Analysis<R>,
    handle: SplicerHandle<R>,
    stats: Arc<ArcSwap<RopeStats>>,
    decrement: usize,
    fresh: bool,
    appended: u64,
    calls: u64,
    failures: u64,
}

pub(crate) fn spawn<R: Record>(
    receiver: channel::Receiver<Message<R>>,
    analysis: Analysis<R>,
    handle: SplicerHandle<R>,
    stats: Arc<ArcSwap<RopeStats>>,
) -> JoinHandle<()> {
    let dispatcher = Dispatcher {
        rope: Rope::new(),
        analysis,
        handle,
        stats,
        decrement: 0,
        fresh: false,
        appended: 0,
        calls: 0,
        failures: 0,
    };
    thread::Builder::new()
        .name("splicer:analysis".to_owned())
        .spawn(move || dispatcher.run(&receiver))
        .expect("analysis thread creation failed")
}

impl<R: Record> Dispatcher<R> {
    fn run(mut self, receiver: &channel::Receiver<Message<R>>) {
        while let Ok(message) = receiver.recv() {
            let mut keep_going = self.process(message);
            // Whatever arrived in the meantime goes into the same analysis call.
            while keep_going {
                match receiver.try_recv() {
                    Ok(message) => keep_going = self.process(message),
                    Err(_) => break,
                }
            }
            if self.fresh {
                self.analyze();
            }
            self.publish_stats();
            if !keep_going {
                break;
            }
        }
        debug!(
            "analysis thread finished after {} calls, {} records left in the rope",
            self.calls,
            self.rope.len()
        );
    }

    fn process(&mut self, message: Message<R>) -> bool {
        match message {
            Message::Extend(records) => {
                self.appended += records.len() as u64;
                self.rope.extend(records);
                self.fresh = true;
            }
            Message::Truncate(cutoff) => self.truncate(&cutoff),
            Message::Flush(ack_sender) => {
                self.analyze();
                self.publish_stats();
                ack_sender.send(()).unwrap_or(());
            }
            Message::Snapshot(reply_sender) => {
                reply_sender.send(self.rope.to_vec()).unwrap_or(());
            }
            Message::Shutdown => return false,
        }
        true
    }

    fn truncate(&mut self, cutoff: &R) {
        let removed = self.rope.truncate(cutoff);
        if removed.is_empty() {
            return;
        }
        self.decrement += removed.len();
        self.handle.listeners().fire(&SplicerEvent::Truncated {
            cutoff,
            removed: &removed,
        });
    }

    fn analyze(&mut self) {
        self.fresh = false;
        self.calls += 1;
        let decrement = mem::take(&mut self.decrement);
        let Self {
            rope,
            analysis,
            handle,
            ..
        } = self;
        let records = rope.as_slice();
        match catch_unwind(AssertUnwindSafe(|| analysis(records, decrement, handle))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                self.failures += 1;
                error!("analysis failed: {err}");
            }
            Err(payload) => {
                self.failures += 1;
                error!("analysis panicked: {}", Error::from_panic_payload(payload));
            }
        }
    }

    fn publish_stats(&self) {
        self.stats.store(Arc::new(RopeStats {
            len: self.rope.len(),
            appended: self.appended,
            truncated: self.rope.total_truncated(),
            analysis_calls: self.calls,
            analysis_failures: self.failures,
        }));
    }
}
