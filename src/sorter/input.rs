// Copyright © 2024 Pathway

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel as channel;

use crate::engine::error::{Error, Result};
use crate::engine::Record;

/// The producer's end of a sorter input.
///
/// Pushing the end-of-data marker, or dropping the input, ends it.
pub struct SortInput<R> {
    id: usize,
    sender: Option<channel::Sender<R>>,
    last: Option<R>,
    pushed: Arc<AtomicU64>,
}

impl<R: Record> SortInput<R> {
    pub(crate) fn new(id: usize, sender: channel::Sender<R>, pushed: Arc<AtomicU64>) -> Self {
        Self {
            id,
            sender: Some(sender),
            last: None,
            pushed,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Blocks while the input queue is full.
    pub fn push(&mut self, record: R) -> Result<()> {
        if record.is_last() {
            self.close();
            return Ok(());
        }
        let Some(sender) = &self.sender else {
            return Err(Error::StrandClosed);
        };
        if let Some(last) = &self.last {
            if record < *last {
                return Err(Error::out_of_order(last, &record));
            }
        }
        self.last = Some(record.clone());
        sender.send(record).map_err(|_| Error::ShutDown)?;
        self.pushed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn close(&mut self) {
        self.sender = None;
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_none()
    }

    /// Records waiting in the queue.
    pub fn queued(&self) -> usize {
        self.sender.as_ref().map_or(0, channel::Sender::len)
    }
}

impl<R> fmt::Debug for SortInput<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SortInput")
            .field("id", &self.id)
            .field("closed", &self.sender.is_none())
            .finish_non_exhaustive()
    }
}
