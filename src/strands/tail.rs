// Copyright © 2024 Pathway

use std::fmt;
use std::sync::{Arc, Weak};

use log::debug;

use super::{Strand, StrandId};
use crate::engine::error::Result;
use crate::engine::signal::WeaveSignal;
use crate::engine::Record;

/// The owner of a strand set, told when a strand has been closed so that it
/// can forget it as soon as nothing is being woven.
pub trait StrandRegistry: Send + Sync {
    fn strand_closed(&self, id: StrandId);
}

struct Unregistered;

impl StrandRegistry for Unregistered {
    fn strand_closed(&self, _id: StrandId) {}
}

/// The producer's write handle onto a strand.
pub struct StrandTail<R> {
    strand: Strand<R>,
    signal: Arc<WeaveSignal>,
    registry: Weak<dyn StrandRegistry>,
}

impl<R: Record> StrandTail<R> {
    pub fn new(
        strand: Strand<R>,
        signal: Arc<WeaveSignal>,
        registry: Weak<dyn StrandRegistry>,
    ) -> Self {
        Self {
            strand,
            signal,
            registry,
        }
    }

    /// A tail whose strand isn't owned by any registry.
    pub fn detached(strand: Strand<R>, signal: Arc<WeaveSignal>) -> Self {
        let registry: Weak<dyn StrandRegistry> = Weak::<Unregistered>::new();
        Self::new(strand, signal, registry)
    }

    pub fn id(&self) -> StrandId {
        self.strand.id()
    }

    /// Appends a record. Pushing `R::last()` marks the end of data until the
    /// splicer stops.
    pub fn push(&self, record: R) -> Result<()> {
        self.strand.push(record)?;
        self.signal.notify();
        Ok(())
    }

    /// Appends a non-decreasing sequence as a whole; nothing is appended if
    /// any of it is rejected.
    pub fn push_all(&self, records: impl IntoIterator<Item = R>) -> Result<()> {
        let records: Vec<R> = records.into_iter().collect();
        let notify = !records.is_empty();
        self.strand.push_all(records)?;
        if notify {
            self.signal.notify();
        }
        Ok(())
    }

    pub fn close(&self) {
        if !self.strand.close() {
            return;
        }
        debug!("{} closed with {} buffered records", self.id(), self.size());
        if let Some(registry) = self.registry.upgrade() {
            registry.strand_closed(self.id());
        }
        self.signal.notify();
    }

    pub fn head(&self) -> Option<R> {
        self.strand.head()
    }

    pub fn size(&self) -> usize {
        self.strand.size()
    }

    pub fn is_closed(&self) -> bool {
        self.strand.is_closed()
    }
}

impl<R: Record> fmt::Debug for StrandTail<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StrandTail")
            .field("strand", &self.strand)
            .finish_non_exhaustive()
    }
}
