// Copyright © 2024 Pathway

//! Weavers merge the strands into the rope.
//!
//! All of them are driven by the single weaving thread of a splicer and are
//! interchangeable behind the [`Weaver`] trait:
//! - [`TwoPassWeaver`] finds the greatest point common to all strands and
//!   gathers everything up to it;
//! - [`MergeTree`] pushes records up a static binary tree of pairwise
//!   comparisons, optionally tolerating idle strands.

pub mod tree;
pub mod two_pass;

use serde::{Deserialize, Serialize};

use crate::engine::Record;
use crate::strands::{Strand, StrandId};

pub use self::tree::strategy::{IdleTimeout, NodeStrategy, Strict};
pub use self::tree::MergeTree;
pub use self::two_pass::TwoPassWeaver;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Nothing could be moved into the rope.
    Idle,
    /// This many records have been appended.
    Woven(usize),
    /// Every strand has ended and has been drained.
    Exhausted,
}

pub trait Weaver<R: Record>: Send {
    fn name(&self) -> &'static str;

    /// Called when a run begins, once the set of strands is stable.
    fn begin(&mut self, strands: &[Strand<R>]);

    /// Appends to `rope` the records that can be released now, none of them
    /// greater than `limit`.
    fn weave(&mut self, strands: &[Strand<R>], limit: Option<&R>, rope: &mut Vec<R>) -> Progress;

    /// Called once per polling interval.
    fn on_tick(&mut self) {}

    /// Number of idle polling intervals after which a silent strand stops
    /// holding back the others, if the weaver supports it at all.
    fn idle_tolerance(&self) -> Option<u32> {
        None
    }

    /// Whether every strand has nothing left that is not greater than
    /// `cutoff`, while still keeping at least one record above it (or having
    /// ended).
    fn retains_beyond(&self, strands: &[Strand<R>], cutoff: &R) -> bool;

    /// Called when a run ends. Records the weaver holds have to be given back
    /// to their strands.
    fn end(&mut self);

    /// The strand the weaving is waiting for, if any.
    fn stalled_strand(&self, strands: &[Strand<R>]) -> Option<StrandId>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeaverKind {
    TwoPass,
    Tree,
    TreeWithTimeout { max_idle_ticks: u32 },
}

impl WeaverKind {
    pub fn build<R: Record>(self, node_capacity: usize) -> Box<dyn Weaver<R>> {
        match self {
            Self::TwoPass => Box::new(TwoPassWeaver::new()),
            Self::Tree => Box::new(MergeTree::new(Box::new(Strict), node_capacity)),
            Self::TreeWithTimeout { max_idle_ticks } => Box::new(MergeTree::new(
                Box::new(IdleTimeout::new(max_idle_ticks)),
                node_capacity,
            )),
        }
    }
}

/// Default check shared by the weavers: a strand is fine if it has ended
/// with nothing at or below `cutoff`, or if its earliest record is above it.
pub(crate) fn strand_retains_beyond<R: Record>(strand: &Strand<R>, cutoff: &R) -> bool {
    match strand.head() {
        Some(head) => head > *cutoff,
        None => strand.is_exhausted(),
    }
}
