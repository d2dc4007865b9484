// Copyright © 2024 Pathway

//! Weaving in two passes.
//!
//! The first pass finds the greatest common point: the minimum, over all
//! strands, of the most recent record of each strand. Every strand is known
//! to be complete up to that point, since records arrive in order within a
//! strand. A strand that has ended doesn't constrain the minimum. If some
//! strand is still empty, nothing can be said and the pass gives up.
//!
//! The second pass pulls everything not greater than that point out of every
//! strand and sorts the result. The sort is stable, so equal records keep the
//! order of the strands they came from and the order they were pushed in.
//!
//! After a successful cycle, the strand that defined the common point is
//! empty, so the next cycle can't make progress until that strand receives
//! more data.

use log::trace;

use super::{strand_retains_beyond, Progress, Weaver};
use crate::engine::{Record, TotalFrontier};
use crate::strands::{Strand, StrandId};

#[derive(Debug, Default)]
pub struct TwoPassWeaver {
    started_with: usize,
    cycles: u64,
    idle_cycles: u64,
}

impl TwoPassWeaver {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` if some strand is still empty.
    pub fn greatest_common_point<R: Record>(strands: &[Strand<R>]) -> Option<TotalFrontier<R>> {
        let mut common_point = TotalFrontier::Done;
        for strand in strands {
            let frontier = strand.frontier()?;
            if frontier < common_point {
                common_point = frontier;
            }
        }
        Some(common_point)
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    pub fn idle_cycles(&self) -> u64 {
        self.idle_cycles
    }
}

impl<R: Record> Weaver<R> for TwoPassWeaver {
    fn name(&self) -> &'static str {
        "two-pass"
    }

    fn begin(&mut self, strands: &[Strand<R>]) {
        self.started_with = strands.len();
        self.cycles = 0;
        self.idle_cycles = 0;
    }

    fn weave(&mut self, strands: &[Strand<R>], limit: Option<&R>, rope: &mut Vec<R>) -> Progress {
        self.cycles += 1;
        if strands.is_empty() {
            // every strand of the run ended and was forgotten
            if self.started_with > 0 {
                return Progress::Exhausted;
            }
            self.idle_cycles += 1;
            return Progress::Idle;
        }
        if strands.iter().all(Strand::is_exhausted) {
            return Progress::Exhausted;
        }
        let Some(common_point) = Self::greatest_common_point(strands) else {
            self.idle_cycles += 1;
            return Progress::Idle;
        };
        let bound = common_point.limited_by(limit);

        let mut gathered = Vec::new();
        for strand in strands {
            strand.pull_up_to(bound.as_bound(), &mut gathered);
        }
        if gathered.is_empty() {
            self.idle_cycles += 1;
            return Progress::Idle;
        }
        gathered.sort();
        trace!(
            "two-pass cycle {} gathered {} records up to {bound:?}",
            self.cycles,
            gathered.len()
        );

        let count = gathered.len();
        rope.append(&mut gathered);
        Progress::Woven(count)
    }

    fn retains_beyond(&self, strands: &[Strand<R>], cutoff: &R) -> bool {
        strands
            .iter()
            .all(|strand| strand_retains_beyond(strand, cutoff))
    }

    fn end(&mut self) {}

    fn stalled_strand(&self, strands: &[Strand<R>]) -> Option<StrandId> {
        strands
            .iter()
            .find(|strand| strand.frontier().is_none())
            .map(Strand::id)
    }
}
