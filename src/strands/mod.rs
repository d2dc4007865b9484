// Copyright © 2024 Pathway

//! A strand is the ordered buffer of one producer.
//!
//! The producer writes through a [`StrandTail`], the weaver reads through a
//! [`Strand`]. Both are handles over the same state, so the only lock a
//! producer ever takes is the one of its own strand.
//!
//! The data of a strand is split into sections. The end-of-data marker
//! terminates the section currently being written; the weaver treats a
//! terminated front section as "nothing more from this strand in this run".
//! Since a strand may resume after the splicer restarts, the marker is
//! reversible: once the splicer stops, [`Strand::release_sentinel`] opens a
//! new section, and [`Strand::rewind`] folds everything into a single section
//! when the next run begins.

pub mod tail;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::engine::error::{Error, Result};
use crate::engine::{Record, TotalFrontier};

pub use self::tail::{StrandRegistry, StrandTail};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StrandId(pub usize);

impl fmt::Display for StrandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "strand#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrandStats {
    pub pushed: u64,
    pub woven: u64,
    pub buffered: usize,
    pub closed: bool,
    pub ended: bool,
}

#[derive(Debug)]
struct Section<R> {
    records: VecDeque<R>,
    terminated: bool,
}

impl<R> Section<R> {
    fn open() -> Self {
        Self {
            records: VecDeque::new(),
            terminated: false,
        }
    }
}

#[derive(Debug)]
struct StrandState<R> {
    // Never empty. The front section is the one being woven, the back one
    // is the one being written.
    sections: VecDeque<Section<R>>,
    last_pushed: Option<R>,
    closed: bool,
    pushed: u64,
    woven: u64,
}

impl<R: Record> StrandState<R> {
    fn new() -> Self {
        Self {
            sections: VecDeque::from([Section::open()]),
            last_pushed: None,
            closed: false,
            pushed: 0,
            woven: 0,
        }
    }

    fn front(&self) -> &Section<R> {
        self.sections.front().expect("a strand always has a section")
    }

    fn front_mut(&mut self) -> &mut Section<R> {
        self.sections
            .front_mut()
            .expect("a strand always has a section")
    }

    fn back(&self) -> &Section<R> {
        self.sections.back().expect("a strand always has a section")
    }

    fn back_mut(&mut self) -> &mut Section<R> {
        self.sections
            .back_mut()
            .expect("a strand always has a section")
    }

    fn size(&self) -> usize {
        self.sections.iter().map(|section| section.records.len()).sum()
    }

    fn head(&self) -> Option<&R> {
        self.sections
            .iter()
            .find_map(|section| section.records.front())
    }

    fn is_ended(&self) -> bool {
        self.closed || self.front().terminated
    }

    fn check_accepts(&self, record: &R) -> Result<()> {
        if self.closed {
            return Err(Error::StrandClosed);
        }
        if record.is_last() {
            return Ok(());
        }
        if self.back().terminated {
            return Err(Error::AfterSentinel);
        }
        match &self.last_pushed {
            Some(previous) if record < previous => Err(Error::out_of_order(previous, record)),
            _ => Ok(()),
        }
    }

    fn append(&mut self, record: R) {
        if record.is_last() {
            // Repeated markers are no-ops.
            self.back_mut().terminated = true;
            return;
        }
        self.last_pushed = Some(record.clone());
        self.back_mut().records.push_back(record);
        self.pushed += 1;
    }
}

/// Checks that a batch can be appended as a whole: non-decreasing, and with
/// nothing following an end-of-data marker.
fn validate_batch<R: Record>(records: &[R]) -> Result<()> {
    let violation = records
        .iter()
        .tuple_windows()
        .find_position(|(previous, next)| previous.is_last() || next < previous);
    match violation {
        Some((_, (previous, _))) if previous.is_last() => Err(Error::AfterSentinel),
        Some((position, _)) => Err(Error::UnorderedBatch {
            position: position + 1,
        }),
        None => Ok(()),
    }
}

/// The weaver's handle onto a strand.
pub struct Strand<R> {
    id: StrandId,
    state: Arc<Mutex<StrandState<R>>>,
}

impl<R> Clone for Strand<R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            state: Arc::clone(&self.state),
        }
    }
}

impl<R: Record> Strand<R> {
    pub fn new(id: StrandId) -> Self {
        Self {
            id,
            state: Arc::new(Mutex::new(StrandState::new())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StrandState<R>> {
        self.state.lock().unwrap()
    }

    pub fn id(&self) -> StrandId {
        self.id
    }

    /// The earliest record that hasn't been woven yet.
    pub fn head(&self) -> Option<R> {
        self.lock().head().cloned()
    }

    /// Number of records pushed but not yet woven.
    pub fn size(&self) -> usize {
        self.lock().size()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Nothing more will come from this strand in the current run.
    pub fn is_ended(&self) -> bool {
        self.lock().is_ended()
    }

    /// Ended and with nothing left to weave in the current run.
    pub fn is_exhausted(&self) -> bool {
        let state = self.lock();
        state.is_ended() && state.front().records.is_empty()
    }

    /// Closed and fully woven, so it can be forgotten.
    pub fn is_disposable(&self) -> bool {
        let state = self.lock();
        state.closed && state.size() == 0
    }

    /// The most recent record visible to the current run, `Done` if the
    /// strand can't constrain the weaving anymore, `None` if there's nothing
    /// to look at yet.
    pub fn frontier(&self) -> Option<TotalFrontier<R>> {
        let state = self.lock();
        if state.is_ended() {
            return Some(TotalFrontier::Done);
        }
        state
            .front()
            .records
            .back()
            .map(|record| TotalFrontier::At(record.clone()))
    }

    /// Moves every record not greater than `bound` into `out`. `None` means
    /// no bound.
    pub fn pull_up_to(&self, bound: Option<&R>, out: &mut Vec<R>) -> usize {
        let mut state = self.lock();
        let front = &mut state.front_mut().records;
        let count = match bound {
            Some(bound) => front.partition_point(|record| record <= bound),
            None => front.len(),
        };
        out.extend(front.drain(..count));
        state.woven += count as u64;
        count
    }

    pub fn pull_one(&self) -> Option<R> {
        let mut state = self.lock();
        let record = state.front_mut().records.pop_front();
        if record.is_some() {
            state.woven += 1;
        }
        record
    }

    /// Drops every record of the current run lower than `floor`.
    pub fn discard_below(&self, floor: &R) -> usize {
        let mut state = self.lock();
        let front = &mut state.front_mut().records;
        let count = front.partition_point(|record| record < floor);
        front.drain(..count);
        count
    }

    /// Puts back records that were pulled but never woven. They have to
    /// precede everything still buffered.
    pub fn restore_front(&self, records: Vec<R>) {
        if records.is_empty() {
            return;
        }
        let mut state = self.lock();
        state.woven = state.woven.saturating_sub(records.len() as u64);
        let front = &mut state.front_mut().records;
        for record in records.into_iter().rev() {
            front.push_front(record);
        }
    }

    /// Opens a new section after an end-of-data marker, so the producer can
    /// continue once the splicer has stopped.
    pub fn release_sentinel(&self) {
        let mut state = self.lock();
        if state.back().terminated && !state.closed {
            state.sections.push_back(Section::open());
        }
    }

    /// Folds all sections into one before a new run. The marker of the last
    /// section, if any, still applies.
    pub fn rewind(&self) {
        let mut state = self.lock();
        if state.sections.len() == 1 {
            return;
        }
        let terminated = state.back().terminated;
        let records = state
            .sections
            .drain(..)
            .flat_map(|section| section.records)
            .collect();
        state.sections.push_back(Section {
            records,
            terminated,
        });
    }

    pub fn stats(&self) -> StrandStats {
        let state = self.lock();
        StrandStats {
            pushed: state.pushed,
            woven: state.woven,
            buffered: state.size(),
            closed: state.closed,
            ended: state.is_ended(),
        }
    }

    fn push(&self, record: R) -> Result<()> {
        let mut state = self.lock();
        state.check_accepts(&record)?;
        state.append(record);
        Ok(())
    }

    fn push_all(&self, records: Vec<R>) -> Result<()> {
        validate_batch(&records)?;
        let mut state = self.lock();
        if state.closed {
            return Err(Error::StrandClosed);
        }
        if let Some(first) = records.first() {
            state.check_accepts(first)?;
        }
        for record in records {
            state.append(record);
        }
        Ok(())
    }

    pub(crate) fn close(&self) -> bool {
        let mut state = self.lock();
        let was_open = !state.closed;
        state.closed = true;
        was_open
    }
}

impl<R: Record> fmt::Debug for Strand<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Strand")
            .field("id", &self.id)
            .field("buffered", &state.size())
            .field("head", &state.head())
            .field("closed", &state.closed)
            .field("ended", &state.is_ended())
            .finish()
    }
}
