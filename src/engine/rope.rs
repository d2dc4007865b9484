// Copyright © 2024 Pathway

use std::collections::VecDeque;

use super::Record;

/// The ordered output of a splicer.
///
/// Records are only ever appended at the back or trimmed from the front, so
/// the contents stay sorted as long as the appended batches are.
#[derive(Debug)]
pub struct Rope<R> {
    records: VecDeque<R>,
    truncated_total: usize,
}

impl<R: Record> Rope<R> {
    pub fn new() -> Self {
        Self {
            records: VecDeque::new(),
            truncated_total: 0,
        }
    }

    pub fn extend(&mut self, records: impl IntoIterator<Item = R>) {
        self.records.extend(records);
    }

    /// Removes every record lower than `cutoff` and returns them in order.
    /// The end-of-data marker removes everything.
    pub fn truncate(&mut self, cutoff: &R) -> Vec<R> {
        let split = if cutoff.is_last() {
            self.records.len()
        } else {
            self.records.partition_point(|record| record < cutoff)
        };
        if split == 0 {
            return Vec::new();
        }
        let removed: Vec<R> = self.records.drain(..split).collect();
        self.truncated_total += removed.len();
        removed
    }

    pub fn as_slice(&mut self) -> &[R] {
        self.records.make_contiguous()
    }

    pub fn to_vec(&self) -> Vec<R> {
        self.records.iter().cloned().collect()
    }

    pub fn last(&self) -> Option<&R> {
        self.records.back()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn total_truncated(&self) -> usize {
        self.truncated_total
    }
}

impl<R: Record> Default for Rope<R> {
    fn default() -> Self {
        Self::new()
    }
}
