// Copyright © 2024 Pathway

/// Consecutive checks finding nothing after which a worker's chunks are
/// considered too big.
const IDLE_CHECKS_THRESHOLD: u64 = 20;

/// Chunks never grow beyond this multiple of the configured size.
const MAX_SCALE: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advice {
    ScaleUp,
    ScaleDown,
    DoNothing,
}

/// What the merge saw when looking at one worker's output during a tuning
/// interval.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckCounter {
    pub checks: u64,
    pub hits: u64,
    pub consecutive_misses: u64,
    pub longest_miss_run: u64,
}

impl CheckCounter {
    pub fn record(&mut self, hit: bool) {
        self.checks += 1;
        if hit {
            self.hits += 1;
            self.consecutive_misses = 0;
        } else {
            self.consecutive_misses += 1;
            self.longest_miss_run = self.longest_miss_run.max(self.consecutive_misses);
        }
    }

    /// Returns the current window and starts a new one.
    pub fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

/// Chooses chunk sizes from how often the merge finds work.
///
/// When the merge keeps finding empty outputs, the workers hold on to data
/// too long before signalling, so chunks shrink. When every check finds data
/// and there are many of them, the merge runs more often than it needs to,
/// so chunks grow.
#[derive(Debug, Clone, Copy)]
pub struct ChunkTuner {
    original: usize,
    busy_checks: u64,
}

impl ChunkTuner {
    pub fn new(original: usize, busy_checks: u64) -> Self {
        Self {
            original: original.max(1),
            busy_checks: busy_checks.max(1),
        }
    }

    pub fn advise(&self, window: &CheckCounter) -> Advice {
        if window.longest_miss_run > IDLE_CHECKS_THRESHOLD {
            return Advice::ScaleDown;
        }
        if window.checks >= self.busy_checks && window.hits == window.checks {
            Advice::ScaleUp
        } else {
            Advice::DoNothing
        }
    }

    pub fn adjust(&self, current: usize, advice: &Advice) -> usize {
        match advice {
            Advice::ScaleDown => (current / 2).max(1),
            Advice::ScaleUp => current.saturating_mul(2).min(self.max_chunk_size()),
            Advice::DoNothing => current,
        }
    }

    pub fn max_chunk_size(&self) -> usize {
        self.original.saturating_mul(MAX_SCALE)
    }
}
