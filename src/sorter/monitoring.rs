// Copyright © 2024 Pathway

use std::time::{Duration, Instant};

use log::{info, warn};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub inputs: usize,
    pub queued: usize,
    pub chunk_size: usize,
    pub finished: bool,
    pub failed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SorterStats {
    pub pushed: u64,
    pub delivered: u64,
    pub out_of_order: u64,
    pub workers: Vec<WorkerStats>,
    pub finished: bool,
}

impl SorterStats {
    pub fn queued(&self) -> usize {
        self.workers.iter().map(|worker| worker.queued).sum()
    }
}

const MIN_REPORTS_INTERVAL: Duration = Duration::from_secs(5);

pub(crate) struct SorterLogger {
    previously_reported: u64,
    reported: u64,
    passes: u64,
    last_reported_timestamp: Option<Instant>,
}

impl SorterLogger {
    pub fn new() -> Self {
        Self {
            previously_reported: 0,
            reported: 0,
            passes: 0,
            last_reported_timestamp: None,
        }
    }

    fn report_stats(&mut self, current_timestamp: Instant) {
        info!(
            "sorter: {} records ({} merge pass(es)) have been delivered",
            self.reported, self.passes
        );
        self.last_reported_timestamp = Some(current_timestamp);
        self.previously_reported = self.reported;
        self.reported = 0;
        self.passes = 0;
    }

    pub fn on_pass(&mut self, current_timestamp: Instant, delivered: u64) {
        self.reported += delivered;
        self.passes += 1;

        let Some(last_reported_timestamp) = self.last_reported_timestamp else {
            if delivered > 0 {
                self.report_stats(current_timestamp);
            }
            return;
        };
        match current_timestamp.checked_duration_since(last_reported_timestamp) {
            Some(elapsed) => {
                if elapsed >= MIN_REPORTS_INTERVAL
                    && (self.previously_reported > 0 || self.reported > 0)
                {
                    self.report_stats(current_timestamp);
                }
            }
            None => warn!("sorter: time went backwards, unable to log merge stats"),
        }
    }

    pub fn on_finished(&mut self, total: u64) {
        if self.reported > 0 {
            self.report_stats(Instant::now());
        }
        info!("sorter: stream ended after {total} records");
    }
}
