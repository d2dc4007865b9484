// Copyright © 2024 Pathway

use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::engine::error::{Error, Result};
use crate::env::parse_env_var;

const MAX_THREADS: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SorterConfig {
    /// Upper bound on the number of worker threads.
    pub parallelism: usize,

    /// Records a worker outputs before it wakes up the merge.
    pub chunk_size: usize,

    /// Capacity of every input queue; a producer pushing into a full queue blocks.
    pub input_capacity: usize,

    /// Capacity of every worker's output queue.
    pub output_capacity: usize,

    /// How long the merge waits for a worker's signal before looking anyway.
    pub poll_interval: Duration,

    /// How often chunk sizes are adjusted.
    pub tuning_interval: Duration,

    /// Checks per tuning interval, all finding data, after which a worker is
    /// considered to be running behind.
    pub busy_checks: u64,
}

impl Default for SorterConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            chunk_size: 64,
            input_capacity: 1024,
            output_capacity: 1024,
            poll_interval: Duration::from_millis(10),
            tuning_interval: Duration::from_secs(1),
            busy_checks: 50,
        }
    }
}

impl SorterConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let mut parallelism: usize = parse_env_var("SORTER_THREADS")?.unwrap_or(defaults.parallelism);
        if parallelism > MAX_THREADS {
            warn!("{parallelism} is greater than the maximum allowed number of sorter threads ({MAX_THREADS}), reducing");
            parallelism = MAX_THREADS;
        }
        let config = Self {
            parallelism,
            chunk_size: parse_env_var("SORTER_CHUNK_SIZE")?.unwrap_or(defaults.chunk_size),
            input_capacity: parse_env_var("SORTER_INPUT_CAPACITY")?
                .unwrap_or(defaults.input_capacity),
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(Error::NeedsThreads);
        }
        if self.chunk_size == 0 {
            return Err(Error::NeedsChunkSize);
        }
        if self.input_capacity == 0 || self.output_capacity == 0 {
            return Err(Error::NeedsCapacity);
        }
        Ok(())
    }

    #[must_use]
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    #[must_use]
    pub fn with_intervals(mut self, poll_interval: Duration, tuning_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.tuning_interval = tuning_interval;
        self
    }

    #[must_use]
    pub fn with_capacities(mut self, input_capacity: usize, output_capacity: usize) -> Self {
        self.input_capacity = input_capacity;
        self.output_capacity = output_capacity;
        self
    }
}
