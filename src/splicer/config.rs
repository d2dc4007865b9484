// Copyright © 2024 Pathway

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::error::Result;
use crate::env::{parse_env_count, parse_env_millis};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_STALL_WARNING: Duration = Duration::from_secs(10);
const DEFAULT_NODE_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SplicerConfig {
    /// How long the weaving thread sleeps when nobody pushes. Also the unit
    /// in which idle strands are counted.
    pub poll_interval: Duration,

    /// How long weaving may make no progress before the blocking strand is
    /// reported.
    pub stall_warning: Duration,

    /// Buffer size of a single merge tree node.
    pub node_capacity: usize,
}

impl Default for SplicerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            stall_warning: DEFAULT_STALL_WARNING,
            node_capacity: DEFAULT_NODE_CAPACITY,
        }
    }
}

impl SplicerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            poll_interval: parse_env_millis("SPLICER_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL)?,
            stall_warning: parse_env_millis("SPLICER_STALL_WARNING_MS", DEFAULT_STALL_WARNING)?,
            node_capacity: parse_env_count("SPLICER_NODE_CAPACITY", DEFAULT_NODE_CAPACITY)?,
        })
    }

    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    #[must_use]
    pub fn with_stall_warning(mut self, stall_warning: Duration) -> Self {
        self.stall_warning = stall_warning;
        self
    }

    #[must_use]
    pub fn with_node_capacity(mut self, node_capacity: usize) -> Self {
        self.node_capacity = node_capacity.max(1);
        self
    }
}
