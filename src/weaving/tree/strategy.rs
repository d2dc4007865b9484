// Copyright © 2024 Pathway

use std::fmt;

/// Idleness bookkeeping of a single tree node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Activity {
    pub idle_ticks: u32,
    pub inactive: bool,
    fresh: bool,
}

impl Activity {
    pub fn record_activity(&mut self) -> bool {
        let was_inactive = self.inactive;
        self.fresh = true;
        self.idle_ticks = 0;
        self.inactive = false;
        was_inactive
    }

    fn take_fresh(&mut self) -> bool {
        std::mem::take(&mut self.fresh)
    }
}

/// Decides how tree nodes react to the passage of time.
pub trait NodeStrategy: Send + fmt::Debug {
    fn name(&self) -> &'static str;

    fn build_node(&self) -> Activity {
        Activity::default()
    }

    /// Called once per polling interval for every leaf.
    fn on_tick(&self, activity: &mut Activity, holds_data: bool);

    fn idle_tolerance(&self) -> Option<u32> {
        None
    }
}

/// Never gives up on a strand: a silent strand stalls its whole subtree.
#[derive(Debug, Clone, Copy, Default)]
pub struct Strict;

impl NodeStrategy for Strict {
    fn name(&self) -> &'static str {
        "tree"
    }

    fn on_tick(&self, activity: &mut Activity, _holds_data: bool) {
        activity.take_fresh();
    }
}

/// Marks a leaf inactive after `max_idle_ticks` consecutive polling intervals
/// without data. An inactive leaf loses every comparison against its peer,
/// so the rest of the tree keeps draining around it.
#[derive(Debug, Clone, Copy)]
pub struct IdleTimeout {
    max_idle_ticks: u32,
}

impl IdleTimeout {
    pub fn new(max_idle_ticks: u32) -> Self {
        Self {
            max_idle_ticks: max_idle_ticks.max(1),
        }
    }
}

impl NodeStrategy for IdleTimeout {
    fn name(&self) -> &'static str {
        "tree-with-timeout"
    }

    fn on_tick(&self, activity: &mut Activity, holds_data: bool) {
        if activity.take_fresh() || holds_data {
            activity.idle_ticks = 0;
            activity.inactive = false;
            return;
        }
        activity.idle_ticks = activity.idle_ticks.saturating_add(1);
        if activity.idle_ticks >= self.max_idle_ticks {
            activity.inactive = true;
        }
    }

    fn idle_tolerance(&self) -> Option<u32> {
        Some(self.max_idle_ticks)
    }
}
