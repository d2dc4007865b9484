// Copyright © 2024 Pathway

use std::sync::{Condvar, Mutex};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    Notified,
    TimedOut,
}

/// Coalescing "new data may be available" flag shared between producers
/// and the weaving thread. Any number of notifications before a wait count
/// as one.
#[derive(Debug, Default)]
pub struct WeaveSignal {
    pending: Mutex<bool>,
    condvar: Condvar,
}

impl WeaveSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self) {
        let mut pending = self.pending.lock().unwrap();
        *pending = true;
        self.condvar.notify_one();
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Wakeup {
        let pending = self.pending.lock().unwrap();
        let (mut pending, _) = self
            .condvar
            .wait_timeout_while(pending, timeout, |pending| !*pending)
            .unwrap();
        if *pending {
            *pending = false;
            Wakeup::Notified
        } else {
            Wakeup::TimedOut
        }
    }
}
