// Copyright © 2024 Pathway

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use log::error;

use super::error::Error;
use super::SplicerState;

/// A notification delivered to every registered listener.
///
/// The borrowed data of `Truncated` is only valid for the duration of the
/// listener call.
#[derive(Debug)]
pub enum SplicerEvent<'a, R> {
    StateChanged {
        old: SplicerState,
        new: SplicerState,
    },
    Truncated {
        cutoff: &'a R,
        removed: &'a [R],
    },
}

pub type Listener<R> = Arc<dyn Fn(&SplicerEvent<'_, R>) + Send + Sync>;

pub struct Listeners<R> {
    listeners: Mutex<Vec<Listener<R>>>,
}

impl<R> Listeners<R> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: Listener<R>) {
        self.listeners.lock().unwrap().push(listener);
    }

    pub fn fire(&self, event: &SplicerEvent<'_, R>) {
        // Listeners may register other listeners, so the list isn't locked while they run.
        let listeners = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(event))) {
                error!(
                    "splicer listener failed: {}",
                    Error::from_panic_payload(payload)
                );
            }
        }
    }

    pub fn fire_state_changes(&self, changes: &[(SplicerState, SplicerState)]) {
        for (old, new) in changes {
            self.fire(&SplicerEvent::StateChanged {
                old: *old,
                new: *new,
            });
        }
    }
}

impl<R> Default for Listeners<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> fmt::Debug for Listeners<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.listeners.lock().unwrap().len())
            .finish()
    }
}
