// Copyright © 2024 Pathway

use serde::{Deserialize, Serialize};

use super::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SplicerState {
    Stopped,
    Starting,
    Started,
    Stopping,
    Failed,
    Disposed,
}

impl SplicerState {
    pub fn can_transition_to(self, next: Self) -> bool {
        match self {
            Self::Stopped => matches!(next, Self::Starting | Self::Disposed),
            Self::Starting => matches!(next, Self::Started | Self::Stopping | Self::Failed),
            Self::Started => matches!(next, Self::Stopping | Self::Failed),
            Self::Stopping => matches!(next, Self::Stopped | Self::Failed),
            Self::Failed => matches!(
                next,
                Self::Starting | Self::Stopping | Self::Disposed | Self::Failed
            ),
            Self::Disposed => false,
        }
    }

    pub fn transition(self, next: Self) -> Result<Self> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(Error::IllegalTransition {
                from: self,
                to: next,
            })
        }
    }

    /// States in which the weaving thread moves records into the rope.
    pub fn is_weaving(self) -> bool {
        matches!(self, Self::Started | Self::Stopping)
    }

    pub fn is_running(self) -> bool {
        matches!(self, Self::Starting | Self::Started | Self::Stopping)
    }
}
