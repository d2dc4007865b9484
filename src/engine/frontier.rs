use serde::{Deserialize, Serialize};

/// Upper bound on what a strand is known to contain.
///
/// `Done` sorts after every `At`, so taking a minimum over strands ignores the
/// ones that can't constrain it anymore.
#[allow(clippy::module_name_repetitions)]
#[derive(Debug, Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TotalFrontier<T> {
    At(T),
    Done,
}

impl<T: Ord> TotalFrontier<T> {
    pub fn as_bound(&self) -> Option<&T> {
        match self {
            Self::At(t) => Some(t),
            Self::Done => None,
        }
    }

    /// Tightens the frontier with an optional extra bound.
    pub fn limited_by(self, limit: Option<&T>) -> Self
    where
        T: Clone,
    {
        match limit {
            Some(limit) => std::cmp::min(self, Self::At(limit.clone())),
            None => self,
        }
    }
}
