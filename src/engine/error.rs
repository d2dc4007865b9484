// Copyright © 2024 Pathway

use std::any::Any;
use std::error;
use std::result;

use super::SplicerState;
use crate::env::Error as EnvError;

#[allow(clippy::module_name_repetitions)]
pub type DynError = Box<dyn error::Error + Send + Sync>;
pub type DynResult<T> = result::Result<T, DynError>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("record {record} is lower than the previously pushed record {previous}")]
    OutOfOrder { previous: String, record: String },

    #[error("pushed records are not ordered at position {position}")]
    UnorderedBatch { position: usize },

    #[error("strand has received the end-of-data marker, no records are accepted until the splicer stops")]
    AfterSentinel,

    #[error("strand is closed")]
    StrandClosed,

    #[error("cutoff {cutoff} is behind the last woven record {woven}")]
    CutoffPassed { cutoff: String, woven: String },

    #[error("the end-of-data marker can't be used as a cutoff")]
    SentinelCutoff,

    #[error("illegal splicer state transition from {from:?} to {to:?}")]
    IllegalTransition {
        from: SplicerState,
        to: SplicerState,
    },

    #[error("strands can be added only while the splicer is stopped, current state is {0:?}")]
    RegistrationClosed(SplicerState),

    #[error("can't sort with no producers")]
    NeedsProducers,

    #[error("can't run with no threads")]
    NeedsThreads,

    #[error("chunk size must be positive")]
    NeedsChunkSize,

    #[error("queue capacity must be positive")]
    NeedsCapacity,

    #[error("the sorter has already been started")]
    AlreadyStarted,

    #[error("the receiving side has shut down")]
    ShutDown,

    #[error("worker panic: {0}")]
    WorkerPanic(String),

    #[error(transparent)]
    Env(#[from] EnvError),

    #[error(transparent)]
    Other(DynError),
}

impl Error {
    pub fn from_panic_payload(panic_payload: Box<dyn Any + Send + 'static>) -> Self {
        let message = match panic_payload.downcast::<&'static str>() {
            Ok(message) => message.to_string(),
            Err(panic_payload) => match panic_payload.downcast::<String>() {
                Ok(message) => *message,
                Err(panic_payload) => format!("{panic_payload:?}"),
            },
        };
        Self::WorkerPanic(message)
    }

    pub fn out_of_order(previous: &impl std::fmt::Debug, record: &impl std::fmt::Debug) -> Self {
        Self::OutOfOrder {
            previous: format!("{previous:?}"),
            record: format!("{record:?}"),
        }
    }

    pub fn cutoff_passed(cutoff: &impl std::fmt::Debug, woven: &impl std::fmt::Debug) -> Self {
        Self::CutoffPassed {
            cutoff: format!("{cutoff:?}"),
            woven: format!("{woven:?}"),
        }
    }
}

impl From<DynError> for Error {
    fn from(value: DynError) -> Self {
        match value.downcast::<Self>() {
            Ok(this) => *this,
            Err(other) => Self::Other(other),
        }
    }
}

pub type Result<T, E = Error> = result::Result<T, E>;
