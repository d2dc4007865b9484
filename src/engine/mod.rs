// Copyright © 2024 Pathway

pub mod error;
pub mod events;
pub mod frontier;
pub mod record;
pub mod rope;
pub mod signal;
pub mod state;

pub use self::error::{DynError, DynResult, Error, Result};
pub use self::events::SplicerEvent;
pub use self::frontier::TotalFrontier;
pub use self::record::Record;
pub use self::rope::Rope;
pub use self::state::SplicerState;
