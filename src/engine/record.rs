// Copyright © 2024 Pathway

use std::fmt::Debug;

/// A totally ordered unit of data flowing through strands.
///
/// `last()` is the end-of-data marker. It has to compare strictly greater than
/// every other value, since the weavers rely on it to never constrain the
/// greatest common point.
pub trait Record: Ord + Clone + Debug + Send + Sync + 'static {
    fn last() -> Self;

    fn is_last(&self) -> bool {
        *self == Self::last()
    }
}

macro_rules! impl_record_for_integer {
    ($($t:ty),*) => {
        $(
            impl Record for $t {
                fn last() -> Self {
                    <$t>::MAX
                }
            }
        )*
    };
}

impl_record_for_integer!(i32, i64, u32, u64);
