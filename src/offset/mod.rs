//! Offset model
//!
//! An [`Offset`] records how far a source has been read. The
//! [`TimestampIncrementingCriteria`] for a querier turns an offset into a
//! query predicate and advances it from extracted rows. Offsets only move
//! forward: `advance` never returns a value ordered below its input.

mod criteria;
mod types;


pub use criteria::{OffsetPredicate, QueryBounds, TimestampIncrementingCriteria};
pub use types::{Offset, NO_INCREMENTING_OFFSET};
