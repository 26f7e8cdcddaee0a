//! Invalidation routing: which cache keys an event makes stale.
//!
//! The router decouples "what changed" from "what must be recomputed".
//! Push messages, local mutations and sibling-view signals all go through
//! the same table, so every source invalidates the same key set.

mod router;
mod target;

pub use router::{InvalidationRouter, KeyFamily};
pub use target::InvalidationTarget;
