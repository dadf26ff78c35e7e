//! Cache-or-fetch engine.
//!
//! Upstream artifacts are mirrored onto local disk under a per-registry
//! directory.  [`store`] persists them atomically, [`freshness`] decides
//! whether a cached copy may be served, [`local`] indexes archives published
//! from a plain directory and [`manager`] ties the pieces together.

pub mod digest;
pub mod error;
pub mod freshness;
pub mod local;
pub mod manager;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use error::CacheError;
pub use freshness::{Freshness, Verdict};
pub use manager::{CacheKey, CacheManager, Resolved, is_valid_segment};
pub use store::Upstream;
