//! Registry-specific document formats.
//!
//! The cache layer stores upstream documents byte for byte; these modules
//! parse them, rewrite links so clients come back through the proxy, and
//! synthesize equivalents for locally published collections.

pub mod galaxy;
pub mod pypi;
