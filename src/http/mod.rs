//! HTTP layer for the package registry proxy.
//!
//! Every registry route funnels through the cache-or-fetch engine in
//! [`crate::cache`] and reports the outcome in `X-Cache-Status`.

pub mod galaxy;
pub mod handler;
pub mod pypi;
pub mod serve;
pub mod static_files;

#[cfg(test)]
pub(crate) mod testing;
