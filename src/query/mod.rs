//! Query engine: the filter predicate, the scan/merge pipeline, and an
//! optional decoded-block cache.

pub mod cache;
pub mod executor;
pub mod filter;

pub use cache::*;
pub use executor::*;
pub use filter::*;
