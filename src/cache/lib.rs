//! On-disk block cache with asynchronous writeback and LRU eviction
#[macro_use]
extern crate tracing;

pub mod manager;
pub mod metrics;
pub mod worker;

pub use manager::*;

#[cfg(test)]
mod test;
