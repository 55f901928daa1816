//! Concurrent HTTP downloader: a pool of in-flight transfers with
//! per-request cancellation, bounded response buffers and grouped waits
#[macro_use]
extern crate tracing;

pub mod batch;
pub mod context;
pub mod manager;
pub mod metrics;
pub mod set;

pub use batch::*;
pub use context::*;
pub use manager::*;
pub use set::*;

#[cfg(test)]
mod test;
