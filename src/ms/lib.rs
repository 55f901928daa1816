//! Signed RPC client for the metadata service: direct RPCs, a batching
//! uploader for deferred metadata updates, and the periodically reloaded
//! volume/certificate view
#[macro_use]
extern crate tracing;

pub mod client;
pub mod msg;
pub mod updates;
pub mod view;

pub use client::*;
pub use msg::*;
pub use updates::*;
pub use view::*;

#[cfg(test)]
mod test;
