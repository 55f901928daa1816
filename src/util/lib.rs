//! Shared plumbing for the Syndicate gateway crates
#[macro_use]
extern crate tracing;

pub mod background;
pub mod config;
pub mod crypto;
pub mod data;
pub mod error;
pub mod future;
pub mod time;
