//! User gateway core: the in-core file model, the write synchronization
//! pipeline that turns dirty blocks into replicated MS-visible state, the
//! replica client, the coordinator handoff protocol and the vacuumer
#[macro_use]
extern crate tracing;

pub mod coordinator;
pub mod core;
pub mod driver;
pub mod fent;
pub mod gc;
pub mod manifest;
pub mod ops;
pub mod replication;
pub mod sync;
pub mod url;
pub mod vacuumer;

pub use crate::core::*;
pub use fent::*;

#[cfg(test)]
mod test;
