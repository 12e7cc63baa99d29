//! Data sources feeding the change cycle.

pub mod rpc;
pub mod snapshot;
