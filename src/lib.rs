pub mod codec;
pub mod error;
pub mod input;
pub mod metrics;
pub mod notify;
pub mod persistence;
pub mod scheduler;
pub mod tracker;
pub mod types;

pub use error::{Error, Result};
