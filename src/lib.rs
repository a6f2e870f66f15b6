//! Library entry for the ground station link, used by the binary and tests.

pub mod config;
pub mod error;
pub mod link;
pub mod metrics;
pub mod radio;
pub mod telemetry;

pub use error::{Error, ErrorKind, Result};
