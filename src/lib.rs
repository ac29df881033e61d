#![forbid(unsafe_code)]

pub mod backend;
pub mod channel;
pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod resilience;
pub mod sync;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
