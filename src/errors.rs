//! Error types shared across the application.

use std::fmt::{Display, Formatter};

use crate::resilience::breaker::CircuitState;

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Transient failure of the remote session channel.
    Channel(String),
    /// Call rejected without being attempted because the breaker is open.
    CircuitOpen {
        /// Name of the breaker that rejected the call.
        name: String,
        /// Breaker state at the moment of rejection.
        state: CircuitState,
    },
    /// Requested entity does not exist.
    NotFound(String),
    /// Session creation failure.
    Provision(String),
    /// File-system or process I/O failure.
    Io(String),
}

impl AppError {
    /// Whether this error is a fail-fast breaker rejection rather than a
    /// failure of the underlying call.
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Channel(msg) => write!(f, "channel: {msg}"),
            Self::CircuitOpen { name, state } => {
                write!(f, "circuit open: breaker '{name}' is {state}")
            }
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Provision(msg) => write!(f, "provision: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<regex::Error> for AppError {
    fn from(err: regex::Error) -> Self {
        Self::Config(format!("invalid pattern: {err}"))
    }
}
