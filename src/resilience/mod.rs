//! Failure isolation for the remote session channel.

pub mod breaker;
pub mod registry;

pub use breaker::{
    BreakerConfig, BreakerEvent, BreakerSnapshot, CircuitBreaker, CircuitState, ListenerId,
};
pub use registry::BreakerRegistry;
