//! Circuit-breaker decorator for a [`SessionChannel`].

use std::sync::Arc;

use futures_util::future::BoxFuture;

use super::{SessionChannel, SessionSpec};
use crate::resilience::breaker::CircuitBreaker;
use crate::Result;

/// Routes every call of the wrapped channel through one shared breaker.
///
/// Build one per channel name from the
/// [`BreakerRegistry`](crate::resilience::BreakerRegistry) so the scheduler,
/// the health monitor and the provisioner all see the same circuit.
#[derive(Clone)]
pub struct GuardedChannel {
    inner: Arc<dyn SessionChannel>,
    breaker: Arc<CircuitBreaker>,
}

impl GuardedChannel {
    /// Wrap `inner` with `breaker`.
    #[must_use]
    pub fn new(inner: Arc<dyn SessionChannel>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    /// The breaker guarding this channel.
    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }
}

impl SessionChannel for GuardedChannel {
    fn send_prompt<'a>(&'a self, session_id: &'a str, prompt: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(
            self.breaker
                .execute(move || self.inner.send_prompt(session_id, prompt)),
        )
    }

    fn check_session_exists<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<bool>> {
        Box::pin(
            self.breaker
                .execute(move || self.inner.check_session_exists(session_id)),
        )
    }

    fn check_channel_health(&self) -> BoxFuture<'_, Result<bool>> {
        Box::pin(self.breaker.execute(move || self.inner.check_channel_health()))
    }

    fn create_session<'a>(&'a self, spec: &'a SessionSpec) -> BoxFuture<'a, Result<String>> {
        Box::pin(self.breaker.execute(move || self.inner.create_session(spec)))
    }
}
