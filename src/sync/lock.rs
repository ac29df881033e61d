//! FIFO async mutual-exclusion lock.
//!
//! [`FifoLock::acquire`] resolves to a [`LockGuard`]; dropping the guard
//! (or calling [`LockGuard::release`]) hands the lock to the oldest waiter
//! directly, so the lock is never observed free while someone is queued.
//! There is no timeout: a guard that is never dropped blocks every later
//! waiter.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

#[derive(Debug, Default)]
struct LockState {
    held: bool,
    waiters: VecDeque<oneshot::Sender<()>>,
}

type SharedState = Arc<Mutex<LockState>>;

fn lock_state(state: &SharedState) -> MutexGuard<'_, LockState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Pass ownership to the next live waiter, or free the lock.
fn release(state: &SharedState) {
    let mut st = lock_state(state);
    while let Some(waiter) = st.waiters.pop_front() {
        if waiter.send(()).is_ok() {
            return;
        }
    }
    st.held = false;
}

/// Async lock granting access strictly in arrival order.
#[derive(Debug, Clone, Default)]
pub struct FifoLock {
    state: SharedState,
}

impl FifoLock {
    /// Create an unlocked lock.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access.
    ///
    /// Waiters are served in the order `acquire` was first polled. If the
    /// returned future is dropped before it completes, the waiter gives up
    /// its place; a grant that raced with the drop is passed on.
    pub async fn acquire(&self) -> LockGuard {
        let rx = {
            let mut st = lock_state(&self.state);
            if st.held {
                let (tx, rx) = oneshot::channel();
                st.waiters.push_back(tx);
                Some(rx)
            } else {
                st.held = true;
                None
            }
        };

        if let Some(rx) = rx {
            let mut pending = PendingGrant {
                rx: Some(rx),
                state: Arc::clone(&self.state),
            };
            pending.wait().await;
        }

        LockGuard {
            state: Some(Arc::clone(&self.state)),
        }
    }

    /// Run `fut` while holding the lock, releasing it on every exit path.
    pub async fn run_exclusive<F, T>(&self, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.acquire().await;
        fut.await
    }

    /// Whether the lock is currently held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        lock_state(&self.state).held
    }

    /// Number of queued waiters.
    #[must_use]
    pub fn waiting(&self) -> usize {
        lock_state(&self.state).waiters.len()
    }
}

struct PendingGrant {
    rx: Option<oneshot::Receiver<()>>,
    state: SharedState,
}

impl PendingGrant {
    async fn wait(&mut self) {
        if let Some(rx) = self.rx.as_mut() {
            // Senders are only dropped after a successful send.
            let _ = rx.await;
        }
        self.rx = None;
    }
}

impl Drop for PendingGrant {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if rx.try_recv().is_ok() {
                release(&self.state);
            }
        }
    }
}

/// Exclusive access token returned by [`FifoLock::acquire`].
#[derive(Debug)]
pub struct LockGuard {
    state: Option<SharedState>,
}

impl LockGuard {
    /// Release the lock explicitly.
    pub fn release(mut self) {
        if let Some(state) = self.state.take() {
            release(&state);
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(state) = self.state.take() {
            release(&state);
        }
    }
}
