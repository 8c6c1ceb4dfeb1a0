//! # Operation Tokens
//!
//! Cancellable handles returned by the manager, downloader and prefetcher.
//! `cancel()` is idempotent and may be called from anywhere, including after
//! the operation completed, in which case it does nothing.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

type CancelHook = Box<dyn FnOnce() + Send>;

enum TokenState {
    Active(Vec<CancelHook>),
    Cancelled,
    Completed,
}

struct TokenInner {
    signal: CancellationToken,
    state: Mutex<TokenState>,
}

/// A cancellable handle for an asynchronous operation.
#[derive(Clone)]
pub struct OperationToken {
    inner: Arc<TokenInner>,
}

impl OperationToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner {
                signal: CancellationToken::new(),
                state: Mutex::new(TokenState::Active(Vec::new())),
            }),
        }
    }

    /// Cancel the operation. Runs every registered hook exactly once.
    pub fn cancel(&self) {
        let hooks = {
            let mut state = self.inner.state.lock();
            match std::mem::replace(&mut *state, TokenState::Cancelled) {
                TokenState::Active(hooks) => hooks,
                other => {
                    *state = other;
                    return;
                }
            }
        };

        self.inner.signal.cancel();
        for hook in hooks {
            hook();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.inner.state.lock(), TokenState::Cancelled)
    }

    /// Whether the operation ran to completion before any cancel.
    pub fn is_completed(&self) -> bool {
        matches!(*self.inner.state.lock(), TokenState::Completed)
    }

    /// Resolves once the token is cancelled. Never resolves for completed operations.
    pub async fn cancelled(&self) {
        self.inner.signal.cancelled().await
    }

    /// Register a hook run on cancel. Runs immediately if already cancelled,
    /// and is dropped if the operation already completed.
    pub(crate) fn on_cancel(&self, hook: impl FnOnce() + Send + 'static) {
        let mut state = self.inner.state.lock();
        match &mut *state {
            TokenState::Active(hooks) => hooks.push(Box::new(hook)),
            TokenState::Cancelled => {
                drop(state);
                hook();
            }
            TokenState::Completed => {}
        }
    }

    /// Mark the operation finished. Later cancels become no-ops.
    pub(crate) fn complete(&self) {
        let mut state = self.inner.state.lock();
        if matches!(*state, TokenState::Active(_)) {
            *state = TokenState::Completed;
        }
    }
}

impl Default for OperationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for OperationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match *self.inner.state.lock() {
            TokenState::Active(_) => "active",
            TokenState::Cancelled => "cancelled",
            TokenState::Completed => "completed",
        };
        f.debug_struct("OperationToken")
            .field("state", &state)
            .finish()
    }
}
