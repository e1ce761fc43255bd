//! Run-wide cancellation for indexing workers
//!
//! Workers stop pulling new work once a fatal store error is recorded.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::store::StoreError;

/// Cancellation token plus the error that triggered it
#[derive(Clone)]
pub struct RunCancellation {
    token: CancellationToken,
    fatal: Arc<Mutex<Option<StoreError>>>,
}

impl RunCancellation {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            fatal: Arc::new(Mutex::new(None)),
        }
    }

    /// Record a fatal error and stop all workers. The first error wins.
    pub fn abort(&self, err: StoreError) {
        let mut fatal = self.fatal.lock();
        if fatal.is_none() {
            error!(error = %err, "Fatal store error, aborting indexing run");
            *fatal = Some(err);
        }
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Token for a subtask
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Take the recorded fatal error, if any
    pub fn take_fatal(&self) -> Option<StoreError> {
        self.fatal.lock().take()
    }
}

impl Default for RunCancellation {
    fn default() -> Self {
        Self::new()
    }
}
