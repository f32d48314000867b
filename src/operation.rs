//! Cancellable operation handles.
//!
//! A request flows through two phases - cache lookup, then download - and
//! the caller holds a single [`CombinedOperation`] spanning both. Cancelling
//! it cancels whichever sub-operation is live; cancellation is idempotent
//! and a cancelled operation never delivers a success completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::sync::{Arc, Weak};

/// A cancellable reference to in-flight work.
pub trait Operation: Send + Sync {
    /// Request cancellation. Idempotent; causes no further callbacks.
    fn cancel(&self);

    /// Whether cancellation has been requested.
    fn is_cancelled(&self) -> bool;
}

/// Handle for an in-flight cache-lookup job on the IO executor.
///
/// The IO-side job observes cancellation at its next check-in point
/// (before reading bytes); the delivery path re-checks before invoking
/// the callback.
#[derive(Debug, Default)]
pub struct CacheOperation {
    cancelled: AtomicBool,
}

impl CacheOperation {
    /// Create a live (not cancelled) operation.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Operation for CacheOperation {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

type CancelHook = Box<dyn FnOnce() + Send>;

/// Cancellable composite of a cache-lookup sub-operation and a download
/// sub-operation under one identity.
///
/// The cancel hook is installed by the manager at download start; it
/// cancels the downloader's sub-operation and removes the handle from the
/// manager's running set. The hook must not capture the operation
/// strongly - it is stored inside the operation, and a strong capture
/// would keep the pair alive until cancellation. Capture a [`Weak`]
/// obtained from [`CombinedOperation::downgrade`] and upgrade on
/// invocation; a failed upgrade makes the hook a no-op.
#[derive(Default)]
pub struct CombinedOperation {
    cancelled: AtomicBool,
    cache_operation: Mutex<Option<Arc<CacheOperation>>>,
    cancel_hook: Mutex<Option<CancelHook>>,
}

impl CombinedOperation {
    /// Create a live operation with no sub-operations attached.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Obtain a weak back-reference for use inside the cancel hook.
    pub fn downgrade(self: &Arc<Self>) -> Weak<Self> {
        Arc::downgrade(self)
    }

    /// Attach the cache-lookup sub-operation.
    ///
    /// If cancellation already happened, the sub-operation is cancelled
    /// immediately instead of being stored.
    pub fn set_cache_operation(&self, op: Arc<CacheOperation>) {
        if self.is_cancelled() {
            op.cancel();
            return;
        }
        let mut slot = self.cache_operation.lock().unwrap();
        if self.is_cancelled() {
            op.cancel();
        } else {
            *slot = Some(op);
        }
    }

    /// Install the cancel hook.
    ///
    /// If cancellation already happened, the hook runs immediately and is
    /// not stored. The hook is invoked outside the internal lock.
    pub fn set_cancel_hook(&self, hook: CancelHook) {
        let deferred = {
            let mut slot = self.cancel_hook.lock().unwrap();
            if self.is_cancelled() {
                Some(hook)
            } else {
                *slot = Some(hook);
                None
            }
        };
        if let Some(hook) = deferred {
            hook();
        }
    }
}

impl Operation for CombinedOperation {
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);

        let cache_op = self.cache_operation.lock().unwrap().take();
        if let Some(op) = cache_op {
            op.cancel();
        }

        let hook = self.cancel_hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for CombinedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CombinedOperation")
            .field("cancelled", &self.is_cancelled())
            .field(
                "has_cache_operation",
                &self.cache_operation.lock().unwrap().is_some(),
            )
            .field(
                "has_cancel_hook",
                &self.cancel_hook.lock().unwrap().is_some(),
            )
            .finish()
    }
}
