//! Cleanup registry that keeps crashed test runs from leaking child processes.
//!
//! Every started [`ManagedProcess`](crate::process::ManagedProcess) registers
//! a callback here and removes it again when it is stopped normally. Whatever
//! is still registered when the guard is torn down gets stopped.
//!
//! Two scopes are available:
//!
//! - an owned [`ExitGuard`] runs its remaining callbacks when dropped, which
//!   includes unwinding out of a panicking test;
//! - [`ExitGuard::global`] is created on first use and runs its callbacks from
//!   a `libc::atexit` hook when the process exits normally.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

type Callback = Box<dyn FnOnce() + Send>;

/// Handle for a registered callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GuardKey(u64);

#[derive(Default)]
pub struct ExitGuard {
    next_key: AtomicU64,
    callbacks: Mutex<Vec<(GuardKey, Callback)>>,
}

static GLOBAL: OnceLock<Arc<ExitGuard>> = OnceLock::new();

impl ExitGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide guard, drained when the process exits normally
    pub fn global() -> Arc<ExitGuard> {
        GLOBAL
            .get_or_init(|| {
                install_exit_hook();
                Arc::new(ExitGuard::new())
            })
            .clone()
    }

    /// Add a cleanup action, returning the key to remove it with
    pub fn register<F>(&self, callback: F) -> GuardKey
    where
        F: FnOnce() + Send + 'static,
    {
        let key = GuardKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        self.lock().push((key, Box::new(callback)));
        key
    }

    /// Remove a cleanup action. Returns false if it was not registered.
    pub fn unregister(&self, key: GuardKey) -> bool {
        let mut callbacks = self.lock();
        match callbacks.iter().position(|(k, _)| *k == key) {
            Some(index) => {
                callbacks.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Run and remove every registered callback, newest first.
    ///
    /// A panicking callback is logged and does not stop the others. Returns
    /// the number of callbacks that ran.
    pub fn run_all(&self) -> usize {
        // Callbacks may call back into the guard, so run them unlocked
        let callbacks = std::mem::take(&mut *self.lock());
        let count = callbacks.len();

        for (key, callback) in callbacks.into_iter().rev() {
            if panic::catch_unwind(AssertUnwindSafe(callback)).is_err() {
                tracing::warn!(key = key.0, "exit cleanup callback panicked");
            }
        }

        if count > 0 {
            tracing::debug!(count, "ran exit cleanup callbacks");
        }
        count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(GuardKey, Callback)>> {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.run_all();
    }
}

impl std::fmt::Debug for ExitGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitGuard")
            .field("registered", &self.len())
            .finish()
    }
}

#[cfg(unix)]
fn install_exit_hook() {
    extern "C" fn run_global_guard() {
        if let Some(guard) = GLOBAL.get() {
            guard.run_all();
        }
    }

    // SAFETY: registering a plain extern "C" fn with no captured state
    let rc = unsafe { libc::atexit(run_global_guard) };
    if rc != 0 {
        tracing::warn!("failed to install exit cleanup hook");
    }
}

#[cfg(not(unix))]
fn install_exit_hook() {
    // TODO: run the global guard at process exit on non-unix targets
}
