//! Scoped execution inside a network namespace
//!
//! Namespace membership belongs to the OS thread. Everything here either
//! pins work to a dedicated thread or ties the switch to a guard that cannot
//! leave the thread it was created on, and always re-enters the original
//! namespace afterwards.

use std::marker::PhantomData;

use netspace_core::{Error, Result};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::config::NetnsConfig;
use crate::handle::NetNs;

/// Keeps the calling thread inside a namespace until restored or dropped
///
/// Created by [`NetNs::enter_scoped`]. The guard is `!Send`: it must be
/// dropped on the thread whose namespace it changed.
#[derive(Debug)]
#[must_use = "dropping the guard immediately re-enters the original namespace"]
pub struct NetNsGuard {
    original: NetNs,
    restored: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl NetNsGuard {
    /// Namespace the thread was in before the switch
    #[must_use]
    pub const fn original(&self) -> &NetNs {
        &self.original
    }

    /// Re-enter the original namespace, reporting failure
    ///
    /// # Errors
    /// Returns the error from [`NetNs::enter`] on the original handle
    pub fn restore(mut self) -> Result<()> {
        self.restored = true;
        self.original.enter()
    }
}

impl Drop for NetNsGuard {
    fn drop(&mut self) {
        if self.restored {
            return;
        }

        if let Err(e) = self.original.enter() {
            error!(
                error = %e,
                path = %self.original.path().display(),
                "Failed to restore network namespace, thread left in foreign namespace"
            );
        }
    }
}

impl NetNs {
    /// Switch the calling thread into this namespace until the returned guard
    /// is restored or dropped
    ///
    /// # Errors
    /// Returns error if the current namespace cannot be opened or
    /// [`enter`](Self::enter) fails; the thread is then left where it was
    pub fn enter_scoped(&self) -> Result<NetNsGuard> {
        let original = Self::current()?;
        self.enter()?;

        Ok(NetNsGuard {
            original,
            restored: false,
            _thread_bound: PhantomData,
        })
    }

    /// Run `f` inside this namespace on a dedicated OS thread
    ///
    /// The worker enters the namespace, runs `f`, and re-enters its original
    /// namespace before exiting, also when `f` panics. The calling thread is
    /// never switched.
    ///
    /// # Errors
    /// - errors from [`enter_scoped`](Self::enter_scoped) or the restore
    /// - [`Error::WorkerPanicked`] if `f` panicked
    pub fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send,
        T: Send,
    {
        std::thread::scope(|s| {
            s.spawn(|| self.run_here(f))
                .join()
                .map_err(|_| Error::WorkerPanicked)?
        })
    }

    /// Async counterpart of [`run`](Self::run)
    ///
    /// Runtime worker threads are never switched: `f` runs on a fresh OS
    /// thread and its result comes back over a oneshot channel.
    ///
    /// # Errors
    /// - [`Error::Operation`] or [`Error::Io`] if the handle cannot be
    ///   duplicated or the thread cannot be spawned
    /// - errors from entering or restoring the namespace
    /// - [`Error::WorkerPanicked`] if `f` panicked
    pub async fn run_async<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let ns = self.try_clone()?;
        let (tx, rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("netns-worker".to_string())
            .spawn(move || {
                // Receiver gone means the caller stopped waiting
                let _ = tx.send(ns.run_here(f));
            })?;

        rx.await.map_err(|_| Error::WorkerPanicked)?
    }

    /// Create a named namespace on a short-lived worker thread
    ///
    /// Same as [`new_named_in`](Self::new_named_in), but the calling thread
    /// stays in its current namespace. Once the mount exists the handle is
    /// returned even if the worker cannot switch back; the worker exits anyway.
    ///
    /// # Errors
    /// See [`new_named_in`](Self::new_named_in); [`Error::WorkerPanicked`]
    /// if the worker panicked
    pub fn new_named_on_worker(config: &NetnsConfig, name: &str) -> Result<Self> {
        std::thread::scope(|s| {
            s.spawn(|| -> Result<Self> {
                let original = Self::current()?;
                let ns = Self::new_named_in(config, name)?;
                if let Err(e) = original.enter() {
                    warn!(
                        path = %ns.path().display(),
                        error = %e,
                        "Worker could not return to previous network namespace"
                    );
                }
                Ok(ns)
            })
            .join()
            .map_err(|_| Error::WorkerPanicked)?
        })
    }

    fn run_here<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T,
    {
        let guard = self.enter_scoped()?;
        debug!(path = %self.path().display(), "Running in network namespace");

        let value = f();
        guard.restore()?;

        Ok(value)
    }
}
