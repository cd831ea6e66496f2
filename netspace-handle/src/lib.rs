//! Handles for Linux network namespaces
//!
//! A [`NetNs`] owns a descriptor on a kernel network namespace. It can:
//! - create a fresh namespace, optionally bind-mounted under a name
//! - locate one by path, `ip netns` name, process, or OS thread
//! - compare two handles by namespace identity
//! - switch the calling OS thread into the namespace
//!
//! Namespace membership is per OS thread, not per process. Code running on
//! a task scheduler that migrates work between threads should use
//! [`NetNs::run`], [`NetNs::run_async`] or [`NetNs::enter_scoped`] instead
//! of calling [`NetNs::enter`] directly.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

pub mod config;
pub mod handle;
pub mod scope;

pub use config::{
    DEFAULT_NETNS_DIR, DEFAULT_RUN_DIR, NetnsConfig, current_thread_ns_path, pid_ns_path,
    thread_ns_path,
};
pub use handle::NetNs;
pub use netspace_core::{Error, NamespaceName, NsId, ProcessId, Result, ThreadId};
pub use scope::NetNsGuard;
