//! Namespace path configuration

use std::path::PathBuf;

use netspace_core::{NamespaceName, ProcessId, ThreadId};
use serde::{Deserialize, Serialize};

/// Directory holding namespaces created by [`NetNs::new_named`](crate::NetNs::new_named)
pub const DEFAULT_RUN_DIR: &str = "/var/run/ns";

/// Directory used by `ip netns add`
pub const DEFAULT_NETNS_DIR: &str = "/var/run/netns";

/// Where named namespaces are bind-mounted and looked up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetnsConfig {
    /// Directory for namespaces this crate creates
    pub run_dir: PathBuf,

    /// Directory for namespaces created by third-party tooling
    pub netns_dir: PathBuf,
}

impl Default for NetnsConfig {
    fn default() -> Self {
        Self {
            run_dir: PathBuf::from(DEFAULT_RUN_DIR),
            netns_dir: PathBuf::from(DEFAULT_NETNS_DIR),
        }
    }
}

impl NetnsConfig {
    /// Create a configuration with the conventional directories
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the directory used for created named namespaces
    #[must_use]
    pub fn with_run_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.run_dir = dir.into();
        self
    }

    /// Set the directory used to look up `ip netns` namespaces
    #[must_use]
    pub fn with_netns_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.netns_dir = dir.into();
        self
    }

    /// Mount point for a namespace created under `name`
    #[must_use]
    pub fn run_path(&self, name: &NamespaceName) -> PathBuf {
        self.run_dir.join(name.as_str())
    }

    /// Mount point of an `ip netns` namespace called `name`
    #[must_use]
    pub fn netns_path(&self, name: &NamespaceName) -> PathBuf {
        self.netns_dir.join(name.as_str())
    }
}

/// `/proc/<pid>/ns/net`: namespace of a process's main thread
#[must_use]
pub fn pid_ns_path(pid: ProcessId) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/ns/net"))
}

/// `/proc/<pid>/task/<tid>/ns/net`: namespace of one OS thread
#[must_use]
pub fn thread_ns_path(pid: ProcessId, tid: ThreadId) -> PathBuf {
    PathBuf::from(format!("/proc/{pid}/task/{tid}/ns/net"))
}

/// Namespace path of the calling OS thread
#[must_use]
pub fn current_thread_ns_path() -> PathBuf {
    thread_ns_path(ProcessId::current(), ThreadId::current())
}
