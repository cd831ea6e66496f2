//! Core type definitions with strong typing and validation

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// Name of a persistent namespace, usable as a single path component
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(try_from = "String", into = "String")]
pub struct NamespaceName(String);

impl NamespaceName {
    /// Maximum length in bytes (`NAME_MAX`)
    pub const MAX_LENGTH: usize = 255;

    /// Create a new `NamespaceName` with validation
    ///
    /// # Errors
    /// Returns error if the name is empty, too long, a relative directory
    /// entry, or contains a path separator or NUL byte
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if let Err(reason) = Self::validate(&name) {
            return Err(Error::InvalidName { name, reason });
        }
        Ok(Self(name))
    }

    fn validate(name: &str) -> std::result::Result<(), &'static str> {
        if name.is_empty() {
            return Err("name cannot be empty");
        }

        if name.len() > Self::MAX_LENGTH {
            return Err("name longer than 255 bytes");
        }

        if name == "." || name == ".." {
            return Err("name cannot be a relative directory entry");
        }

        if name.contains(['/', '\0']) {
            return Err("name cannot contain '/' or NUL");
        }

        Ok(())
    }

    /// Get the name as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NamespaceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NamespaceName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for NamespaceName {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        Self::new(s)
    }
}

impl From<NamespaceName> for String {
    fn from(name: NamespaceName) -> Self {
        name.0
    }
}

impl AsRef<str> for NamespaceName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Process identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ProcessId(i32);

impl ProcessId {
    /// Create from raw PID
    #[must_use]
    pub const fn from_raw(pid: i32) -> Self {
        Self(pid)
    }

    /// Get the current process ID
    #[must_use]
    pub fn current() -> Self {
        nix::unistd::getpid().into()
    }

    /// Get raw PID value
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<nix::unistd::Pid> for ProcessId {
    fn from(pid: nix::unistd::Pid) -> Self {
        Self(pid.as_raw())
    }
}

impl From<ProcessId> for nix::unistd::Pid {
    fn from(pid: ProcessId) -> Self {
        nix::unistd::Pid::from_raw(pid.0)
    }
}

/// Kernel thread identifier, as returned by `gettid(2)`
///
/// Network namespace membership belongs to the OS thread, so lookups of the
/// "current" namespace key on this rather than on any runtime task id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
#[serde(transparent)]
pub struct ThreadId(i32);

impl ThreadId {
    /// Create from raw TID
    #[must_use]
    pub const fn from_raw(tid: i32) -> Self {
        Self(tid)
    }

    /// Get the calling OS thread's ID
    #[must_use]
    pub fn current() -> Self {
        Self(nix::unistd::gettid().as_raw())
    }

    /// Get raw TID value
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a kernel namespace object: the (device, inode) pair of its
/// `nsfs` file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NsId {
    dev: u64,
    ino: u64,
}

impl NsId {
    /// Create from a device and inode number
    #[must_use]
    pub const fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }

    /// Device number of the `nsfs` mount
    #[must_use]
    pub const fn dev(self) -> u64 {
        self.dev
    }

    /// Inode number of the namespace
    #[must_use]
    pub const fn ino(self) -> u64 {
        self.ino
    }
}

impl fmt::Display for NsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net:[{}]", self.ino)
    }
}
