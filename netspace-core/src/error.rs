//! Error types for netspace

use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

/// netspace error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The kernel refused to detach or switch the calling thread
    ///
    /// Missing `CAP_SYS_ADMIN`, a kernel without network namespace support,
    /// or an exhausted namespace count limit all land here.
    #[error("Namespace operation refused ({context}): {source}")]
    PrivilegeOrKernel {
        /// Operation and, where known, the path involved
        context: String,
        /// Errno reported by the kernel
        source: Errno,
    },

    /// A lookup path does not exist or is not a namespace object
    #[error("Network namespace not found at {}: {source}", path.display())]
    NotFound {
        /// Path that was looked up
        path: PathBuf,
        /// Underlying open or validation error
        source: std::io::Error,
    },

    /// Creating or removing a named namespace mount failed
    #[error("Mount conflict at {}: {source}", path.display())]
    MountConflict {
        /// Mount point
        path: PathBuf,
        /// Underlying filesystem error
        source: std::io::Error,
    },

    /// Switching into a handle failed
    #[error("Failed to switch network namespace {}: {source}", path.display())]
    Operation {
        /// Path the handle was opened from
        path: PathBuf,
        /// Errno reported by the kernel
        source: Errno,
    },

    /// Name cannot be used as a named namespace
    #[error("Invalid namespace name {name:?}: {reason}")]
    InvalidName {
        /// Rejected name
        name: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A dedicated namespace worker thread panicked
    #[error("Namespace worker thread panicked")]
    WorkerPanicked,
}

impl Error {
    /// Whether the error stems from missing privileges
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        match self {
            Self::PrivilegeOrKernel { source, .. } | Self::Operation { source, .. } => {
                matches!(source, Errno::EPERM | Errno::EACCES)
            }
            Self::NotFound { source, .. } | Self::MountConflict { source, .. } | Self::Io(source) => {
                source.kind() == std::io::ErrorKind::PermissionDenied
            }
            _ => false,
        }
    }
}

/// Result type alias for netspace operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display_includes_path() {
        let err = Error::NotFound {
            path: PathBuf::from("/proc/999999/ns/net"),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        };

        assert!(err.to_string().contains("/proc/999999/ns/net"));
    }

    #[test]
    fn test_permission_classification() {
        let refused = Error::PrivilegeOrKernel {
            context: "unshare(CLONE_NEWNET)".to_string(),
            source: Errno::EPERM,
        };
        assert!(refused.is_permission_denied());

        let closed = Error::Operation {
            path: PathBuf::from("/var/run/netns/blue"),
            source: Errno::EBADF,
        };
        assert!(!closed.is_permission_denied());

        let conflict = Error::MountConflict {
            path: PathBuf::from("/var/run/ns/blue"),
            source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        };
        assert!(conflict.is_permission_denied());
    }
}
