//! Network namespace handles
//!
//! This module uses `unsafe` for fstatfs(2) and the `NS_GET_NSTYPE` ioctl.

#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use netspace_core::{Error, NamespaceName, NsId, ProcessId, Result, ThreadId};
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, setns, unshare};
use tracing::{debug, trace, warn};

use crate::config::{self, NetnsConfig};

/// `f_type` of the kernel's namespace filesystem
const NSFS_MAGIC: i64 = 0x6e73_6673;

/// `_IO(0xb7, 0x3)`: ask an nsfs descriptor for its `CLONE_NEW*` type
const NS_GET_NSTYPE: u64 = 0xb703;

/// Handle to a kernel network namespace
///
/// Owns one read-only descriptor on an `nsfs` file. While the handle is
/// open the namespace stays alive, even with no process left inside it.
/// The handle is `Open` until [`close`](Self::close) (or drop), after which
/// [`enter`](Self::enter) fails and [`is_same`](Self::is_same) is false.
#[derive(Debug)]
pub struct NetNs {
    file: Option<File>,
    path: PathBuf,
}

impl NetNs {
    /// Move the calling OS thread into a brand-new network namespace
    ///
    /// Only the calling thread is affected. Callers on a task runtime should
    /// prefer [`run`](Self::run) or keep the task pinned and re-enter the
    /// previous namespace before yielding the thread.
    ///
    /// # Errors
    /// Returns [`Error::PrivilegeOrKernel`] if unshare(2) is refused
    pub fn new() -> Result<Self> {
        detach()?;
        let ns = Self::current()?;

        debug!(path = %ns.path.display(), "Created network namespace");
        Ok(ns)
    }

    /// Like [`new`](Self::new), and also bind-mount the namespace at
    /// `/var/run/ns/<name>` so it outlives every process inside it
    ///
    /// [`from_name`](Self::from_name) finds it again under the same name.
    ///
    /// # Errors
    /// See [`new_named_in`](Self::new_named_in)
    pub fn new_named(name: &str) -> Result<Self> {
        Self::new_named_in(&NetnsConfig::default(), name)
    }

    /// Create a fresh namespace on the calling thread and bind-mount it at
    /// `<run_dir>/<name>`
    ///
    /// The mount point is created with exclusive-create, so of two callers
    /// racing on one name exactly one wins. If the bind mount or the final
    /// open fails, the mount point is removed and the thread re-enters its
    /// prior namespace.
    ///
    /// # Errors
    /// - [`Error::InvalidName`] if `name` is not a single path component
    /// - [`Error::MountConflict`] if the mount point exists, the run
    ///   directory is missing, or the bind mount is refused
    /// - [`Error::PrivilegeOrKernel`] if unshare(2) is refused
    pub fn new_named_in(config: &NetnsConfig, name: &str) -> Result<Self> {
        let name = NamespaceName::new(name)?;
        let target = config.run_path(&name);

        create_mount_point(&target)?;

        let original = match Self::current() {
            Ok(ns) => ns,
            Err(e) => {
                discard_mount_point(&target);
                return Err(e);
            }
        };

        if let Err(e) = detach() {
            discard_mount_point(&target);
            return Err(e);
        }

        let source = config::current_thread_ns_path();
        if let Err(errno) = mount(
            Some(source.as_path()),
            target.as_path(),
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        ) {
            roll_back_named(&target, &original, false);
            return Err(Error::MountConflict {
                path: target,
                source: errno.into(),
            });
        }

        let ns = match Self::from_path(&target) {
            Ok(ns) => ns,
            Err(e) => {
                roll_back_named(&target, &original, true);
                return Err(e);
            }
        };

        debug!(name = %name, path = %target.display(), "Created named network namespace");
        Ok(ns)
    }

    /// Remove the bind mount behind `/var/run/ns/<name>`
    ///
    /// # Errors
    /// See [`remove_named_in`](Self::remove_named_in)
    pub fn remove_named(name: &str) -> Result<()> {
        Self::remove_named_in(&NetnsConfig::default(), name)
    }

    /// Lazily unmount `<run_dir>/<name>` and delete the mount point
    ///
    /// Handles opened earlier keep the namespace alive. A leftover mount
    /// point with nothing mounted on it is deleted as well.
    ///
    /// # Errors
    /// - [`Error::InvalidName`] if `name` is not a single path component
    /// - [`Error::NotFound`] if no mount point exists under that name
    /// - [`Error::MountConflict`] if unmounting or deleting fails
    pub fn remove_named_in(config: &NetnsConfig, name: &str) -> Result<()> {
        let name = NamespaceName::new(name)?;
        let target = config.run_path(&name);

        if let Err(source) = target.symlink_metadata() {
            return Err(Error::NotFound {
                path: target,
                source,
            });
        }

        match umount2(target.as_path(), MntFlags::MNT_DETACH) {
            // EINVAL: not a mount point, only the file is left
            Ok(()) | Err(Errno::EINVAL) => {}
            Err(errno) => {
                return Err(Error::MountConflict {
                    path: target,
                    source: errno.into(),
                });
            }
        }

        std::fs::remove_file(&target).map_err(|source| Error::MountConflict {
            path: target.clone(),
            source,
        })?;

        debug!(name = %name, path = %target.display(), "Removed named network namespace");
        Ok(())
    }

    /// Open the namespace file at `path`
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] if the path cannot be opened or does not
    /// refer to a namespace
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let not_found = |source| Error::NotFound {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(not_found)?;
        if filesystem_magic(&file).map_err(not_found)? != NSFS_MAGIC {
            return Err(not_found(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a namespace file",
            )));
        }
        if let Some(nstype) = namespace_type(&file)
            && nstype != libc::CLONE_NEWNET
        {
            return Err(not_found(io::Error::new(
                io::ErrorKind::InvalidInput,
                "not a network namespace",
            )));
        }

        trace!(path = %path.display(), "Opened network namespace");
        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
        })
    }

    /// Open a named namespace, created either by
    /// [`new_named`](Self::new_named) or by `ip netns add <name>`
    ///
    /// # Errors
    /// See [`from_name_in`](Self::from_name_in)
    pub fn from_name(name: &str) -> Result<Self> {
        Self::from_name_in(&NetnsConfig::default(), name)
    }

    /// Open `<run_dir>/<name>` if it exists, otherwise `<netns_dir>/<name>`
    ///
    /// # Errors
    /// Returns [`Error::InvalidName`] for a malformed name, or
    /// [`Error::NotFound`] if the namespace was never created
    pub fn from_name_in(config: &NetnsConfig, name: &str) -> Result<Self> {
        let name = NamespaceName::new(name)?;

        let own = config.run_path(&name);
        if own.symlink_metadata().is_ok() {
            return Self::from_path(own);
        }

        Self::from_path(config.netns_path(&name))
    }

    /// Open the namespace of a process's main thread
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] if the process does not exist or is not
    /// accessible
    pub fn from_pid(pid: ProcessId) -> Result<Self> {
        Self::from_path(config::pid_ns_path(pid))
    }

    /// Open the namespace of one OS thread
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] if the thread has exited or is not
    /// accessible
    pub fn from_thread(pid: ProcessId, tid: ThreadId) -> Result<Self> {
        Self::from_path(config::thread_ns_path(pid, tid))
    }

    /// Open the namespace of the calling OS thread
    ///
    /// # Errors
    /// Returns [`Error::NotFound`] if `/proc` is unavailable
    pub fn current() -> Result<Self> {
        Self::from_thread(ProcessId::current(), ThreadId::current())
    }

    /// Switch the calling OS thread into this namespace
    ///
    /// Other threads of the process keep their namespace.
    ///
    /// # Errors
    /// - [`Error::Operation`] if the handle is closed or its descriptor is
    ///   rejected
    /// - [`Error::PrivilegeOrKernel`] if the caller lacks `CAP_SYS_ADMIN`
    pub fn enter(&self) -> Result<()> {
        let file = self.file.as_ref().ok_or_else(|| self.closed())?;

        setns(file, CloneFlags::CLONE_NEWNET).map_err(|errno| match errno {
            Errno::EPERM => Error::PrivilegeOrKernel {
                context: format!("setns {}", self.path.display()),
                source: errno,
            },
            _ => Error::Operation {
                path: self.path.clone(),
                source: errno,
            },
        })?;

        trace!(path = %self.path.display(), tid = %ThreadId::current(), "Entered network namespace");
        Ok(())
    }

    /// Whether both handles refer to the same kernel namespace
    ///
    /// Compares the (device, inode) pair of the two descriptors. A closed
    /// handle is never the same as anything, itself included.
    #[must_use]
    pub fn is_same(&self, other: &Self) -> bool {
        match (self.id(), other.id()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }

    /// Identity of the referenced namespace, `None` once closed
    #[must_use]
    pub fn id(&self) -> Option<NsId> {
        let metadata = self.file.as_ref()?.metadata().ok()?;
        Some(NsId::new(metadata.dev(), metadata.ino()))
    }

    /// Close the descriptor
    ///
    /// # Errors
    /// Returns [`Error::Operation`] (`EBADF`) if the handle was already
    /// closed
    pub fn close(&mut self) -> Result<()> {
        let file = self.file.take().ok_or_else(|| self.closed())?;
        drop(file);

        trace!(path = %self.path.display(), "Closed network namespace handle");
        Ok(())
    }

    /// Whether the descriptor is still open
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Path the handle was opened from
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Borrow the descriptor, `None` once closed
    #[must_use]
    pub fn as_fd(&self) -> Option<BorrowedFd<'_>> {
        self.file.as_ref().map(AsFd::as_fd)
    }

    /// Duplicate the descriptor into an independently owned handle
    ///
    /// # Errors
    /// Returns [`Error::Operation`] if closed, or [`Error::Io`] if dup fails
    pub fn try_clone(&self) -> Result<Self> {
        let file = self.file.as_ref().ok_or_else(|| self.closed())?;

        Ok(Self {
            file: Some(file.try_clone()?),
            path: self.path.clone(),
        })
    }

    fn closed(&self) -> Error {
        Error::Operation {
            path: self.path.clone(),
            source: Errno::EBADF,
        }
    }
}

fn detach() -> Result<()> {
    unshare(CloneFlags::CLONE_NEWNET).map_err(|errno| Error::PrivilegeOrKernel {
        context: "unshare(CLONE_NEWNET)".to_string(),
        source: errno,
    })
}

fn create_mount_point(path: &Path) -> Result<()> {
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o444)
        .open(path)
        .map(drop)
        .map_err(|source| Error::MountConflict {
            path: path.to_path_buf(),
            source,
        })
}

/// Undo a partially created named namespace: unmount if needed, drop the
/// mount point, and put the thread back into `original`
fn roll_back_named(target: &Path, original: &NetNs, mounted: bool) {
    if mounted && let Err(errno) = umount2(target, MntFlags::MNT_DETACH) {
        warn!(path = %target.display(), error = %errno, "Could not unmount mount point");
    }

    discard_mount_point(target);

    if let Err(e) = original.enter() {
        warn!(error = %e, "Could not return to previous network namespace");
    }
}

fn discard_mount_point(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "Could not remove mount point");
    }
}

fn filesystem_magic(file: &File) -> io::Result<i64> {
    let mut buf = MaybeUninit::<libc::statfs>::uninit();

    // SAFETY: the descriptor is open for the duration of the borrow and
    // `buf` is a valid out-pointer.
    let rc = unsafe { libc::fstatfs(file.as_raw_fd(), buf.as_mut_ptr()) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: fstatfs succeeded, so the buffer is initialized.
    let buf = unsafe { buf.assume_init() };

    #[allow(clippy::cast_possible_wrap, clippy::unnecessary_cast, clippy::cast_lossless)]
    let magic = buf.f_type as i64;
    Ok(magic)
}

/// `None` on kernels without `NS_GET_NSTYPE` (before 4.11)
#[allow(clippy::cast_possible_truncation)]
fn namespace_type(file: &File) -> Option<i32> {
    // SAFETY: NS_GET_NSTYPE takes no argument and only reads the descriptor.
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), NS_GET_NSTYPE as _) };
    (rc >= 0).then_some(rc)
}
