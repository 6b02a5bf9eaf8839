use std::mem::MaybeUninit;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::{MainloopError, Result};

/// Timeout used when no source asks for an earlier wakeup.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Owned `fd_set`.
pub struct FdSet {
    raw: libc::fd_set,
}

impl FdSet {
    /// Create an empty set.
    pub fn new() -> Self {
        let mut raw = MaybeUninit::<libc::fd_set>::uninit();
        // SAFETY: FD_ZERO fully initializes the fd_set it is given.
        let raw = unsafe {
            libc::FD_ZERO(raw.as_mut_ptr());
            raw.assume_init()
        };
        Self { raw }
    }

    /// Add `fd` to the set.
    pub fn insert(&mut self, fd: RawFd) -> Result<()> {
        check_range(fd)?;
        // SAFETY: `fd` is within [0, FD_SETSIZE) and `raw` is an initialized fd_set.
        unsafe { libc::FD_SET(fd, &mut self.raw) };
        Ok(())
    }

    /// Remove `fd` from the set.
    pub fn remove(&mut self, fd: RawFd) {
        if check_range(fd).is_ok() {
            // SAFETY: `fd` is within [0, FD_SETSIZE) and `raw` is an initialized fd_set.
            unsafe { libc::FD_CLR(fd, &mut self.raw) };
        }
    }

    /// Whether `fd` is in the set. Out-of-range descriptors never are.
    pub fn contains(&self, fd: RawFd) -> bool {
        if check_range(fd).is_err() {
            return false;
        }
        // SAFETY: `fd` is within [0, FD_SETSIZE) and `raw` is an initialized fd_set.
        unsafe { libc::FD_ISSET(fd, &self.raw) }
    }

    /// Remove every descriptor.
    pub fn clear(&mut self) {
        // SAFETY: `raw` is a valid fd_set.
        unsafe { libc::FD_ZERO(&mut self.raw) };
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::fd_set {
        &mut self.raw
    }
}

impl Default for FdSet {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FdSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let max = libc::FD_SETSIZE as RawFd;
        f.debug_set()
            .entries((0..max).filter(|fd| self.contains(*fd)))
            .finish()
    }
}

fn check_range(fd: RawFd) -> Result<()> {
    let max = libc::FD_SETSIZE as usize;
    if fd < 0 || fd as usize >= max {
        return Err(MainloopError::FdOutOfRange { fd, max });
    }
    Ok(())
}

/// Readiness interest and timeout for one mainloop iteration.
///
/// Built fresh every iteration; nothing carries over.
#[derive(Debug)]
pub struct Context {
    read_fds: FdSet,
    write_fds: FdSet,
    error_fds: FdSet,
    max_fd: RawFd,
    timeout: Duration,
}

impl Context {
    /// Create an empty context that will wait at most `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            read_fds: FdSet::new(),
            write_fds: FdSet::new(),
            error_fds: FdSet::new(),
            max_fd: -1,
            timeout,
        }
    }

    /// Wake up when `fd` becomes readable.
    pub fn add_read_fd(&mut self, fd: RawFd) -> Result<()> {
        self.read_fds.insert(fd)?;
        self.max_fd = self.max_fd.max(fd);
        Ok(())
    }

    /// Wake up when `fd` becomes writable.
    pub fn add_write_fd(&mut self, fd: RawFd) -> Result<()> {
        self.write_fds.insert(fd)?;
        self.max_fd = self.max_fd.max(fd);
        Ok(())
    }

    /// Wake up on an exceptional condition on `fd`.
    pub fn add_error_fd(&mut self, fd: RawFd) -> Result<()> {
        self.error_fds.insert(fd)?;
        self.max_fd = self.max_fd.max(fd);
        Ok(())
    }

    pub fn is_readable(&self, fd: RawFd) -> bool {
        self.read_fds.contains(fd)
    }

    pub fn is_writable(&self, fd: RawFd) -> bool {
        self.write_fds.contains(fd)
    }

    pub fn has_error(&self, fd: RawFd) -> bool {
        self.error_fds.contains(fd)
    }

    /// Highest descriptor registered, or -1.
    pub fn max_fd(&self) -> RawFd {
        self.max_fd
    }

    /// Current wait budget.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Shrink the wait budget to `timeout` if that is sooner. Never grows it.
    pub fn set_timeout_if_earlier(&mut self, timeout: Duration) {
        if timeout < self.timeout {
            self.timeout = timeout;
        }
    }

    /// Forget all readiness, e.g. after an interrupted `select()`.
    pub fn clear_ready(&mut self) {
        self.read_fds.clear();
        self.write_fds.clear();
        self.error_fds.clear();
    }

    pub(crate) fn fd_sets_mut(&mut self) -> (&mut FdSet, &mut FdSet, &mut FdSet) {
        (&mut self.read_fds, &mut self.write_fds, &mut self.error_fds)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}
