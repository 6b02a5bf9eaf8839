use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::context::{Context, DEFAULT_TIMEOUT};
use crate::error::{MainloopError, Result};
use crate::manager::{Manager, Source, SourceId};

/// Drives registered sources through one `select()` per iteration.
#[derive(Debug)]
pub struct Mainloop {
    manager: Manager,
    default_timeout: Duration,
}

impl Mainloop {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    /// Create a mainloop that never sleeps longer than `default_timeout`.
    pub fn with_timeout(default_timeout: Duration) -> Self {
        Self {
            manager: Manager::new(),
            default_timeout,
        }
    }

    pub fn add<S: Source + 'static>(&mut self, source: &Rc<RefCell<S>>) -> SourceId {
        self.manager.add(source)
    }

    pub fn remove(&mut self, id: SourceId) -> bool {
        self.manager.remove(id)
    }

    pub fn manager(&self) -> &Manager {
        &self.manager
    }

    /// Run one update / select / process iteration.
    ///
    /// Returns the number of ready descriptors. An interrupted `select()` counts as
    /// zero ready and sources still get their `process` call.
    pub fn run_once(&mut self) -> Result<usize> {
        let mut ctx = Context::new(self.default_timeout);
        self.manager.update(&mut ctx);
        let ready = select(&mut ctx)?;
        self.manager.process(&ctx);
        Ok(ready)
    }
}

impl Default for Mainloop {
    fn default() -> Self {
        Self::new()
    }
}

/// Block in `select()` on the fds and timeout held by `ctx`.
///
/// On return the context's sets contain only ready descriptors.
pub fn select(ctx: &mut Context) -> Result<usize> {
    let mut timeout = to_timeval(ctx.timeout());
    let nfds = ctx.max_fd() + 1;
    let (read, write, error) = ctx.fd_sets_mut();

    // SAFETY: all three sets are initialized fd_sets owned by `ctx`, and `timeout`
    // is a valid timeval for the duration of the call.
    let rc = unsafe {
        libc::select(
            nfds,
            read.as_mut_ptr(),
            write.as_mut_ptr(),
            error.as_mut_ptr(),
            &mut timeout,
        )
    };

    if rc >= 0 {
        trace!(ready = rc, "select returned");
        return Ok(rc as usize);
    }

    let err = io::Error::last_os_error();
    if err.kind() == io::ErrorKind::Interrupted {
        ctx.clear_ready();
        return Ok(0);
    }
    Err(MainloopError::Select(err))
}

/// Readiness a blocking wait is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

/// Block until `fd` is ready for `interest` or `timeout` elapses.
///
/// Returns `Ok(false)` on timeout. `EINTR` is reported as an error of kind
/// `Interrupted` so the caller can recompute its remaining budget.
pub fn wait_fd(fd: RawFd, interest: Interest, timeout: Duration) -> io::Result<bool> {
    let mut ctx = Context::new(timeout);
    let added = match interest {
        Interest::Read => ctx.add_read_fd(fd),
        Interest::Write => ctx.add_write_fd(fd),
    };
    added.map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;

    let mut tv = to_timeval(timeout);
    let (read, write, error) = ctx.fd_sets_mut();
    // SAFETY: the fd_sets are initialized and owned by `ctx`; `tv` outlives the call.
    let rc = unsafe {
        libc::select(
            fd + 1,
            read.as_mut_ptr(),
            write.as_mut_ptr(),
            error.as_mut_ptr(),
            &mut tv,
        )
    };

    match rc {
        0 => Ok(false),
        n if n > 0 => Ok(true),
        _ => Err(io::Error::last_os_error()),
    }
}

/// Longest single wait handed to `select()`. Longer timeouts are clamped to it.
pub const MAX_WAIT: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// The instant `timeout` from now, clamped to [`MAX_WAIT`].
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout.min(MAX_WAIT)).unwrap_or(now)
}

fn to_timeval(timeout: Duration) -> libc::timeval {
    let timeout = timeout.min(MAX_WAIT);
    libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    }
}
