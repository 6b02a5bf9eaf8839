//! [`CpcDriver`] backed by the vendor `libcpc` client library.

use std::ffi::{c_int, c_void, CString};
use std::io;
use std::os::fd::RawFd;
use std::ptr;
use std::time::Duration;

use tracing::debug;

use crate::cpc::CpcDriver;
use crate::reset::{ResetRegistry, ResetSignal};

#[repr(C)]
#[derive(Clone, Copy)]
struct CpcHandle {
    ptr: *mut c_void,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct CpcEndpoint {
    ptr: *mut c_void,
}

#[repr(C)]
struct CpcTimeval {
    seconds: c_int,
    microseconds: c_int,
}

const CPC_OPTION_RX_TIMEOUT: c_int = 2;
const CPC_ENDPOINT_READ_FLAG_NONE: c_int = 0;
const CPC_ENDPOINT_READ_FLAG_NON_BLOCKING: c_int = 1;
const CPC_ENDPOINT_WRITE_FLAG_NONE: c_int = 0;

type ResetCallback = extern "C" fn();

#[link(name = "cpc")]
extern "C" {
    fn cpc_init(
        handle: *mut CpcHandle,
        instance_name: *const std::ffi::c_char,
        enable_tracing: bool,
        reset_callback: Option<ResetCallback>,
    ) -> c_int;
    fn cpc_restart(handle: *mut CpcHandle) -> c_int;
    fn cpc_open_endpoint(
        handle: CpcHandle,
        endpoint: *mut CpcEndpoint,
        id: u8,
        tx_window_size: u8,
    ) -> c_int;
    fn cpc_close_endpoint(endpoint: *mut CpcEndpoint) -> c_int;
    fn cpc_read_endpoint(
        endpoint: CpcEndpoint,
        buffer: *mut c_void,
        count: usize,
        flags: c_int,
    ) -> isize;
    fn cpc_write_endpoint(
        endpoint: CpcEndpoint,
        data: *const c_void,
        data_length: usize,
        flags: c_int,
    ) -> isize;
    fn cpc_set_endpoint_option(
        endpoint: CpcEndpoint,
        option: c_int,
        optval: *const c_void,
        optlen: usize,
    ) -> c_int;
}

// libcpc's reset callback carries no context, so every live driver's signal is
// raised.
static RESET_SIGNALS: ResetRegistry = ResetRegistry::new();

extern "C" fn on_daemon_reset() {
    RESET_SIGNALS.raise_all();
}

fn check(rc: isize) -> io::Result<usize> {
    if rc < 0 {
        let errno = i32::try_from(-rc).unwrap_or(libc::EIO);
        return Err(io::Error::from_raw_os_error(errno));
    }
    Ok(rc as usize)
}

pub struct LibCpcDriver {
    handle: CpcHandle,
    endpoint: CpcEndpoint,
    rx_timeout: Option<Duration>,
    signal: Option<ResetSignal>,
}

impl LibCpcDriver {
    pub fn new() -> Self {
        Self {
            handle: CpcHandle {
                ptr: ptr::null_mut(),
            },
            endpoint: CpcEndpoint {
                ptr: ptr::null_mut(),
            },
            rx_timeout: None,
            signal: None,
        }
    }

    fn set_rx_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        if self.rx_timeout == Some(timeout) {
            return Ok(());
        }
        let tv = CpcTimeval {
            seconds: c_int::try_from(timeout.as_secs()).unwrap_or(c_int::MAX),
            microseconds: timeout.subsec_micros() as c_int,
        };
        // SAFETY: `tv` is a valid CpcTimeval for the duration of the call and the
        // endpoint was opened by `cpc_open_endpoint`.
        let rc = unsafe {
            cpc_set_endpoint_option(
                self.endpoint,
                CPC_OPTION_RX_TIMEOUT,
                (&tv as *const CpcTimeval).cast(),
                std::mem::size_of::<CpcTimeval>(),
            )
        };
        check(rc as isize)?;
        self.rx_timeout = Some(timeout);
        Ok(())
    }
}

impl Default for LibCpcDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CpcDriver for LibCpcDriver {
    fn init(&mut self, instance: &str, reset: ResetSignal) -> io::Result<()> {
        let name = CString::new(instance)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        // SAFETY: `handle` is writable and `name` is a NUL-terminated string that
        // outlives the call.
        let rc = unsafe { cpc_init(&mut self.handle, name.as_ptr(), false, Some(on_daemon_reset)) };
        check(rc as isize)?;

        RESET_SIGNALS.register(&reset);
        if let Some(previous) = self.signal.replace(reset) {
            if !self.signal.as_ref().is_some_and(|current| current.same_as(&previous)) {
                RESET_SIGNALS.unregister(&previous);
            }
        }
        debug!(instance, "libcpc initialized");
        Ok(())
    }

    fn restart(&mut self) -> io::Result<()> {
        // SAFETY: `handle` was initialized by `cpc_init`.
        let rc = unsafe { cpc_restart(&mut self.handle) };
        check(rc as isize).map(|_| ())
    }

    fn open_endpoint(&mut self, id: u8, tx_window: u8) -> io::Result<RawFd> {
        self.rx_timeout = None;
        // SAFETY: `handle` was initialized by `cpc_init`; `endpoint` is writable.
        let rc = unsafe { cpc_open_endpoint(self.handle, &mut self.endpoint, id, tx_window) };
        check(rc as isize).map(|fd| fd as RawFd)
    }

    fn close_endpoint(&mut self) -> io::Result<()> {
        // SAFETY: `endpoint` was filled in by `cpc_open_endpoint`.
        let rc = unsafe { cpc_close_endpoint(&mut self.endpoint) };
        check(rc as isize).map(|_| ())
    }

    fn read(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
        let flags = match timeout {
            Some(timeout) => {
                self.set_rx_timeout(timeout)?;
                CPC_ENDPOINT_READ_FLAG_NONE
            }
            None => CPC_ENDPOINT_READ_FLAG_NON_BLOCKING,
        };
        // SAFETY: `buf` is valid for `buf.len()` writable bytes.
        let rc = unsafe {
            cpc_read_endpoint(self.endpoint, buf.as_mut_ptr().cast(), buf.len(), flags)
        };
        check(rc)
    }

    fn write(&mut self, frame: &[u8]) -> io::Result<()> {
        // SAFETY: `frame` is valid for `frame.len()` readable bytes.
        let rc = unsafe {
            cpc_write_endpoint(
                self.endpoint,
                frame.as_ptr().cast(),
                frame.len(),
                CPC_ENDPOINT_WRITE_FLAG_NONE,
            )
        };
        let written = check(rc)?;
        if written != frame.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short cpc write ({written} of {})", frame.len()),
            ));
        }
        Ok(())
    }
}

impl Drop for LibCpcDriver {
    fn drop(&mut self) {
        let Some(own) = self.signal.take() else {
            return;
        };
        RESET_SIGNALS.unregister(&own);
    }
}
