//! Process exit codes and the fatal-error path.
//!
//! Transports treat an unexpected channel error as unrecoverable: they log where it
//! happened and exit with a code that tells a supervisor which class of failure
//! occurred.

use std::fmt;
use std::io;
use std::panic::Location;

use tracing::error;

/// Exit status of the host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Failure = 1,
    InvalidArguments = 2,
    RadioSpinelIncompatible = 3,
    RadioSpinelReset = 4,
    RadioSpinelNoResponse = 5,
    ErrorErrno = 6,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ExitCode::Success => "Success",
            ExitCode::Failure => "Failure",
            ExitCode::InvalidArguments => "InvalidArgument",
            ExitCode::RadioSpinelIncompatible => "RadioSpinelIncompatible",
            ExitCode::RadioSpinelReset => "RadioSpinelReset",
            ExitCode::RadioSpinelNoResponse => "RadioSpinelNoResponse",
            ExitCode::ErrorErrno => "ErrorErrno",
        }
    }

    /// Human readable description. `ErrorErrno` embeds the last OS error, so call
    /// this before anything else can overwrite `errno`.
    pub fn describe(self) -> String {
        match self {
            ExitCode::ErrorErrno => io::Error::last_os_error().to_string(),
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ExitCode> for std::process::ExitCode {
    fn from(code: ExitCode) -> Self {
        std::process::ExitCode::from(code.code() as u8)
    }
}

/// Log the caller's location and exit the process with `code`.
#[track_caller]
pub fn die_now(code: ExitCode) -> ! {
    let description = code.describe();
    let location = Location::caller();
    error!(
        file = location.file(),
        line = location.line(),
        exit_code = code.code(),
        "exit({}): {}",
        code.code(),
        description
    );
    std::process::exit(code.code())
}

/// Like [`die_now`], with an extra message describing what went wrong.
#[track_caller]
pub fn die_now_with(code: ExitCode, message: &str) -> ! {
    let description = code.describe();
    let location = Location::caller();
    error!(
        file = location.file(),
        line = location.line(),
        exit_code = code.code(),
        "exit({}): {}: {}",
        code.code(),
        message,
        description
    );
    std::process::exit(code.code())
}

/// Exit with `code` unless `condition` holds.
#[track_caller]
pub fn verify_or_die(condition: bool, code: ExitCode) {
    if !condition {
        die_now(code);
    }
}
