use std::fmt;
use std::io;

use spinelhost_transport::{ExitCode, TransportError};

// CLI exit codes share the numbering of the transport's fatal exits.
pub const SUCCESS: i32 = ExitCode::Success as i32;
pub const FAILURE: i32 = ExitCode::Failure as i32;
pub const USAGE: i32 = ExitCode::InvalidArguments as i32;
pub const NO_RESPONSE: i32 = ExitCode::RadioSpinelNoResponse as i32;
pub const ERRNO: i32 = ExitCode::ErrorErrno as i32;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(USAGE, message)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::TimedOut => NO_RESPONSE,
        io::ErrorKind::InvalidInput => USAGE,
        _ => ERRNO,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Io(source) => io_error(context, source),
        TransportError::InvalidUrl { .. }
        | TransportError::InvalidArgs(_)
        | TransportError::Unsupported(_) => CliError::new(USAGE, format!("{context}: {err}")),
        TransportError::ResponseTimeout => {
            CliError::new(NO_RESPONSE, format!("{context}: {err}"))
        }
        TransportError::ReconnectExhausted { .. } => {
            CliError::new(ERRNO, format!("{context}: {err}"))
        }
        other => CliError::new(FAILURE, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_transport_exit_codes() {
        assert_eq!((SUCCESS, FAILURE, USAGE, NO_RESPONSE, ERRNO), (0, 1, 2, 5, 6));
    }

    #[test]
    fn transport_errors_map_to_exit_codes() {
        let unsupported = TransportError::Unsupported("trel".into());
        assert_eq!(transport_error("open", unsupported).code, USAGE);
        assert_eq!(
            transport_error("wait", TransportError::ResponseTimeout).code,
            NO_RESPONSE
        );
        assert_eq!(transport_error("send", TransportError::Busy).code, FAILURE);

        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        let err = transport_error("open", TransportError::Io(refused));
        assert_eq!(err.code, ERRNO);
        assert!(err.message.starts_with("open: "));
    }
}
