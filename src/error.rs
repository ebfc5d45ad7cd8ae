//! The mining fleet errors

use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Debug, Display};

use std::io;

pub struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
    /// General error used for more specific input/output error.
    #[fail(display = "{}", _0)]
    General(String),

    /// Standard input/output error.
    #[fail(display = "IO: {}", _0)]
    Io(String),

    /// Serial port open/setup failure with a diagnosable cause.
    #[fail(display = "Transport: {}: {}", _0, _1)]
    Transport(TransportCause, String),

    /// Communication failure during an active scan cycle.
    #[fail(display = "Comms: {}", _0)]
    Comms(String),

    /// Error concerning a device with specific index.
    #[fail(display = "Device {}: {}", _0, _1)]
    Device(usize, String),

    /// Cross-thread channel or semaphore failure.
    #[fail(display = "Channel: {}", _0)]
    Channel(String),
}

/// Distinguishable causes of a serial port open failure
#[derive(Clone, Copy, Eq, PartialEq, Debug, Fail)]
pub enum TransportCause {
    #[fail(display = "permission denied")]
    PermissionDenied,
    #[fail(display = "device busy")]
    Busy,
    #[fail(display = "device not found")]
    NotFound,
    #[fail(display = "OS error")]
    Other,
}

/// Implement Fail trait instead of use Derive to get more control over custom type.
/// The main advantage is customization of Context type which allows conversion of
/// any error types to this custom error with general error kind by calling context
/// method on any result type.
impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.inner, f)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.inner.get_context().clone()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Self {
        Self { inner }
    }
}

impl From<Context<String>> for Error {
    fn from(context: Context<String>) -> Self {
        Self {
            inner: context.map(|info| ErrorKind::General(info)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let msg = e.to_string();
        Self {
            inner: e.context(ErrorKind::Io(msg)),
        }
    }
}

/// A specialized `Result` type bound to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
