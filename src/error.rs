//! Error types returned by every fallible operation in this crate.
//!
//! An [`Error`] is an [`ErrorKind`] describing what went wrong (with enough
//! context to diagnose it: the offending event, CPU or transition) plus an
//! optional underlying cause, usually the OS error reported by the native
//! counter layer.

use std::{error, fmt, io};

use thiserror::Error as ThisError;

use crate::{
    catalog::EventName,
    cpu::CpuId,
    session::{Operation, SessionState},
};

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    cause: Option<Box<dyn error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ErrorKind {
    /// The event list could not be turned into an [`EventCatalog`], or
    /// there is nothing to measure.
    ///
    /// [`EventCatalog`]: crate::EventCatalog
    #[error("invalid configuration: {0}")]
    Configuration(ConfigurationError),

    /// The counter hardware of `cpu` cannot schedule `event`.
    #[error("event {event:?} is not supported on cpu {cpu}")]
    HardwareUnsupportedEvent { event: EventName, cpu: CpuId },

    /// There are not enough counter slots on `cpu` for `requested` events.
    #[error("not enough counters on cpu {cpu} for {requested} events")]
    ResourceExhausted { cpu: CpuId, requested: usize },

    /// The requested CPU does not exist or is offline.
    #[error("cpu {0} does not exist or is offline")]
    InvalidCpu(CpuId),

    /// A lifecycle operation was called out of order.
    #[error(transparent)]
    Lifecycle(LifecycleError),

    /// Reading or writing measurement data failed.
    #[error("i/o error: {0}")]
    Io(String),

    /// Persisted records do not form complete iterations.
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Rate operands have different lengths.
    #[error("dimension mismatch: {dividend} dividends, {divisor} divisors")]
    DimensionMismatch { dividend: usize, divisor: usize },

    /// The caller does not have the permissions required to count events
    /// system-wide on a CPU.
    #[error("forbidden: insufficient privileges to access the counters")]
    Forbidden,

    /// Counter access is not implemented on this platform.
    #[error("performance counters are not supported on this platform")]
    Unsupported,

    /// An unknown error
    #[error("unknown error")]
    Unknown,
}

/// Problems with the event list.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum ConfigurationError {
    #[error("no events listed")]
    Empty,

    #[error("cannot read {0}")]
    Unreadable(String),

    #[error("event {0:?} listed more than once")]
    Duplicate(EventName),

    #[error("no cpus to measure")]
    NoCpus,
}

/// State machine violations, for both a single [`CounterBinding`] and a
/// whole [`MeasurementSession`].
///
/// [`CounterBinding`]: crate::CounterBinding
/// [`MeasurementSession`]: crate::MeasurementSession
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum LifecycleError {
    #[error("counters on cpu {0} are already counting")]
    AlreadyCounting(CpuId),

    #[error("counters on cpu {0} are not counting")]
    NotCounting(CpuId),

    #[error("counters on cpu {0} have been released")]
    Released(CpuId),

    #[error("cannot {attempted} a session that is {from}")]
    InvalidTransition {
        from: SessionState,
        attempted: Operation,
    },

    #[error("counters failed to start on cpus {0:?}")]
    PartialStart(Vec<CpuId>),
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self.cause {
            None => None,
            Some(ref b) => Some(b.as_ref()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.cause {
            Some(ref cause) => write!(f, "{}: {}", self.kind, cause),
            None => write!(f, "{}", self.kind),
        }
    }
}

#[doc(hidden)]
impl PartialEq for Error {
    fn eq(&self, other: &Error) -> bool {
        self.kind == other.kind
    }
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Consume the error, returning its kind.
    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        new_error(kind)
    }
}

impl From<ConfigurationError> for Error {
    fn from(e: ConfigurationError) -> Self {
        new_error(ErrorKind::Configuration(e))
    }
}

impl From<LifecycleError> for Error {
    fn from(e: LifecycleError) -> Self {
        new_error(ErrorKind::Lifecycle(e))
    }
}

#[allow(dead_code)]
pub(crate) fn new_os_error(kind: ErrorKind) -> Error {
    // Get the last OS error to reference as the cause
    Error {
        kind,
        cause: Some(Box::new(io::Error::last_os_error())),
    }
}

pub(crate) fn new_error(kind: ErrorKind) -> Error {
    Error { kind, cause: None }
}

#[allow(dead_code)]
pub(crate) fn new_error_with_cause(
    kind: ErrorKind,
    cause: impl error::Error + Send + Sync + 'static,
) -> Error {
    Error {
        kind,
        cause: Some(Box::new(cause)),
    }
}

pub(crate) fn new_io_error(context: impl Into<String>, cause: io::Error) -> Error {
    Error {
        kind: ErrorKind::Io(context.into()),
        cause: Some(Box::new(cause)),
    }
}
