use std::fmt;

use thiserror::Error;

use crate::session::SessionError;
use crate::ThreadId;

/// Classification carried by every [`DebugError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    /// Communication or protocol failure talking to the remote VM.
    TargetRequestFailed,
    /// The operation needs a suspended thread.
    ThreadNotSuspended,
    /// An invocation or evaluation is already running in this thread.
    NestedInvocation,
    IncompatibleThreadState,
    SuspendTimeout,
    InvalidStackFrame,
    Unsupported,
    /// A local precondition failed.
    RequestFailed,
    Cancelled,
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::TargetRequestFailed => "target request failed",
            StatusCode::ThreadNotSuspended => "thread not suspended",
            StatusCode::NestedInvocation => "nested invocation",
            StatusCode::IncompatibleThreadState => "incompatible thread state",
            StatusCode::SuspendTimeout => "suspend timeout",
            StatusCode::InvalidStackFrame => "invalid stack frame",
            StatusCode::Unsupported => "unsupported",
            StatusCode::RequestFailed => "request failed",
            StatusCode::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct DebugError {
    pub code: StatusCode,
    pub message: String,
    #[source]
    pub source: Option<SessionError>,
}

pub type DebugResult<T> = Result<T, DebugError>;

impl DebugError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// Wraps a session failure, classifying it by what the VM reported.
    pub fn target_request_failed(message: impl Into<String>, source: SessionError) -> Self {
        let code = match &source {
            SessionError::IncompatibleThreadState => StatusCode::IncompatibleThreadState,
            SessionError::InvalidStackFrame => StatusCode::InvalidStackFrame,
            SessionError::Unsupported => StatusCode::Unsupported,
            _ => StatusCode::TargetRequestFailed,
        };
        Self {
            code,
            message: format!("{}: {source}", message.into()),
            source: Some(source),
        }
    }

    pub fn request_failed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::RequestFailed, message)
    }

    pub fn thread_not_suspended() -> Self {
        Self::new(StatusCode::ThreadNotSuspended, "thread is not suspended")
    }

    pub fn is(&self, code: StatusCode) -> bool {
        self.code == code
    }

    pub fn is_disconnect(&self) -> bool {
        self.source.as_ref().is_some_and(SessionError::is_disconnect)
    }
}

/// A recoverable condition reported outside the normal `Result` path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: StatusCode,
    pub message: String,
}

/// Receives recoverable conditions such as a suspend that never confirmed.
pub trait StatusHandler: Send + Sync {
    fn handle_status(&self, thread: ThreadId, status: &Status);
}

/// Default handler: writes the status to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStatusHandler;

impl StatusHandler for LogStatusHandler {
    fn handle_status(&self, thread: ThreadId, status: &Status) {
        tracing::warn!(
            target: "jdi.model",
            thread,
            code = %status.code,
            "{}",
            status.message
        );
    }
}
