//! The boundary between the thread model and a live debuggee.
//!
//! [`VmSession`] is the only way the model talks to the remote VM. The wire
//! implementation lives in [`crate::wire_session`]; tests use
//! [`crate::mock::MockVm`].

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;

use jdi_wire::types::{error_code, ACC_STATIC, ACC_SYNTHETIC};

pub use jdi_wire::JdwpValue as Value;
use jdi_wire::JdwpError;

use crate::{FrameId, MethodId, ObjectId, ReferenceTypeId, RequestId, ThreadGroupId, ThreadId};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("VM disconnected")]
    Disconnected,
    #[error("thread is not in a compatible state")]
    IncompatibleThreadState,
    #[error("invalid stack frame")]
    InvalidStackFrame,
    #[error("object has been collected")]
    ObjectCollected,
    #[error("operation not supported by the target VM")]
    Unsupported,
    #[error("request timed out")]
    Timeout,
    #[error("invocation threw exception object {0}")]
    Exception(ObjectId),
    #[error("VM error code {0}")]
    Vm(u16),
    #[error("{0}")]
    Protocol(String),
}

impl SessionError {
    pub fn is_disconnect(&self) -> bool {
        matches!(self, SessionError::Disconnected)
    }
}

impl From<JdwpError> for SessionError {
    fn from(err: JdwpError) -> Self {
        if err.is_disconnect() {
            return SessionError::Disconnected;
        }
        match err {
            JdwpError::Timeout => SessionError::Timeout,
            JdwpError::VmError(code) => match code {
                error_code::THREAD_NOT_SUSPENDED | error_code::THREAD_SUSPENDED => {
                    SessionError::IncompatibleThreadState
                }
                error_code::INVALID_FRAMEID | error_code::NO_MORE_FRAMES | error_code::OPAQUE_FRAME => {
                    SessionError::InvalidStackFrame
                }
                error_code::INVALID_OBJECT => SessionError::ObjectCollected,
                error_code::NOT_IMPLEMENTED => SessionError::Unsupported,
                other => SessionError::Vm(other),
            },
            other => SessionError::Protocol(other.to_string()),
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Identifies a method independently of any frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodRef {
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Method {
    pub id: MethodRef,
    pub name: String,
    /// Fully qualified name of the declaring type, e.g. `java.lang.String`.
    pub declaring_type: String,
    pub signature: String,
    pub modifiers: u32,
}

impl Method {
    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }

    pub fn is_static_initializer(&self) -> bool {
        self.name == "<clinit>"
    }

    pub fn is_synthetic(&self) -> bool {
        self.modifiers & ACC_SYNTHETIC != 0
    }

    pub fn is_static(&self) -> bool {
        self.modifiers & ACC_STATIC != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub method: Method,
    pub code_index: u64,
    /// `None` when the class has no line information.
    pub line: Option<i32>,
}

impl Location {
    /// Same method and same line; the code index may differ.
    pub fn same_line_as(&self, other: &Location) -> bool {
        self.method.id == other.method.id && self.line == other.line
    }
}

/// A frame as the VM reports it right now. Only valid while the thread stays suspended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFrame {
    pub id: FrameId,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    pub signature: String,
    pub value: Value,
}

/// Receiver of an invocation: a class for static dispatch or an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Receiver {
    Class(ReferenceTypeId),
    Object {
        object: ObjectId,
        class: ReferenceTypeId,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvokeOptions {
    pub single_threaded: bool,
    /// Dispatch to exactly the named method, skipping overrides (`super.m()`).
    pub nonvirtual: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepDepth {
    Into,
    Over,
    Out,
    /// Re-enter the current frame from its start. Used to finish a simulated frame drop.
    Reenter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SuspendPolicy {
    Thread,
    Vm,
}

/// A line-granularity step request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepRequest {
    pub thread: ThreadId,
    pub depth: StepDepth,
    /// Report only the n-th event.
    pub count: Option<u32>,
    /// Class patterns the VM should step through without reporting.
    pub class_exclusions: Vec<String>,
    pub suspend_policy: SuspendPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointRequest {
    pub type_name: String,
    pub line: i32,
    pub suspend_policy: SuspendPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventRequestKind {
    Step,
    Breakpoint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmEvent {
    Step {
        request: RequestId,
        thread: ThreadId,
        location: Location,
    },
    Breakpoint {
        request: RequestId,
        thread: ThreadId,
        location: Location,
    },
    ThreadStart {
        thread: ThreadId,
    },
    ThreadDeath {
        thread: ThreadId,
    },
    VmDeath,
    Disconnected,
}

impl VmEvent {
    pub fn thread(&self) -> Option<ThreadId> {
        match self {
            VmEvent::Step { thread, .. }
            | VmEvent::Breakpoint { thread, .. }
            | VmEvent::ThreadStart { thread }
            | VmEvent::ThreadDeath { thread } => Some(*thread),
            VmEvent::VmDeath | VmEvent::Disconnected => None,
        }
    }
}

/// Events the VM reported together.
///
/// The VM suspended once for the whole set, so the set is resumed at most
/// once, after every event in it has been handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmEventSet {
    /// `None` when the VM suspended nothing.
    pub suspend_policy: Option<SuspendPolicy>,
    pub events: Vec<VmEvent>,
}

impl VmEventSet {
    pub fn new(suspend_policy: Option<SuspendPolicy>, events: Vec<VmEvent>) -> Self {
        Self { suspend_policy, events }
    }

    /// The thread the VM suspended for an event-thread set.
    pub fn thread(&self) -> Option<ThreadId> {
        self.events.iter().find_map(VmEvent::thread)
    }

    /// Whether the connection is gone after this set.
    pub fn is_final(&self) -> bool {
        self.events
            .iter()
            .any(|event| matches!(event, VmEvent::VmDeath | VmEvent::Disconnected))
    }
}

/// A lone event; step and breakpoint events suspend their thread.
impl From<VmEvent> for VmEventSet {
    fn from(event: VmEvent) -> Self {
        let suspend_policy = match event {
            VmEvent::Step { .. } | VmEvent::Breakpoint { .. } => Some(SuspendPolicy::Thread),
            _ => None,
        };
        Self::new(suspend_policy, vec![event])
    }
}

/// A live connection to the debuggee.
///
/// A [`VmEventSet`] leaves its thread (or the VM, for [`SuspendPolicy::Vm`])
/// suspended until someone resumes it.
pub trait VmSession: Send + Sync + 'static {
    fn all_threads(&self) -> impl Future<Output = SessionResult<Vec<ThreadId>>> + Send;

    fn thread_name(&self, thread: ThreadId) -> impl Future<Output = SessionResult<String>> + Send;

    fn suspend_thread(&self, thread: ThreadId) -> impl Future<Output = SessionResult<()>> + Send;

    fn resume_thread(&self, thread: ThreadId) -> impl Future<Output = SessionResult<()>> + Send;

    fn thread_is_suspended(&self, thread: ThreadId) -> impl Future<Output = SessionResult<bool>> + Send;

    /// Top-first. Fails with [`SessionError::IncompatibleThreadState`] while the thread runs.
    fn frames(&self, thread: ThreadId) -> impl Future<Output = SessionResult<Vec<RemoteFrame>>> + Send;

    fn frame_count(&self, thread: ThreadId) -> impl Future<Output = SessionResult<usize>> + Send;

    fn thread_group(
        &self,
        thread: ThreadId,
    ) -> impl Future<Output = SessionResult<Option<ThreadGroupId>>> + Send;

    fn thread_group_name(&self, group: ThreadGroupId) -> impl Future<Output = SessionResult<String>> + Send;

    fn thread_group_parent(
        &self,
        group: ThreadGroupId,
    ) -> impl Future<Output = SessionResult<Option<ThreadGroupId>>> + Send;

    fn thread_priority(&self, thread: ThreadId) -> impl Future<Output = SessionResult<i32>> + Send;

    fn owned_monitors(&self, _thread: ThreadId) -> impl Future<Output = SessionResult<Vec<ObjectId>>> + Send {
        async { Err(SessionError::Unsupported) }
    }

    fn contended_monitor(
        &self,
        _thread: ThreadId,
    ) -> impl Future<Output = SessionResult<Option<ObjectId>>> + Send {
        async { Err(SessionError::Unsupported) }
    }

    fn create_step_request(&self, request: StepRequest) -> impl Future<Output = SessionResult<RequestId>> + Send;

    fn create_breakpoint_request(
        &self,
        request: BreakpointRequest,
    ) -> impl Future<Output = SessionResult<RequestId>> + Send;

    fn delete_event_request(
        &self,
        kind: EventRequestKind,
        request: RequestId,
    ) -> impl Future<Output = SessionResult<()>> + Send;

    /// A thrown exception is reported as [`SessionError::Exception`].
    fn invoke_method(
        &self,
        thread: ThreadId,
        receiver: Receiver,
        method: MethodRef,
        args: Vec<Value>,
        options: InvokeOptions,
    ) -> impl Future<Output = SessionResult<Value>> + Send;

    fn new_instance(
        &self,
        thread: ThreadId,
        class: ReferenceTypeId,
        constructor: MethodRef,
        args: Vec<Value>,
        options: InvokeOptions,
    ) -> impl Future<Output = SessionResult<Value>> + Send;

    fn can_pop_frames(&self) -> bool {
        false
    }

    /// Pops `frame` and every frame above it.
    fn pop_frames(&self, _thread: ThreadId, _frame: FrameId) -> impl Future<Output = SessionResult<()>> + Send {
        async { Err(SessionError::Unsupported) }
    }

    /// Makes the top frame return immediately once the thread resumes.
    fn force_return(&self, _thread: ThreadId) -> impl Future<Output = SessionResult<()>> + Send {
        async { Err(SessionError::Unsupported) }
    }

    /// Looks up a visible local variable of `frame`.
    fn frame_variable(
        &self,
        thread: ThreadId,
        frame: &RemoteFrame,
        name: &str,
    ) -> impl Future<Output = SessionResult<Option<Variable>>> + Send;

    /// `None` means requests wait forever.
    fn request_timeout(&self) -> Option<Duration>;

    /// Returns the previous timeout.
    fn set_request_timeout(&self, timeout: Option<Duration>) -> Option<Duration>;

    fn suspend_vm(&self) -> impl Future<Output = SessionResult<()>> + Send;

    fn resume_vm(&self) -> impl Future<Output = SessionResult<()>> + Send;

    fn exit_vm(&self, exit_code: i32) -> impl Future<Output = SessionResult<()>> + Send;

    fn subscribe(&self) -> broadcast::Receiver<VmEventSet>;
}
