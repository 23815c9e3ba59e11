//! Thread and stepping model of a Java debugger.
//!
//! [`DebugTarget`] attaches to a VM through a [`VmSession`] and keeps one
//! [`JdiThread`] per remote thread. Threads track suspended/running state,
//! cache [`StackFrame`]s with stable identity across suspensions, and run the
//! step state machine (step into/over/return, step to frame, drop to frame)
//! on top of the VM's single-step requests.

pub mod breakpoint;
pub mod element;
pub mod error;
pub mod filter;
pub mod frame;
pub mod mock;
pub mod session;
pub mod step;
pub mod target;
pub mod thread;
pub mod wire_session;

pub use jdi_wire::{FrameId, MethodId, ObjectId, ReferenceTypeId, RequestId, ThreadGroupId, ThreadId};

pub use breakpoint::{BreakpointListener, JavaBreakpoint, Vote};
pub use element::{DebugElement, DebugEvent, DebugEventKind, ElementRef, EventBus, EventDetail};
pub use error::{DebugError, DebugResult, LogStatusHandler, Status, StatusCode, StatusHandler};
pub use filter::StepFilters;
pub use frame::StackFrame;
pub use session::{
    Location, Method, MethodRef, Receiver, RemoteFrame, SessionError, SessionResult, SuspendPolicy, Value,
    Variable, VmEvent, VmEventSet, VmSession,
};
pub use step::StepKind;
pub use target::DebugTarget;
pub use thread::{JdiThread, SuspendOutcome, SuspendTicket};
pub use wire_session::WireSession;
