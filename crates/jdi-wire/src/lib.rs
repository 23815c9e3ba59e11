//! Wire-level JDWP implementation.
//!
//! Speaks the binary Java Debug Wire Protocol over TCP with `tokio`. Replies
//! are correlated by packet id; VM events are decoded from composite event
//! packets and fanned out on a broadcast channel.

mod client;
mod codec;
mod poison;
pub mod types;

pub use client::{EventModifier, JdwpClient, JdwpClientConfig};
pub use codec::{class_name_to_signature, signature_to_type_name};
pub use types::{
    ClassInfo, FieldId, FieldInfo, FrameId, FrameInfo, InvokeReply, JdwpCapabilities,
    JdwpError, JdwpEvent, JdwpEventSet, JdwpIdSizes, JdwpValue, LineTable, LineTableEntry, Location,
    MethodId, MethodInfo, ObjectId, ReferenceTypeId, RequestId, ThreadGroupId, ThreadId,
    ThreadStatus, VariableInfo,
};

// Compiled for this crate's unit tests and, behind `wire-test-support`, for
// downstream integration suites.
#[cfg(any(test, feature = "wire-test-support"))]
pub mod mock;
