use thiserror::Error;

pub type ObjectId = u64;
pub type ThreadId = ObjectId;
pub type ThreadGroupId = ObjectId;
pub type ReferenceTypeId = u64;
pub type MethodId = u64;
pub type FieldId = u64;
pub type FrameId = u64;
pub type RequestId = i32;

/// Size of the fixed JDWP packet header (length, id, flags, command/error code).
pub const JDWP_HEADER_LEN: usize = 11;

/// Upper bound for a single packet read from the wire.
///
/// Real VMs never send anything close to this; the bound keeps a corrupt length
/// prefix from triggering a huge allocation.
pub const MAX_JDWP_PACKET_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum JdwpError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timed out waiting for a JDWP reply")]
    Timeout,
    #[error("request cancelled")]
    Cancelled,
    #[error("JDWP connection closed")]
    ConnectionClosed,
    #[error("VM returned error code {0}")]
    VmError(u16),
}

impl JdwpError {
    /// Whether the error means the debuggee is gone (as opposed to a failed request).
    pub fn is_disconnect(&self) -> bool {
        match self {
            JdwpError::ConnectionClosed | JdwpError::Cancelled | JdwpError::Io(_) => true,
            JdwpError::VmError(code) => *code == error_code::VM_DEAD,
            JdwpError::Protocol(_) | JdwpError::Timeout => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, JdwpError>;

/// JDWP error constants returned in reply headers.
pub mod error_code {
    pub const INVALID_THREAD: u16 = 10;
    pub const THREAD_NOT_SUSPENDED: u16 = 13;
    pub const THREAD_SUSPENDED: u16 = 14;
    pub const INVALID_OBJECT: u16 = 20;
    pub const INVALID_METHODID: u16 = 23;
    pub const INVALID_FRAMEID: u16 = 30;
    pub const NO_MORE_FRAMES: u16 = 31;
    pub const OPAQUE_FRAME: u16 = 32;
    pub const NOT_FOUND: u16 = 41;
    pub const NOT_IMPLEMENTED: u16 = 99;
    pub const ABSENT_INFORMATION: u16 = 101;
    pub const VM_DEAD: u16 = 112;
}

pub mod event_kind {
    pub const SINGLE_STEP: u8 = 1;
    pub const BREAKPOINT: u8 = 2;
    pub const THREAD_START: u8 = 6;
    pub const THREAD_DEATH: u8 = 7;
    pub const VM_START: u8 = 90;
    pub const VM_DEATH: u8 = 99;
}

pub mod suspend_policy {
    pub const NONE: u8 = 0;
    pub const EVENT_THREAD: u8 = 1;
    pub const ALL: u8 = 2;
}

pub mod step_size {
    pub const MIN: u32 = 0;
    pub const LINE: u32 = 1;
}

pub mod step_depth {
    pub const INTO: u32 = 0;
    pub const OVER: u32 = 1;
    pub const OUT: u32 = 2;
}

pub mod invoke_options {
    pub const SINGLE_THREADED: u32 = 0x01;
    pub const NONVIRTUAL: u32 = 0x02;
}

/// `suspendStatus` bit reported by ThreadReference.Status.
pub const SUSPEND_STATUS_SUSPENDED: i32 = 0x1;

/// Access flag marking compiler-generated methods.
pub const ACC_SYNTHETIC: u32 = 0x1000;
pub const ACC_STATIC: u32 = 0x0008;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JdwpIdSizes {
    pub field_id: usize,
    pub method_id: usize,
    pub object_id: usize,
    pub reference_type_id: usize,
    pub frame_id: usize,
}

impl Default for JdwpIdSizes {
    fn default() -> Self {
        Self {
            field_id: 8,
            method_id: 8,
            object_id: 8,
            reference_type_id: 8,
            frame_id: 8,
        }
    }
}

/// Subset of VirtualMachine.CapabilitiesNew the thread model cares about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JdwpCapabilities {
    pub can_get_synthetic_attribute: bool,
    pub can_get_owned_monitor_info: bool,
    pub can_get_current_contended_monitor: bool,
    pub can_pop_frames: bool,
    pub can_force_early_return: bool,
}

impl JdwpCapabilities {
    pub fn from_flags(flags: &[bool]) -> Self {
        let flag = |idx: usize| flags.get(idx).copied().unwrap_or(false);
        Self {
            can_get_synthetic_attribute: flag(3),
            can_get_owned_monitor_info: flag(4),
            can_get_current_contended_monitor: flag(5),
            can_pop_frames: flag(10),
            can_force_early_return: flag(20),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    pub type_tag: u8,
    pub class_id: ReferenceTypeId,
    pub method_id: MethodId,
    pub index: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JdwpValue {
    Boolean(bool),
    Byte(i8),
    Char(u16),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object { tag: u8, id: ObjectId },
    Void,
}

impl JdwpValue {
    pub fn tag(&self) -> u8 {
        match *self {
            JdwpValue::Boolean(_) => b'Z',
            JdwpValue::Byte(_) => b'B',
            JdwpValue::Char(_) => b'C',
            JdwpValue::Short(_) => b'S',
            JdwpValue::Int(_) => b'I',
            JdwpValue::Long(_) => b'J',
            JdwpValue::Float(_) => b'F',
            JdwpValue::Double(_) => b'D',
            JdwpValue::Object { tag, .. } => tag,
            JdwpValue::Void => b'V',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub frame_id: FrameId,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassInfo {
    pub ref_type_tag: u8,
    pub type_id: ReferenceTypeId,
    pub signature: String,
    pub status: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodInfo {
    pub method_id: MethodId,
    pub name: String,
    pub signature: String,
    pub mod_bits: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub field_id: FieldId,
    pub name: String,
    pub signature: String,
    pub mod_bits: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTableEntry {
    pub code_index: u64,
    pub line: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineTable {
    pub start: u64,
    pub end: u64,
    pub lines: Vec<LineTableEntry>,
}

impl LineTable {
    /// Line of the closest entry at or before `index`.
    pub fn line_for(&self, index: u64) -> Option<i32> {
        self.lines
            .iter()
            .filter(|entry| entry.code_index <= index)
            .max_by_key(|entry| entry.code_index)
            .map(|entry| entry.line)
    }

    /// Lowest code index mapped to `line`.
    pub fn first_index_of(&self, line: i32) -> Option<u64> {
        self.lines
            .iter()
            .filter(|entry| entry.line == line)
            .map(|entry| entry.code_index)
            .min()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableInfo {
    pub code_index: u64,
    pub name: String,
    pub signature: String,
    pub length: u32,
    pub slot: u32,
}

impl VariableInfo {
    pub fn in_scope(&self, index: u64) -> bool {
        index >= self.code_index && index < self.code_index + u64::from(self.length)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadStatus {
    pub thread_status: i32,
    pub suspend_status: i32,
}

impl ThreadStatus {
    pub fn is_suspended(&self) -> bool {
        self.suspend_status & SUSPEND_STATUS_SUSPENDED != 0
    }
}

/// Reply of the invoke commands: the value plus the thrown exception, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeReply {
    pub value: JdwpValue,
    pub exception: Option<ObjectId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JdwpEvent {
    SingleStep {
        request_id: RequestId,
        thread: ThreadId,
        location: Location,
    },
    Breakpoint {
        request_id: RequestId,
        thread: ThreadId,
        location: Location,
    },
    ThreadStart {
        request_id: RequestId,
        thread: ThreadId,
    },
    ThreadDeath {
        request_id: RequestId,
        thread: ThreadId,
    },
    VmStart {
        request_id: RequestId,
        thread: ThreadId,
    },
    VmDeath,
}

/// One composite event packet. The VM suspended according to `suspend_policy`
/// once for all of `events`.
#[derive(Debug, Clone, PartialEq)]
pub struct JdwpEventSet {
    pub suspend_policy: u8,
    pub events: Vec<JdwpEvent>,
}
