//! Stack frame wrappers and the cache merge that keeps their identity stable.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::session::{Location, Method, MethodRef, RemoteFrame};
use crate::{FrameId, ThreadId};

#[derive(Debug, Default)]
struct FrameState {
    remote: Option<RemoteFrame>,
    /// Method of the last remote frame this wrapper was bound to. Survives `preserve`.
    last_method: Option<Method>,
}

/// A stack frame of a suspended thread.
///
/// Wrappers are shared as `Arc` and compared by pointer identity: the same
/// wrapper is handed out for a frame across suspensions as long as the frame
/// at that stack position keeps running the same method.
#[derive(Debug)]
pub struct StackFrame {
    thread: ThreadId,
    state: Mutex<FrameState>,
}

impl StackFrame {
    pub(crate) fn new(thread: ThreadId, remote: Option<RemoteFrame>) -> Arc<Self> {
        let last_method = remote.as_ref().map(|frame| frame.location.method.clone());
        Arc::new(Self {
            thread,
            state: Mutex::new(FrameState { remote, last_method }),
        })
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// A frame is valid while it is bound to a frame of the suspended thread.
    pub fn is_valid(&self) -> bool {
        self.state.lock().remote.is_some()
    }

    pub fn remote(&self) -> Option<RemoteFrame> {
        self.state.lock().remote.clone()
    }

    pub fn frame_id(&self) -> Option<FrameId> {
        self.state.lock().remote.as_ref().map(|frame| frame.id)
    }

    pub fn location(&self) -> Option<Location> {
        self.state.lock().remote.as_ref().map(|frame| frame.location.clone())
    }

    pub fn method(&self) -> Option<Method> {
        self.state
            .lock()
            .remote
            .as_ref()
            .map(|frame| frame.location.method.clone())
    }

    pub fn line_number(&self) -> Option<i32> {
        self.state.lock().remote.as_ref().and_then(|frame| frame.location.line)
    }

    pub fn declaring_type_name(&self) -> Option<String> {
        self.state
            .lock()
            .remote
            .as_ref()
            .map(|frame| frame.location.method.declaring_type.clone())
    }

    /// Whether the frame runs a type whose hot code replace failed.
    pub fn is_out_of_sync(&self, out_of_sync_types: &HashSet<String>) -> bool {
        self.declaring_type_name()
            .is_some_and(|name| out_of_sync_types.contains(&name))
    }

    pub fn last_method(&self) -> Option<MethodRef> {
        self.state.lock().last_method.as_ref().map(|method| method.id)
    }

    pub(crate) fn bind(&self, remote: RemoteFrame) {
        let mut state = self.state.lock();
        state.last_method = Some(remote.location.method.clone());
        state.remote = Some(remote);
    }

    /// Drops the remote frame but remembers its method for the next merge.
    pub(crate) fn unbind(&self) {
        self.state.lock().remote = None;
    }
}

/// Brings `cached` in line with the thread's current `remote` stack (top-first).
///
/// When the top method is unchanged the stack is assumed to have changed at
/// the bottom and wrappers are kept top-down; otherwise they are kept
/// bottom-up. Only the top frame takes part in that decision. Wrappers in the
/// overlap are rebound when their last method still matches and replaced
/// otherwise.
pub(crate) fn merge_frames(thread: ThreadId, cached: &mut Vec<Arc<StackFrame>>, remote: Vec<RemoteFrame>) {
    let top_down = match (cached.first(), remote.first()) {
        (Some(top), Some(current)) => top.last_method() == Some(current.location.method.id),
        _ => false,
    };

    let mut offset = 0;
    if remote.len() > cached.len() {
        let added = remote.len() - cached.len();
        if top_down {
            cached.extend((0..added).map(|_| StackFrame::new(thread, None)));
        } else {
            offset = added;
            let fresh: Vec<_> = remote[..added]
                .iter()
                .map(|frame| StackFrame::new(thread, Some(frame.clone())))
                .collect();
            cached.splice(0..0, fresh);
        }
    } else if remote.len() < cached.len() {
        let removed = cached.len() - remote.len();
        if top_down {
            cached.truncate(remote.len());
        } else {
            cached.drain(..removed);
        }
    }

    for (slot, frame) in cached.iter_mut().zip(remote).skip(offset) {
        if slot.last_method() == Some(frame.location.method.id) {
            slot.bind(frame);
        } else {
            *slot = StackFrame::new(thread, Some(frame));
        }
    }
}

/// Unbinds every wrapper so the next merge re-fetches the stack.
pub(crate) fn preserve_frames(cached: &[Arc<StackFrame>]) {
    for frame in cached {
        frame.unbind();
    }
}
