use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::session::SuspendPolicy;
use crate::{RequestId, ThreadId};

/// A line breakpoint installed in the target.
#[derive(Debug)]
pub struct JavaBreakpoint {
    request: RequestId,
    type_name: String,
    line: i32,
    suspend_policy: SuspendPolicy,
    hit_count: AtomicU64,
}

impl JavaBreakpoint {
    pub(crate) fn new(request: RequestId, type_name: String, line: i32, suspend_policy: SuspendPolicy) -> Self {
        Self {
            request,
            type_name,
            line,
            suspend_policy,
            hit_count: AtomicU64::new(0),
        }
    }

    pub fn request(&self) -> RequestId {
        self.request
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn line(&self) -> i32 {
        self.line
    }

    pub fn suspend_policy(&self) -> SuspendPolicy {
        self.suspend_policy
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    pub(crate) fn record_hit(&self) {
        self.hit_count.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    Suspend,
    DontSuspend,
    DontCare,
}

/// Votes on whether a thread that hit a breakpoint actually stops.
pub trait BreakpointListener: Send + Sync {
    fn breakpoint_hit(&self, thread: ThreadId, breakpoint: &JavaBreakpoint) -> Vote;
}

/// Any `DontSuspend` vetoes; otherwise the thread suspends.
pub(crate) fn collective_vote(
    listeners: &[Arc<dyn BreakpointListener>],
    thread: ThreadId,
    breakpoint: &JavaBreakpoint,
) -> bool {
    let mut suspend = true;
    // Every listener is asked, even after a veto.
    for listener in listeners {
        if listener.breakpoint_hit(thread, breakpoint) == Vote::DontSuspend {
            suspend = false;
        }
    }
    suspend
}
