//! Debug events and the bus that carries them to listeners.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementRef {
    Target,
    Thread(ThreadId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebugEventKind {
    Create,
    Resume,
    Suspend,
    Terminate,
    Change,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventDetail {
    Unspecified,
    ClientRequest,
    StepInto,
    StepOver,
    StepReturn,
    StepEnd,
    Breakpoint,
    /// An evaluation the user did not ask for, e.g. computing a `toString()` for display.
    EvaluationImplicit,
    Evaluation,
    Content,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DebugEvent {
    pub source: ElementRef,
    pub kind: DebugEventKind,
    pub detail: EventDetail,
}

/// Fan-out of [`DebugEvent`]s.
///
/// Events are either fired right away or queued; queued events go out on the
/// next [`EventBus::flush`], which the target calls once the VM event being
/// dispatched has been fully handled.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<DebugEvent>,
    queued: Arc<Mutex<Vec<DebugEvent>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            queued: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DebugEvent> {
        self.sender.subscribe()
    }

    pub fn fire(&self, event: DebugEvent) {
        tracing::trace!(target: "jdi.model", ?event, "debug event");
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }

    pub fn queue(&self, event: DebugEvent) {
        self.queued.lock().push(event);
    }

    /// Fires every queued event in order. Returns how many went out.
    pub fn flush(&self) -> usize {
        let queued = std::mem::take(&mut *self.queued.lock());
        let count = queued.len();
        for event in queued {
            self.fire(event);
        }
        count
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Handle used by a thread or target to publish its own events.
#[derive(Debug, Clone)]
pub struct DebugElement {
    source: ElementRef,
    bus: EventBus,
}

impl DebugElement {
    pub fn new(source: ElementRef, bus: EventBus) -> Self {
        Self { source, bus }
    }

    pub fn source(&self) -> ElementRef {
        self.source
    }

    fn event(&self, kind: DebugEventKind, detail: EventDetail) -> DebugEvent {
        DebugEvent {
            source: self.source,
            kind,
            detail,
        }
    }

    pub fn fire(&self, kind: DebugEventKind, detail: EventDetail) {
        self.bus.fire(self.event(kind, detail));
    }

    pub fn queue(&self, kind: DebugEventKind, detail: EventDetail) {
        self.bus.queue(self.event(kind, detail));
    }

    pub fn fire_create(&self) {
        self.fire(DebugEventKind::Create, EventDetail::Unspecified);
    }

    pub fn fire_resume(&self, detail: EventDetail) {
        self.fire(DebugEventKind::Resume, detail);
    }

    pub fn fire_suspend(&self, detail: EventDetail) {
        self.fire(DebugEventKind::Suspend, detail);
    }

    pub fn queue_suspend(&self, detail: EventDetail) {
        self.queue(DebugEventKind::Suspend, detail);
    }

    pub fn fire_change(&self, detail: EventDetail) {
        self.fire(DebugEventKind::Change, detail);
    }

    pub fn fire_terminate(&self) {
        self.fire(DebugEventKind::Terminate, EventDetail::Unspecified);
    }
}
