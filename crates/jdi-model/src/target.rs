//! The debug target: thread registry, breakpoints and VM event dispatch.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use jdi_config::{DebuggerConfig, TimeoutConfig};

use crate::breakpoint::{collective_vote, BreakpointListener, JavaBreakpoint};
use crate::element::{DebugElement, DebugEvent, ElementRef, EventBus, EventDetail};
use crate::error::{DebugError, DebugResult, LogStatusHandler, StatusHandler};
use crate::filter::StepFilters;
use crate::frame::StackFrame;
use crate::session::{BreakpointRequest, EventRequestKind, Location, SuspendPolicy, VmEvent, VmEventSet, VmSession};
use crate::thread::{EventDisposition, JdiThread};
use crate::{RequestId, ThreadId};

/// Exit code used when the debugger terminates the VM.
const TERMINATE_EXIT_CODE: i32 = 1;

#[derive(Debug, Default)]
struct TargetState {
    suspended: bool,
    disconnected: bool,
    performing_hot_code_replace: bool,
    hot_code_replace_failed: bool,
    out_of_sync_types: HashSet<String>,
    active_invocations: usize,
    saved_request_timeout: Option<Duration>,
}

pub struct DebugTarget<S: VmSession> {
    session: Arc<S>,
    element: DebugElement,
    bus: EventBus,
    config: DebuggerConfig,
    status_handler: Arc<dyn StatusHandler>,
    threads: RwLock<Vec<Arc<JdiThread<S>>>>,
    breakpoints: RwLock<HashMap<RequestId, Arc<JavaBreakpoint>>>,
    breakpoint_listeners: RwLock<Vec<Arc<dyn BreakpointListener>>>,
    step_listeners: Mutex<HashMap<RequestId, ThreadId>>,
    step_filters: RwLock<Arc<StepFilters>>,
    state: Mutex<TargetState>,
    shutdown: CancellationToken,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl<S: VmSession> DebugTarget<S> {
    /// Builds the model for an attached VM and starts dispatching its events.
    pub async fn attach(session: Arc<S>, config: &DebuggerConfig) -> DebugResult<Arc<Self>> {
        Self::attach_with_status_handler(session, config, Arc::new(LogStatusHandler)).await
    }

    pub async fn attach_with_status_handler(
        session: Arc<S>,
        config: &DebuggerConfig,
        status_handler: Arc<dyn StatusHandler>,
    ) -> DebugResult<Arc<Self>> {
        // Subscribe first so no thread start slips between enumeration and dispatch.
        let events = session.subscribe();
        let bus = EventBus::default();
        let target = Arc::new(Self {
            session: session.clone(),
            element: DebugElement::new(ElementRef::Target, bus.clone()),
            bus,
            config: config.clone(),
            status_handler,
            threads: RwLock::new(Vec::new()),
            breakpoints: RwLock::new(HashMap::new()),
            breakpoint_listeners: RwLock::new(Vec::new()),
            step_listeners: Mutex::new(HashMap::new()),
            step_filters: RwLock::new(Arc::new(StepFilters::from_config(&config.step_filters))),
            state: Mutex::new(TargetState::default()),
            shutdown: CancellationToken::new(),
            dispatcher: Mutex::new(None),
        });

        let ids = session
            .all_threads()
            .await
            .map_err(|err| DebugError::target_request_failed("listing threads", err))?;
        for id in ids {
            target.add_thread(id).await;
        }

        let handle = tokio::spawn(dispatch_events(
            Arc::downgrade(&target),
            events,
            target.shutdown.clone(),
        ));
        *target.dispatcher.lock() = Some(handle);

        tracing::info!(target: "jdi.model", threads = target.threads.read().len(), "attached to VM");
        target.element.fire_create();
        Ok(target)
    }

    pub fn session(&self) -> &Arc<S> {
        &self.session
    }

    pub fn element(&self) -> &DebugElement {
        &self.element
    }

    pub(crate) fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DebugEvent> {
        self.bus.subscribe()
    }

    pub(crate) fn timeouts(&self) -> &TimeoutConfig {
        &self.config.timeouts
    }

    /// Lifts the session's request timeout until every returned lease is dropped.
    ///
    /// The first lease saves the timeout in force and the last one puts it back,
    /// so invocations overlapping across threads restore the original value.
    pub(crate) fn lift_request_timeout(self: &Arc<Self>) -> RequestTimeoutLease<S> {
        let mut state = self.state.lock();
        state.active_invocations += 1;
        if state.active_invocations == 1 {
            state.saved_request_timeout = self.session.set_request_timeout(None);
        }
        RequestTimeoutLease { target: self.clone() }
    }

    pub(crate) fn status_handler(&self) -> Arc<dyn StatusHandler> {
        self.status_handler.clone()
    }

    pub fn threads(&self) -> Vec<Arc<JdiThread<S>>> {
        self.threads.read().clone()
    }

    pub fn thread(&self, id: ThreadId) -> Option<Arc<JdiThread<S>>> {
        self.threads.read().iter().find(|thread| thread.id() == id).cloned()
    }

    async fn add_thread(self: &Arc<Self>, id: ThreadId) -> Arc<JdiThread<S>> {
        if let Some(existing) = self.thread(id) {
            return existing;
        }
        let thread = JdiThread::create(self, id).await;
        {
            let mut threads = self.threads.write();
            if let Some(existing) = threads.iter().find(|thread| thread.id() == id) {
                return existing.clone();
            }
            threads.push(thread.clone());
        }
        tracing::debug!(target: "jdi.model", thread = id, system = thread.is_system_thread(), "thread added");
        thread.element().fire_create();
        thread
    }

    fn remove_thread(&self, id: ThreadId) -> Option<Arc<JdiThread<S>>> {
        let mut threads = self.threads.write();
        let index = threads.iter().position(|thread| thread.id() == id)?;
        Some(threads.remove(index))
    }

    // -- VM-wide state --

    pub fn is_suspended(&self) -> bool {
        self.state.lock().suspended
    }

    pub fn is_disconnected(&self) -> bool {
        self.state.lock().disconnected
    }

    pub fn can_pop_frames(&self) -> bool {
        self.session.can_pop_frames()
    }

    pub async fn suspend(&self) -> DebugResult<()> {
        self.session
            .suspend_vm()
            .await
            .map_err(|err| DebugError::target_request_failed("suspending VM", err))?;
        self.state.lock().suspended = true;
        for thread in self.threads() {
            thread.suspended_by_vm();
        }
        self.element.fire_suspend(EventDetail::ClientRequest);
        Ok(())
    }

    pub async fn resume(&self) -> DebugResult<()> {
        self.state.lock().suspended = false;
        for thread in self.threads() {
            thread.resumed_by_vm();
        }
        self.element.fire_resume(EventDetail::ClientRequest);
        self.session
            .resume_vm()
            .await
            .map_err(|err| DebugError::target_request_failed("resuming VM", err))
    }

    pub fn can_terminate(&self) -> bool {
        self.config.connect.allow_terminate && !self.is_disconnected()
    }

    pub async fn terminate(&self) -> DebugResult<()> {
        if !self.can_terminate() {
            return Err(DebugError::request_failed("terminating the VM is not allowed"));
        }
        match self.session.exit_vm(TERMINATE_EXIT_CODE).await {
            Ok(()) => {}
            Err(err) if err.is_disconnect() => {}
            Err(err) => return Err(DebugError::target_request_failed("terminating VM", err)),
        }
        self.disconnected();
        Ok(())
    }

    /// The connection is gone: every thread terminates and dispatch stops.
    pub fn disconnected(&self) {
        {
            let mut state = self.state.lock();
            if state.disconnected {
                return;
            }
            state.disconnected = true;
        }
        tracing::info!(target: "jdi.model", "VM disconnected");
        for thread in self.threads() {
            thread.disconnected();
        }
        self.step_listeners.lock().clear();
        self.shutdown.cancel();
        self.element.fire_terminate();
    }

    /// Stops event dispatch without touching the VM.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // -- step filters --

    /// The snapshot new steps use.
    pub fn step_filters(&self) -> Arc<StepFilters> {
        self.step_filters.read().clone()
    }

    pub fn set_step_filters(&self, filters: StepFilters) {
        *self.step_filters.write() = Arc::new(filters);
    }

    pub(crate) fn add_step_listener(&self, request: RequestId, thread: ThreadId) {
        self.step_listeners.lock().insert(request, thread);
    }

    pub(crate) fn remove_step_listener(&self, request: RequestId) {
        self.step_listeners.lock().remove(&request);
    }

    // -- breakpoints --

    pub async fn install_breakpoint(
        &self,
        type_name: &str,
        line: i32,
        suspend_policy: SuspendPolicy,
    ) -> DebugResult<Arc<JavaBreakpoint>> {
        let request = self
            .session
            .create_breakpoint_request(BreakpointRequest {
                type_name: type_name.to_owned(),
                line,
                suspend_policy,
            })
            .await
            .map_err(|err| DebugError::target_request_failed("installing breakpoint", err))?;
        let breakpoint = Arc::new(JavaBreakpoint::new(request, type_name.to_owned(), line, suspend_policy));
        self.breakpoints.write().insert(request, breakpoint.clone());
        tracing::debug!(target: "jdi.model", request, type_name, line, "breakpoint installed");
        Ok(breakpoint)
    }

    pub async fn remove_breakpoint(&self, breakpoint: &Arc<JavaBreakpoint>) -> DebugResult<()> {
        self.breakpoints.write().remove(&breakpoint.request());
        for thread in self.threads() {
            thread.remove_current_breakpoint(breakpoint);
        }
        self.session
            .delete_event_request(EventRequestKind::Breakpoint, breakpoint.request())
            .await
            .map_err(|err| DebugError::target_request_failed("removing breakpoint", err))
    }

    pub fn breakpoints(&self) -> Vec<Arc<JavaBreakpoint>> {
        self.breakpoints.read().values().cloned().collect()
    }

    pub fn add_breakpoint_listener(&self, listener: Arc<dyn BreakpointListener>) {
        self.breakpoint_listeners.write().push(listener);
    }

    pub fn remove_breakpoint_listener(&self, listener: &Arc<dyn BreakpointListener>) {
        self.breakpoint_listeners
            .write()
            .retain(|current| !Arc::ptr_eq(current, listener));
    }

    pub(crate) fn breakpoint_vote(&self, thread: ThreadId, breakpoint: &JavaBreakpoint) -> bool {
        let listeners = self.breakpoint_listeners.read().clone();
        collective_vote(&listeners, thread, breakpoint)
    }

    /// A VM-wide breakpoint suspended everything; mark all threads suspended before voting.
    pub(crate) fn prepare_to_suspend_by_breakpoint(&self, _breakpoint: &JavaBreakpoint) {
        self.state.lock().suspended = true;
        for thread in self.threads() {
            thread.suspended_by_vm();
        }
    }

    pub(crate) fn suspended_by_breakpoint(&self, _breakpoint: &JavaBreakpoint, queue_event: bool) {
        if queue_event {
            self.element.queue_suspend(EventDetail::Breakpoint);
        } else {
            self.element.fire_suspend(EventDetail::Breakpoint);
        }
    }

    /// The voters vetoed a VM-wide suspension: undo [`Self::prepare_to_suspend_by_breakpoint`].
    ///
    /// The VM itself is resumed once the whole event set has been handled.
    pub(crate) fn cancel_suspend_by_breakpoint(&self, _breakpoint: &JavaBreakpoint) {
        self.state.lock().suspended = false;
        for thread in self.threads() {
            thread.resumed_by_vm();
        }
    }

    // -- hot code replace --

    pub fn set_performing_hot_code_replace(&self, performing: bool) {
        self.state.lock().performing_hot_code_replace = performing;
    }

    pub fn is_performing_hot_code_replace(&self) -> bool {
        self.state.lock().performing_hot_code_replace
    }

    /// Records types whose replacement failed; frames running them are out of sync.
    pub fn record_hot_code_replace_failure<I>(&self, types: I)
    where
        I: IntoIterator<Item = String>,
    {
        let mut state = self.state.lock();
        state.hot_code_replace_failed = true;
        state.out_of_sync_types.extend(types);
    }

    pub fn has_hot_code_replace_failed(&self) -> bool {
        self.state.lock().hot_code_replace_failed
    }

    pub fn is_out_of_sync_type(&self, type_name: &str) -> bool {
        self.state.lock().out_of_sync_types.contains(type_name)
    }

    pub fn is_frame_out_of_sync(&self, frame: &StackFrame) -> bool {
        frame.is_out_of_sync(&self.state.lock().out_of_sync_types)
    }

    // -- event dispatch --

    /// Handles every event of `set`, then resumes what the VM suspended for it
    /// unless one of the events left its thread suspended.
    async fn handle_event_set(self: &Arc<Self>, set: VmEventSet) {
        let policy = set.suspend_policy;
        let suspended_thread = set.thread();
        let mut stay_suspended = false;
        for event in set.events {
            if self.handle_vm_event(event).await == EventDisposition::StaySuspended {
                stay_suspended = true;
            }
        }

        if !stay_suspended && !self.is_disconnected() {
            match (policy, suspended_thread) {
                (Some(SuspendPolicy::Vm), _) => self.resume_remote_vm().await,
                (Some(SuspendPolicy::Thread), Some(thread)) => self.resume_remote_thread(thread).await,
                (Some(SuspendPolicy::Thread), None) => {
                    tracing::warn!(target: "jdi.model", "suspending event set without a thread");
                }
                (None, _) => {}
            }
        }
        self.bus.flush();
    }

    async fn handle_vm_event(self: &Arc<Self>, event: VmEvent) -> EventDisposition {
        match event {
            VmEvent::Step {
                request,
                thread,
                location,
            } => self.handle_step(request, thread, location).await,
            VmEvent::Breakpoint {
                request,
                thread,
                location,
            } => self.handle_breakpoint(request, thread, location).await,
            VmEvent::ThreadStart { thread } => {
                self.add_thread(thread).await;
                EventDisposition::Resume
            }
            VmEvent::ThreadDeath { thread } => {
                self.step_listeners.lock().retain(|_, owner| *owner != thread);
                if let Some(thread) = self.remove_thread(thread) {
                    tracing::debug!(target: "jdi.model", thread = thread.id(), "thread died");
                    thread.terminated();
                }
                EventDisposition::Resume
            }
            VmEvent::VmDeath | VmEvent::Disconnected => {
                self.disconnected();
                EventDisposition::Resume
            }
        }
    }

    async fn handle_step(&self, request: RequestId, thread: ThreadId, location: Location) -> EventDisposition {
        let owner = self.step_listeners.lock().get(&request).copied();
        match owner.and_then(|owner| self.thread(owner)) {
            Some(owner) => owner.handle_step_event(request, location).await,
            None => {
                tracing::debug!(target: "jdi.model", thread, request, "step event without listener");
                EventDisposition::Resume
            }
        }
    }

    async fn handle_breakpoint(
        self: &Arc<Self>,
        request: RequestId,
        thread: ThreadId,
        location: Location,
    ) -> EventDisposition {
        let breakpoint = self.breakpoints.read().get(&request).cloned();
        let Some(breakpoint) = breakpoint else {
            tracing::debug!(target: "jdi.model", thread, request, "breakpoint event for unknown request");
            return EventDisposition::Resume;
        };
        breakpoint.record_hit();
        let thread = self.add_thread(thread).await;

        if !thread.honors_breakpoints() {
            tracing::trace!(
                target: "jdi.model",
                thread = thread.id(),
                request,
                line = ?location.line,
                "breakpoint ignored during evaluation"
            );
            return EventDisposition::Resume;
        }

        if thread.handle_suspend_for_breakpoint(&breakpoint, true).await {
            EventDisposition::StaySuspended
        } else {
            EventDisposition::Resume
        }
    }

    async fn resume_remote_vm(&self) {
        match self.session.resume_vm().await {
            Ok(()) => {}
            Err(err) if err.is_disconnect() => self.disconnected(),
            Err(err) => {
                tracing::warn!(target: "jdi.model", error = %err, "failed to resume VM");
            }
        }
    }

    async fn resume_remote_thread(&self, thread: ThreadId) {
        match self.session.resume_thread(thread).await {
            Ok(()) => {}
            Err(err) if err.is_disconnect() => self.disconnected(),
            Err(err) => {
                tracing::warn!(target: "jdi.model", thread, error = %err, "failed to resume thread");
            }
        }
    }
}

async fn dispatch_events<S: VmSession>(
    target: Weak<DebugTarget<S>>,
    mut events: broadcast::Receiver<VmEventSet>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => return,
            event = events.recv() => event,
        };
        let set = match event {
            Ok(set) => set,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(target: "jdi.model", skipped, "VM event stream lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => VmEvent::Disconnected.into(),
        };
        let Some(target) = target.upgrade() else {
            return;
        };
        let last = set.is_final();
        target.handle_event_set(set).await;
        if last {
            return;
        }
    }
}

/// Holds the request timeout lifted; see [`DebugTarget::lift_request_timeout`].
pub(crate) struct RequestTimeoutLease<S: VmSession> {
    target: Arc<DebugTarget<S>>,
}

impl<S: VmSession> Drop for RequestTimeoutLease<S> {
    fn drop(&mut self) {
        let mut state = self.target.state.lock();
        state.active_invocations = state.active_invocations.saturating_sub(1);
        if state.active_invocations == 0 {
            let restore = state.saved_request_timeout.take();
            self.target.session.set_request_timeout(restore);
        }
    }
}

impl<S: VmSession> Drop for DebugTarget<S> {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.dispatcher.get_mut().take() {
            handle.abort();
        }
    }
}
