//! Deterministic, in-memory [`VmSession`] for tests.
//!
//! Threads, frames and invocation results are scripted up front. A resume
//! with an armed step request completes the step immediately: the thread
//! suspends again at the next scripted landing (or at a landing derived from
//! the step depth) and a [`VmEvent::Step`] goes out.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};

use crate::session::{
    BreakpointRequest, EventRequestKind, InvokeOptions, Location, Method, MethodRef, Receiver, RemoteFrame,
    SessionError, SessionResult, StepDepth, StepRequest, SuspendPolicy, Value, Variable, VmEvent, VmEventSet, VmSession,
};
use crate::{FrameId, ObjectId, ReferenceTypeId, RequestId, ThreadGroupId, ThreadId};

/// First id handed out for frames the mock creates itself.
const FIRST_SYNTHETIC_FRAME: FrameId = 10_000;

#[derive(Debug, Clone)]
pub struct MockThread {
    pub id: ThreadId,
    pub name: String,
    pub group: Option<ThreadGroupId>,
    pub priority: i32,
    pub suspended: bool,
    /// Top-first.
    pub frames: Vec<RemoteFrame>,
}

impl MockThread {
    pub fn new(id: ThreadId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            group: None,
            priority: 5,
            suspended: false,
            frames: Vec::new(),
        }
    }

    pub fn in_group(mut self, group: ThreadGroupId) -> Self {
        self.group = Some(group);
        self
    }

    /// Suspended with `frames` on its stack.
    pub fn suspended_at(mut self, frames: Vec<RemoteFrame>) -> Self {
        self.suspended = true;
        self.frames = frames;
        self
    }
}

/// Builds a method declared by `declaring_type`; the class id is derived from the method id.
pub fn method(method_id: u64, declaring_type: &str, name: &str) -> Method {
    Method {
        id: MethodRef {
            class_id: method_id / 100,
            method_id,
        },
        name: name.to_owned(),
        declaring_type: declaring_type.to_owned(),
        signature: "()V".to_owned(),
        modifiers: 0,
    }
}

pub fn frame(id: FrameId, method: &Method, line: i32) -> RemoteFrame {
    RemoteFrame {
        id,
        location: Location {
            method: method.clone(),
            code_index: u64::try_from(line).unwrap_or_default(),
            line: Some(line),
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedStepRequest {
    pub id: RequestId,
    pub request: StepRequest,
    pub fired: bool,
    pub deleted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationTarget {
    Method(Receiver),
    NewInstance(ReferenceTypeId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedInvocation {
    pub thread: ThreadId,
    pub target: InvocationTarget,
    pub method: MethodRef,
    pub args: Vec<Value>,
    pub options: InvokeOptions,
    /// The request timeout in force while the call ran.
    pub timeout: Option<Duration>,
}

#[derive(Debug)]
struct MockState {
    threads: Vec<MockThread>,
    groups: HashMap<ThreadGroupId, (String, Option<ThreadGroupId>)>,
    landings: HashMap<ThreadId, VecDeque<Vec<RemoteFrame>>>,
    step_requests: Vec<RecordedStepRequest>,
    breakpoint_requests: Vec<(RequestId, BreakpointRequest)>,
    deleted_requests: Vec<(EventRequestKind, RequestId)>,
    invoke_results: VecDeque<SessionResult<Value>>,
    invocations: Vec<RecordedInvocation>,
    invoke_gate: Option<Arc<Notify>>,
    forced_returns: HashSet<ThreadId>,
    /// Deepest frame removed by a native pop; the next step into re-enters it.
    reentry: HashMap<ThreadId, RemoteFrame>,
    variables: HashMap<(FrameId, String), Variable>,
    owned_monitors: HashMap<ThreadId, Vec<ObjectId>>,
    ignores_suspend: HashSet<ThreadId>,
    /// Threads whose armed steps wait for [`MockVm::complete_deferred_step`].
    deferred_steps: HashSet<ThreadId>,
    resume_failures: VecDeque<SessionError>,
    can_pop_frames: bool,
    group_queries_unsupported: bool,
    timeout: Option<Duration>,
    timeout_history: Vec<Option<Duration>>,
    thread_resumes: Vec<ThreadId>,
    popped_frames: Vec<(ThreadId, FrameId)>,
    vm_suspends: usize,
    vm_resumes: usize,
    exit_code: Option<i32>,
    next_request: RequestId,
    next_frame: FrameId,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            threads: Vec::new(),
            groups: HashMap::new(),
            landings: HashMap::new(),
            step_requests: Vec::new(),
            breakpoint_requests: Vec::new(),
            deleted_requests: Vec::new(),
            invoke_results: VecDeque::new(),
            invocations: Vec::new(),
            invoke_gate: None,
            forced_returns: HashSet::new(),
            reentry: HashMap::new(),
            variables: HashMap::new(),
            owned_monitors: HashMap::new(),
            ignores_suspend: HashSet::new(),
            deferred_steps: HashSet::new(),
            resume_failures: VecDeque::new(),
            can_pop_frames: false,
            group_queries_unsupported: false,
            timeout: Some(Duration::from_secs(3)),
            timeout_history: Vec::new(),
            thread_resumes: Vec::new(),
            popped_frames: Vec::new(),
            vm_suspends: 0,
            vm_resumes: 0,
            exit_code: None,
            next_request: 1,
            next_frame: FIRST_SYNTHETIC_FRAME,
        }
    }
}

impl MockState {
    fn thread_mut(&mut self, thread: ThreadId) -> SessionResult<&mut MockThread> {
        self.threads
            .iter_mut()
            .find(|candidate| candidate.id == thread)
            .ok_or_else(|| SessionError::Protocol(format!("unknown thread {thread}")))
    }

    fn suspended_thread(&self, thread: ThreadId) -> SessionResult<&MockThread> {
        let found = self
            .threads
            .iter()
            .find(|candidate| candidate.id == thread)
            .ok_or_else(|| SessionError::Protocol(format!("unknown thread {thread}")))?;
        if found.suspended {
            Ok(found)
        } else {
            Err(SessionError::IncompatibleThreadState)
        }
    }

    fn allocate_request(&mut self) -> RequestId {
        let id = self.next_request;
        self.next_request += 1;
        id
    }

    /// Completes the newest armed step request of `thread`, if any.
    fn complete_step(&mut self, thread: ThreadId) -> Option<VmEvent> {
        let armed = self
            .step_requests
            .iter_mut()
            .rev()
            .find(|recorded| recorded.request.thread == thread && !recorded.fired && !recorded.deleted)?;
        armed.fired = true;
        let (request, depth) = (armed.id, armed.request.depth);

        let scripted = self.landings.get_mut(&thread).and_then(VecDeque::pop_front);
        let returned = self.forced_returns.remove(&thread);
        let reentry = self.reentry.remove(&thread);
        let next_frame = self.next_frame;
        let mock = self.thread_mut(thread).ok()?;
        mock.suspended = true;

        let mut allocated = false;
        match scripted {
            Some(frames) => mock.frames = frames,
            None => match depth {
                StepDepth::Reenter => {
                    if let Some(top) = mock.frames.first_mut() {
                        top.location.code_index = 0;
                    }
                }
                _ if returned => {
                    if mock.frames.len() > 1 {
                        mock.frames.remove(0);
                    }
                }
                StepDepth::Out => {
                    if mock.frames.len() > 1 {
                        mock.frames.remove(0);
                    }
                }
                StepDepth::Into | StepDepth::Over => match reentry {
                    Some(mut frame) => {
                        frame.id = next_frame;
                        frame.location.code_index = 0;
                        mock.frames.insert(0, frame);
                        allocated = true;
                    }
                    None => {
                        if let Some(top) = mock.frames.first_mut() {
                            top.location.code_index += 1;
                            top.location.line = top.location.line.map(|line| line + 1);
                        }
                    }
                },
            },
        }
        let location = mock.frames.first().map(|top| top.location.clone())?;
        if allocated {
            self.next_frame += 1;
        }
        Some(VmEvent::Step {
            request,
            thread,
            location,
        })
    }
}

/// Scripted, recording [`VmSession`].
#[derive(Debug)]
pub struct MockVm {
    state: Mutex<MockState>,
    events: broadcast::Sender<VmEventSet>,
}

impl Default for MockVm {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVm {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            state: Mutex::new(MockState::default()),
            events,
        }
    }

    pub fn add_thread(&self, thread: MockThread) {
        self.state.lock().threads.push(thread);
    }

    pub fn add_group(&self, id: ThreadGroupId, name: impl Into<String>, parent: Option<ThreadGroupId>) {
        self.state.lock().groups.insert(id, (name.into(), parent));
    }

    /// The next step completion of `thread` lands on `frames` instead of the derived landing.
    pub fn push_step_landing(&self, thread: ThreadId, frames: Vec<RemoteFrame>) {
        self.state
            .lock()
            .landings
            .entry(thread)
            .or_default()
            .push_back(frames);
    }

    pub fn push_invoke_result(&self, result: SessionResult<Value>) {
        self.state.lock().invoke_results.push_back(result);
    }

    /// Invocations wait for a permit on the returned gate before they run.
    pub fn gate_invocations(&self) -> Arc<Notify> {
        self.state.lock().invoke_gate.get_or_insert_with(Default::default).clone()
    }

    pub fn set_variable(&self, frame: FrameId, variable: Variable) {
        self.state
            .lock()
            .variables
            .insert((frame, variable.name.clone()), variable);
    }

    pub fn set_owned_monitors(&self, thread: ThreadId, monitors: Vec<ObjectId>) {
        self.state.lock().owned_monitors.insert(thread, monitors);
    }

    pub fn set_can_pop_frames(&self, can_pop: bool) {
        self.state.lock().can_pop_frames = can_pop;
    }

    /// Thread group queries answer [`SessionError::Unsupported`].
    pub fn set_group_queries_unsupported(&self, unsupported: bool) {
        self.state.lock().group_queries_unsupported = unsupported;
    }

    /// Suspend requests for `thread` are accepted but never take effect.
    pub fn ignore_suspend(&self, thread: ThreadId) {
        self.state.lock().ignores_suspend.insert(thread);
    }

    /// Resuming `thread` leaves its armed step pending instead of completing it.
    pub fn defer_steps(&self, thread: ThreadId) {
        self.state.lock().deferred_steps.insert(thread);
    }

    /// Completes the pending step of `thread`. Returns whether a step event went out.
    pub fn complete_deferred_step(&self, thread: ThreadId) -> bool {
        let event = {
            let mut state = self.state.lock();
            state.deferred_steps.remove(&thread);
            state.complete_step(thread)
        };
        match event {
            Some(event) => {
                self.emit(event);
                true
            }
            None => false,
        }
    }

    /// Completes a deferred step whose landing also hits the breakpoint `request`.
    ///
    /// Both events go out in one set; `step_first` picks their order in it.
    pub fn complete_deferred_step_at_breakpoint(&self, thread: ThreadId, request: RequestId, step_first: bool) -> bool {
        let step = {
            let mut state = self.state.lock();
            state.deferred_steps.remove(&thread);
            state.complete_step(thread)
        };
        let Some(step) = step else {
            return false;
        };
        let VmEvent::Step { location, .. } = &step else {
            return false;
        };
        let breakpoint = VmEvent::Breakpoint {
            request,
            thread,
            location: location.clone(),
        };
        let events = if step_first {
            vec![step, breakpoint]
        } else {
            vec![breakpoint, step]
        };
        self.emit(VmEventSet::new(Some(SuspendPolicy::Thread), events));
        true
    }

    /// The next thread resume fails with `err`.
    pub fn fail_next_resume(&self, err: SessionError) {
        self.state.lock().resume_failures.push_back(err);
    }

    pub fn set_thread_frames(&self, thread: ThreadId, frames: Vec<RemoteFrame>) {
        if let Ok(mock) = self.state.lock().thread_mut(thread) {
            mock.frames = frames;
        }
    }

    pub fn thread_frames(&self, thread: ThreadId) -> Vec<RemoteFrame> {
        self.state
            .lock()
            .threads
            .iter()
            .find(|candidate| candidate.id == thread)
            .map(|mock| mock.frames.clone())
            .unwrap_or_default()
    }

    pub fn is_thread_suspended(&self, thread: ThreadId) -> bool {
        self.state
            .lock()
            .threads
            .iter()
            .any(|candidate| candidate.id == thread && candidate.suspended)
    }

    /// Suspends `thread` at a breakpoint request and reports it.
    ///
    /// Returns `false` when the thread has no frames to report.
    pub fn hit_breakpoint(&self, thread: ThreadId, request: RequestId) -> bool {
        let event = {
            let mut state = self.state.lock();
            let vm_wide = state
                .breakpoint_requests
                .iter()
                .any(|(id, recorded)| *id == request && recorded.suspend_policy == SuspendPolicy::Vm);
            let policy = if vm_wide { SuspendPolicy::Vm } else { SuspendPolicy::Thread };
            if vm_wide {
                for mock in &mut state.threads {
                    mock.suspended = true;
                }
            }
            let Ok(mock) = state.thread_mut(thread) else {
                return false;
            };
            mock.suspended = true;
            let Some(location) = mock.frames.first().map(|top| top.location.clone()) else {
                return false;
            };
            VmEventSet::new(
                Some(policy),
                vec![VmEvent::Breakpoint {
                    request,
                    thread,
                    location,
                }],
            )
        };
        self.emit(event);
        true
    }

    pub fn emit(&self, events: impl Into<VmEventSet>) {
        // No subscribers is fine.
        let _ = self.events.send(events.into());
    }

    pub fn step_requests(&self) -> Vec<RecordedStepRequest> {
        self.state.lock().step_requests.clone()
    }

    pub fn breakpoint_requests(&self) -> Vec<(RequestId, BreakpointRequest)> {
        self.state.lock().breakpoint_requests.clone()
    }

    pub fn deleted_requests(&self) -> Vec<(EventRequestKind, RequestId)> {
        self.state.lock().deleted_requests.clone()
    }

    pub fn invocations(&self) -> Vec<RecordedInvocation> {
        self.state.lock().invocations.clone()
    }

    /// Every timeout set through [`VmSession::set_request_timeout`], in order.
    pub fn timeout_history(&self) -> Vec<Option<Duration>> {
        self.state.lock().timeout_history.clone()
    }

    pub fn thread_resumes(&self) -> Vec<ThreadId> {
        self.state.lock().thread_resumes.clone()
    }

    pub fn popped_frames(&self) -> Vec<(ThreadId, FrameId)> {
        self.state.lock().popped_frames.clone()
    }

    pub fn vm_suspends(&self) -> usize {
        self.state.lock().vm_suspends
    }

    pub fn vm_resumes(&self) -> usize {
        self.state.lock().vm_resumes
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.state.lock().exit_code
    }

    async fn record_invocation(
        &self,
        thread: ThreadId,
        target: InvocationTarget,
        method: MethodRef,
        args: Vec<Value>,
        options: InvokeOptions,
        default: Value,
    ) -> SessionResult<Value> {
        let gate = self.state.lock().invoke_gate.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let mut state = self.state.lock();
        state.suspended_thread(thread)?;
        let timeout = state.timeout;
        state.invocations.push(RecordedInvocation {
            thread,
            target,
            method,
            args,
            options,
            timeout,
        });
        state.invoke_results.pop_front().unwrap_or(Ok(default))
    }
}

impl VmSession for MockVm {
    async fn all_threads(&self) -> SessionResult<Vec<ThreadId>> {
        Ok(self.state.lock().threads.iter().map(|mock| mock.id).collect())
    }

    async fn thread_name(&self, thread: ThreadId) -> SessionResult<String> {
        Ok(self.state.lock().thread_mut(thread)?.name.clone())
    }

    async fn suspend_thread(&self, thread: ThreadId) -> SessionResult<()> {
        let mut state = self.state.lock();
        if state.ignores_suspend.contains(&thread) {
            return Ok(());
        }
        state.thread_mut(thread)?.suspended = true;
        Ok(())
    }

    async fn resume_thread(&self, thread: ThreadId) -> SessionResult<()> {
        let event = {
            let mut state = self.state.lock();
            state.thread_resumes.push(thread);
            if let Some(err) = state.resume_failures.pop_front() {
                return Err(err);
            }
            state.thread_mut(thread)?.suspended = false;
            if state.deferred_steps.contains(&thread) {
                None
            } else {
                state.complete_step(thread)
            }
        };
        if let Some(event) = event {
            self.emit(event);
        }
        Ok(())
    }

    async fn thread_is_suspended(&self, thread: ThreadId) -> SessionResult<bool> {
        Ok(self.state.lock().thread_mut(thread)?.suspended)
    }

    async fn frames(&self, thread: ThreadId) -> SessionResult<Vec<RemoteFrame>> {
        Ok(self.state.lock().suspended_thread(thread)?.frames.clone())
    }

    async fn frame_count(&self, thread: ThreadId) -> SessionResult<usize> {
        Ok(self.state.lock().suspended_thread(thread)?.frames.len())
    }

    async fn thread_group(&self, thread: ThreadId) -> SessionResult<Option<ThreadGroupId>> {
        let mut state = self.state.lock();
        if state.group_queries_unsupported {
            return Err(SessionError::Unsupported);
        }
        Ok(state.thread_mut(thread)?.group)
    }

    async fn thread_group_name(&self, group: ThreadGroupId) -> SessionResult<String> {
        self.state
            .lock()
            .groups
            .get(&group)
            .map(|(name, _)| name.clone())
            .ok_or(SessionError::ObjectCollected)
    }

    async fn thread_group_parent(&self, group: ThreadGroupId) -> SessionResult<Option<ThreadGroupId>> {
        self.state
            .lock()
            .groups
            .get(&group)
            .map(|(_, parent)| *parent)
            .ok_or(SessionError::ObjectCollected)
    }

    async fn thread_priority(&self, thread: ThreadId) -> SessionResult<i32> {
        Ok(self.state.lock().thread_mut(thread)?.priority)
    }

    async fn owned_monitors(&self, thread: ThreadId) -> SessionResult<Vec<ObjectId>> {
        let state = self.state.lock();
        state.suspended_thread(thread)?;
        Ok(state.owned_monitors.get(&thread).cloned().unwrap_or_default())
    }

    async fn contended_monitor(&self, thread: ThreadId) -> SessionResult<Option<ObjectId>> {
        self.state.lock().suspended_thread(thread)?;
        Ok(None)
    }

    async fn create_step_request(&self, request: StepRequest) -> SessionResult<RequestId> {
        let mut state = self.state.lock();
        let id = state.allocate_request();
        state.step_requests.push(RecordedStepRequest {
            id,
            request,
            fired: false,
            deleted: false,
        });
        Ok(id)
    }

    async fn create_breakpoint_request(&self, request: BreakpointRequest) -> SessionResult<RequestId> {
        let mut state = self.state.lock();
        let id = state.allocate_request();
        state.breakpoint_requests.push((id, request));
        Ok(id)
    }

    async fn delete_event_request(&self, kind: EventRequestKind, request: RequestId) -> SessionResult<()> {
        let mut state = self.state.lock();
        if kind == EventRequestKind::Step {
            if let Some(recorded) = state.step_requests.iter_mut().find(|recorded| recorded.id == request) {
                recorded.deleted = true;
            }
        }
        state.deleted_requests.push((kind, request));
        Ok(())
    }

    async fn invoke_method(
        &self,
        thread: ThreadId,
        receiver: Receiver,
        method: MethodRef,
        args: Vec<Value>,
        options: InvokeOptions,
    ) -> SessionResult<Value> {
        self.record_invocation(
            thread,
            InvocationTarget::Method(receiver),
            method,
            args,
            options,
            Value::Int(0),
        )
        .await
    }

    async fn new_instance(
        &self,
        thread: ThreadId,
        class: ReferenceTypeId,
        constructor: MethodRef,
        args: Vec<Value>,
        options: InvokeOptions,
    ) -> SessionResult<Value> {
        self.record_invocation(
            thread,
            InvocationTarget::NewInstance(class),
            constructor,
            args,
            options,
            Value::Object { tag: b'L', id: 9000 },
        )
        .await
    }

    fn can_pop_frames(&self) -> bool {
        self.state.lock().can_pop_frames
    }

    async fn pop_frames(&self, thread: ThreadId, frame: FrameId) -> SessionResult<()> {
        let mut state = self.state.lock();
        if !state.can_pop_frames {
            return Err(SessionError::Unsupported);
        }
        state.popped_frames.push((thread, frame));
        let mock = state.thread_mut(thread)?;
        if !mock.suspended {
            return Err(SessionError::IncompatibleThreadState);
        }
        let index = mock
            .frames
            .iter()
            .position(|candidate| candidate.id == frame)
            .ok_or(SessionError::InvalidStackFrame)?;
        if index + 1 >= mock.frames.len() {
            return Err(SessionError::InvalidStackFrame);
        }
        let mut removed: Vec<_> = mock.frames.drain(..=index).collect();
        if let Some(deepest) = removed.pop() {
            state.reentry.insert(thread, deepest);
        }
        Ok(())
    }

    async fn force_return(&self, thread: ThreadId) -> SessionResult<()> {
        let mut state = self.state.lock();
        state.suspended_thread(thread)?;
        state.forced_returns.insert(thread);
        Ok(())
    }

    async fn frame_variable(
        &self,
        thread: ThreadId,
        frame: &RemoteFrame,
        name: &str,
    ) -> SessionResult<Option<Variable>> {
        let state = self.state.lock();
        state.suspended_thread(thread)?;
        Ok(state.variables.get(&(frame.id, name.to_owned())).cloned())
    }

    fn request_timeout(&self) -> Option<Duration> {
        self.state.lock().timeout
    }

    fn set_request_timeout(&self, timeout: Option<Duration>) -> Option<Duration> {
        let mut state = self.state.lock();
        state.timeout_history.push(timeout);
        std::mem::replace(&mut state.timeout, timeout)
    }

    async fn suspend_vm(&self) -> SessionResult<()> {
        let mut state = self.state.lock();
        state.vm_suspends += 1;
        for mock in &mut state.threads {
            mock.suspended = true;
        }
        Ok(())
    }

    async fn resume_vm(&self) -> SessionResult<()> {
        let mut state = self.state.lock();
        state.vm_resumes += 1;
        for mock in &mut state.threads {
            mock.suspended = false;
        }
        Ok(())
    }

    async fn exit_vm(&self, exit_code: i32) -> SessionResult<()> {
        self.state.lock().exit_code = Some(exit_code);
        self.emit(VmEvent::VmDeath);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<VmEventSet> {
        self.events.subscribe()
    }
}
