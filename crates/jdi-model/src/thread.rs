//! The thread model.
//!
//! A [`JdiThread`] mirrors one thread of the debuggee. Entry points that
//! change its suspended/running state take the thread's access token (an
//! async mutex) first, so a resume in flight and an invocation or step being
//! started never interleave. Plain flags live behind a short-lived
//! `parking_lot` lock that is never held across an `.await`.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::breakpoint::JavaBreakpoint;
use crate::element::{DebugElement, ElementRef, EventBus, EventDetail};
use crate::error::{DebugError, DebugResult, Status, StatusCode, StatusHandler};
use crate::filter::StepFilters;
use crate::frame::{merge_frames, preserve_frames, StackFrame};
use crate::session::{
    EventRequestKind, InvokeOptions, Location, MethodRef, Receiver, SessionError, SessionResult, SuspendPolicy,
    Value, Variable, VmSession,
};
use crate::step::{OriginalStep, StepHandler, StepKind, StepTransition};
use crate::target::{DebugTarget, RequestTimeoutLease};
use crate::{ObjectId, ReferenceTypeId, RequestId, ThreadId};

/// Thread groups below this name hold application threads.
const MAIN_THREAD_GROUP: &str = "main";

/// How the dispatcher treats the suspended remote thread after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EventDisposition {
    Resume,
    StaySuspended,
}

/// Result of an explicit [`JdiThread::suspend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendOutcome {
    /// The VM reported the thread as suspended.
    Confirmed,
    /// The VM never confirmed in time. The thread is treated as suspended anyway.
    TimedOut,
    Disconnected,
}

/// Handle on the background task confirming a suspend.
#[derive(Debug)]
pub struct SuspendTicket {
    handle: JoinHandle<DebugResult<SuspendOutcome>>,
    cancel: CancellationToken,
}

impl SuspendTicket {
    /// Stops waiting for confirmation; [`Self::outcome`] then yields a `Cancelled` error.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn outcome(self) -> DebugResult<SuspendOutcome> {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(err) => Err(DebugError::new(
                StatusCode::Cancelled,
                format!("suspend watchdog did not finish: {err}"),
            )),
        }
    }
}

/// Proof that the caller holds the thread's access token.
pub(crate) struct ThreadAccess<'a> {
    _guard: AsyncMutexGuard<'a, ()>,
}

/// Marks a thread as evaluating until dropped.
struct Evaluating<'a, S: VmSession> {
    thread: &'a JdiThread<S>,
    detail: EventDetail,
}

impl<S: VmSession> Drop for Evaluating<'_, S> {
    fn drop(&mut self) {
        {
            let mut state = self.thread.state.lock();
            state.performing_evaluation = false;
            state.evaluation = None;
            state.honor_breakpoints = true;
        }
        self.thread.element.fire_suspend(self.detail);
    }
}

#[derive(Default)]
struct ThreadState {
    running: bool,
    terminated: bool,
    frames: Vec<Arc<StackFrame>>,
    refresh_frames: bool,
    breakpoints: Vec<Arc<JavaBreakpoint>>,
    performing_evaluation: bool,
    evaluation: Option<CancellationToken>,
    invoking_method: bool,
    honor_breakpoints: bool,
    suspending: bool,
    step: Option<StepHandler>,
    original_step: Option<OriginalStep>,
}

impl ThreadState {
    fn is_suspended(&self) -> bool {
        !self.running && !self.terminated
    }

    /// Breakpoints only describe a suspension; running clears them.
    fn set_running(&mut self, running: bool) {
        self.running = running;
        if running {
            self.breakpoints.clear();
        }
    }

    fn preserve_frames(&mut self) {
        self.refresh_frames = true;
        preserve_frames(&self.frames);
    }

    fn dispose_frames(&mut self) {
        self.frames.clear();
        self.refresh_frames = true;
    }
}

pub struct JdiThread<S: VmSession> {
    id: ThreadId,
    session: Arc<S>,
    target: Weak<DebugTarget<S>>,
    this: Weak<JdiThread<S>>,
    element: DebugElement,
    bus: EventBus,
    status_handler: Arc<dyn StatusHandler>,
    suspend_timeout: Duration,
    suspend_poll: Duration,
    system_thread: bool,
    group_name: OnceCell<Option<String>>,
    access: AsyncMutex<()>,
    state: Mutex<ThreadState>,
}

impl<S: VmSession> fmt::Debug for JdiThread<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("JdiThread")
            .field("id", &self.id)
            .field("running", &state.running)
            .field("terminated", &state.terminated)
            .field("stepping", &state.step.is_some())
            .field("system_thread", &self.system_thread)
            .finish()
    }
}

async fn is_system_thread<S: VmSession>(session: &S, thread: ThreadId) -> Result<bool, SessionError> {
    let mut group = session.thread_group(thread).await?;
    let mut system = group.is_some();
    while let Some(current) = group {
        if session.thread_group_name(current).await? == MAIN_THREAD_GROUP {
            system = false;
            break;
        }
        group = session.thread_group_parent(current).await?;
    }
    Ok(system)
}

impl<S: VmSession> JdiThread<S> {
    pub(crate) async fn create(target: &Arc<DebugTarget<S>>, id: ThreadId) -> Arc<Self> {
        let session = target.session().clone();
        let mut terminated = false;

        let system_thread = match is_system_thread(session.as_ref(), id).await {
            Ok(system) => system,
            Err(SessionError::Unsupported) => false,
            Err(err) => {
                if err.is_disconnect() {
                    // Threads created while the VM shuts down.
                    terminated = true;
                } else {
                    tracing::warn!(target: "jdi.model", thread = id, error = %err, "failed to determine thread group");
                }
                false
            }
        };
        let running = match session.thread_is_suspended(id).await {
            Ok(suspended) => !suspended,
            Err(err) => {
                terminated |= err.is_disconnect();
                true
            }
        };

        let timeouts = target.timeouts();
        Arc::new_cyclic(|this| Self {
            id,
            session,
            target: Arc::downgrade(target),
            this: this.clone(),
            element: DebugElement::new(ElementRef::Thread(id), target.bus().clone()),
            bus: target.bus().clone(),
            status_handler: target.status_handler(),
            suspend_timeout: timeouts.suspend(),
            suspend_poll: timeouts.suspend_poll(),
            system_thread,
            group_name: OnceCell::new(),
            access: AsyncMutex::new(()),
            state: Mutex::new(ThreadState {
                running: running && !terminated,
                terminated,
                refresh_frames: true,
                honor_breakpoints: true,
                ..ThreadState::default()
            }),
        })
    }

    async fn acquire(&self) -> ThreadAccess<'_> {
        ThreadAccess {
            _guard: self.access.lock().await,
        }
    }

    fn target(&self) -> DebugResult<Arc<DebugTarget<S>>> {
        self.target
            .upgrade()
            .ok_or_else(|| DebugError::request_failed("debug target is gone"))
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn element(&self) -> &DebugElement {
        &self.element
    }

    pub fn is_suspended(&self) -> bool {
        self.state.lock().is_suspended()
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    pub fn is_stepping(&self) -> bool {
        self.state.lock().step.is_some()
    }

    pub fn is_system_thread(&self) -> bool {
        self.system_thread
    }

    pub fn is_performing_evaluation(&self) -> bool {
        self.state.lock().performing_evaluation
    }

    pub fn is_invoking_method(&self) -> bool {
        self.state.lock().invoking_method
    }

    /// Breakpoints are ignored only during an evaluation that asked for it.
    pub fn honors_breakpoints(&self) -> bool {
        let state = self.state.lock();
        !state.performing_evaluation || state.honor_breakpoints
    }

    /// Breakpoints responsible for the current suspension.
    pub fn breakpoints(&self) -> Vec<Arc<JavaBreakpoint>> {
        self.state.lock().breakpoints.clone()
    }

    pub(crate) fn remove_current_breakpoint(&self, breakpoint: &Arc<JavaBreakpoint>) {
        self.state
            .lock()
            .breakpoints
            .retain(|current| !Arc::ptr_eq(current, breakpoint));
    }

    pub async fn name(&self) -> DebugResult<String> {
        self.session
            .thread_name(self.id)
            .await
            .map_err(|err| DebugError::target_request_failed("retrieving thread name", err))
    }

    pub async fn priority(&self) -> DebugResult<i32> {
        self.session
            .thread_priority(self.id)
            .await
            .map_err(|err| DebugError::target_request_failed("retrieving thread priority", err))
    }

    /// `None` for a thread without a group.
    pub async fn thread_group_name(&self) -> DebugResult<Option<String>> {
        let name = self
            .group_name
            .get_or_try_init(|| async {
                match self.session.thread_group(self.id).await {
                    Ok(Some(group)) => self.session.thread_group_name(group).await.map(Some),
                    Ok(None) => Ok(None),
                    Err(err) => Err(err),
                }
            })
            .await
            .map_err(|err| DebugError::target_request_failed("retrieving thread group name", err))?;
        Ok(name.clone())
    }

    // -- stack frames --

    async fn underlying_frames(&self) -> DebugResult<Vec<crate::session::RemoteFrame>> {
        match self.session.frames(self.id).await {
            Ok(frames) => Ok(frames),
            Err(SessionError::IncompatibleThreadState) => Err(DebugError::thread_not_suspended()),
            Err(err) => Err(DebugError::target_request_failed("retrieving stack frames", err)),
        }
    }

    async fn compute_frames(&self, _access: &ThreadAccess<'_>, force: bool) -> DebugResult<Vec<Arc<StackFrame>>> {
        let refresh = {
            let state = self.state.lock();
            if !state.is_suspended() {
                return Ok(Vec::new());
            }
            force || state.refresh_frames
        };
        if refresh {
            let remote = self.underlying_frames().await?;
            let mut state = self.state.lock();
            if state.frames.is_empty() {
                state.frames = remote
                    .into_iter()
                    .map(|frame| StackFrame::new(self.id, Some(frame)))
                    .collect();
                if state.frames.is_empty() {
                    // Frames can be missing right after a suspend; try again next time.
                    return Ok(Vec::new());
                }
            } else {
                merge_frames(self.id, &mut state.frames, remote);
            }
            state.refresh_frames = false;
        }
        Ok(self.state.lock().frames.clone())
    }

    /// Top-first. Empty while the thread runs.
    pub async fn stack_frames(&self) -> DebugResult<Vec<Arc<StackFrame>>> {
        let access = self.acquire().await;
        self.compute_frames(&access, false).await
    }

    /// Like [`Self::stack_frames`] but always re-reads the remote stack.
    pub async fn compute_new_stack_frames(&self) -> DebugResult<Vec<Arc<StackFrame>>> {
        let access = self.acquire().await;
        self.compute_frames(&access, true).await
    }

    pub async fn top_stack_frame(&self) -> DebugResult<Option<Arc<StackFrame>>> {
        Ok(self.stack_frames().await?.into_iter().next())
    }

    pub async fn has_stack_frames(&self) -> DebugResult<bool> {
        match self.stack_frames().await {
            Ok(frames) => Ok(!frames.is_empty()),
            Err(err) if err.is(StatusCode::ThreadNotSuspended) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn frame_count(&self) -> DebugResult<usize> {
        match self.session.frame_count(self.id).await {
            Ok(count) => Ok(count),
            Err(SessionError::IncompatibleThreadState) => Err(DebugError::thread_not_suspended()),
            Err(err) => Err(DebugError::target_request_failed("retrieving frame count", err)),
        }
    }

    /// Searches the visible locals of every frame, top-first.
    pub async fn find_variable(&self, name: &str) -> DebugResult<Option<Variable>> {
        if !self.is_suspended() {
            return Ok(None);
        }
        let frames = match self.stack_frames().await {
            Ok(frames) => frames,
            Err(err) if err.is(StatusCode::ThreadNotSuspended) => return Ok(None),
            Err(err) => return Err(err),
        };
        for frame in frames {
            let Some(remote) = frame.remote() else {
                continue;
            };
            match self.session.frame_variable(self.id, &remote, name).await {
                Ok(Some(variable)) => return Ok(Some(variable)),
                Ok(None) => {}
                // The thread resumed under us.
                Err(SessionError::IncompatibleThreadState) => return Ok(None),
                Err(err) => return Err(DebugError::target_request_failed("looking up variable", err)),
            }
        }
        Ok(None)
    }

    pub async fn owned_monitors(&self) -> DebugResult<Vec<ObjectId>> {
        match self.session.owned_monitors(self.id).await {
            Ok(monitors) => Ok(monitors),
            Err(SessionError::IncompatibleThreadState) => Ok(Vec::new()),
            Err(err) => Err(DebugError::target_request_failed("retrieving owned monitors", err)),
        }
    }

    pub async fn has_owned_monitors(&self) -> DebugResult<bool> {
        Ok(self.is_suspended() && !self.owned_monitors().await?.is_empty())
    }

    pub async fn contended_monitor(&self) -> DebugResult<Option<ObjectId>> {
        match self.session.contended_monitor(self.id).await {
            Ok(monitor) => Ok(monitor),
            Err(SessionError::IncompatibleThreadState) => Ok(None),
            Err(err) => Err(DebugError::target_request_failed("retrieving contended monitor", err)),
        }
    }

    /// Whether a frame of this thread runs code replaced by a failed hot code replace.
    pub async fn is_out_of_sync(&self) -> DebugResult<bool> {
        let target = self.target()?;
        if !self.is_suspended() || !target.has_hot_code_replace_failed() {
            return Ok(false);
        }
        let frames = self.stack_frames().await?;
        Ok(frames.iter().any(|frame| target.is_frame_out_of_sync(frame)))
    }

    /// A running thread may be executing obsolete code after a failed hot code replace.
    pub fn may_be_out_of_sync(&self) -> bool {
        !self.is_suspended()
            && self
                .target
                .upgrade()
                .is_some_and(|target| target.has_hot_code_replace_failed())
    }

    // -- capabilities --

    pub fn can_resume(&self) -> bool {
        self.is_suspended() && !self.target.upgrade().is_some_and(|target| target.is_suspended())
    }

    pub fn can_suspend(&self) -> bool {
        let state = self.state.lock();
        !state.is_suspended() && !state.terminated
    }

    pub fn can_terminate(&self) -> bool {
        self.target.upgrade().is_some_and(|target| target.can_terminate())
    }

    async fn can_step_locked(&self, access: &ThreadAccess<'_>) -> bool {
        {
            let state = self.state.lock();
            if !state.is_suspended() || state.step.is_some() {
                return false;
            }
        }
        if self
            .target
            .upgrade()
            .is_some_and(|target| target.is_performing_hot_code_replace())
        {
            return false;
        }
        matches!(self.compute_frames(access, false).await, Ok(frames) if !frames.is_empty())
    }

    pub async fn can_step(&self) -> bool {
        let access = self.acquire().await;
        self.can_step_locked(&access).await
    }

    pub async fn can_step_into(&self) -> bool {
        self.can_step().await
    }

    pub async fn can_step_over(&self) -> bool {
        self.can_step().await
    }

    pub async fn can_step_return(&self) -> bool {
        self.can_step().await
    }

    pub async fn can_step_with_filters(&self) -> bool {
        let has_patterns = self
            .target
            .upgrade()
            .is_some_and(|target| target.step_filters().has_active_patterns());
        has_patterns && self.can_step_into().await
    }

    pub async fn can_drop_to_frame(&self, frame: &Arc<StackFrame>) -> bool {
        let access = self.acquire().await;
        if !self.can_step_locked(&access).await {
            return false;
        }
        let Ok(frames) = self.compute_frames(&access, false).await else {
            return false;
        };
        let Some(index) = frames.iter().position(|candidate| Arc::ptr_eq(candidate, frame)) else {
            return false;
        };
        // The bottom frame cannot be popped.
        !self.session.can_pop_frames() || index + 1 < frames.len()
    }

    // -- resume / suspend --

    pub async fn resume(&self) -> DebugResult<()> {
        self.resume_thread(true).await
    }

    /// Resumes without a resume notification.
    pub async fn resume_quiet(&self) -> DebugResult<()> {
        self.resume_thread(false).await
    }

    async fn resume_thread(&self, notify: bool) -> DebugResult<()> {
        let _access = self.acquire().await;
        {
            let mut state = self.state.lock();
            if !state.is_suspended() {
                return Ok(());
            }
            state.set_running(true);
            state.preserve_frames();
        }
        if notify {
            self.element.fire_resume(EventDetail::ClientRequest);
        }
        match self.session.resume_thread(self.id).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_disconnect() => {
                self.disconnected();
                Ok(())
            }
            Err(err) => {
                self.state.lock().set_running(false);
                self.element.fire_suspend(EventDetail::ClientRequest);
                Err(DebugError::target_request_failed("resuming thread", err))
            }
        }
    }

    /// Aborts any step and asks the VM to suspend the thread.
    ///
    /// Confirmation happens on a background task; the thread counts as
    /// suspended once the task confirms or gives up. Returns `None` when a
    /// suspend is already being confirmed.
    pub async fn suspend(&self) -> DebugResult<Option<SuspendTicket>> {
        let _access = self.acquire().await;
        self.abort_step().await;
        {
            let mut state = self.state.lock();
            if state.suspending {
                return Ok(None);
            }
            state.suspending = true;
        }
        let Some(this) = self.this.upgrade() else {
            self.state.lock().suspending = false;
            return Err(DebugError::request_failed("thread is gone"));
        };

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { this.watch_suspend(token).await });
        Ok(Some(SuspendTicket { handle, cancel }))
    }

    async fn watch_suspend(self: Arc<Self>, cancel: CancellationToken) -> DebugResult<SuspendOutcome> {
        let result = self.confirm_suspend(&cancel).await;
        self.state.lock().suspending = false;
        match &result {
            Ok(SuspendOutcome::Confirmed) | Ok(SuspendOutcome::TimedOut) => {
                self.state.lock().set_running(false);
                self.element.fire_suspend(EventDetail::ClientRequest);
            }
            Ok(SuspendOutcome::Disconnected) => self.disconnected(),
            Err(err) => {
                tracing::debug!(target: "jdi.model", thread = self.id, error = %err, "suspend not confirmed");
            }
        }
        result
    }

    async fn confirm_suspend(&self, cancel: &CancellationToken) -> DebugResult<SuspendOutcome> {
        let cancelled = || DebugError::new(StatusCode::Cancelled, "suspend cancelled");

        let issued = tokio::select! {
            _ = cancel.cancelled() => return Err(cancelled()),
            issued = self.session.suspend_thread(self.id) => issued,
        };
        match issued {
            Ok(()) => {}
            Err(err) if err.is_disconnect() => return Ok(SuspendOutcome::Disconnected),
            Err(err) => return Err(DebugError::target_request_failed("suspending thread", err)),
        }

        let deadline = tokio::time::Instant::now() + self.suspend_timeout;
        loop {
            match self.session.thread_is_suspended(self.id).await {
                Ok(true) => return Ok(SuspendOutcome::Confirmed),
                Ok(false) => {}
                Err(err) if err.is_disconnect() => return Ok(SuspendOutcome::Disconnected),
                Err(err) => return Err(DebugError::target_request_failed("querying thread status", err)),
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                let status = Status {
                    code: StatusCode::SuspendTimeout,
                    message: format!(
                        "thread did not suspend within {} ms",
                        self.suspend_timeout.as_millis()
                    ),
                };
                self.status_handler.handle_status(self.id, &status);
                return Ok(SuspendOutcome::TimedOut);
            }
            let pause = self.suspend_poll.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(cancelled()),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// The whole VM was suspended.
    pub(crate) fn suspended_by_vm(&self) {
        self.state.lock().set_running(false);
    }

    /// The whole VM was resumed.
    pub(crate) fn resumed_by_vm(&self) {
        let mut state = self.state.lock();
        state.set_running(true);
        state.preserve_frames();
    }

    pub async fn terminate(&self) -> DebugResult<()> {
        self.target()?.terminate().await
    }

    /// The thread died in the VM.
    pub(crate) fn terminated(&self) {
        {
            let mut state = self.state.lock();
            if state.terminated {
                return;
            }
            state.terminated = true;
            state.set_running(false);
            state.step = None;
            state.original_step = None;
            state.dispose_frames();
        }
        self.element.fire_terminate();
    }

    /// The VM went away.
    pub(crate) fn disconnected(&self) {
        self.terminated();
    }

    // -- stepping --

    pub async fn step_into(&self) -> DebugResult<()> {
        self.step(StepKind::Into, self.target()?.step_filters()).await
    }

    pub async fn step_over(&self) -> DebugResult<()> {
        self.step(StepKind::Over, self.target()?.step_filters()).await
    }

    pub async fn step_return(&self) -> DebugResult<()> {
        self.step(StepKind::Return, self.target()?.step_filters()).await
    }

    /// Steps into with filtering forced on for this one step.
    pub async fn step_with_filters(&self) -> DebugResult<()> {
        let filters = self.target()?.step_filters();
        if !filters.has_active_patterns() {
            return Ok(());
        }
        let access = self.acquire().await;
        if !self.can_step_locked(&access).await {
            return Ok(());
        }
        self.start_step(&access, StepKind::Into, filters, true).await
    }

    /// Starts a step of `kind` with an explicit filter snapshot.
    ///
    /// Does nothing when the thread cannot step right now (running, already
    /// stepping, no frames).
    pub async fn step(&self, kind: StepKind, filters: Arc<StepFilters>) -> DebugResult<()> {
        let access = self.acquire().await;
        if !self.can_step_locked(&access).await {
            return Ok(());
        }
        self.start_step(&access, kind, filters, false).await
    }

    /// Steps out until `frame` is the top frame.
    pub async fn step_to_frame(&self, frame: &Arc<StackFrame>) -> DebugResult<()> {
        let filters = self.target()?.step_filters();
        let access = self.acquire().await;
        if !self.can_step_locked(&access).await {
            return Ok(());
        }
        let frames = self.compute_frames(&access, false).await?;
        let index = Self::index_of(&frames, frame)?;
        let kind = StepKind::ToFrame {
            remaining_frames: frames.len() - index,
        };
        self.start_step(&access, kind, filters, false).await
    }

    /// Re-executes `frame` from its start, discarding every frame above it.
    pub async fn drop_to_frame(&self, frame: &Arc<StackFrame>) -> DebugResult<()> {
        let filters = self.target()?.step_filters();
        let access = self.acquire().await;
        if !self.can_step_locked(&access).await {
            return Ok(());
        }
        let frames = self.compute_frames(&access, false).await?;
        let index = Self::index_of(&frames, frame)?;

        if self.session.can_pop_frames() {
            self.pop_frames(&access, frame, index, frames.len()).await?;
            self.start_step(&access, StepKind::Into, filters, false).await
        } else {
            let kind = StepKind::DropToFrame {
                frames_to_drop: index as i64,
            };
            self.start_step(&access, kind, filters, false).await
        }
    }

    fn index_of(frames: &[Arc<StackFrame>], frame: &Arc<StackFrame>) -> DebugResult<usize> {
        frames
            .iter()
            .position(|candidate| Arc::ptr_eq(candidate, frame))
            .ok_or_else(|| DebugError::new(StatusCode::InvalidStackFrame, "frame does not belong to this thread"))
    }

    /// Pops until the stack is at most `size - index - 1` deep or stops shrinking.
    async fn pop_frames(
        &self,
        access: &ThreadAccess<'_>,
        frame: &Arc<StackFrame>,
        index: usize,
        size: usize,
    ) -> DebugResult<()> {
        let desired = size - index - 1;
        let mut last_size = size + 1;
        let mut size = size;
        while size < last_size && size > desired {
            let Some(frame_id) = frame.frame_id() else {
                break;
            };
            self.state.lock().preserve_frames();
            match self.session.pop_frames(self.id, frame_id).await {
                Ok(()) => {}
                Err(SessionError::InvalidStackFrame) => {
                    // All but the deepest frame may be gone already.
                    self.element.fire_change(EventDetail::Content);
                    return Err(DebugError::target_request_failed(
                        "popping stack frames",
                        SessionError::InvalidStackFrame,
                    ));
                }
                Err(err) => return Err(DebugError::target_request_failed("popping stack frames", err)),
            }
            last_size = size;
            size = self.compute_frames(access, false).await?.len();
        }
        Ok(())
    }

    async fn start_step(
        &self,
        access: &ThreadAccess<'_>,
        kind: StepKind,
        filters: Arc<StepFilters>,
        use_filters: bool,
    ) -> DebugResult<()> {
        let target = self.target()?;
        let frames = self.compute_frames(access, false).await?;
        let Some(location) = frames.first().and_then(|top| top.location()) else {
            return Ok(());
        };
        let original = OriginalStep {
            depth: kind.depth(),
            location,
            stack_depth: frames.len(),
        };

        let mut handler = StepHandler::new(kind, filters, use_filters);
        let step_request = handler.step_request(self.id, &original);
        let request = self
            .session
            .create_step_request(step_request)
            .await
            .map_err(|err| DebugError::target_request_failed("creating step request", err))?;
        handler.request = Some(request);
        let with_return = handler.resumes_with_return();
        {
            let mut state = self.state.lock();
            state.original_step = Some(original);
            state.step = Some(handler);
            state.set_running(true);
            state.preserve_frames();
        }
        target.add_step_listener(request, self.id);
        tracing::debug!(target: "jdi.model", thread = self.id, request, ?kind, "step started");

        self.element.fire_resume(kind.detail());
        self.invoke_thread(with_return).await
    }

    /// Lets the thread run for the current step request.
    async fn invoke_thread(&self, with_return: bool) -> DebugResult<()> {
        let result = if with_return {
            match self.session.force_return(self.id).await {
                Ok(()) => self.session.resume_thread(self.id).await,
                Err(err) => Err(err),
            }
        } else {
            self.session.resume_thread(self.id).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) => {
                self.step_end().await;
                self.bus.flush();
                let context = if with_return { "popping stack frame" } else { "stepping" };
                Err(DebugError::target_request_failed(context, err))
            }
        }
    }

    async fn delete_step_request(&self, request: RequestId) {
        if let Some(target) = self.target.upgrade() {
            target.remove_step_listener(request);
        }
        if let Err(err) = self.session.delete_event_request(EventRequestKind::Step, request).await {
            tracing::warn!(target: "jdi.model", thread = self.id, request, error = %err, "failed to delete step request");
        }
    }

    async fn step_end(&self) {
        let request = {
            let mut state = self.state.lock();
            state.set_running(false);
            state.original_step = None;
            state.step.take().and_then(|handler| handler.request)
        };
        if let Some(request) = request {
            self.delete_step_request(request).await;
        }
        tracing::debug!(target: "jdi.model", thread = self.id, "step ended");
        self.element.queue_suspend(EventDetail::StepEnd);
    }

    /// Cancels the pending step, if any. Silent: no event, no error.
    async fn abort_step(&self) {
        let request = {
            let mut state = self.state.lock();
            state.original_step = None;
            state.step.take().and_then(|handler| handler.request)
        };
        if let Some(request) = request {
            tracing::debug!(target: "jdi.model", thread = self.id, request, "aborting step");
            self.delete_step_request(request).await;
        }
    }

    /// A step request of this thread completed at `location`.
    pub(crate) async fn handle_step_event(&self, request: RequestId, location: Location) -> EventDisposition {
        let _access = self.acquire().await;
        let (original, needs_frame_count) = {
            let state = self.state.lock();
            match (&state.step, &state.original_step) {
                (Some(handler), Some(original)) if handler.request == Some(request) => {
                    (original.clone(), handler.needs_frame_count(original))
                }
                _ => {
                    tracing::debug!(target: "jdi.model", thread = self.id, request, "stale step event");
                    return EventDisposition::Resume;
                }
            }
        };

        let frame_count = if needs_frame_count {
            match self.session.frame_count(self.id).await {
                Ok(count) => Some(count),
                Err(err) => {
                    tracing::warn!(target: "jdi.model", thread = self.id, error = %err, "failed to read frame count");
                    self.step_end().await;
                    return EventDisposition::StaySuspended;
                }
            }
        } else {
            None
        };

        let transition = {
            let mut state = self.state.lock();
            match state.step.as_mut() {
                Some(handler) => handler.on_step_event(&location, frame_count, &original),
                None => StepTransition::End,
            }
        };
        if transition == StepTransition::End {
            self.step_end().await;
            return EventDisposition::StaySuspended;
        }

        self.delete_step_request(request).await;
        let Some((step_request, with_return, drops_frames)) = ({
            let mut state = self.state.lock();
            state.set_running(true);
            state.step.as_mut().map(|handler| {
                handler.request = None;
                (
                    handler.step_request(self.id, &original),
                    handler.resumes_with_return(),
                    matches!(handler.kind, StepKind::DropToFrame { .. }),
                )
            })
        }) else {
            return EventDisposition::Resume;
        };

        match self.session.create_step_request(step_request).await {
            Ok(secondary) => {
                if let Some(handler) = self.state.lock().step.as_mut() {
                    handler.request = Some(secondary);
                }
                if let Some(target) = self.target.upgrade() {
                    target.add_step_listener(secondary, self.id);
                }
                tracing::trace!(target: "jdi.model", thread = self.id, request = secondary, "secondary step request");
            }
            Err(err) => {
                tracing::warn!(target: "jdi.model", thread = self.id, error = %err, "failed to create secondary step request");
                self.step_end().await;
                return EventDisposition::StaySuspended;
            }
        }

        if drops_frames {
            // Frame drops resume through their own invocation.
            if let Err(err) = self.invoke_thread(with_return).await {
                tracing::warn!(target: "jdi.model", thread = self.id, error = %err, "frame drop failed");
            }
            EventDisposition::StaySuspended
        } else {
            EventDisposition::Resume
        }
    }

    // -- breakpoints --

    /// Records a breakpoint hit and lets the voters decide whether to stay suspended.
    ///
    /// Returns whether the thread ended up suspended. On `false` the caller
    /// resumes the remote thread, or the VM for a VM-wide breakpoint.
    pub async fn handle_suspend_for_breakpoint(&self, breakpoint: &Arc<JavaBreakpoint>, queue_event: bool) -> bool {
        let vm_wide = breakpoint.suspend_policy() == SuspendPolicy::Vm;
        self.state.lock().breakpoints.push(breakpoint.clone());
        let target = self.target.upgrade();

        match (&target, vm_wide) {
            (Some(target), true) => target.prepare_to_suspend_by_breakpoint(breakpoint),
            _ => self.state.lock().set_running(false),
        }

        let suspend = target
            .as_ref()
            .map_or(true, |target| target.breakpoint_vote(self.id, breakpoint));

        if suspend {
            if let (Some(target), true) = (&target, vm_wide) {
                target.suspended_by_breakpoint(breakpoint, queue_event);
            }
            self.abort_step().await;
            if queue_event {
                self.element.queue_suspend(EventDetail::Breakpoint);
            } else {
                self.element.fire_suspend(EventDetail::Breakpoint);
            }
        } else {
            match (&target, vm_wide) {
                (Some(target), true) => target.cancel_suspend_by_breakpoint(breakpoint),
                _ => {
                    let mut state = self.state.lock();
                    state.set_running(true);
                    state.preserve_frames();
                }
            }
        }
        tracing::debug!(
            target: "jdi.model",
            thread = self.id,
            request = breakpoint.request(),
            suspend,
            "breakpoint hit"
        );
        suspend
    }

    /// Records the suspension without voting or notifying.
    pub async fn handle_suspend_for_breakpoint_quiet(&self, breakpoint: &Arc<JavaBreakpoint>) -> bool {
        {
            let mut state = self.state.lock();
            state.breakpoints.push(breakpoint.clone());
            state.set_running(false);
        }
        self.abort_step().await;
        true
    }

    // -- invocation --

    /// Invokes `method` in this thread, single-threaded.
    ///
    /// The thread must be suspended and not already invoking. No events are
    /// fired; the thread is suspended again when the call returns. The
    /// request timeout is lifted for the duration of the call. Dropping the
    /// returned future does not abandon the call: it completes in the
    /// background and the thread is restored all the same.
    pub async fn invoke_method(
        &self,
        receiver: Receiver,
        method: MethodRef,
        args: Vec<Value>,
        nonvirtual: bool,
    ) -> DebugResult<Value> {
        let options = InvokeOptions {
            single_threaded: true,
            nonvirtual,
        };
        self.invoke(move |session, thread| async move {
            session.invoke_method(thread, receiver, method, args, options).await
        })
        .await
    }

    /// Creates an instance of `class` through `constructor`.
    pub async fn new_instance(
        &self,
        class: ReferenceTypeId,
        constructor: MethodRef,
        args: Vec<Value>,
    ) -> DebugResult<Value> {
        let options = InvokeOptions {
            single_threaded: true,
            nonvirtual: false,
        };
        self.invoke(move |session, thread| async move {
            session.new_instance(thread, class, constructor, args, options).await
        })
        .await
    }

    async fn invoke<F, Fut>(&self, call: F) -> DebugResult<Value>
    where
        F: FnOnce(Arc<S>, ThreadId) -> Fut,
        Fut: Future<Output = SessionResult<Value>> + Send + 'static,
    {
        let Some(this) = self.this.upgrade() else {
            return Err(DebugError::request_failed("thread is gone"));
        };
        let lease = self.begin_invocation().await?;
        let call = call(self.session.clone(), self.id);
        // Owns the call and the restore; the caller only waits for it.
        let task = tokio::spawn(async move {
            let result = call.await;
            this.invoke_complete(lease).await;
            result
        });
        match task.await {
            Ok(result) => result.map_err(Self::invoke_failed),
            Err(err) => Err(DebugError::new(
                StatusCode::Cancelled,
                format!("invocation did not finish: {err}"),
            )),
        }
    }

    fn invoke_failed(err: SessionError) -> DebugError {
        match err {
            SessionError::IncompatibleThreadState => DebugError::target_request_failed(
                "thread must be suspended by a step or breakpoint to invoke a method",
                err,
            ),
            err => DebugError::target_request_failed("invoking method", err),
        }
    }

    async fn begin_invocation(&self) -> DebugResult<RequestTimeoutLease<S>> {
        let target = self.target()?;
        let _access = self.acquire().await;
        {
            let mut state = self.state.lock();
            // An invocation in flight leaves the thread running; report the nesting.
            if state.invoking_method {
                return Err(DebugError::new(
                    StatusCode::NestedInvocation,
                    "cannot perform nested evaluations",
                ));
            }
            if !state.is_suspended() {
                return Err(DebugError::new(
                    StatusCode::ThreadNotSuspended,
                    "evaluation failed: thread not suspended",
                ));
            }
            state.set_running(true);
            state.invoking_method = true;
            state.preserve_frames();
        }
        Ok(target.lift_request_timeout())
    }

    async fn invoke_complete(&self, lease: RequestTimeoutLease<S>) {
        let access = self.acquire().await;
        self.abort_step().await;
        {
            let mut state = self.state.lock();
            state.set_running(false);
            state.invoking_method = false;
        }
        drop(lease);
        if let Err(err) = self.compute_frames(&access, false).await {
            tracing::debug!(target: "jdi.model", thread = self.id, error = %err, "failed to refresh frames after invocation");
        }
    }

    /// Runs `evaluation` with this thread marked as evaluating.
    ///
    /// Fires a resume event with `detail` before and a suspend event after,
    /// also when the returned future is dropped part way. While
    /// `honor_breakpoints` is false, breakpoint hits in this thread are
    /// ignored. The evaluation gets a token that
    /// [`Self::terminate_evaluation`] cancels.
    pub async fn run_evaluation<F, Fut, T>(
        &self,
        detail: EventDetail,
        honor_breakpoints: bool,
        evaluation: F,
    ) -> DebugResult<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = DebugResult<T>>,
    {
        let (cancel, _evaluating) = {
            let mut state = self.state.lock();
            if state.performing_evaluation {
                return Err(DebugError::new(
                    StatusCode::NestedInvocation,
                    "cannot perform nested evaluations",
                ));
            }
            let cancel = CancellationToken::new();
            state.performing_evaluation = true;
            state.honor_breakpoints = honor_breakpoints;
            state.evaluation = Some(cancel.clone());
            (cancel, Evaluating { thread: self, detail })
        };
        self.element.fire_resume(detail);

        evaluation(cancel).await
    }

    pub fn can_terminate_evaluation(&self) -> bool {
        self.state.lock().evaluation.is_some()
    }

    pub fn terminate_evaluation(&self) {
        if let Some(cancel) = &self.state.lock().evaluation {
            cancel.cancel();
        }
    }
}
