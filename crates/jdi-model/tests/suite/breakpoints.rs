use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use jdi_model::mock::{frame, MockThread};
use jdi_model::session::EventRequestKind;
use jdi_model::{
    BreakpointListener, DebugEventKind, ElementRef, EventDetail, JavaBreakpoint, SuspendPolicy, ThreadId, Vote,
};

use crate::harness::{
    attach, eventually, main_method, main_stack, run, vm_with_main, Fixture, MAIN, MAIN_GROUP, WORKER,
};

struct Voter {
    vote: Vote,
    calls: AtomicUsize,
}

impl Voter {
    fn new(vote: Vote) -> Arc<Self> {
        Arc::new(Self {
            vote,
            calls: AtomicUsize::new(0),
        })
    }
}

impl BreakpointListener for Voter {
    fn breakpoint_hit(&self, _thread: ThreadId, _breakpoint: &JavaBreakpoint) -> Vote {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.vote
    }
}

/// `main` running with a worker thread beside it.
async fn running_main() -> Fixture {
    let vm = vm_with_main(main_stack());
    vm.add_thread(MockThread::new(WORKER, "worker").in_group(MAIN_GROUP));
    let fixture = attach(vm).await;
    fixture.main_thread().resume().await.unwrap();
    fixture
}

#[tokio::test]
async fn thread_breakpoint_suspends_the_thread() {
    let mut fixture = running_main().await;
    let main = fixture.main_thread();
    let breakpoint = fixture
        .target
        .install_breakpoint("com.example.Main", 10, SuspendPolicy::Thread)
        .await
        .unwrap();
    assert_eq!(fixture.vm.breakpoint_requests()[0].1.line, 10);

    assert!(fixture.vm.hit_breakpoint(MAIN, breakpoint.request()));
    let event = fixture.next_event(ElementRef::Thread(MAIN), DebugEventKind::Suspend).await;
    assert_eq!(event.detail, EventDetail::Breakpoint);

    assert!(main.is_suspended());
    assert_eq!(breakpoint.hit_count(), 1);
    let current = main.breakpoints();
    assert_eq!(current.len(), 1);
    assert!(Arc::ptr_eq(&current[0], &breakpoint));
    assert!(!fixture.target.is_suspended());
    assert!(fixture.target.thread(WORKER).unwrap().is_running());

    main.resume().await.unwrap();
    assert!(main.breakpoints().is_empty());
}

#[tokio::test]
async fn a_veto_resumes_the_thread() {
    let fixture = running_main().await;
    let main = fixture.main_thread();
    let suspend = Voter::new(Vote::Suspend);
    let veto = Voter::new(Vote::DontSuspend);
    fixture.target.add_breakpoint_listener(suspend.clone());
    fixture.target.add_breakpoint_listener(veto.clone());
    let breakpoint = fixture
        .target
        .install_breakpoint("com.example.Main", 10, SuspendPolicy::Thread)
        .await
        .unwrap();

    fixture.vm.hit_breakpoint(MAIN, breakpoint.request());
    let vm = fixture.vm.clone();
    eventually("veto resume", || vm.thread_resumes().len() == 2).await;

    assert!(main.is_running());
    assert!(!fixture.vm.is_thread_suspended(MAIN));
    assert!(main.breakpoints().is_empty());
    // Both listeners were asked.
    assert_eq!(suspend.calls.load(Ordering::SeqCst), 1);
    assert_eq!(veto.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn vm_breakpoint_suspends_every_thread() {
    let mut fixture = running_main().await;
    let breakpoint = fixture
        .target
        .install_breakpoint("com.example.Main", 10, SuspendPolicy::Vm)
        .await
        .unwrap();

    fixture.vm.hit_breakpoint(MAIN, breakpoint.request());
    let event = fixture.next_event(ElementRef::Target, DebugEventKind::Suspend).await;
    assert_eq!(event.detail, EventDetail::Breakpoint);
    fixture.next_event(ElementRef::Thread(MAIN), DebugEventKind::Suspend).await;

    assert!(fixture.target.is_suspended());
    assert!(fixture.main_thread().is_suspended());
    assert!(fixture.target.thread(WORKER).unwrap().is_suspended());
    assert_eq!(fixture.vm.vm_resumes(), 0);
}

#[tokio::test]
async fn vetoed_vm_breakpoint_resumes_the_vm() {
    let fixture = running_main().await;
    fixture.target.add_breakpoint_listener(Voter::new(Vote::DontSuspend));
    let breakpoint = fixture
        .target
        .install_breakpoint("com.example.Main", 10, SuspendPolicy::Vm)
        .await
        .unwrap();

    fixture.vm.hit_breakpoint(MAIN, breakpoint.request());
    let vm = fixture.vm.clone();
    eventually("VM resume", || vm.vm_resumes() == 1).await;

    assert!(!fixture.target.is_suspended());
    assert!(fixture.main_thread().is_running());
    assert!(fixture.target.thread(WORKER).unwrap().is_running());
    // The VM resume covers the thread; no separate thread resume.
    assert_eq!(fixture.vm.thread_resumes(), vec![MAIN]);
}

#[tokio::test]
async fn breakpoints_are_ignored_during_a_silent_evaluation() {
    let fixture = running_main().await;
    let main = fixture.main_thread();
    let breakpoint = fixture
        .target
        .install_breakpoint("com.example.Main", 10, SuspendPolicy::Thread)
        .await
        .unwrap();

    let vm = fixture.vm.clone();
    let request = breakpoint.request();
    main.run_evaluation(EventDetail::EvaluationImplicit, false, |_| async move {
        vm.hit_breakpoint(MAIN, request);
        eventually("ignored breakpoint resume", || vm.thread_resumes().len() == 2).await;
        Ok(())
    })
    .await
    .unwrap();

    assert_eq!(breakpoint.hit_count(), 1);
    assert!(main.breakpoints().is_empty());
    assert!(main.honors_breakpoints());
}

#[tokio::test]
async fn breakpoint_hit_aborts_a_pending_step() {
    let mut fixture = attach(vm_with_main(main_stack())).await;
    fixture.vm.defer_steps(MAIN);
    let main = fixture.main_thread();
    let breakpoint = fixture
        .target
        .install_breakpoint("com.example.Main", 12, SuspendPolicy::Thread)
        .await
        .unwrap();

    main.step_over().await.unwrap();
    assert!(main.is_stepping());

    fixture.vm.hit_breakpoint(MAIN, breakpoint.request());
    let event = fixture.next_event(ElementRef::Thread(MAIN), DebugEventKind::Suspend).await;
    assert_eq!(event.detail, EventDetail::Breakpoint);

    assert!(!main.is_stepping());
    assert!(main.is_suspended());
    assert!(fixture.vm.step_requests()[0].deleted);
}

#[tokio::test]
async fn unknown_breakpoint_requests_resume_the_thread() {
    let fixture = running_main().await;

    fixture.vm.hit_breakpoint(MAIN, 4242);
    let vm = fixture.vm.clone();
    eventually("resume after unknown breakpoint", || vm.thread_resumes().len() == 2).await;
    assert!(fixture.main_thread().is_running());
}

#[tokio::test]
async fn removed_breakpoints_are_cleared_everywhere() {
    let mut fixture = running_main().await;
    let main = fixture.main_thread();
    let breakpoint = fixture
        .target
        .install_breakpoint("com.example.Main", 10, SuspendPolicy::Thread)
        .await
        .unwrap();
    fixture.vm.hit_breakpoint(MAIN, breakpoint.request());
    fixture.next_event(ElementRef::Thread(MAIN), DebugEventKind::Suspend).await;

    fixture.target.remove_breakpoint(&breakpoint).await.unwrap();

    assert!(main.breakpoints().is_empty());
    assert!(fixture.target.breakpoints().is_empty());
    assert_eq!(
        fixture.vm.deleted_requests(),
        vec![(EventRequestKind::Breakpoint, breakpoint.request())]
    );
}

#[tokio::test]
async fn step_ending_on_a_breakpoint_keeps_the_thread_suspended() {
    let mut fixture = attach(vm_with_main(main_stack())).await;
    fixture.vm.defer_steps(MAIN);
    let main = fixture.main_thread();
    let breakpoint = fixture
        .target
        .install_breakpoint("com.example.Main", 11, SuspendPolicy::Thread)
        .await
        .unwrap();

    main.step_over().await.unwrap();
    // One event set: the breakpoint, then the step that landed on it.
    assert!(fixture
        .vm
        .complete_deferred_step_at_breakpoint(MAIN, breakpoint.request(), false));
    let event = fixture.next_event(ElementRef::Thread(MAIN), DebugEventKind::Suspend).await;
    assert_eq!(event.detail, EventDetail::Breakpoint);

    assert!(main.is_suspended());
    assert!(fixture.vm.is_thread_suspended(MAIN));
    assert!(!main.is_stepping());
    assert_eq!(main.breakpoints().len(), 1);
    // Only the resume that started the step.
    assert_eq!(fixture.vm.thread_resumes(), vec![MAIN]);
}

#[tokio::test]
async fn continuing_step_yields_to_a_breakpoint_in_the_same_set() {
    let mut fixture = attach(vm_with_main(main_stack())).await;
    fixture.vm.defer_steps(MAIN);
    let mut same_line = frame(1, &run(), 10);
    same_line.location.code_index = 14;
    fixture
        .vm
        .push_step_landing(MAIN, vec![same_line, frame(2, &main_method(), 3)]);
    let main = fixture.main_thread();
    let breakpoint = fixture
        .target
        .install_breakpoint("com.example.Main", 10, SuspendPolicy::Thread)
        .await
        .unwrap();

    main.step_into().await.unwrap();
    // The step bounces back to its start line and would continue, but the
    // breakpoint reported with it wins.
    assert!(fixture
        .vm
        .complete_deferred_step_at_breakpoint(MAIN, breakpoint.request(), true));
    let event = fixture.next_event(ElementRef::Thread(MAIN), DebugEventKind::Suspend).await;
    assert_eq!(event.detail, EventDetail::Breakpoint);

    assert!(main.is_suspended());
    assert!(fixture.vm.is_thread_suspended(MAIN));
    assert!(!main.is_stepping());
    let requests = fixture.vm.step_requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].deleted);
    assert_eq!(fixture.vm.thread_resumes(), vec![MAIN]);
}
