use std::sync::Arc;

use parking_lot::Mutex;

use jdi_config::DebuggerConfig;
use jdi_model::{
    DebugEventKind, DebugTarget, ElementRef, EventDetail, Status, StatusCode, StatusHandler, SuspendOutcome, ThreadId,
};

use crate::harness::{attach, main_stack, vm_with_main, Fixture, MAIN};

#[derive(Default)]
struct RecordingHandler {
    statuses: Mutex<Vec<(ThreadId, Status)>>,
}

impl StatusHandler for RecordingHandler {
    fn handle_status(&self, thread: ThreadId, status: &Status) {
        self.statuses.lock().push((thread, status.clone()));
    }
}

#[tokio::test]
async fn suspend_is_confirmed_by_the_vm() {
    let mut fixture = attach(vm_with_main(main_stack())).await;
    let main = fixture.main_thread();
    main.resume().await.unwrap();
    assert!(main.can_suspend());

    let ticket = main.suspend().await.unwrap().expect("no suspend in flight");
    assert_eq!(ticket.outcome().await.unwrap(), SuspendOutcome::Confirmed);

    assert!(main.is_suspended());
    assert!(fixture.vm.is_thread_suspended(MAIN));
    let event = fixture.next_event(ElementRef::Thread(MAIN), DebugEventKind::Suspend).await;
    assert_eq!(event.detail, EventDetail::ClientRequest);
    assert_eq!(main.stack_frames().await.unwrap().len(), 2);
}

#[tokio::test]
async fn unconfirmed_suspend_times_out_and_reports_it() {
    let vm = Arc::new(vm_with_main(main_stack()));
    vm.ignore_suspend(MAIN);
    let mut config = DebuggerConfig::default();
    config.timeouts.suspend_ms = 40;
    config.timeouts.suspend_poll_ms = 5;
    let handler = Arc::new(RecordingHandler::default());
    let target = DebugTarget::attach_with_status_handler(vm.clone(), &config, handler.clone())
        .await
        .unwrap();
    let fixture = Fixture {
        events: target.subscribe(),
        vm,
        target,
    };
    let main = fixture.main_thread();
    main.resume().await.unwrap();

    let ticket = main.suspend().await.unwrap().unwrap();
    assert_eq!(ticket.outcome().await.unwrap(), SuspendOutcome::TimedOut);

    // Treated as suspended even though the VM never confirmed.
    assert!(main.is_suspended());
    assert!(!fixture.vm.is_thread_suspended(MAIN));
    let statuses = handler.statuses.lock().clone();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].0, MAIN);
    assert_eq!(statuses[0].1.code, StatusCode::SuspendTimeout);
}

#[tokio::test]
async fn only_one_suspend_is_confirmed_at_a_time() {
    let vm = vm_with_main(main_stack());
    vm.ignore_suspend(MAIN);
    let fixture = attach(vm).await;
    let main = fixture.main_thread();
    main.resume().await.unwrap();

    let ticket = main.suspend().await.unwrap().unwrap();
    assert!(main.suspend().await.unwrap().is_none());

    ticket.cancel();
    let err = ticket.outcome().await.unwrap_err();
    assert!(err.is(StatusCode::Cancelled));
    assert!(main.is_running());

    let again = main.suspend().await.unwrap();
    assert!(again.is_some());
    if let Some(ticket) = again {
        ticket.cancel();
    }
}

#[tokio::test]
async fn suspend_aborts_a_pending_step() {
    let fixture = attach(vm_with_main(main_stack())).await;
    fixture.vm.defer_steps(MAIN);
    let main = fixture.main_thread();

    main.step_over().await.unwrap();
    assert!(main.is_stepping());

    let ticket = main.suspend().await.unwrap().unwrap();
    assert!(!main.is_stepping());
    assert_eq!(ticket.outcome().await.unwrap(), SuspendOutcome::Confirmed);

    assert!(main.is_suspended());
    assert!(fixture.vm.step_requests()[0].deleted);
    // The deleted request never reports.
    assert!(!fixture.vm.complete_deferred_step(MAIN));
}
