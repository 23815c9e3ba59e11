use std::sync::Arc;

use jdi_config::DebuggerConfig;
use jdi_model::mock::{frame, MockThread, MockVm};
use jdi_model::{DebugEventKind, ElementRef, EventDetail, SessionError, StatusCode, Value, Variable, VmEvent};

use crate::harness::{
    attach, attach_with, main_method, main_stack, run, vm_with_main, MAIN, MAIN_GROUP, SYSTEM_GROUP, WORKER,
};

#[tokio::test]
async fn attached_threads_mirror_vm_state() {
    let vm = vm_with_main(main_stack());
    vm.add_thread(MockThread::new(WORKER, "worker").in_group(MAIN_GROUP));
    let fixture = attach(vm).await;

    let main = fixture.main_thread();
    assert!(main.is_suspended());
    assert!(!main.is_running());
    assert!(!main.is_stepping());

    let frames = main.stack_frames().await.unwrap();
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].line_number(), Some(10));
    assert_eq!(frames[1].method().map(|m| m.name), Some("main".to_owned()));
    assert_eq!(main.frame_count().await.unwrap(), 2);

    let worker = fixture.target.thread(WORKER).unwrap();
    assert!(worker.is_running());
    assert!(worker.stack_frames().await.unwrap().is_empty());
    assert!(!worker.has_stack_frames().await.unwrap());
    assert!(worker.frame_count().await.unwrap_err().is(StatusCode::ThreadNotSuspended));
}

#[tokio::test]
async fn resume_runs_the_thread_and_reports_it() {
    let mut fixture = attach(vm_with_main(main_stack())).await;
    let main = fixture.main_thread();
    let frames = main.stack_frames().await.unwrap();

    main.resume().await.unwrap();

    let event = fixture.next_event(ElementRef::Thread(MAIN), DebugEventKind::Resume).await;
    assert_eq!(event.detail, EventDetail::ClientRequest);
    assert!(main.is_running());
    assert!(!fixture.vm.is_thread_suspended(MAIN));
    assert!(main.stack_frames().await.unwrap().is_empty());
    // Wrappers handed out earlier no longer point at a live frame.
    assert!(frames.iter().all(|frame| !frame.is_valid()));

    // Resuming a running thread is a no-op.
    main.resume().await.unwrap();
    assert_eq!(fixture.vm.thread_resumes(), vec![MAIN]);
}

#[tokio::test]
async fn failed_resume_leaves_the_thread_suspended() {
    let vm = vm_with_main(main_stack());
    vm.fail_next_resume(SessionError::Vm(13));
    let mut fixture = attach(vm).await;
    let main = fixture.main_thread();

    let err = main.resume().await.unwrap_err();
    assert!(err.is(StatusCode::TargetRequestFailed));
    assert!(main.is_suspended());

    fixture.next_event(ElementRef::Thread(MAIN), DebugEventKind::Resume).await;
    let event = fixture.next_event(ElementRef::Thread(MAIN), DebugEventKind::Suspend).await;
    assert_eq!(event.detail, EventDetail::ClientRequest);
}

#[tokio::test]
async fn resume_while_disconnected_terminates_the_thread() {
    let vm = vm_with_main(main_stack());
    vm.fail_next_resume(SessionError::Disconnected);
    let fixture = attach(vm).await;
    let main = fixture.main_thread();

    main.resume().await.unwrap();
    assert!(main.is_terminated());
    assert!(!main.is_suspended());
}

#[tokio::test]
async fn frames_keep_their_identity_across_a_vm_suspend() {
    let fixture = attach(vm_with_main(main_stack())).await;
    let main = fixture.main_thread();
    let before = main.stack_frames().await.unwrap();

    main.resume().await.unwrap();
    fixture
        .vm
        .set_thread_frames(MAIN, vec![frame(5, &run(), 11), frame(6, &main_method(), 3)]);
    fixture.target.suspend().await.unwrap();

    assert!(fixture.target.is_suspended());
    assert!(main.is_suspended());
    // The thread cannot be resumed on its own while the whole VM is suspended.
    assert!(!main.can_resume());

    let after = main.stack_frames().await.unwrap();
    assert_eq!(after.len(), 2);
    assert!(Arc::ptr_eq(&before[0], &after[0]));
    assert!(Arc::ptr_eq(&before[1], &after[1]));
    assert_eq!(after[0].line_number(), Some(11));
    assert_eq!(after[0].frame_id(), Some(5));

    fixture.target.resume().await.unwrap();
    assert!(main.is_running());
    assert_eq!(fixture.vm.vm_resumes(), 1);
}

#[tokio::test]
async fn system_threads_are_found_through_the_group_chain() {
    let vm = vm_with_main(main_stack());
    vm.add_group(102, "workers", Some(MAIN_GROUP));
    vm.add_thread(MockThread::new(WORKER, "pool-1").in_group(102));
    vm.add_thread(MockThread::new(3, "Reference Handler").in_group(SYSTEM_GROUP));
    vm.add_thread(MockThread::new(4, "orphan"));
    let fixture = attach(vm).await;

    let system = |id| fixture.target.thread(id).unwrap().is_system_thread();
    assert!(!system(MAIN));
    assert!(!system(WORKER));
    assert!(system(3));
    assert!(!system(4));
}

#[tokio::test]
async fn unsupported_group_queries_mean_user_threads() {
    let vm = vm_with_main(main_stack());
    vm.add_thread(MockThread::new(3, "Reference Handler").in_group(SYSTEM_GROUP));
    vm.set_group_queries_unsupported(true);
    let fixture = attach(vm).await;

    assert!(!fixture.target.thread(3).unwrap().is_system_thread());
    assert!(!fixture.target.thread(3).unwrap().is_terminated());
}

#[tokio::test]
async fn thread_properties_come_from_the_vm() {
    let fixture = attach(vm_with_main(main_stack())).await;
    let main = fixture.main_thread();

    assert_eq!(main.name().await.unwrap(), "main");
    assert_eq!(main.priority().await.unwrap(), 5);
    assert_eq!(main.thread_group_name().await.unwrap().as_deref(), Some("main"));
    // Cached after the first lookup.
    assert_eq!(main.thread_group_name().await.unwrap().as_deref(), Some("main"));
}

#[tokio::test]
async fn find_variable_searches_frames_top_first() {
    let vm = vm_with_main(main_stack());
    let args = Variable {
        name: "args".to_owned(),
        signature: "[Ljava/lang/String;".to_owned(),
        value: Value::Object { tag: b'[', id: 77 },
    };
    vm.set_variable(2, args.clone());
    vm.set_variable(
        1,
        Variable {
            name: "count".to_owned(),
            signature: "I".to_owned(),
            value: Value::Int(3),
        },
    );
    vm.set_variable(
        2,
        Variable {
            name: "count".to_owned(),
            signature: "I".to_owned(),
            value: Value::Int(99),
        },
    );
    let fixture = attach(vm).await;
    let main = fixture.main_thread();

    assert_eq!(main.find_variable("args").await.unwrap(), Some(args));
    assert_eq!(main.find_variable("count").await.unwrap().map(|v| v.value), Some(Value::Int(3)));
    assert_eq!(main.find_variable("missing").await.unwrap(), None);

    main.resume().await.unwrap();
    assert_eq!(main.find_variable("args").await.unwrap(), None);
}

#[tokio::test]
async fn monitors_are_only_reported_while_suspended() {
    let vm = vm_with_main(main_stack());
    vm.set_owned_monitors(MAIN, vec![55, 56]);
    let fixture = attach(vm).await;
    let main = fixture.main_thread();

    assert_eq!(main.owned_monitors().await.unwrap(), vec![55, 56]);
    assert!(main.has_owned_monitors().await.unwrap());
    assert_eq!(main.contended_monitor().await.unwrap(), None);

    main.resume().await.unwrap();
    assert!(main.owned_monitors().await.unwrap().is_empty());
    assert!(!main.has_owned_monitors().await.unwrap());
}

#[tokio::test]
async fn failed_hot_code_replace_marks_frames_out_of_sync() {
    let vm = vm_with_main(main_stack());
    vm.add_thread(MockThread::new(WORKER, "worker").in_group(MAIN_GROUP));
    let fixture = attach(vm).await;
    let main = fixture.main_thread();
    let worker = fixture.target.thread(WORKER).unwrap();

    assert!(!main.is_out_of_sync().await.unwrap());
    assert!(!worker.may_be_out_of_sync());

    fixture
        .target
        .record_hot_code_replace_failure(["com.example.Main".to_owned()]);
    assert!(fixture.target.is_out_of_sync_type("com.example.Main"));
    assert!(main.is_out_of_sync().await.unwrap());
    assert!(!main.may_be_out_of_sync());
    assert!(worker.may_be_out_of_sync());
    assert!(!worker.is_out_of_sync().await.unwrap());
}

#[tokio::test]
async fn thread_lifecycle_follows_vm_events() {
    let mut fixture = attach(vm_with_main(main_stack())).await;

    fixture.vm.add_thread(MockThread::new(WORKER, "worker").in_group(MAIN_GROUP));
    fixture.vm.emit(VmEvent::ThreadStart { thread: WORKER });
    fixture.next_event(ElementRef::Thread(WORKER), DebugEventKind::Create).await;
    let worker = fixture.target.thread(WORKER).unwrap();
    assert!(worker.is_running());

    fixture.vm.emit(VmEvent::ThreadDeath { thread: WORKER });
    fixture.next_event(ElementRef::Thread(WORKER), DebugEventKind::Terminate).await;
    assert!(worker.is_terminated());
    assert!(!worker.can_suspend());
    assert!(fixture.target.thread(WORKER).is_none());
}

#[tokio::test]
async fn terminate_needs_permission() {
    let fixture = attach(vm_with_main(main_stack())).await;
    let main = fixture.main_thread();

    assert!(!main.can_terminate());
    assert!(main.terminate().await.is_err());
    assert_eq!(fixture.vm.exit_code(), None);
}

#[tokio::test]
async fn terminate_exits_the_vm_and_ends_every_thread() {
    let mut config = DebuggerConfig::default();
    config.connect.allow_terminate = true;
    let mut fixture = attach_with(vm_with_main(main_stack()), config).await;
    let main = fixture.main_thread();

    assert!(main.can_terminate());
    main.terminate().await.unwrap();

    assert_eq!(fixture.vm.exit_code(), Some(1));
    assert!(main.is_terminated());
    assert!(fixture.target.is_disconnected());
    assert!(!fixture.target.can_terminate());
    fixture.next_event(ElementRef::Target, DebugEventKind::Terminate).await;
}

#[tokio::test]
async fn a_vm_without_threads_attaches() {
    let fixture = attach(MockVm::new()).await;
    assert!(fixture.target.threads().is_empty());
    assert!(!fixture.target.is_suspended());
}
