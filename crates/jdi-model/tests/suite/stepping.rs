use std::sync::Arc;

use jdi_config::StepFilterConfig;
use jdi_model::mock::frame;
use jdi_model::session::StepDepth;
use jdi_model::{
    DebugEventKind, ElementRef, EventDetail, SessionError, StatusCode, StepFilters, StepKind, VmEvent,
};

use crate::harness::{
    attach, eventually, helper, main_method, main_stack, run, value_of, vm_with_main, MAIN,
};

fn filters(enabled: bool, patterns: &[&str]) -> StepFilters {
    StepFilters::from_config(&StepFilterConfig {
        enabled,
        active_patterns: patterns.iter().map(|p| (*p).to_owned()).collect(),
        ..StepFilterConfig::default()
    })
}

#[tokio::test]
async fn step_over_stops_on_the_next_line() {
    let mut fixture = attach(vm_with_main(main_stack())).await;
    let main = fixture.main_thread();
    let before = main.stack_frames().await.unwrap();

    main.step_over().await.unwrap();
    let event = fixture.next_event(ElementRef::Thread(MAIN), DebugEventKind::Resume).await;
    assert_eq!(event.detail, EventDetail::StepOver);
    fixture.step_end().await;

    assert!(main.is_suspended());
    assert!(!main.is_stepping());
    let after = main.stack_frames().await.unwrap();
    assert!(Arc::ptr_eq(&before[0], &after[0]));
    assert_eq!(after[0].line_number(), Some(11));

    let requests = fixture.vm.step_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].request.depth, StepDepth::Over);
    assert_eq!(requests[0].request.count, Some(1));
    assert!(requests[0].request.class_exclusions.is_empty());
    assert!(requests[0].fired);
    assert!(requests[0].deleted);
}

#[tokio::test]
async fn no_second_step_while_one_is_pending() {
    let fixture = attach(vm_with_main(main_stack())).await;
    fixture.vm.defer_steps(MAIN);
    let main = fixture.main_thread();

    main.step_over().await.unwrap();
    assert!(main.is_stepping());
    assert!(main.is_running());
    assert!(!main.can_step().await);

    main.step_into().await.unwrap();
    main.step_return().await.unwrap();
    assert_eq!(fixture.vm.step_requests().len(), 1);

    assert!(fixture.vm.complete_deferred_step(MAIN));
    eventually("step end", || !main.is_stepping()).await;
    assert!(main.is_suspended());
}

#[tokio::test]
async fn filtered_step_into_passes_through_library_code() {
    let mut fixture = attach(vm_with_main(main_stack())).await;
    fixture.target.set_step_filters(filters(true, &["java.*"]));
    fixture.vm.push_step_landing(
        MAIN,
        vec![frame(20, &value_of(), 300), frame(1, &run(), 10), frame(2, &main_method(), 3)],
    );
    fixture.vm.push_step_landing(
        MAIN,
        vec![frame(21, &helper(), 5), frame(1, &run(), 10), frame(2, &main_method(), 3)],
    );
    let main = fixture.main_thread();

    main.step_into().await.unwrap();
    fixture.step_end().await;

    let requests = fixture.vm.step_requests();
    assert_eq!(requests.len(), 2, "one secondary request for the filtered landing");
    for recorded in &requests {
        assert_eq!(recorded.request.depth, StepDepth::Into);
        assert_eq!(recorded.request.class_exclusions, vec!["java.*".to_owned()]);
        assert!(recorded.deleted);
    }

    let top = main.top_stack_frame().await.unwrap().unwrap();
    assert_eq!(top.declaring_type_name().as_deref(), Some("com.example.Util"));
    assert_eq!(main.frame_count().await.unwrap(), 3);
}

#[tokio::test]
async fn step_into_starting_in_filtered_code_can_stop_there() {
    let stack = vec![frame(20, &value_of(), 300), frame(1, &run(), 10)];
    let mut fixture = attach(vm_with_main(stack)).await;
    fixture.target.set_step_filters(filters(true, &["java.*"]));
    let main = fixture.main_thread();

    main.step_into().await.unwrap();
    fixture.step_end().await;

    let requests = fixture.vm.step_requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].request.class_exclusions.is_empty());
    assert_eq!(main.stack_frames().await.unwrap()[0].line_number(), Some(301));
}

#[tokio::test]
async fn step_into_back_to_the_start_line_steps_again() {
    let mut fixture = attach(vm_with_main(main_stack())).await;
    let mut same_line = frame(1, &run(), 10);
    same_line.location.code_index = 14;
    fixture
        .vm
        .push_step_landing(MAIN, vec![same_line, frame(2, &main_method(), 3)]);
    let main = fixture.main_thread();

    main.step_into().await.unwrap();
    fixture.step_end().await;

    assert_eq!(fixture.vm.step_requests().len(), 2);
    assert_eq!(main.stack_frames().await.unwrap()[0].line_number(), Some(11));
}

#[tokio::test]
async fn recursive_call_on_the_same_line_ends_the_step() {
    let mut fixture = attach(vm_with_main(main_stack())).await;
    let mut recursive = frame(30, &run(), 10);
    recursive.location.code_index = 0;
    fixture.vm.push_step_landing(
        MAIN,
        vec![recursive, frame(1, &run(), 10), frame(2, &main_method(), 3)],
    );
    let main = fixture.main_thread();

    main.step_into().await.unwrap();
    fixture.step_end().await;

    assert_eq!(fixture.vm.step_requests().len(), 1);
    let frames = main.stack_frames().await.unwrap();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[0].frame_id(), Some(30));
}

#[tokio::test]
async fn step_return_leaves_the_current_method() {
    let mut fixture = attach(vm_with_main(main_stack())).await;
    let main = fixture.main_thread();
    let before = main.stack_frames().await.unwrap();

    main.step_return().await.unwrap();
    let event = fixture.next_event(ElementRef::Thread(MAIN), DebugEventKind::Resume).await;
    assert_eq!(event.detail, EventDetail::StepReturn);
    fixture.step_end().await;

    let after = main.stack_frames().await.unwrap();
    assert_eq!(after.len(), 1);
    assert!(Arc::ptr_eq(&before[1], &after[0]));
    assert_eq!(fixture.vm.step_requests()[0].request.depth, StepDepth::Out);
}

#[tokio::test]
async fn step_to_frame_steps_out_until_the_frame_is_on_top() {
    let stack = vec![frame(3, &helper(), 20), frame(1, &run(), 10), frame(2, &main_method(), 3)];
    let mut fixture = attach(vm_with_main(stack)).await;
    let main = fixture.main_thread();
    let frames = main.stack_frames().await.unwrap();

    main.step_to_frame(&frames[2]).await.unwrap();
    fixture.step_end().await;

    let requests = fixture.vm.step_requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|recorded| recorded.request.depth == StepDepth::Out));
    let after = main.stack_frames().await.unwrap();
    assert_eq!(after.len(), 1);
    assert!(Arc::ptr_eq(&frames[2], &after[0]));
}

#[tokio::test]
async fn step_to_a_foreign_frame_is_rejected() {
    let fixture = attach(vm_with_main(main_stack())).await;
    let main = fixture.main_thread();
    let first = main.stack_frames().await.unwrap();

    main.resume().await.unwrap();
    fixture.vm.set_thread_frames(MAIN, vec![frame(9, &helper(), 20)]);
    fixture.target.suspend().await.unwrap();

    // run/main were replaced by helper, so the old wrappers are stale.
    let err = main.step_to_frame(&first[1]).await.unwrap_err();
    assert!(err.is(StatusCode::InvalidStackFrame));
    assert!(fixture.vm.step_requests().is_empty());
}

#[tokio::test]
async fn step_with_filters_overrides_disabled_filtering() {
    let mut fixture = attach(vm_with_main(main_stack())).await;
    fixture.target.set_step_filters(filters(false, &["java.*"]));
    let main = fixture.main_thread();
    assert!(main.can_step_with_filters().await);

    main.step_into().await.unwrap();
    fixture.step_end().await;
    main.step_with_filters().await.unwrap();
    fixture.step_end().await;

    let requests = fixture.vm.step_requests();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].request.class_exclusions.is_empty());
    assert_eq!(requests[1].request.class_exclusions, vec!["java.*".to_owned()]);
}

#[tokio::test]
async fn step_with_filters_needs_active_patterns() {
    let fixture = attach(vm_with_main(main_stack())).await;
    let main = fixture.main_thread();

    assert!(!main.can_step_with_filters().await);
    main.step_with_filters().await.unwrap();
    assert!(fixture.vm.step_requests().is_empty());
}

#[tokio::test]
async fn explicit_filter_snapshot_wins_over_the_target_filters() {
    let mut fixture = attach(vm_with_main(main_stack())).await;
    let main = fixture.main_thread();

    main.step(StepKind::Into, Arc::new(filters(true, &["org.*"])))
        .await
        .unwrap();
    fixture.step_end().await;

    assert_eq!(
        fixture.vm.step_requests()[0].request.class_exclusions,
        vec!["org.*".to_owned()]
    );
}

#[tokio::test]
async fn failed_step_resume_ends_the_step() {
    let vm = vm_with_main(main_stack());
    vm.fail_next_resume(SessionError::Vm(13));
    let mut fixture = attach(vm).await;
    let main = fixture.main_thread();

    let err = main.step_over().await.unwrap_err();
    assert!(err.is(StatusCode::TargetRequestFailed));
    fixture.step_end().await;

    assert!(main.is_suspended());
    assert!(!main.is_stepping());
    assert!(fixture.vm.step_requests()[0].deleted);
}

#[tokio::test]
async fn no_stepping_during_hot_code_replace() {
    let fixture = attach(vm_with_main(main_stack())).await;
    let main = fixture.main_thread();

    fixture.target.set_performing_hot_code_replace(true);
    assert!(!main.can_step_over().await);
    main.step_over().await.unwrap();
    assert!(fixture.vm.step_requests().is_empty());

    fixture.target.set_performing_hot_code_replace(false);
    assert!(main.can_step_over().await);
}

#[tokio::test]
async fn step_event_without_an_owner_resumes_the_thread() {
    let fixture = attach(vm_with_main(main_stack())).await;
    let location = main_stack()[0].location.clone();

    fixture.vm.emit(VmEvent::Step {
        request: 999,
        thread: MAIN,
        location,
    });

    let vm = fixture.vm.clone();
    eventually("orphan step resume", || vm.thread_resumes() == vec![MAIN]).await;
}
