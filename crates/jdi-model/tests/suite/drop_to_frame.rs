use jdi_model::mock::{frame, method};
use jdi_model::session::StepDepth;
use jdi_model::{DebugEventKind, ElementRef, EventDetail, RemoteFrame, StatusCode};

use crate::harness::{attach, vm_with_main, MAIN};

/// `a` (line 30) called from `b` (line 20) called from `c` (line 10).
fn three_deep() -> Vec<RemoteFrame> {
    vec![
        frame(1, &method(101, "com.example.Main", "a"), 30),
        frame(2, &method(102, "com.example.Main", "b"), 20),
        frame(3, &method(103, "com.example.Main", "c"), 10),
    ]
}

#[tokio::test]
async fn native_drop_pops_and_reenters_the_frame() {
    let vm = vm_with_main(three_deep());
    vm.set_can_pop_frames(true);
    let mut fixture = attach(vm).await;
    let main = fixture.main_thread();
    let frames = main.stack_frames().await.unwrap();

    assert!(main.can_drop_to_frame(&frames[1]).await);
    main.drop_to_frame(&frames[1]).await.unwrap();
    fixture.step_end().await;

    assert_eq!(fixture.vm.popped_frames(), vec![(MAIN, 2)]);
    let requests = fixture.vm.step_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].request.depth, StepDepth::Into);

    let after = main.stack_frames().await.unwrap();
    assert_eq!(after.len(), 2);
    let top = after[0].location().unwrap();
    assert_eq!(top.method.name, "b");
    assert_eq!(top.code_index, 0);
    assert_eq!(after[1].method().map(|m| m.name).as_deref(), Some("c"));
}

#[tokio::test]
async fn the_bottom_frame_cannot_be_popped() {
    let vm = vm_with_main(three_deep());
    vm.set_can_pop_frames(true);
    let mut fixture = attach(vm).await;
    let main = fixture.main_thread();
    let frames = main.stack_frames().await.unwrap();

    assert!(!main.can_drop_to_frame(&frames[2]).await);

    let err = main.drop_to_frame(&frames[2]).await.unwrap_err();
    assert!(err.is(StatusCode::InvalidStackFrame));
    let event = fixture.next_event(ElementRef::Thread(MAIN), DebugEventKind::Change).await;
    assert_eq!(event.detail, EventDetail::Content);
    assert!(fixture.vm.step_requests().is_empty());
    assert!(!main.is_stepping());
}

#[tokio::test]
async fn simulated_drop_returns_then_reenters() {
    let mut fixture = attach(vm_with_main(three_deep())).await;
    let main = fixture.main_thread();
    let frames = main.stack_frames().await.unwrap();

    // Without native popping any frame can be re-entered by simulation.
    assert!(main.can_drop_to_frame(&frames[2]).await);
    main.drop_to_frame(&frames[1]).await.unwrap();
    let event = fixture.next_event(ElementRef::Thread(MAIN), DebugEventKind::Resume).await;
    assert_eq!(event.detail, EventDetail::StepReturn);
    fixture.step_end().await;

    let depths: Vec<_> = fixture
        .vm
        .step_requests()
        .iter()
        .map(|recorded| recorded.request.depth)
        .collect();
    assert_eq!(depths, vec![StepDepth::Out, StepDepth::Reenter, StepDepth::Into]);
    assert!(fixture.vm.popped_frames().is_empty());

    let after = main.stack_frames().await.unwrap();
    assert_eq!(after.len(), 2);
    assert_eq!(after[0].method().map(|m| m.name).as_deref(), Some("b"));
    assert!(main.is_suspended());
    assert!(!main.is_stepping());
}

#[tokio::test]
async fn drop_needs_a_suspended_thread() {
    let fixture = attach(vm_with_main(three_deep())).await;
    let main = fixture.main_thread();
    let frames = main.stack_frames().await.unwrap();

    main.resume().await.unwrap();
    assert!(!main.can_drop_to_frame(&frames[1]).await);
    main.drop_to_frame(&frames[1]).await.unwrap();
    assert!(fixture.vm.step_requests().is_empty());
}
