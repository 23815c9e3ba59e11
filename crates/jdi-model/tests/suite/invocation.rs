use std::sync::Arc;
use std::time::Duration;

use jdi_model::mock::{InvocationTarget, MockThread, MockVm};
use jdi_model::{
    DebugEventKind, DebugResult, ElementRef, EventDetail, JdiThread, MethodRef, Receiver, SessionError, StatusCode,
    Value, VmSession,
};

use crate::harness::{attach, eventually, main_stack, vm_with_main, MAIN, MAIN_GROUP, WORKER};

const TO_STRING: MethodRef = MethodRef {
    class_id: 1,
    method_id: 5,
};

#[tokio::test]
async fn invocation_lifts_the_request_timeout() {
    let fixture = attach(vm_with_main(main_stack())).await;
    let main = fixture.main_thread();

    let value = main
        .invoke_method(Receiver::Class(1), TO_STRING, vec![Value::Int(1)], false)
        .await
        .unwrap();
    assert_eq!(value, Value::Int(0));

    let invocations = fixture.vm.invocations();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].timeout, None);
    assert_eq!(invocations[0].target, InvocationTarget::Method(Receiver::Class(1)));
    assert_eq!(invocations[0].args, vec![Value::Int(1)]);
    assert!(invocations[0].options.single_threaded);
    assert!(!invocations[0].options.nonvirtual);

    assert_eq!(fixture.vm.timeout_history(), vec![None, Some(Duration::from_secs(3))]);
    assert_eq!(fixture.vm.request_timeout(), Some(Duration::from_secs(3)));
    assert!(main.is_suspended());
    assert!(!main.is_invoking_method());
}

#[tokio::test]
async fn nonvirtual_invocation_on_an_object() {
    let fixture = attach(vm_with_main(main_stack())).await;
    let main = fixture.main_thread();
    let receiver = Receiver::Object { object: 40, class: 1 };

    main.invoke_method(receiver, TO_STRING, Vec::new(), true).await.unwrap();

    let invocation = &fixture.vm.invocations()[0];
    assert_eq!(invocation.target, InvocationTarget::Method(receiver));
    assert!(invocation.options.nonvirtual);
}

#[tokio::test]
async fn thrown_exception_still_restores_the_thread() {
    let vm = vm_with_main(main_stack());
    vm.push_invoke_result(Err(SessionError::Exception(88)));
    let fixture = attach(vm).await;
    let main = fixture.main_thread();

    let err = main
        .invoke_method(Receiver::Class(1), TO_STRING, Vec::new(), false)
        .await
        .unwrap_err();
    assert!(err.is(StatusCode::TargetRequestFailed));
    assert_eq!(err.source, Some(SessionError::Exception(88)));

    assert_eq!(fixture.vm.request_timeout(), Some(Duration::from_secs(3)));
    assert!(main.is_suspended());
    assert!(!main.is_invoking_method());
    assert_eq!(main.stack_frames().await.unwrap().len(), 2);
}

#[tokio::test]
async fn running_thread_cannot_invoke() {
    let fixture = attach(vm_with_main(main_stack())).await;
    let main = fixture.main_thread();
    main.resume().await.unwrap();

    let err = main
        .invoke_method(Receiver::Class(1), TO_STRING, Vec::new(), false)
        .await
        .unwrap_err();
    assert!(err.is(StatusCode::ThreadNotSuspended));
    assert_eq!(err.message, "evaluation failed: thread not suspended");
    assert!(fixture.vm.invocations().is_empty());
    assert!(fixture.vm.timeout_history().is_empty());
}

#[tokio::test]
async fn invocation_needs_an_event_suspension_in_the_vm() {
    let fixture = attach(vm_with_main(main_stack())).await;
    let main = fixture.main_thread();
    // The VM resumed the thread behind the model's back.
    fixture.vm.resume_thread(MAIN).await.unwrap();

    let err = main
        .invoke_method(Receiver::Class(1), TO_STRING, Vec::new(), false)
        .await
        .unwrap_err();
    assert!(err.is(StatusCode::IncompatibleThreadState));
    assert!(!main.is_invoking_method());
}

#[tokio::test]
async fn nested_invocations_are_rejected() {
    let fixture = attach(vm_with_main(main_stack())).await;
    let gate = fixture.vm.gate_invocations();
    let main = fixture.main_thread();

    let outer = {
        let main = main.clone();
        tokio::spawn(async move {
            main.invoke_method(Receiver::Class(1), TO_STRING, Vec::new(), false)
                .await
        })
    };
    eventually("invocation start", || main.is_invoking_method()).await;

    let err = main
        .invoke_method(Receiver::Class(1), TO_STRING, Vec::new(), false)
        .await
        .unwrap_err();
    assert!(err.is(StatusCode::NestedInvocation));
    // The thread counts as running: no frames and no steps, but nothing blocks either.
    assert!(main.stack_frames().await.unwrap().is_empty());
    main.step_over().await.unwrap();
    assert!(fixture.vm.step_requests().is_empty());

    gate.notify_one();
    assert_eq!(outer.await.unwrap().unwrap(), Value::Int(0));
    assert!(main.is_suspended());
    assert_eq!(fixture.vm.invocations().len(), 1);
}

#[tokio::test]
async fn new_instance_runs_the_constructor() {
    let fixture = attach(vm_with_main(main_stack())).await;
    let main = fixture.main_thread();
    let constructor = MethodRef {
        class_id: 7,
        method_id: 700,
    };

    let value = main.new_instance(7, constructor, vec![Value::Int(2)]).await.unwrap();

    assert_eq!(value, Value::Object { tag: b'L', id: 9000 });
    let invocation = &fixture.vm.invocations()[0];
    assert_eq!(invocation.target, InvocationTarget::NewInstance(7));
    assert_eq!(invocation.method, constructor);
    assert_eq!(invocation.timeout, None);
}

#[tokio::test]
async fn evaluation_reports_resume_and_suspend() {
    let mut fixture = attach(vm_with_main(main_stack())).await;
    let main = fixture.main_thread();
    assert!(!main.can_terminate_evaluation());

    let inner = main.clone();
    let value = main
        .run_evaluation(EventDetail::Evaluation, true, |cancel| async move {
            assert!(inner.is_performing_evaluation());
            assert!(inner.can_terminate_evaluation());

            let nested = inner
                .run_evaluation(EventDetail::EvaluationImplicit, true, |_| async { Ok(()) })
                .await
                .unwrap_err();
            assert!(nested.is(StatusCode::NestedInvocation));

            let value = inner
                .invoke_method(Receiver::Class(1), TO_STRING, Vec::new(), false)
                .await
                .unwrap();
            inner.terminate_evaluation();
            assert!(cancel.is_cancelled());
            Ok(value)
        })
        .await
        .unwrap();

    assert_eq!(value, Value::Int(0));
    assert!(!main.is_performing_evaluation());
    assert!(!main.can_terminate_evaluation());

    let resume = fixture.next_event(ElementRef::Thread(MAIN), DebugEventKind::Resume).await;
    assert_eq!(resume.detail, EventDetail::Evaluation);
    let suspend = fixture.next_event(ElementRef::Thread(MAIN), DebugEventKind::Suspend).await;
    assert_eq!(suspend.detail, EventDetail::Evaluation);
}

#[tokio::test]
async fn abandoned_invocation_still_restores_the_thread() {
    let fixture = attach(vm_with_main(main_stack())).await;
    let gate = fixture.vm.gate_invocations();
    let main = fixture.main_thread();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        main.invoke_method(Receiver::Class(1), TO_STRING, Vec::new(), false),
    )
    .await;
    assert!(abandoned.is_err());
    // The call itself is still outstanding in the VM.
    assert!(main.is_invoking_method());
    assert_eq!(fixture.vm.request_timeout(), None);

    gate.notify_one();
    eventually("invocation end", || !main.is_invoking_method()).await;
    assert!(main.is_suspended());
    assert_eq!(fixture.vm.request_timeout(), Some(Duration::from_secs(3)));
    assert_eq!(fixture.vm.invocations().len(), 1);
    assert_eq!(main.stack_frames().await.unwrap().len(), 2);

    // The thread is usable again.
    gate.notify_one();
    main.invoke_method(Receiver::Class(1), TO_STRING, Vec::new(), false)
        .await
        .unwrap();
}

#[tokio::test]
async fn overlapping_invocations_restore_the_original_timeout() {
    let vm = vm_with_main(main_stack());
    vm.add_thread(MockThread::new(WORKER, "worker").in_group(MAIN_GROUP).suspended_at(main_stack()));
    let fixture = attach(vm).await;
    let gate = fixture.vm.gate_invocations();
    let main = fixture.main_thread();
    let worker = fixture.target.thread(WORKER).unwrap();

    let spawn_invocation = |thread: Arc<JdiThread<MockVm>>| {
        tokio::spawn(async move {
            thread
                .invoke_method(Receiver::Class(1), TO_STRING, Vec::new(), false)
                .await
        })
    };
    let first = spawn_invocation(main.clone());
    eventually("main invocation start", || main.is_invoking_method()).await;
    let second = spawn_invocation(worker.clone());
    eventually("worker invocation start", || worker.is_invoking_method()).await;
    assert_eq!(fixture.vm.request_timeout(), None);

    gate.notify_one();
    eventually("one invocation end", || {
        !main.is_invoking_method() || !worker.is_invoking_method()
    })
    .await;
    // The other call is still running without a timeout.
    assert_eq!(fixture.vm.request_timeout(), None);

    gate.notify_one();
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    assert_eq!(fixture.vm.request_timeout(), Some(Duration::from_secs(3)));
    assert_eq!(fixture.vm.timeout_history(), vec![None, Some(Duration::from_secs(3))]);
    assert!(main.is_suspended());
    assert!(worker.is_suspended());
}

#[tokio::test]
async fn abandoned_evaluation_clears_the_evaluation_state() {
    let mut fixture = attach(vm_with_main(main_stack())).await;
    let main = fixture.main_thread();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(50),
        main.run_evaluation(EventDetail::EvaluationImplicit, false, |_| {
            std::future::pending::<DebugResult<()>>()
        }),
    )
    .await;
    assert!(abandoned.is_err());

    assert!(!main.is_performing_evaluation());
    assert!(!main.can_terminate_evaluation());
    assert!(main.honors_breakpoints());
    let resume = fixture.next_event(ElementRef::Thread(MAIN), DebugEventKind::Resume).await;
    assert_eq!(resume.detail, EventDetail::EvaluationImplicit);
    let suspend = fixture.next_event(ElementRef::Thread(MAIN), DebugEventKind::Suspend).await;
    assert_eq!(suspend.detail, EventDetail::EvaluationImplicit);

    main.run_evaluation(EventDetail::Evaluation, true, |_| async { Ok(()) })
        .await
        .unwrap();
}
