use std::sync::Arc;
use std::time::Duration;

use jdi_config::DebuggerConfig;
use jdi_model::{
    DebugEventKind, DebugTarget, ElementRef, EventDetail, MethodRef, Receiver, SuspendPolicy, Value, WireSession,
};
use jdi_wire::mock::MockJdwpServer;
use jdi_wire::types::{event_kind, invoke_options, step_depth};

async fn attach_to(server: &MockJdwpServer) -> Arc<DebugTarget<WireSession>> {
    let mut config = DebuggerConfig::default();
    config.connect.host = "127.0.0.1".to_owned();
    config.connect.port = server.addr().port();
    let session = WireSession::connect(&config).await.expect("connect");
    DebugTarget::attach(Arc::new(session), &config).await.expect("attach")
}

#[tokio::test]
async fn threads_and_frames_resolve_over_the_wire() {
    let server = MockJdwpServer::spawn().await.unwrap();
    let target = attach_to(&server).await;

    assert_eq!(target.threads().len(), 2);
    let main = target.thread(MockJdwpServer::MAIN_THREAD).unwrap();
    let system = target.thread(MockJdwpServer::SYSTEM_THREAD).unwrap();
    assert!(main.is_suspended());
    assert!(!main.is_system_thread());
    assert!(system.is_running());
    assert!(system.is_system_thread());

    assert_eq!(main.name().await.unwrap(), "main");
    assert_eq!(main.priority().await.unwrap(), 5);
    assert_eq!(main.thread_group_name().await.unwrap().as_deref(), Some("main"));

    let frames = main.stack_frames().await.unwrap();
    assert_eq!(frames.len(), 2);
    let top = frames[0].location().unwrap();
    assert_eq!(top.method.name, "helper");
    assert_eq!(top.method.declaring_type, "com.example.Main");
    assert_eq!(top.line, Some(20));
    assert_eq!(frames[1].line_number(), Some(11));

    let count = main.find_variable("count").await.unwrap().unwrap();
    assert_eq!(count.value, Value::Int(7));
}

#[tokio::test]
async fn step_over_round_trips_through_the_wire() {
    let server = MockJdwpServer::spawn().await.unwrap();
    let target = attach_to(&server).await;
    let mut events = target.subscribe();
    let main = target.thread(MockJdwpServer::MAIN_THREAD).unwrap();
    let before = main.stack_frames().await.unwrap();

    main.step_over().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.source == ElementRef::Thread(MockJdwpServer::MAIN_THREAD)
                && event.kind == DebugEventKind::Suspend
            {
                assert_eq!(event.detail, EventDetail::StepEnd);
                return;
            }
        }
    })
    .await
    .expect("step end");

    let request = &server.event_requests()[0];
    assert_eq!(request.event_kind, event_kind::SINGLE_STEP);
    assert_eq!(
        request.step.map(|(thread, _, depth)| (thread, depth)),
        Some((MockJdwpServer::MAIN_THREAD, step_depth::OVER))
    );
    assert_eq!(request.count, Some(1));
    assert_eq!(server.cleared_requests(), vec![(event_kind::SINGLE_STEP, request.request_id)]);

    let after = main.stack_frames().await.unwrap();
    assert!(Arc::ptr_eq(&before[0], &after[0]));
    assert_eq!(after[0].line_number(), Some(21));
}

#[tokio::test]
async fn step_onto_a_breakpoint_resumes_nothing() {
    let server = MockJdwpServer::spawn().await.unwrap();
    let target = attach_to(&server).await;
    let mut events = target.subscribe();
    let main = target.thread(MockJdwpServer::MAIN_THREAD).unwrap();
    target
        .install_breakpoint("com.example.Main", 21, SuspendPolicy::Thread)
        .await
        .unwrap();

    main.step_over().await.unwrap();
    let detail = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.source == ElementRef::Thread(MockJdwpServer::MAIN_THREAD)
                && event.kind == DebugEventKind::Suspend
            {
                return event.detail;
            }
        }
    })
    .await
    .expect("suspend");

    assert_eq!(detail, EventDetail::Breakpoint);
    assert!(main.is_suspended());
    assert!(!main.is_stepping());
    assert_eq!(main.breakpoints().len(), 1);
    assert!(server.is_thread_suspended(MockJdwpServer::MAIN_THREAD));
    // Only the resume that started the step.
    assert_eq!(server.thread_resume_calls(), 1);
}

#[tokio::test]
async fn invocation_goes_out_single_threaded() {
    let server = MockJdwpServer::spawn().await.unwrap();
    let target = attach_to(&server).await;
    let main = target.thread(MockJdwpServer::MAIN_THREAD).unwrap();
    let method = MethodRef {
        class_id: MockJdwpServer::MAIN_CLASS,
        method_id: MockJdwpServer::HELPER_METHOD,
    };

    let value = main
        .invoke_method(Receiver::Class(MockJdwpServer::MAIN_CLASS), method, vec![Value::Int(3)], false)
        .await
        .unwrap();

    assert_eq!(value, Value::Int(42));
    let invocations = server.invocations();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].method_id, MockJdwpServer::HELPER_METHOD);
    assert_eq!(invocations[0].args, vec![Value::Int(3)]);
    assert_ne!(invocations[0].options & invoke_options::SINGLE_THREADED, 0);
    assert!(main.is_suspended());
}
