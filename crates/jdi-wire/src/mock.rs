use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedWriteHalf, TcpListener},
};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{encode_command, encode_reply, JdwpReader, JdwpWriter, PacketHeader, EVENT_COMPOSITE, HANDSHAKE},
    poison::lock,
    types::{
        error_code, event_kind, suspend_policy, JdwpIdSizes, JdwpValue, Location, MethodId,
        ObjectId, ReferenceTypeId, RequestId, ThreadId, JDWP_HEADER_LEN,
    },
};

/// A tiny in-process JDWP server for tests.
///
/// The VM has two threads: `main` (suspended, two frames deep in
/// `com.example.Main`) and a `system` group thread with no frames. Resuming a
/// thread with an armed step request advances its top frame to the next line
/// and reports a step event.
pub struct MockJdwpServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<Mutex<VmState>>,
}

#[derive(Clone, Debug)]
pub struct MockJdwpServerConfig {
    pub id_sizes: JdwpIdSizes,
    /// Raw `CapabilitiesNew` flags in protocol order.
    pub capabilities: Vec<bool>,
}

impl Default for MockJdwpServerConfig {
    fn default() -> Self {
        let mut capabilities = vec![false; 32];
        capabilities[4] = true;
        capabilities[5] = true;
        capabilities[10] = true;
        capabilities[20] = true;
        Self {
            id_sizes: JdwpIdSizes::default(),
            capabilities,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEventRequest {
    pub request_id: RequestId,
    pub event_kind: u8,
    pub suspend_policy: u8,
    pub modifier_kinds: Vec<u8>,
    pub count: Option<u32>,
    /// `(thread, size, depth)` of a step modifier.
    pub step: Option<(ThreadId, u32, u32)>,
    pub class_excludes: Vec<String>,
    pub location: Option<Location>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedInvoke {
    pub command_set: u8,
    pub command: u8,
    pub method_id: MethodId,
    pub args: Vec<JdwpValue>,
    pub options: u32,
}

#[derive(Debug, Clone)]
struct MockMethod {
    id: MethodId,
    name: &'static str,
    signature: &'static str,
    mod_bits: u32,
    lines: Vec<(u64, i32)>,
}

#[derive(Debug, Clone)]
struct MockClass {
    id: ReferenceTypeId,
    signature: &'static str,
    methods: Vec<MockMethod>,
}

#[derive(Debug, Clone)]
struct MockThread {
    id: ThreadId,
    name: &'static str,
    group: ObjectId,
    suspend_count: u32,
    frames: Vec<(u64, Location)>,
}

#[derive(Debug)]
struct VmState {
    sizes: JdwpIdSizes,
    capabilities: Vec<bool>,
    threads: Vec<MockThread>,
    groups: Vec<(ObjectId, &'static str, ObjectId)>,
    classes: Vec<MockClass>,
    next_request_id: RequestId,
    next_packet_id: u32,
    event_requests: Vec<RecordedEventRequest>,
    /// Armed one-shot step requests: `(request, thread)`.
    armed_steps: Vec<(RequestId, ThreadId)>,
    cleared: Vec<(u8, RequestId)>,
    invocations: Vec<RecordedInvoke>,
    popped_frames: Vec<u64>,
    thread_resume_calls: u32,
    vm_resume_calls: u32,
    /// Event kind written ahead of the next stop event set.
    unknown_event: Option<u8>,
}

impl MockJdwpServer {
    pub const MAIN_THREAD: ThreadId = 1;
    pub const SYSTEM_THREAD: ThreadId = 2;
    pub const MAIN_GROUP: ObjectId = 100;
    pub const SYSTEM_GROUP: ObjectId = 101;
    pub const MAIN_CLASS: ReferenceTypeId = 10;
    pub const THREAD_CLASS: ReferenceTypeId = 11;
    pub const MAIN_METHOD: MethodId = 20;
    pub const HELPER_METHOD: MethodId = 21;
    pub const PRIORITY_FIELD: u64 = 500;

    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(MockJdwpServerConfig::default()).await
    }

    pub async fn spawn_with_config(config: MockJdwpServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let state = Arc::new(Mutex::new(VmState::new(config)));

        let task_state = state.clone();
        let task_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = run(listener, task_state, task_shutdown).await {
                tracing::debug!(target: "jdi.wire", error = %err, "mock JDWP server stopped");
            }
        });

        Ok(Self { addr, shutdown, state })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn event_requests(&self) -> Vec<RecordedEventRequest> {
        lock(&self.state, "mock.event_requests").event_requests.clone()
    }

    pub fn cleared_requests(&self) -> Vec<(u8, RequestId)> {
        lock(&self.state, "mock.cleared").cleared.clone()
    }

    pub fn invocations(&self) -> Vec<RecordedInvoke> {
        lock(&self.state, "mock.invocations").invocations.clone()
    }

    pub fn popped_frames(&self) -> Vec<u64> {
        lock(&self.state, "mock.popped_frames").popped_frames.clone()
    }

    pub fn thread_resume_calls(&self) -> u32 {
        lock(&self.state, "mock.thread_resume_calls").thread_resume_calls
    }

    pub fn vm_resume_calls(&self) -> u32 {
        lock(&self.state, "mock.vm_resume_calls").vm_resume_calls
    }

    pub fn is_thread_suspended(&self, thread: ThreadId) -> bool {
        let state = lock(&self.state, "mock.is_thread_suspended");
        state.thread(thread).is_some_and(|t| t.suspend_count > 0)
    }

    /// Leads the next stop event set with an event of `kind`, which carries no body.
    pub fn inject_unknown_event(&self, kind: u8) {
        lock(&self.state, "mock.unknown_event").unknown_event = Some(kind);
    }

    pub fn frame_count(&self, thread: ThreadId) -> Option<usize> {
        let state = lock(&self.state, "mock.frame_count");
        state.thread(thread).map(|t| t.frames.len())
    }
}

impl Drop for MockJdwpServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn location(class_id: ReferenceTypeId, method_id: MethodId, index: u64) -> Location {
    Location {
        type_tag: 1,
        class_id,
        method_id,
        index,
    }
}

impl VmState {
    fn new(config: MockJdwpServerConfig) -> Self {
        let main_class = MockClass {
            id: MockJdwpServer::MAIN_CLASS,
            signature: "Lcom/example/Main;",
            methods: vec![
                MockMethod {
                    id: MockJdwpServer::MAIN_METHOD,
                    name: "main",
                    signature: "([Ljava/lang/String;)V",
                    mod_bits: 0x0009,
                    lines: vec![(0, 10), (4, 11), (8, 12)],
                },
                MockMethod {
                    id: MockJdwpServer::HELPER_METHOD,
                    name: "helper",
                    signature: "()V",
                    mod_bits: 0x0002,
                    lines: vec![(0, 20), (3, 21), (6, 22)],
                },
            ],
        };
        let thread_class = MockClass {
            id: MockJdwpServer::THREAD_CLASS,
            signature: "Ljava/lang/Thread;",
            methods: Vec::new(),
        };
        Self {
            sizes: config.id_sizes,
            capabilities: config.capabilities,
            threads: vec![
                MockThread {
                    id: MockJdwpServer::MAIN_THREAD,
                    name: "main",
                    group: MockJdwpServer::MAIN_GROUP,
                    suspend_count: 1,
                    frames: vec![
                        (1000, location(MockJdwpServer::MAIN_CLASS, MockJdwpServer::HELPER_METHOD, 0)),
                        (1001, location(MockJdwpServer::MAIN_CLASS, MockJdwpServer::MAIN_METHOD, 4)),
                    ],
                },
                MockThread {
                    id: MockJdwpServer::SYSTEM_THREAD,
                    name: "Reference Handler",
                    group: MockJdwpServer::SYSTEM_GROUP,
                    suspend_count: 0,
                    frames: Vec::new(),
                },
            ],
            groups: vec![
                (MockJdwpServer::MAIN_GROUP, "main", MockJdwpServer::SYSTEM_GROUP),
                (MockJdwpServer::SYSTEM_GROUP, "system", 0),
            ],
            classes: vec![main_class, thread_class],
            next_request_id: 1,
            next_packet_id: 0x4000_0000,
            event_requests: Vec::new(),
            armed_steps: Vec::new(),
            cleared: Vec::new(),
            invocations: Vec::new(),
            popped_frames: Vec::new(),
            thread_resume_calls: 0,
            vm_resume_calls: 0,
            unknown_event: None,
        }
    }

    fn thread(&self, id: ThreadId) -> Option<&MockThread> {
        self.threads.iter().find(|t| t.id == id)
    }

    fn thread_mut(&mut self, id: ThreadId) -> Option<&mut MockThread> {
        self.threads.iter_mut().find(|t| t.id == id)
    }

    fn class(&self, id: ReferenceTypeId) -> Option<&MockClass> {
        self.classes.iter().find(|c| c.id == id)
    }

    fn method(&self, class_id: ReferenceTypeId, method_id: MethodId) -> Option<&MockMethod> {
        self.class(class_id)?.methods.iter().find(|m| m.id == method_id)
    }

    /// Move the thread's top frame to the next line and build the step event.
    fn complete_step(&mut self, request: RequestId, thread: ThreadId) -> Option<Vec<u8>> {
        let top = self.thread(thread)?.frames.first().copied()?;
        let (frame_id, loc) = top;
        let next_index = self
            .method(loc.class_id, loc.method_id)
            .and_then(|m| m.lines.iter().map(|(idx, _)| *idx).find(|idx| *idx > loc.index))
            .unwrap_or(loc.index);
        let moved = Location { index: next_index, ..loc };
        let t = self.thread_mut(thread)?;
        t.frames[0] = (frame_id, moved);
        t.suspend_count = 1;

        // Breakpoints at the landing location report in the same set.
        let breakpoints: Vec<_> = self
            .event_requests
            .iter()
            .filter(|req| {
                req.event_kind == event_kind::BREAKPOINT
                    && req.location == Some(moved)
                    && !self.cleared.contains(&(event_kind::BREAKPOINT, req.request_id))
            })
            .map(|req| (event_kind::BREAKPOINT, req.request_id, req.suspend_policy))
            .collect();
        let policy = breakpoints
            .iter()
            .map(|(_, _, policy)| *policy)
            .max()
            .unwrap_or(suspend_policy::EVENT_THREAD)
            .max(suspend_policy::EVENT_THREAD);
        if policy == suspend_policy::ALL {
            for other in &mut self.threads {
                other.suspend_count = other.suspend_count.max(1);
            }
        }
        let mut events: Vec<_> = breakpoints.into_iter().map(|(kind, id, _)| (kind, id)).collect();
        events.push((event_kind::SINGLE_STEP, request));
        Some(self.stop_event(policy, &events, thread, moved))
    }

    fn stop_event(&mut self, policy: u8, events: &[(u8, RequestId)], thread: ThreadId, loc: Location) -> Vec<u8> {
        let sizes = self.sizes;
        let unknown = self.unknown_event.take();
        let mut w = JdwpWriter::new();
        w.write_u8(policy);
        w.write_u32((events.len() + usize::from(unknown.is_some())) as u32);
        if let Some(kind) = unknown {
            w.write_u8(kind);
            w.write_i32(0);
        }
        for (kind, request) in events {
            w.write_u8(*kind);
            w.write_i32(*request);
            w.write_object_id(thread, &sizes);
            w.write_location(&loc, &sizes);
        }
        self.next_packet_id += 1;
        encode_command(self.next_packet_id, EVENT_COMPOSITE.0, EVENT_COMPOSITE.1, &w.into_vec())
    }

    fn fire_armed_steps(&mut self, threads: &[ThreadId]) -> Vec<Vec<u8>> {
        let armed: Vec<_> = self
            .armed_steps
            .iter()
            .copied()
            .filter(|(_, t)| threads.contains(t))
            .collect();
        self.armed_steps.retain(|(_, t)| !threads.contains(t));
        armed
            .into_iter()
            .filter_map(|(request, thread)| self.complete_step(request, thread))
            .collect()
    }
}

async fn run(listener: TcpListener, state: Arc<Mutex<VmState>>, shutdown: CancellationToken) -> std::io::Result<()> {
    let (mut socket, _) = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        accept = listener.accept() => accept?,
    };

    let mut hs = [0u8; HANDSHAKE.len()];
    socket.read_exact(&mut hs).await?;
    if hs != *HANDSHAKE {
        return Ok(());
    }
    socket.write_all(HANDSHAKE).await?;

    let (mut reader, mut writer) = socket.into_split();
    loop {
        let mut raw = [0u8; JDWP_HEADER_LEN];
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            res = reader.read_exact(&mut raw) => match res {
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err),
            },
        }
        let header = PacketHeader::parse(&raw);
        let mut payload = vec![0u8; header.payload_len()];
        reader.read_exact(&mut payload).await?;

        let outcome = {
            let mut state = lock(&state, "mock.handle");
            handle_command(&mut state, header.trailer[0], header.trailer[1], &payload)
        };
        write_outcome(&mut writer, header.id, outcome).await?;
    }
}

struct Outcome {
    error: u16,
    payload: Vec<u8>,
    events: Vec<Vec<u8>>,
    close: bool,
}

impl Outcome {
    fn ok(payload: Vec<u8>) -> Self {
        Self { error: 0, payload, events: Vec::new(), close: false }
    }

    fn error(code: u16) -> Self {
        Self { error: code, payload: Vec::new(), events: Vec::new(), close: false }
    }
}

async fn write_outcome(writer: &mut OwnedWriteHalf, id: u32, outcome: Outcome) -> std::io::Result<()> {
    writer.write_all(&encode_reply(id, outcome.error, &outcome.payload)).await?;
    for event in outcome.events {
        writer.write_all(&event).await?;
    }
    if outcome.close {
        writer.shutdown().await?;
    }
    Ok(())
}

fn parse_modifiers(r: &mut JdwpReader<'_>, sizes: &JdwpIdSizes, req: &mut RecordedEventRequest) -> crate::types::Result<()> {
    let count = r.read_u32()?;
    for _ in 0..count {
        let kind = r.read_u8()?;
        req.modifier_kinds.push(kind);
        match kind {
            1 => req.count = Some(r.read_u32()?),
            3 => {
                r.read_object_id(sizes)?;
            }
            4 => {
                r.read_reference_type_id(sizes)?;
            }
            5 | 12 => {
                r.read_string()?;
            }
            6 => req.class_excludes.push(r.read_string()?),
            7 => req.location = Some(r.read_location(sizes)?),
            10 => {
                let thread = r.read_object_id(sizes)?;
                req.step = Some((thread, r.read_u32()?, r.read_u32()?));
            }
            other => {
                return Err(crate::types::JdwpError::Protocol(format!(
                    "mock does not understand modifier kind {other}"
                )))
            }
        }
    }
    Ok(())
}

fn handle_command(state: &mut VmState, command_set: u8, command: u8, payload: &[u8]) -> Outcome {
    match dispatch(state, command_set, command, payload) {
        Ok(outcome) => outcome,
        Err(_) => Outcome::error(error_code::NOT_IMPLEMENTED),
    }
}

fn dispatch(state: &mut VmState, command_set: u8, command: u8, payload: &[u8]) -> crate::types::Result<Outcome> {
    let sizes = state.sizes;
    let mut r = JdwpReader::new(payload);
    let mut w = JdwpWriter::new();

    match (command_set, command) {
        (1, 7) => {
            for size in [sizes.field_id, sizes.method_id, sizes.object_id, sizes.reference_type_id, sizes.frame_id] {
                w.write_u32(size as u32);
            }
        }
        (1, 17) => {
            for flag in &state.capabilities {
                w.write_bool(*flag);
            }
        }
        (1, 4) => {
            w.write_u32(state.threads.len() as u32);
            for thread in &state.threads {
                w.write_object_id(thread.id, &sizes);
            }
        }
        (1, 2) => {
            let signature = r.read_string()?;
            let matches: Vec<_> = state.classes.iter().filter(|c| c.signature == signature).collect();
            w.write_u32(matches.len() as u32);
            for class in matches {
                w.write_u8(1);
                w.write_reference_type_id(class.id, &sizes);
                w.write_u32(7);
            }
        }
        (1, 8) => {
            for thread in &mut state.threads {
                thread.suspend_count += 1;
            }
        }
        (1, 9) => {
            state.vm_resume_calls += 1;
            let mut resumed = Vec::new();
            for thread in &mut state.threads {
                if thread.suspend_count > 0 {
                    thread.suspend_count -= 1;
                    if thread.suspend_count == 0 {
                        resumed.push(thread.id);
                    }
                }
            }
            let events = state.fire_armed_steps(&resumed);
            return Ok(Outcome { events, ..Outcome::ok(Vec::new()) });
        }
        (1, 10) => {
            return Ok(Outcome { close: true, ..Outcome::ok(Vec::new()) });
        }
        (11, cmd) => {
            let id = r.read_object_id(&sizes)?;
            let Some(thread) = state.thread(id).cloned() else {
                return Ok(Outcome::error(error_code::INVALID_THREAD));
            };
            match cmd {
                1 => w.write_string(thread.name),
                2 => {
                    if let Some(t) = state.thread_mut(id) {
                        t.suspend_count += 1;
                    }
                }
                3 => {
                    state.thread_resume_calls += 1;
                    let mut resumed = false;
                    if let Some(t) = state.thread_mut(id) {
                        t.suspend_count = t.suspend_count.saturating_sub(1);
                        resumed = t.suspend_count == 0;
                    }
                    let events = if resumed { state.fire_armed_steps(&[id]) } else { Vec::new() };
                    return Ok(Outcome { events, ..Outcome::ok(Vec::new()) });
                }
                4 => {
                    w.write_i32(1);
                    w.write_i32(i32::from(thread.suspend_count > 0));
                }
                5 => w.write_object_id(thread.group, &sizes),
                6 | 7 if thread.suspend_count == 0 => {
                    return Ok(Outcome::error(error_code::THREAD_NOT_SUSPENDED));
                }
                6 => {
                    let _start = r.read_i32()?;
                    let _len = r.read_i32()?;
                    w.write_u32(thread.frames.len() as u32);
                    for (frame_id, loc) in &thread.frames {
                        w.write_id(*frame_id, sizes.frame_id);
                        w.write_location(loc, &sizes);
                    }
                }
                7 => w.write_i32(thread.frames.len() as i32),
                8 => w.write_u32(0),
                9 => {
                    w.write_u8(b'L');
                    w.write_object_id(0, &sizes);
                }
                12 => w.write_i32(thread.suspend_count as i32),
                14 => {
                    let _value = r.read_value(&sizes)?;
                    if let Some(t) = state.thread_mut(id) {
                        if !t.frames.is_empty() {
                            t.frames.remove(0);
                        }
                    }
                }
                _ => return Ok(Outcome::error(error_code::NOT_IMPLEMENTED)),
            }
        }
        (12, cmd) => {
            let id = r.read_object_id(&sizes)?;
            let Some((_, name, parent)) = state.groups.iter().find(|(g, _, _)| *g == id).copied() else {
                return Ok(Outcome::error(error_code::INVALID_OBJECT));
            };
            match cmd {
                1 => w.write_string(name),
                2 => w.write_object_id(parent, &sizes),
                _ => return Ok(Outcome::error(error_code::NOT_IMPLEMENTED)),
            }
        }
        (2, cmd) => {
            let id = r.read_reference_type_id(&sizes)?;
            let Some(class) = state.class(id).cloned() else {
                return Ok(Outcome::error(21));
            };
            match cmd {
                1 => w.write_string(class.signature),
                4 if id == MockJdwpServer::THREAD_CLASS => {
                    w.write_u32(1);
                    w.write_id(MockJdwpServer::PRIORITY_FIELD, sizes.field_id);
                    w.write_string("priority");
                    w.write_string("I");
                    w.write_u32(0x0002);
                }
                4 => w.write_u32(0),
                5 => {
                    w.write_u32(class.methods.len() as u32);
                    for method in &class.methods {
                        w.write_id(method.id, sizes.method_id);
                        w.write_string(method.name);
                        w.write_string(method.signature);
                        w.write_u32(method.mod_bits);
                    }
                }
                _ => return Ok(Outcome::error(error_code::NOT_IMPLEMENTED)),
            }
        }
        (3, 1) => {
            let _class = r.read_reference_type_id(&sizes)?;
            w.write_reference_type_id(0, &sizes);
        }
        (6, cmd) => {
            let class_id = r.read_reference_type_id(&sizes)?;
            let method_id = r.read_id(sizes.method_id)?;
            let Some(method) = state.method(class_id, method_id).cloned() else {
                return Ok(Outcome::error(error_code::INVALID_METHODID));
            };
            match cmd {
                1 => {
                    let end = method.lines.last().map(|(idx, _)| idx + 3).unwrap_or(0);
                    w.write_u64(0);
                    w.write_u64(end);
                    w.write_u32(method.lines.len() as u32);
                    for (idx, line) in &method.lines {
                        w.write_u64(*idx);
                        w.write_i32(*line);
                    }
                }
                2 => {
                    w.write_u32(0);
                    w.write_u32(1);
                    w.write_u64(0);
                    w.write_string("count");
                    w.write_string("I");
                    w.write_u32(64);
                    w.write_u32(1);
                }
                _ => return Ok(Outcome::error(error_code::NOT_IMPLEMENTED)),
            }
        }
        (16, 1) => {
            let _thread = r.read_object_id(&sizes)?;
            let _frame = r.read_id(sizes.frame_id)?;
            let count = r.read_u32()?;
            w.write_u32(count);
            for _ in 0..count {
                let _slot = r.read_u32()?;
                let tag = r.read_u8()?;
                let value = if tag == b'I' { JdwpValue::Int(7) } else { JdwpValue::Object { tag, id: 0 } };
                w.write_value(&value, &sizes);
            }
        }
        (16, 5) => {
            let thread = r.read_object_id(&sizes)?;
            let frame = r.read_id(sizes.frame_id)?;
            let Some(t) = state.thread_mut(thread) else {
                return Ok(Outcome::error(error_code::INVALID_THREAD));
            };
            let Some(pos) = t.frames.iter().position(|(id, _)| *id == frame) else {
                return Ok(Outcome::error(error_code::INVALID_FRAMEID));
            };
            t.frames.drain(..=pos);
            state.popped_frames.push(frame);
        }
        (9, 1) => {
            let _object = r.read_object_id(&sizes)?;
            w.write_u8(1);
            w.write_reference_type_id(MockJdwpServer::THREAD_CLASS, &sizes);
        }
        (9, 2) => {
            let _object = r.read_object_id(&sizes)?;
            let count = r.read_u32()?;
            w.write_u32(count);
            for _ in 0..count {
                let field = r.read_id(sizes.field_id)?;
                let value = if field == MockJdwpServer::PRIORITY_FIELD { JdwpValue::Int(5) } else { JdwpValue::Int(0) };
                w.write_value(&value, &sizes);
            }
        }
        (3, 3) | (3, 4) | (9, 6) => {
            if command_set == 9 {
                r.read_object_id(&sizes)?;
                r.read_object_id(&sizes)?;
                r.read_reference_type_id(&sizes)?;
            } else {
                r.read_reference_type_id(&sizes)?;
                r.read_object_id(&sizes)?;
            }
            let method_id = r.read_id(sizes.method_id)?;
            let argc = r.read_u32()?;
            let args = (0..argc).map(|_| r.read_value(&sizes)).collect::<crate::types::Result<Vec<_>>>()?;
            let options = r.read_u32()?;
            state.invocations.push(RecordedInvoke { command_set, command, method_id, args, options });
            let value = if (command_set, command) == (3, 4) {
                JdwpValue::Object { tag: b'L', id: 9000 }
            } else {
                JdwpValue::Int(42)
            };
            w.write_value(&value, &sizes);
            w.write_u8(b'L');
            w.write_object_id(0, &sizes);
        }
        (15, 1) => {
            let event_kind = r.read_u8()?;
            let policy = r.read_u8()?;
            let request_id = state.next_request_id;
            state.next_request_id += 1;
            let mut req = RecordedEventRequest {
                request_id,
                event_kind,
                suspend_policy: policy,
                modifier_kinds: Vec::new(),
                count: None,
                step: None,
                class_excludes: Vec::new(),
                location: None,
            };
            parse_modifiers(&mut r, &sizes, &mut req)?;
            if let (event_kind::SINGLE_STEP, Some((thread, _, _))) = (event_kind, req.step) {
                state.armed_steps.push((request_id, thread));
            }
            state.event_requests.push(req);
            w.write_i32(request_id);
        }
        (15, 2) => {
            let event_kind = r.read_u8()?;
            let request_id = r.read_i32()?;
            state.armed_steps.retain(|(id, _)| *id != request_id);
            state.cleared.push((event_kind, request_id));
        }
        _ => return Ok(Outcome::error(error_code::NOT_IMPLEMENTED)),
    }

    Ok(Outcome::ok(w.into_vec()))
}
