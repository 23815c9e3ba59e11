//! [`VmSession`] over a JDWP connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use jdi_config::DebuggerConfig;
use jdi_wire::types::{error_code, event_kind, invoke_options, step_depth, step_size, suspend_policy};
use jdi_wire::{
    signature_to_type_name, EventModifier, JdwpClient, JdwpClientConfig, JdwpEvent, JdwpEventSet, JdwpValue, LineTable,
    MethodInfo,
};

use crate::session::{
    BreakpointRequest, EventRequestKind, InvokeOptions, Location, Method, MethodRef, Receiver, RemoteFrame,
    SessionError, SessionResult, StepDepth, StepRequest, SuspendPolicy, Value, Variable, VmEvent,
    VmEventSet, VmSession,
};
use crate::{FrameId, MethodId, ObjectId, ReferenceTypeId, RequestId, ThreadGroupId, ThreadId};

const EVENT_CHANNEL_SIZE: usize = 256;

/// Resolves wire locations into model locations, caching per type and method.
#[derive(Debug)]
struct Resolver {
    client: JdwpClient,
    type_names: Mutex<HashMap<ReferenceTypeId, String>>,
    methods: Mutex<HashMap<ReferenceTypeId, Vec<MethodInfo>>>,
    line_tables: Mutex<HashMap<(ReferenceTypeId, MethodId), Option<LineTable>>>,
}

impl Resolver {
    async fn type_name(&self, type_id: ReferenceTypeId) -> SessionResult<String> {
        if let Some(name) = self.type_names.lock().get(&type_id) {
            return Ok(name.clone());
        }
        let signature = self.client.reference_type_signature(type_id).await?;
        let name = signature_to_type_name(&signature);
        self.type_names.lock().insert(type_id, name.clone());
        Ok(name)
    }

    async fn methods(&self, type_id: ReferenceTypeId) -> SessionResult<Vec<MethodInfo>> {
        if let Some(methods) = self.methods.lock().get(&type_id) {
            return Ok(methods.clone());
        }
        let methods = self.client.reference_type_methods(type_id).await?;
        self.methods.lock().insert(type_id, methods.clone());
        Ok(methods)
    }

    /// `None` for methods without line information (native, abstract, stripped).
    async fn line_table(&self, type_id: ReferenceTypeId, method_id: MethodId) -> SessionResult<Option<LineTable>> {
        if let Some(table) = self.line_tables.lock().get(&(type_id, method_id)) {
            return Ok(table.clone());
        }
        let table = match self.client.method_line_table(type_id, method_id).await {
            Ok(table) => Some(table),
            Err(jdi_wire::JdwpError::VmError(error_code::ABSENT_INFORMATION | error_code::NOT_IMPLEMENTED)) => None,
            Err(err) => return Err(err.into()),
        };
        self.line_tables.lock().insert((type_id, method_id), table.clone());
        Ok(table)
    }

    async fn method(&self, type_id: ReferenceTypeId, method_id: MethodId) -> SessionResult<Method> {
        let declaring_type = self.type_name(type_id).await?;
        let info = self
            .methods(type_id)
            .await?
            .into_iter()
            .find(|method| method.method_id == method_id)
            .ok_or_else(|| SessionError::Protocol(format!("unknown method {method_id} in {declaring_type}")))?;
        Ok(Method {
            id: MethodRef {
                class_id: type_id,
                method_id,
            },
            name: info.name,
            declaring_type,
            signature: info.signature,
            modifiers: info.mod_bits,
        })
    }

    async fn location(&self, location: &jdi_wire::Location) -> SessionResult<Location> {
        let method = self.method(location.class_id, location.method_id).await?;
        let line = self
            .line_table(location.class_id, location.method_id)
            .await?
            .and_then(|table| table.line_for(location.index));
        Ok(Location {
            method,
            code_index: location.index,
            line,
        })
    }

    /// Falls back to an unnamed location so an event is never lost.
    async fn location_or_unknown(&self, location: &jdi_wire::Location) -> Location {
        match self.location(location).await {
            Ok(resolved) => resolved,
            Err(err) => {
                tracing::warn!(target: "jdi.model", error = %err, "failed to resolve event location");
                Location {
                    method: Method {
                        id: MethodRef {
                            class_id: location.class_id,
                            method_id: location.method_id,
                        },
                        name: String::new(),
                        declaring_type: String::new(),
                        signature: String::new(),
                        modifiers: 0,
                    },
                    code_index: location.index,
                    line: None,
                }
            }
        }
    }

    async fn to_vm_event(&self, event: JdwpEvent) -> Option<VmEvent> {
        Some(match event {
            JdwpEvent::SingleStep {
                request_id,
                thread,
                location,
            } => VmEvent::Step {
                request: request_id,
                thread,
                location: self.location_or_unknown(&location).await,
            },
            JdwpEvent::Breakpoint {
                request_id,
                thread,
                location,
            } => VmEvent::Breakpoint {
                request: request_id,
                thread,
                location: self.location_or_unknown(&location).await,
            },
            JdwpEvent::ThreadStart { thread, .. } => VmEvent::ThreadStart { thread },
            JdwpEvent::ThreadDeath { thread, .. } => VmEvent::ThreadDeath { thread },
            JdwpEvent::VmDeath => VmEvent::VmDeath,
            JdwpEvent::VmStart { .. } => return None,
        })
    }

    async fn to_vm_event_set(&self, set: JdwpEventSet) -> Option<VmEventSet> {
        let policy = match set.suspend_policy {
            suspend_policy::EVENT_THREAD => Some(SuspendPolicy::Thread),
            suspend_policy::ALL => Some(SuspendPolicy::Vm),
            _ => None,
        };
        let mut events = Vec::with_capacity(set.events.len());
        for event in set.events {
            if let Some(event) = self.to_vm_event(event).await {
                events.push(event);
            }
        }
        if events.is_empty() && policy.is_none() {
            return None;
        }
        Some(VmEventSet::new(policy, events))
    }
}

/// A live JDWP session.
///
/// A background task resolves incoming wire events and republishes them as
/// [`VmEventSet`]s; it reports [`VmEvent::Disconnected`] once the connection closes.
#[derive(Debug)]
pub struct WireSession {
    resolver: Arc<Resolver>,
    events: broadcast::Sender<VmEventSet>,
    forwarder: JoinHandle<()>,
}

impl WireSession {
    pub fn new(client: JdwpClient) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let resolver = Arc::new(Resolver {
            client,
            type_names: Mutex::new(HashMap::new()),
            methods: Mutex::new(HashMap::new()),
            line_tables: Mutex::new(HashMap::new()),
        });
        let forwarder = tokio::spawn(forward_events(
            resolver.client.subscribe_events(),
            resolver.clone(),
            events.clone(),
            resolver.client.shutdown_token(),
        ));
        Self {
            resolver,
            events,
            forwarder,
        }
    }

    /// Connects to the VM named by `config.connect`.
    pub async fn connect(config: &DebuggerConfig) -> SessionResult<Self> {
        let address = config.connect.address();
        let addr = tokio::net::lookup_host(&address)
            .await
            .map_err(|err| SessionError::Protocol(format!("resolving {address}: {err}")))?
            .next()
            .ok_or_else(|| SessionError::Protocol(format!("no address for {address}")))?;
        let client_config = JdwpClientConfig {
            handshake_timeout: config.timeouts.handshake(),
            reply_timeout: Some(config.timeouts.request()),
            event_channel_size: EVENT_CHANNEL_SIZE,
        };
        let client = JdwpClient::connect_with_config(addr, client_config).await?;
        tracing::info!(target: "jdi.model", %addr, "connected to VM");
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &JdwpClient {
        &self.resolver.client
    }

    pub fn shutdown(&self) {
        self.resolver.client.shutdown();
    }

    async fn location_of_line(&self, request: &BreakpointRequest) -> SessionResult<jdi_wire::Location> {
        let classes = self.client().classes_by_name(&request.type_name).await?;
        let class = classes
            .first()
            .ok_or_else(|| SessionError::Protocol(format!("class {} is not loaded", request.type_name)))?;
        for method in self.resolver.methods(class.type_id).await? {
            let Some(table) = self.resolver.line_table(class.type_id, method.method_id).await? else {
                continue;
            };
            if let Some(index) = table.first_index_of(request.line) {
                return Ok(jdi_wire::Location {
                    type_tag: class.ref_type_tag,
                    class_id: class.type_id,
                    method_id: method.method_id,
                    index,
                });
            }
        }
        Err(SessionError::Protocol(format!(
            "no code at {}:{}",
            request.type_name, request.line
        )))
    }
}

impl Drop for WireSession {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

async fn forward_events(
    mut wire: broadcast::Receiver<JdwpEventSet>,
    resolver: Arc<Resolver>,
    events: broadcast::Sender<VmEventSet>,
    shutdown: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = events.send(VmEvent::Disconnected.into());
                return;
            }
            received = wire.recv() => received,
        };
        match received {
            Ok(set) => {
                if let Some(set) = resolver.to_vm_event_set(set).await {
                    let _ = events.send(set);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(target: "jdi.model", skipped, "JDWP event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                let _ = events.send(VmEvent::Disconnected.into());
                return;
            }
        }
    }
}

fn wire_suspend_policy(policy: SuspendPolicy) -> u8 {
    match policy {
        SuspendPolicy::Thread => suspend_policy::EVENT_THREAD,
        SuspendPolicy::Vm => suspend_policy::ALL,
    }
}

fn wire_event_kind(kind: EventRequestKind) -> u8 {
    match kind {
        EventRequestKind::Step => event_kind::SINGLE_STEP,
        EventRequestKind::Breakpoint => event_kind::BREAKPOINT,
    }
}

fn wire_invoke_options(options: InvokeOptions) -> u32 {
    let mut bits = 0;
    if options.single_threaded {
        bits |= invoke_options::SINGLE_THREADED;
    }
    if options.nonvirtual {
        bits |= invoke_options::NONVIRTUAL;
    }
    bits
}

fn invoke_result(reply: jdi_wire::InvokeReply) -> SessionResult<Value> {
    match reply.exception {
        Some(exception) => Err(SessionError::Exception(exception)),
        None => Ok(reply.value),
    }
}

impl VmSession for WireSession {
    async fn all_threads(&self) -> SessionResult<Vec<ThreadId>> {
        Ok(self.client().all_threads().await?)
    }

    async fn thread_name(&self, thread: ThreadId) -> SessionResult<String> {
        Ok(self.client().thread_name(thread).await?)
    }

    async fn suspend_thread(&self, thread: ThreadId) -> SessionResult<()> {
        Ok(self.client().thread_suspend(thread).await?)
    }

    async fn resume_thread(&self, thread: ThreadId) -> SessionResult<()> {
        Ok(self.client().thread_resume(thread).await?)
    }

    async fn thread_is_suspended(&self, thread: ThreadId) -> SessionResult<bool> {
        Ok(self.client().thread_status(thread).await?.is_suspended())
    }

    async fn frames(&self, thread: ThreadId) -> SessionResult<Vec<RemoteFrame>> {
        let frames = self.client().frames(thread, 0, -1).await?;
        let mut resolved = Vec::with_capacity(frames.len());
        for frame in frames {
            resolved.push(RemoteFrame {
                id: frame.frame_id,
                location: self.resolver.location(&frame.location).await?,
            });
        }
        Ok(resolved)
    }

    async fn frame_count(&self, thread: ThreadId) -> SessionResult<usize> {
        let count = self.client().frame_count(thread).await?;
        usize::try_from(count).map_err(|_| SessionError::Protocol(format!("negative frame count {count}")))
    }

    async fn thread_group(&self, thread: ThreadId) -> SessionResult<Option<ThreadGroupId>> {
        Ok(self.client().thread_group(thread).await?)
    }

    async fn thread_group_name(&self, group: ThreadGroupId) -> SessionResult<String> {
        Ok(self.client().thread_group_name(group).await?)
    }

    async fn thread_group_parent(&self, group: ThreadGroupId) -> SessionResult<Option<ThreadGroupId>> {
        Ok(self.client().thread_group_parent(group).await?)
    }

    async fn thread_priority(&self, thread: ThreadId) -> SessionResult<i32> {
        let client = self.client();
        let mut current = Some(client.object_reference_type(thread).await?);
        while let Some(type_id) = current {
            let fields = client.reference_type_fields(type_id).await?;
            if let Some(field) = fields.iter().find(|field| field.name == "priority") {
                let values = client.object_get_values(thread, &[field.field_id]).await?;
                return match values.first() {
                    Some(JdwpValue::Int(priority)) => Ok(*priority),
                    other => Err(SessionError::Protocol(format!("unexpected priority value {other:?}"))),
                };
            }
            current = client.class_superclass(type_id).await?;
        }
        Err(SessionError::Protocol("thread object has no priority field".to_owned()))
    }

    async fn owned_monitors(&self, thread: ThreadId) -> SessionResult<Vec<ObjectId>> {
        if !self.client().capabilities().can_get_owned_monitor_info {
            return Err(SessionError::Unsupported);
        }
        Ok(self.client().owned_monitors(thread).await?)
    }

    async fn contended_monitor(&self, thread: ThreadId) -> SessionResult<Option<ObjectId>> {
        if !self.client().capabilities().can_get_current_contended_monitor {
            return Err(SessionError::Unsupported);
        }
        Ok(self.client().current_contended_monitor(thread).await?)
    }

    async fn create_step_request(&self, request: StepRequest) -> SessionResult<RequestId> {
        let depth = match request.depth {
            StepDepth::Into => step_depth::INTO,
            StepDepth::Over => step_depth::OVER,
            StepDepth::Out => step_depth::OUT,
            // Needs a VM-specific extension.
            StepDepth::Reenter => return Err(SessionError::Unsupported),
        };
        let mut modifiers = vec![EventModifier::Step {
            thread: request.thread,
            size: step_size::LINE,
            depth,
        }];
        modifiers.extend(
            request
                .class_exclusions
                .into_iter()
                .map(|pattern| EventModifier::ClassExclude { pattern }),
        );
        // Count last, so it only counts events that passed the other filters.
        if let Some(count) = request.count {
            modifiers.push(EventModifier::Count { count });
        }
        Ok(self
            .client()
            .event_request_set(event_kind::SINGLE_STEP, wire_suspend_policy(request.suspend_policy), modifiers)
            .await?)
    }

    async fn create_breakpoint_request(&self, request: BreakpointRequest) -> SessionResult<RequestId> {
        let location = self.location_of_line(&request).await?;
        Ok(self
            .client()
            .event_request_set(
                event_kind::BREAKPOINT,
                wire_suspend_policy(request.suspend_policy),
                vec![EventModifier::LocationOnly { location }],
            )
            .await?)
    }

    async fn delete_event_request(&self, kind: EventRequestKind, request: RequestId) -> SessionResult<()> {
        Ok(self
            .client()
            .event_request_clear(wire_event_kind(kind), request)
            .await?)
    }

    async fn invoke_method(
        &self,
        thread: ThreadId,
        receiver: Receiver,
        method: MethodRef,
        args: Vec<Value>,
        options: InvokeOptions,
    ) -> SessionResult<Value> {
        let bits = wire_invoke_options(options);
        let reply = match receiver {
            Receiver::Class(class) => {
                self.client()
                    .class_invoke_method(class, thread, method.method_id, &args, bits)
                    .await?
            }
            Receiver::Object { object, class } => {
                self.client()
                    .object_invoke_method(object, thread, class, method.method_id, &args, bits)
                    .await?
            }
        };
        invoke_result(reply)
    }

    async fn new_instance(
        &self,
        thread: ThreadId,
        class: ReferenceTypeId,
        constructor: MethodRef,
        args: Vec<Value>,
        options: InvokeOptions,
    ) -> SessionResult<Value> {
        let reply = self
            .client()
            .class_new_instance(class, thread, constructor.method_id, &args, wire_invoke_options(options))
            .await?;
        invoke_result(reply)
    }

    fn can_pop_frames(&self) -> bool {
        self.client().capabilities().can_pop_frames
    }

    async fn pop_frames(&self, thread: ThreadId, frame: FrameId) -> SessionResult<()> {
        if !self.can_pop_frames() {
            return Err(SessionError::Unsupported);
        }
        Ok(self.client().stack_frame_pop_frames(thread, frame).await?)
    }

    async fn force_return(&self, thread: ThreadId) -> SessionResult<()> {
        if !self.client().capabilities().can_force_early_return {
            return Err(SessionError::Unsupported);
        }
        Ok(self
            .client()
            .force_early_return(thread, &JdwpValue::Void)
            .await?)
    }

    async fn frame_variable(
        &self,
        thread: ThreadId,
        frame: &RemoteFrame,
        name: &str,
    ) -> SessionResult<Option<Variable>> {
        let method = frame.location.method.id;
        let table = match self
            .client()
            .method_variable_table(method.class_id, method.method_id)
            .await
        {
            Ok(table) => table,
            Err(jdi_wire::JdwpError::VmError(error_code::ABSENT_INFORMATION)) => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let Some(info) = table
            .into_iter()
            .find(|variable| variable.name == name && variable.in_scope(frame.location.code_index))
        else {
            return Ok(None);
        };
        let values = self
            .client()
            .stack_frame_get_values(thread, frame.id, &[(info.slot, info.signature.clone())])
            .await?;
        let value = values
            .into_iter()
            .next()
            .ok_or_else(|| SessionError::Protocol("empty GetValues reply".to_owned()))?;
        Ok(Some(Variable {
            name: info.name,
            signature: info.signature,
            value,
        }))
    }

    fn request_timeout(&self) -> Option<Duration> {
        self.client().reply_timeout()
    }

    fn set_request_timeout(&self, timeout: Option<Duration>) -> Option<Duration> {
        self.client().set_reply_timeout(timeout)
    }

    async fn suspend_vm(&self) -> SessionResult<()> {
        Ok(self.client().vm_suspend().await?)
    }

    async fn resume_vm(&self) -> SessionResult<()> {
        Ok(self.client().vm_resume().await?)
    }

    async fn exit_vm(&self, exit_code: i32) -> SessionResult<()> {
        Ok(self.client().vm_exit(exit_code).await?)
    }

    fn subscribe(&self) -> broadcast::Receiver<VmEventSet> {
        self.events.subscribe()
    }
}
