use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{broadcast, oneshot, Mutex},
};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{
        class_name_to_signature, encode_command, signature_to_tag, JdwpReader, JdwpWriter,
        PacketHeader, EVENT_COMPOSITE, HANDSHAKE,
    },
    poison::lock,
    types::{
        event_kind, ClassInfo, FieldId, FieldInfo, FrameId, FrameInfo, InvokeReply,
        JdwpCapabilities, JdwpError, JdwpEvent, JdwpEventSet, JdwpIdSizes, JdwpValue, LineTable,
        LineTableEntry, Location, MethodId, MethodInfo, ObjectId, ReferenceTypeId, RequestId,
        Result, ThreadGroupId, ThreadId, ThreadStatus, VariableInfo, JDWP_HEADER_LEN,
        MAX_JDWP_PACKET_BYTES,
    },
};

#[derive(Debug, Clone)]
pub struct JdwpClientConfig {
    pub handshake_timeout: Duration,
    /// Initial reply timeout. `None` waits forever.
    pub reply_timeout: Option<Duration>,
    pub event_channel_size: usize,
}

impl Default for JdwpClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            reply_timeout: Some(Duration::from_secs(3)),
            event_channel_size: 256,
        }
    }
}

#[derive(Debug)]
struct Reply {
    error_code: u16,
    payload: Vec<u8>,
}

type PendingReplies = HashMap<u32, oneshot::Sender<Result<Reply>>>;

#[derive(Debug)]
struct Inner {
    writer: Mutex<OwnedWriteHalf>,
    pending: Mutex<PendingReplies>,
    next_id: AtomicU32,
    id_sizes: StdMutex<JdwpIdSizes>,
    capabilities: StdMutex<JdwpCapabilities>,
    reply_timeout: StdMutex<Option<Duration>>,
    events: broadcast::Sender<JdwpEventSet>,
    shutdown: CancellationToken,
}

/// Async JDWP connection. Cheap to clone; all clones share one socket.
#[derive(Clone, Debug)]
pub struct JdwpClient {
    inner: Arc<Inner>,
}

impl JdwpClient {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with_config(addr, JdwpClientConfig::default()).await
    }

    pub async fn connect_with_config(addr: SocketAddr, config: JdwpClientConfig) -> Result<Self> {
        let mut stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);

        tokio::time::timeout(config.handshake_timeout, stream.write_all(HANDSHAKE))
            .await
            .map_err(|_| JdwpError::Timeout)??;
        let mut handshake = [0u8; HANDSHAKE.len()];
        tokio::time::timeout(config.handshake_timeout, stream.read_exact(&mut handshake))
            .await
            .map_err(|_| JdwpError::Timeout)??;
        if handshake != *HANDSHAKE {
            return Err(JdwpError::Protocol(format!(
                "invalid handshake reply: {:?}",
                String::from_utf8_lossy(&handshake)
            )));
        }

        let (reader, writer) = stream.into_split();
        let (events, _) = broadcast::channel(config.event_channel_size.max(1));
        let inner = Arc::new(Inner {
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU32::new(1),
            id_sizes: StdMutex::new(JdwpIdSizes::default()),
            capabilities: StdMutex::new(JdwpCapabilities::default()),
            reply_timeout: StdMutex::new(config.reply_timeout),
            events,
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(read_loop(reader, inner.clone()));

        let client = Self { inner };
        client.idsizes().await?;
        let flags = client.capabilities_new().await?;
        *lock(&client.inner.capabilities, "capabilities") = JdwpCapabilities::from_flags(&flags);
        tracing::debug!(target: "jdi.wire", %addr, "JDWP connection established");
        Ok(client)
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Cancelled on [`JdwpClient::shutdown`] and when the socket closes.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<JdwpEventSet> {
        self.inner.events.subscribe()
    }

    pub fn capabilities(&self) -> JdwpCapabilities {
        *lock(&self.inner.capabilities, "capabilities")
    }

    pub fn reply_timeout(&self) -> Option<Duration> {
        *lock(&self.inner.reply_timeout, "reply_timeout")
    }

    /// Replaces the reply timeout and returns the previous one.
    pub fn set_reply_timeout(&self, timeout: Option<Duration>) -> Option<Duration> {
        std::mem::replace(&mut *lock(&self.inner.reply_timeout, "reply_timeout"), timeout)
    }

    fn id_sizes(&self) -> JdwpIdSizes {
        *lock(&self.inner.id_sizes, "id_sizes")
    }

    async fn send_command_raw(&self, command_set: u8, command: u8, payload: Vec<u8>) -> Result<Vec<u8>> {
        if self.inner.shutdown.is_cancelled() {
            return Err(JdwpError::ConnectionClosed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        let packet = encode_command(id, command_set, command, &payload);
        {
            let mut writer = self.inner.writer.lock().await;
            if let Err(err) = writer.write_all(&packet).await {
                self.remove_pending(id).await;
                return Err(err.into());
            }
        }

        let limit = self.reply_timeout();
        let wait = async move {
            match limit {
                Some(limit) => tokio::time::timeout(limit, rx)
                    .await
                    .map_err(|_| JdwpError::Timeout),
                None => Ok(rx.await),
            }
        };

        let reply = tokio::select! {
            _ = self.inner.shutdown.cancelled() => {
                self.remove_pending(id).await;
                return Err(JdwpError::Cancelled);
            }
            res = wait => match res {
                Ok(Ok(reply)) => reply,
                Ok(Err(_closed)) => return Err(JdwpError::ConnectionClosed),
                Err(err) => {
                    self.remove_pending(id).await;
                    tracing::debug!(target: "jdi.wire", command_set, command, "JDWP reply timed out");
                    return Err(err);
                }
            },
        }?;

        if reply.error_code != 0 {
            return Err(JdwpError::VmError(reply.error_code));
        }
        Ok(reply.payload)
    }

    async fn remove_pending(&self, id: u32) {
        self.inner.pending.lock().await.remove(&id);
    }

    async fn object_command(&self, command_set: u8, command: u8, object: ObjectId) -> Result<Vec<u8>> {
        let mut w = JdwpWriter::new();
        w.write_object_id(object, &self.id_sizes());
        self.send_command_raw(command_set, command, w.into_vec()).await
    }

    async fn type_command(&self, command_set: u8, command: u8, type_id: ReferenceTypeId) -> Result<Vec<u8>> {
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(type_id, &self.id_sizes());
        self.send_command_raw(command_set, command, w.into_vec()).await
    }

    /// VirtualMachine.IDSizes (1, 7)
    pub async fn idsizes(&self) -> Result<JdwpIdSizes> {
        let payload = self.send_command_raw(1, 7, Vec::new()).await?;
        let mut r = JdwpReader::new(&payload);
        let sizes = JdwpIdSizes {
            field_id: r.read_u32()? as usize,
            method_id: r.read_u32()? as usize,
            object_id: r.read_u32()? as usize,
            reference_type_id: r.read_u32()? as usize,
            frame_id: r.read_u32()? as usize,
        };
        *lock(&self.inner.id_sizes, "id_sizes") = sizes;
        Ok(sizes)
    }

    /// VirtualMachine.CapabilitiesNew (1, 17), raw flags in protocol order.
    pub async fn capabilities_new(&self) -> Result<Vec<bool>> {
        let payload = self.send_command_raw(1, 17, Vec::new()).await?;
        let mut r = JdwpReader::new(&payload);
        let mut caps = Vec::with_capacity(r.remaining());
        while r.remaining() > 0 {
            caps.push(r.read_bool()?);
        }
        Ok(caps)
    }

    /// VirtualMachine.AllThreads (1, 4)
    pub async fn all_threads(&self) -> Result<Vec<ThreadId>> {
        let payload = self.send_command_raw(1, 4, Vec::new()).await?;
        let sizes = self.id_sizes();
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        (0..count).map(|_| r.read_object_id(&sizes)).collect()
    }

    /// VirtualMachine.ClassesBySignature (1, 2)
    pub async fn classes_by_signature(&self, signature: &str) -> Result<Vec<ClassInfo>> {
        let mut w = JdwpWriter::new();
        w.write_string(signature);
        let payload = self.send_command_raw(1, 2, w.into_vec()).await?;
        let sizes = self.id_sizes();
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut classes = Vec::with_capacity(count);
        for _ in 0..count {
            classes.push(ClassInfo {
                ref_type_tag: r.read_u8()?,
                type_id: r.read_reference_type_id(&sizes)?,
                signature: signature.to_string(),
                status: r.read_u32()?,
            });
        }
        Ok(classes)
    }

    pub async fn classes_by_name(&self, class_name: &str) -> Result<Vec<ClassInfo>> {
        self.classes_by_signature(&class_name_to_signature(class_name))
            .await
    }

    pub async fn vm_suspend(&self) -> Result<()> {
        self.send_command_raw(1, 8, Vec::new()).await.map(drop)
    }

    pub async fn vm_resume(&self) -> Result<()> {
        self.send_command_raw(1, 9, Vec::new()).await.map(drop)
    }

    /// VirtualMachine.Exit (1, 10)
    pub async fn vm_exit(&self, exit_code: i32) -> Result<()> {
        let mut w = JdwpWriter::new();
        w.write_i32(exit_code);
        self.send_command_raw(1, 10, w.into_vec()).await.map(drop)
    }

    pub async fn thread_name(&self, thread: ThreadId) -> Result<String> {
        let payload = self.object_command(11, 1, thread).await?;
        JdwpReader::new(&payload).read_string()
    }

    pub async fn thread_suspend(&self, thread: ThreadId) -> Result<()> {
        self.object_command(11, 2, thread).await.map(drop)
    }

    pub async fn thread_resume(&self, thread: ThreadId) -> Result<()> {
        self.object_command(11, 3, thread).await.map(drop)
    }

    /// ThreadReference.Status (11, 4)
    pub async fn thread_status(&self, thread: ThreadId) -> Result<ThreadStatus> {
        let payload = self.object_command(11, 4, thread).await?;
        let mut r = JdwpReader::new(&payload);
        Ok(ThreadStatus {
            thread_status: r.read_i32()?,
            suspend_status: r.read_i32()?,
        })
    }

    /// ThreadReference.ThreadGroup (11, 5). A null group is `None`.
    pub async fn thread_group(&self, thread: ThreadId) -> Result<Option<ThreadGroupId>> {
        let payload = self.object_command(11, 5, thread).await?;
        let group = JdwpReader::new(&payload).read_object_id(&self.id_sizes())?;
        Ok((group != 0).then_some(group))
    }

    /// ThreadReference.Frames (11, 6). `length == -1` requests every frame from `start`.
    pub async fn frames(&self, thread: ThreadId, start: i32, length: i32) -> Result<Vec<FrameInfo>> {
        let sizes = self.id_sizes();
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        w.write_i32(start);
        w.write_i32(length);
        let payload = self.send_command_raw(11, 6, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut frames = Vec::with_capacity(count);
        for _ in 0..count {
            let frame_id = r.read_id(sizes.frame_id)?;
            let location = r.read_location(&sizes)?;
            frames.push(FrameInfo { frame_id, location });
        }
        Ok(frames)
    }

    pub async fn frame_count(&self, thread: ThreadId) -> Result<i32> {
        let payload = self.object_command(11, 7, thread).await?;
        JdwpReader::new(&payload).read_i32()
    }

    /// ThreadReference.OwnedMonitors (11, 8)
    pub async fn owned_monitors(&self, thread: ThreadId) -> Result<Vec<ObjectId>> {
        let payload = self.object_command(11, 8, thread).await?;
        let sizes = self.id_sizes();
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        (0..count)
            .map(|_| r.read_tagged_object_id(&sizes).map(|(_, id)| id))
            .collect()
    }

    /// ThreadReference.CurrentContendedMonitor (11, 9)
    pub async fn current_contended_monitor(&self, thread: ThreadId) -> Result<Option<ObjectId>> {
        let payload = self.object_command(11, 9, thread).await?;
        let (_, id) = JdwpReader::new(&payload).read_tagged_object_id(&self.id_sizes())?;
        Ok((id != 0).then_some(id))
    }

    /// ThreadReference.ForceEarlyReturn (11, 14)
    pub async fn force_early_return(&self, thread: ThreadId, value: &JdwpValue) -> Result<()> {
        let sizes = self.id_sizes();
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        w.write_value(value, &sizes);
        self.send_command_raw(11, 14, w.into_vec()).await.map(drop)
    }

    pub async fn thread_group_name(&self, group: ThreadGroupId) -> Result<String> {
        let payload = self.object_command(12, 1, group).await?;
        JdwpReader::new(&payload).read_string()
    }

    pub async fn thread_group_parent(&self, group: ThreadGroupId) -> Result<Option<ThreadGroupId>> {
        let payload = self.object_command(12, 2, group).await?;
        let parent = JdwpReader::new(&payload).read_object_id(&self.id_sizes())?;
        Ok((parent != 0).then_some(parent))
    }

    pub async fn reference_type_signature(&self, type_id: ReferenceTypeId) -> Result<String> {
        let payload = self.type_command(2, 1, type_id).await?;
        JdwpReader::new(&payload).read_string()
    }

    pub async fn reference_type_fields(&self, type_id: ReferenceTypeId) -> Result<Vec<FieldInfo>> {
        let payload = self.type_command(2, 4, type_id).await?;
        let sizes = self.id_sizes();
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut fields = Vec::with_capacity(count);
        for _ in 0..count {
            fields.push(FieldInfo {
                field_id: r.read_id(sizes.field_id)?,
                name: r.read_string()?,
                signature: r.read_string()?,
                mod_bits: r.read_u32()?,
            });
        }
        Ok(fields)
    }

    pub async fn reference_type_methods(&self, type_id: ReferenceTypeId) -> Result<Vec<MethodInfo>> {
        let payload = self.type_command(2, 5, type_id).await?;
        let sizes = self.id_sizes();
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        let mut methods = Vec::with_capacity(count);
        for _ in 0..count {
            methods.push(MethodInfo {
                method_id: r.read_id(sizes.method_id)?,
                name: r.read_string()?,
                signature: r.read_string()?,
                mod_bits: r.read_u32()?,
            });
        }
        Ok(methods)
    }

    /// ClassType.Superclass (3, 1)
    pub async fn class_superclass(&self, type_id: ReferenceTypeId) -> Result<Option<ReferenceTypeId>> {
        let payload = self.type_command(3, 1, type_id).await?;
        let id = JdwpReader::new(&payload).read_reference_type_id(&self.id_sizes())?;
        Ok((id != 0).then_some(id))
    }

    fn method_payload(&self, type_id: ReferenceTypeId, method_id: MethodId) -> Vec<u8> {
        let sizes = self.id_sizes();
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(type_id, &sizes);
        w.write_id(method_id, sizes.method_id);
        w.into_vec()
    }

    /// Method.LineTable (6, 1)
    pub async fn method_line_table(&self, type_id: ReferenceTypeId, method_id: MethodId) -> Result<LineTable> {
        let payload = self
            .send_command_raw(6, 1, self.method_payload(type_id, method_id))
            .await?;
        let mut r = JdwpReader::new(&payload);
        let start = r.read_u64()?;
        let end = r.read_u64()?;
        let count = r.read_u32()? as usize;
        let mut lines = Vec::with_capacity(count);
        for _ in 0..count {
            lines.push(LineTableEntry {
                code_index: r.read_u64()?,
                line: r.read_i32()?,
            });
        }
        Ok(LineTable { start, end, lines })
    }

    /// Method.VariableTable (6, 2)
    pub async fn method_variable_table(
        &self,
        type_id: ReferenceTypeId,
        method_id: MethodId,
    ) -> Result<Vec<VariableInfo>> {
        let payload = self
            .send_command_raw(6, 2, self.method_payload(type_id, method_id))
            .await?;
        let mut r = JdwpReader::new(&payload);
        let _arg_count = r.read_u32()?;
        let count = r.read_u32()? as usize;
        let mut vars = Vec::with_capacity(count);
        for _ in 0..count {
            vars.push(VariableInfo {
                code_index: r.read_u64()?,
                name: r.read_string()?,
                signature: r.read_string()?,
                length: r.read_u32()?,
                slot: r.read_u32()?,
            });
        }
        Ok(vars)
    }

    /// StackFrame.GetValues (16, 1)
    pub async fn stack_frame_get_values(
        &self,
        thread: ThreadId,
        frame_id: FrameId,
        slots: &[(u32, String)],
    ) -> Result<Vec<JdwpValue>> {
        let sizes = self.id_sizes();
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        w.write_id(frame_id, sizes.frame_id);
        w.write_u32(slots.len() as u32);
        for (slot, signature) in slots {
            w.write_u32(*slot);
            w.write_u8(signature_to_tag(signature));
        }
        let payload = self.send_command_raw(16, 1, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        (0..count).map(|_| r.read_value(&sizes)).collect()
    }

    /// StackFrame.PopFrames (16, 5): pops `frame_id` and every frame above it.
    pub async fn stack_frame_pop_frames(&self, thread: ThreadId, frame_id: FrameId) -> Result<()> {
        let sizes = self.id_sizes();
        let mut w = JdwpWriter::new();
        w.write_object_id(thread, &sizes);
        w.write_id(frame_id, sizes.frame_id);
        self.send_command_raw(16, 5, w.into_vec()).await.map(drop)
    }

    /// ObjectReference.ReferenceType (9, 1)
    pub async fn object_reference_type(&self, object: ObjectId) -> Result<ReferenceTypeId> {
        let payload = self.object_command(9, 1, object).await?;
        let mut r = JdwpReader::new(&payload);
        let _ref_type_tag = r.read_u8()?;
        r.read_reference_type_id(&self.id_sizes())
    }

    /// ObjectReference.GetValues (9, 2)
    pub async fn object_get_values(&self, object: ObjectId, fields: &[FieldId]) -> Result<Vec<JdwpValue>> {
        let sizes = self.id_sizes();
        let mut w = JdwpWriter::new();
        w.write_object_id(object, &sizes);
        w.write_u32(fields.len() as u32);
        for field in fields {
            w.write_id(*field, sizes.field_id);
        }
        let payload = self.send_command_raw(9, 2, w.into_vec()).await?;
        let mut r = JdwpReader::new(&payload);
        let count = r.read_u32()? as usize;
        (0..count).map(|_| r.read_value(&sizes)).collect()
    }

    fn write_invoke_tail(w: &mut JdwpWriter, method_id: MethodId, args: &[JdwpValue], options: u32, sizes: &JdwpIdSizes) {
        w.write_id(method_id, sizes.method_id);
        w.write_u32(args.len() as u32);
        for arg in args {
            w.write_value(arg, sizes);
        }
        w.write_u32(options);
    }

    fn read_invoke_reply(&self, payload: &[u8]) -> Result<InvokeReply> {
        let sizes = self.id_sizes();
        let mut r = JdwpReader::new(payload);
        let value = r.read_value(&sizes)?;
        let (_, exception) = r.read_tagged_object_id(&sizes)?;
        Ok(InvokeReply {
            value,
            exception: (exception != 0).then_some(exception),
        })
    }

    /// ClassType.InvokeMethod (3, 3)
    pub async fn class_invoke_method(
        &self,
        class_id: ReferenceTypeId,
        thread: ThreadId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<InvokeReply> {
        let sizes = self.id_sizes();
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        w.write_object_id(thread, &sizes);
        Self::write_invoke_tail(&mut w, method_id, args, options, &sizes);
        let payload = self.send_command_raw(3, 3, w.into_vec()).await?;
        self.read_invoke_reply(&payload)
    }

    /// ClassType.NewInstance (3, 4). The reply value is the new object.
    pub async fn class_new_instance(
        &self,
        class_id: ReferenceTypeId,
        thread: ThreadId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<InvokeReply> {
        let sizes = self.id_sizes();
        let mut w = JdwpWriter::new();
        w.write_reference_type_id(class_id, &sizes);
        w.write_object_id(thread, &sizes);
        Self::write_invoke_tail(&mut w, method_id, args, options, &sizes);
        let payload = self.send_command_raw(3, 4, w.into_vec()).await?;
        self.read_invoke_reply(&payload)
    }

    /// ObjectReference.InvokeMethod (9, 6)
    pub async fn object_invoke_method(
        &self,
        object: ObjectId,
        thread: ThreadId,
        class_id: ReferenceTypeId,
        method_id: MethodId,
        args: &[JdwpValue],
        options: u32,
    ) -> Result<InvokeReply> {
        let sizes = self.id_sizes();
        let mut w = JdwpWriter::new();
        w.write_object_id(object, &sizes);
        w.write_object_id(thread, &sizes);
        w.write_reference_type_id(class_id, &sizes);
        Self::write_invoke_tail(&mut w, method_id, args, options, &sizes);
        let payload = self.send_command_raw(9, 6, w.into_vec()).await?;
        self.read_invoke_reply(&payload)
    }

    /// EventRequest.Set (15, 1)
    pub async fn event_request_set(
        &self,
        event_kind: u8,
        suspend_policy: u8,
        modifiers: Vec<EventModifier>,
    ) -> Result<RequestId> {
        let sizes = self.id_sizes();
        let mut w = JdwpWriter::new();
        w.write_u8(event_kind);
        w.write_u8(suspend_policy);
        w.write_u32(modifiers.len() as u32);
        for modifier in modifiers {
            modifier.encode(&mut w, &sizes);
        }
        let payload = self.send_command_raw(15, 1, w.into_vec()).await?;
        JdwpReader::new(&payload).read_i32()
    }

    /// EventRequest.Clear (15, 2)
    pub async fn event_request_clear(&self, event_kind: u8, request_id: RequestId) -> Result<()> {
        let mut w = JdwpWriter::new();
        w.write_u8(event_kind);
        w.write_i32(request_id);
        self.send_command_raw(15, 2, w.into_vec()).await.map(drop)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventModifier {
    Count { count: u32 },
    ThreadOnly { thread: ThreadId },
    ClassMatch { pattern: String },
    ClassExclude { pattern: String },
    LocationOnly { location: Location },
    Step { thread: ThreadId, size: u32, depth: u32 },
}

impl EventModifier {
    pub fn kind(&self) -> u8 {
        match self {
            EventModifier::Count { .. } => 1,
            EventModifier::ThreadOnly { .. } => 3,
            EventModifier::ClassMatch { .. } => 5,
            EventModifier::ClassExclude { .. } => 6,
            EventModifier::LocationOnly { .. } => 7,
            EventModifier::Step { .. } => 10,
        }
    }

    fn encode(self, w: &mut JdwpWriter, sizes: &JdwpIdSizes) {
        w.write_u8(self.kind());
        match self {
            EventModifier::Count { count } => w.write_u32(count),
            EventModifier::ThreadOnly { thread } => w.write_object_id(thread, sizes),
            EventModifier::ClassMatch { pattern } | EventModifier::ClassExclude { pattern } => {
                w.write_string(&pattern)
            }
            EventModifier::LocationOnly { location } => w.write_location(&location, sizes),
            EventModifier::Step { thread, size, depth } => {
                w.write_object_id(thread, sizes);
                w.write_u32(size);
                w.write_u32(depth);
            }
        }
    }
}

async fn read_loop(mut reader: OwnedReadHalf, inner: Arc<Inner>) {
    let mut failure: Option<String> = None;

    loop {
        let mut raw = [0u8; JDWP_HEADER_LEN];
        let read = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = reader.read_exact(&mut raw) => res,
        };
        if let Err(err) = read {
            failure = Some(err.to_string());
            break;
        }

        let header = PacketHeader::parse(&raw);
        if header.length < JDWP_HEADER_LEN || header.length > MAX_JDWP_PACKET_BYTES {
            failure = Some(format!("invalid packet length {}", header.length));
            break;
        }
        let mut payload = vec![0u8; header.payload_len()];
        let read = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            res = reader.read_exact(&mut payload) => res,
        };
        if let Err(err) = read {
            failure = Some(err.to_string());
            break;
        }

        if header.is_reply() {
            let tx = inner.pending.lock().await.remove(&header.id);
            if let Some(tx) = tx {
                let _ = tx.send(Ok(Reply {
                    error_code: header.error_code(),
                    payload,
                }));
            }
        } else if (header.trailer[0], header.trailer[1]) == EVENT_COMPOSITE {
            if let Err(err) = handle_event_packet(&inner, &payload) {
                failure = Some(err.to_string());
                break;
            }
        } else {
            tracing::trace!(
                target: "jdi.wire",
                command_set = header.trailer[0],
                command = header.trailer[1],
                "ignoring VM command packet"
            );
        }
    }

    if let Some(reason) = &failure {
        tracing::debug!(target: "jdi.wire", reason = %reason, "JDWP read loop terminated");
    }
    inner.shutdown.cancel();

    let pending = std::mem::take(&mut *inner.pending.lock().await);
    for (_id, tx) in pending {
        let _ = tx.send(Err(JdwpError::ConnectionClosed));
    }
}

fn handle_event_packet(inner: &Inner, payload: &[u8]) -> Result<()> {
    let sizes = *lock(&inner.id_sizes, "id_sizes");
    let mut r = JdwpReader::new(payload);
    let suspend_policy = r.read_u8()?;
    let count = r.read_u32()? as usize;
    let mut events = Vec::with_capacity(count.min(64));
    for index in 0..count {
        let kind = r.read_u8()?;
        let request_id = r.read_i32()?;
        let event = match kind {
            event_kind::SINGLE_STEP => JdwpEvent::SingleStep {
                request_id,
                thread: r.read_object_id(&sizes)?,
                location: r.read_location(&sizes)?,
            },
            event_kind::BREAKPOINT => JdwpEvent::Breakpoint {
                request_id,
                thread: r.read_object_id(&sizes)?,
                location: r.read_location(&sizes)?,
            },
            event_kind::THREAD_START => JdwpEvent::ThreadStart {
                request_id,
                thread: r.read_object_id(&sizes)?,
            },
            event_kind::THREAD_DEATH => JdwpEvent::ThreadDeath {
                request_id,
                thread: r.read_object_id(&sizes)?,
            },
            event_kind::VM_START => JdwpEvent::VmStart {
                request_id,
                thread: r.read_object_id(&sizes)?,
            },
            event_kind::VM_DEATH => JdwpEvent::VmDeath,
            other => {
                // The remaining events of this set cannot be located without
                // knowing this one's layout.
                tracing::warn!(
                    target: "jdi.wire",
                    kind = other,
                    request = request_id,
                    dropped = count - index,
                    "unsupported event kind; dropping the rest of the event set"
                );
                break;
            }
        };
        events.push(event);
    }
    // Sent even when truncated: the VM still suspended for this set.
    let _ = inner.events.send(JdwpEventSet { suspend_policy, events });
    Ok(())
}
