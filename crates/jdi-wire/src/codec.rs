use crate::types::{
    JdwpError, JdwpIdSizes, JdwpValue, Location, ObjectId, ReferenceTypeId, Result,
    JDWP_HEADER_LEN,
};

pub const HANDSHAKE: &[u8] = b"JDWP-Handshake";
pub const FLAG_REPLY: u8 = 0x80;

/// Command set / command of the composite event packet sent by the VM.
pub const EVENT_COMPOSITE: (u8, u8) = (64, 100);

pub fn signature_to_tag(signature: &str) -> u8 {
    signature.as_bytes().first().copied().unwrap_or(b'V')
}

/// `com.example.Foo` → `Lcom/example/Foo;`. Signatures pass through untouched.
pub fn class_name_to_signature(class: &str) -> String {
    if class.starts_with('L') && class.ends_with(';') {
        return class.to_string();
    }
    format!("L{};", class.replace('.', "/"))
}

/// `Lcom/example/Foo;` → `com.example.Foo`, `[I` → `int[]`.
pub fn signature_to_type_name(signature: &str) -> String {
    let dims = signature.bytes().take_while(|b| *b == b'[').count();
    let element = &signature[dims..];
    let base = match element.as_bytes().first() {
        Some(b'L') => element
            .trim_start_matches('L')
            .trim_end_matches(';')
            .replace('/', "."),
        Some(b'Z') => "boolean".to_string(),
        Some(b'B') => "byte".to_string(),
        Some(b'C') => "char".to_string(),
        Some(b'S') => "short".to_string(),
        Some(b'I') => "int".to_string(),
        Some(b'J') => "long".to_string(),
        Some(b'F') => "float".to_string(),
        Some(b'D') => "double".to_string(),
        Some(b'V') => "void".to_string(),
        _ => element.to_string(),
    };
    let mut out = base;
    for _ in 0..dims {
        out.push_str("[]");
    }
    out
}

#[derive(Default)]
pub struct JdwpWriter {
    buf: Vec<u8>,
}

impl JdwpWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// Writes the low `size` bytes of `id`, big endian.
    pub fn write_id(&mut self, id: u64, size: usize) {
        let be = id.to_be_bytes();
        let size = size.clamp(1, 8);
        self.buf.extend_from_slice(&be[8 - size..]);
    }

    pub fn write_object_id(&mut self, id: ObjectId, sizes: &JdwpIdSizes) {
        self.write_id(id, sizes.object_id);
    }

    pub fn write_reference_type_id(&mut self, id: ReferenceTypeId, sizes: &JdwpIdSizes) {
        self.write_id(id, sizes.reference_type_id);
    }

    pub fn write_location(&mut self, loc: &Location, sizes: &JdwpIdSizes) {
        self.write_u8(loc.type_tag);
        self.write_reference_type_id(loc.class_id, sizes);
        self.write_id(loc.method_id, sizes.method_id);
        self.write_u64(loc.index);
    }

    pub fn write_untagged_value(&mut self, v: &JdwpValue, sizes: &JdwpIdSizes) {
        match *v {
            JdwpValue::Boolean(v) => self.write_bool(v),
            JdwpValue::Byte(v) => self.write_u8(v as u8),
            JdwpValue::Char(v) => self.write_u16(v),
            JdwpValue::Short(v) => self.write_u16(v as u16),
            JdwpValue::Int(v) => self.write_i32(v),
            JdwpValue::Long(v) => self.write_i64(v),
            JdwpValue::Float(v) => self.write_u32(v.to_bits()),
            JdwpValue::Double(v) => self.write_u64(v.to_bits()),
            JdwpValue::Object { id, .. } => self.write_object_id(id, sizes),
            JdwpValue::Void => {}
        }
    }

    pub fn write_value(&mut self, v: &JdwpValue, sizes: &JdwpIdSizes) {
        self.write_u8(v.tag());
        self.write_untagged_value(v, sizes);
    }
}

pub struct JdwpReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> JdwpReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.buf.len())
            .ok_or_else(|| {
                JdwpError::Protocol(format!(
                    "buffer underflow: need {n} bytes at offset {}, packet has {}",
                    self.pos,
                    self.buf.len()
                ))
            })?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.array()?))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| JdwpError::Protocol(format!("invalid utf-8 string: {e}")))
    }

    pub fn read_id(&mut self, size: usize) -> Result<u64> {
        if size == 0 || size > 8 {
            return Err(JdwpError::Protocol(format!("invalid id size: {size}")));
        }
        let mut be = [0u8; 8];
        be[8 - size..].copy_from_slice(self.take(size)?);
        Ok(u64::from_be_bytes(be))
    }

    pub fn read_object_id(&mut self, sizes: &JdwpIdSizes) -> Result<ObjectId> {
        self.read_id(sizes.object_id)
    }

    pub fn read_tagged_object_id(&mut self, sizes: &JdwpIdSizes) -> Result<(u8, ObjectId)> {
        let tag = self.read_u8()?;
        Ok((tag, self.read_object_id(sizes)?))
    }

    pub fn read_reference_type_id(&mut self, sizes: &JdwpIdSizes) -> Result<ReferenceTypeId> {
        self.read_id(sizes.reference_type_id)
    }

    pub fn read_location(&mut self, sizes: &JdwpIdSizes) -> Result<Location> {
        Ok(Location {
            type_tag: self.read_u8()?,
            class_id: self.read_reference_type_id(sizes)?,
            method_id: self.read_id(sizes.method_id)?,
            index: self.read_u64()?,
        })
    }

    pub fn read_untagged_value(&mut self, tag: u8, sizes: &JdwpIdSizes) -> Result<JdwpValue> {
        Ok(match tag {
            b'Z' => JdwpValue::Boolean(self.read_bool()?),
            b'B' => JdwpValue::Byte(self.read_u8()? as i8),
            b'C' => JdwpValue::Char(self.read_u16()?),
            b'S' => JdwpValue::Short(self.read_u16()? as i16),
            b'I' => JdwpValue::Int(self.read_i32()?),
            b'J' => JdwpValue::Long(self.read_i64()?),
            b'F' => JdwpValue::Float(f32::from_bits(self.read_u32()?)),
            b'D' => JdwpValue::Double(f64::from_bits(self.read_u64()?)),
            b'V' => JdwpValue::Void,
            _ => JdwpValue::Object {
                tag,
                id: self.read_object_id(sizes)?,
            },
        })
    }

    pub fn read_value(&mut self, sizes: &JdwpIdSizes) -> Result<JdwpValue> {
        let tag = self.read_u8()?;
        self.read_untagged_value(tag, sizes)
    }
}

fn encode_packet(id: u32, flags: u8, trailer: [u8; 2], payload: &[u8]) -> Vec<u8> {
    let length = (JDWP_HEADER_LEN + payload.len()) as u32;
    let mut out = Vec::with_capacity(length as usize);
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(&id.to_be_bytes());
    out.push(flags);
    out.extend_from_slice(&trailer);
    out.extend_from_slice(payload);
    out
}

pub fn encode_command(id: u32, command_set: u8, command: u8, payload: &[u8]) -> Vec<u8> {
    encode_packet(id, 0, [command_set, command], payload)
}

pub fn encode_reply(id: u32, error_code: u16, payload: &[u8]) -> Vec<u8> {
    encode_packet(id, FLAG_REPLY, error_code.to_be_bytes(), payload)
}

/// Decoded fixed header of an incoming packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub length: usize,
    pub id: u32,
    pub flags: u8,
    pub trailer: [u8; 2],
}

impl PacketHeader {
    pub fn parse(header: &[u8; JDWP_HEADER_LEN]) -> Self {
        Self {
            length: u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize,
            id: u32::from_be_bytes([header[4], header[5], header[6], header[7]]),
            flags: header[8],
            trailer: [header[9], header[10]],
        }
    }

    pub fn is_reply(&self) -> bool {
        self.flags & FLAG_REPLY != 0
    }

    pub fn error_code(&self) -> u16 {
        u16::from_be_bytes(self.trailer)
    }

    pub fn payload_len(&self) -> usize {
        self.length.saturating_sub(JDWP_HEADER_LEN)
    }
}
