//! AMQP 0-9-1 frame model: methods, content headers, field tables.
//!
//! Only the methods a publishing client exchanges with a broker are modelled
//! with their arguments; anything else decodes as [`Method::Other`].

use std::io;

use bytes::{BufMut, Bytes, BytesMut};

pub const FRAME_METHOD: u8 = 1;
pub const FRAME_HEADER: u8 = 2;
pub const FRAME_BODY: u8 = 3;
pub const FRAME_HEARTBEAT: u8 = 8;
pub const FRAME_END: u8 = 0xCE;

/// Sent raw before the first frame.
pub const PROTOCOL_HEADER: &[u8; 8] = b"AMQP\x00\x00\x09\x01";

pub const CLASS_CONNECTION: u16 = 10;
pub const CLASS_CHANNEL: u16 = 20;
pub const CLASS_BASIC: u16 = 60;

/// `reply-code` for a normal, client-requested shutdown.
pub const REPLY_SUCCESS: u16 = 200;

/// A decoded frame together with its channel number.
#[derive(Debug, Clone, PartialEq)]
pub enum AmqpFrame {
    Method(u16, Method),
    Header(u16, ContentHeader),
    Body(u16, Bytes),
    Heartbeat,
}

/// Value stored in a [`FieldTable`] or field array.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    F32(f32),
    F64(f64),
    Decimal { scale: u8, value: u32 },
    LongString(Vec<u8>),
    Array(Vec<FieldValue>),
    Timestamp(u64),
    Table(FieldTable),
    Void,
    ByteArray(Vec<u8>),
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::LongString(s.as_bytes().to_vec())
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

/// Ordered AMQP field table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldTable(pub Vec<(String, FieldValue)>);

impl FieldTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `key`.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<FieldValue>) {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.0.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.0.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Basic class content properties. Absent fields are not sent.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<FieldTable>,
    /// 1 = transient, 2 = persistent
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    /// Per-message TTL in milliseconds, as a decimal string
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

/// Content header frame payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHeader {
    pub class_id: u16,
    pub body_size: u64,
    pub properties: BasicProperties,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    ConnectionStart {
        version_major: u8,
        version_minor: u8,
        server_properties: FieldTable,
        mechanisms: String,
        locales: String,
    },
    ConnectionStartOk {
        client_properties: FieldTable,
        mechanism: String,
        response: Vec<u8>,
        locale: String,
    },
    ConnectionTune {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionTuneOk {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionOpen {
        virtual_host: String,
    },
    ConnectionOpenOk,
    ConnectionClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ConnectionCloseOk,
    ConnectionBlocked {
        reason: String,
    },
    ConnectionUnblocked,
    ChannelOpen,
    ChannelOpenOk,
    ChannelFlow {
        active: bool,
    },
    ChannelFlowOk {
        active: bool,
    },
    ChannelClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ChannelCloseOk,
    BasicPublish {
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
    },
    /// A method this client does not interpret. Arguments are dropped.
    Other { class_id: u16, method_id: u16 },
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

impl Method {
    /// `(class-id, method-id)` of this method.
    pub fn ids(&self) -> (u16, u16) {
        use Method::*;
        match self {
            ConnectionStart { .. } => (CLASS_CONNECTION, 10),
            ConnectionStartOk { .. } => (CLASS_CONNECTION, 11),
            ConnectionTune { .. } => (CLASS_CONNECTION, 30),
            ConnectionTuneOk { .. } => (CLASS_CONNECTION, 31),
            ConnectionOpen { .. } => (CLASS_CONNECTION, 40),
            ConnectionOpenOk => (CLASS_CONNECTION, 41),
            ConnectionClose { .. } => (CLASS_CONNECTION, 50),
            ConnectionCloseOk => (CLASS_CONNECTION, 51),
            ConnectionBlocked { .. } => (CLASS_CONNECTION, 60),
            ConnectionUnblocked => (CLASS_CONNECTION, 61),
            ChannelOpen => (CLASS_CHANNEL, 10),
            ChannelOpenOk => (CLASS_CHANNEL, 11),
            ChannelFlow { .. } => (CLASS_CHANNEL, 20),
            ChannelFlowOk { .. } => (CLASS_CHANNEL, 21),
            ChannelClose { .. } => (CLASS_CHANNEL, 40),
            ChannelCloseOk => (CLASS_CHANNEL, 41),
            BasicPublish { .. } => (CLASS_BASIC, 40),
            Other { class_id, method_id } => (*class_id, *method_id),
        }
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) -> io::Result<()> {
        use Method::*;
        let (class_id, method_id) = self.ids();
        dst.put_u16(class_id);
        dst.put_u16(method_id);
        match self {
            ConnectionStart {
                version_major,
                version_minor,
                server_properties,
                mechanisms,
                locales,
            } => {
                dst.put_u8(*version_major);
                dst.put_u8(*version_minor);
                put_table(dst, server_properties)?;
                put_longstr(dst, mechanisms.as_bytes());
                put_longstr(dst, locales.as_bytes());
            }
            ConnectionStartOk {
                client_properties,
                mechanism,
                response,
                locale,
            } => {
                put_table(dst, client_properties)?;
                put_shortstr(dst, mechanism)?;
                put_longstr(dst, response);
                put_shortstr(dst, locale)?;
            }
            ConnectionTune {
                channel_max,
                frame_max,
                heartbeat,
            }
            | ConnectionTuneOk {
                channel_max,
                frame_max,
                heartbeat,
            } => {
                dst.put_u16(*channel_max);
                dst.put_u32(*frame_max);
                dst.put_u16(*heartbeat);
            }
            ConnectionOpen { virtual_host } => {
                put_shortstr(dst, virtual_host)?;
                // reserved capabilities + insist
                put_shortstr(dst, "")?;
                dst.put_u8(0);
            }
            ConnectionOpenOk => put_shortstr(dst, "")?,
            ConnectionClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            }
            | ChannelClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            } => {
                dst.put_u16(*reply_code);
                put_shortstr(dst, reply_text)?;
                dst.put_u16(*class_id);
                dst.put_u16(*method_id);
            }
            ConnectionBlocked { reason } => put_shortstr(dst, reason)?,
            ChannelOpen => put_shortstr(dst, "")?,
            ChannelOpenOk => put_longstr(dst, b""),
            ChannelFlow { active } | ChannelFlowOk { active } => dst.put_u8(u8::from(*active)),
            BasicPublish {
                exchange,
                routing_key,
                mandatory,
                immediate,
            } => {
                // reserved ticket
                dst.put_u16(0);
                put_shortstr(dst, exchange)?;
                put_shortstr(dst, routing_key)?;
                dst.put_u8(u8::from(*mandatory) | (u8::from(*immediate) << 1));
            }
            ConnectionCloseOk | ConnectionUnblocked | ChannelCloseOk | Other { .. } => {}
        }
        Ok(())
    }

    pub(crate) fn decode(payload: &[u8]) -> io::Result<Method> {
        let mut r = Reader::new(payload);
        let class_id = r.u16()?;
        let method_id = r.u16()?;
        let method = match (class_id, method_id) {
            (CLASS_CONNECTION, 10) => Method::ConnectionStart {
                version_major: r.u8()?,
                version_minor: r.u8()?,
                server_properties: r.table()?,
                mechanisms: r.longstr_lossy()?,
                locales: r.longstr_lossy()?,
            },
            (CLASS_CONNECTION, 11) => Method::ConnectionStartOk {
                client_properties: r.table()?,
                mechanism: r.shortstr()?,
                response: r.longstr()?,
                locale: r.shortstr()?,
            },
            (CLASS_CONNECTION, 30) => Method::ConnectionTune {
                channel_max: r.u16()?,
                frame_max: r.u32()?,
                heartbeat: r.u16()?,
            },
            (CLASS_CONNECTION, 31) => Method::ConnectionTuneOk {
                channel_max: r.u16()?,
                frame_max: r.u32()?,
                heartbeat: r.u16()?,
            },
            (CLASS_CONNECTION, 40) => Method::ConnectionOpen {
                virtual_host: r.shortstr()?,
            },
            (CLASS_CONNECTION, 41) => Method::ConnectionOpenOk,
            (CLASS_CONNECTION, 50) => Method::ConnectionClose {
                reply_code: r.u16()?,
                reply_text: r.shortstr()?,
                class_id: r.u16()?,
                method_id: r.u16()?,
            },
            (CLASS_CONNECTION, 51) => Method::ConnectionCloseOk,
            (CLASS_CONNECTION, 60) => Method::ConnectionBlocked {
                reason: r.shortstr()?,
            },
            (CLASS_CONNECTION, 61) => Method::ConnectionUnblocked,
            (CLASS_CHANNEL, 10) => Method::ChannelOpen,
            (CLASS_CHANNEL, 11) => Method::ChannelOpenOk,
            (CLASS_CHANNEL, 20) => Method::ChannelFlow {
                active: r.u8()? & 1 == 1,
            },
            (CLASS_CHANNEL, 21) => Method::ChannelFlowOk {
                active: r.u8()? & 1 == 1,
            },
            (CLASS_CHANNEL, 40) => Method::ChannelClose {
                reply_code: r.u16()?,
                reply_text: r.shortstr()?,
                class_id: r.u16()?,
                method_id: r.u16()?,
            },
            (CLASS_CHANNEL, 41) => Method::ChannelCloseOk,
            (CLASS_BASIC, 40) => {
                let _ticket = r.u16()?;
                let exchange = r.shortstr()?;
                let routing_key = r.shortstr()?;
                let bits = r.u8()?;
                Method::BasicPublish {
                    exchange,
                    routing_key,
                    mandatory: bits & 1 != 0,
                    immediate: bits & 2 != 0,
                }
            }
            _ => Method::Other {
                class_id,
                method_id,
            },
        };
        Ok(method)
    }
}

// property flag bits, most significant first
const FLAG_CONTENT_TYPE: u16 = 1 << 15;
const FLAG_CONTENT_ENCODING: u16 = 1 << 14;
const FLAG_HEADERS: u16 = 1 << 13;
const FLAG_DELIVERY_MODE: u16 = 1 << 12;
const FLAG_PRIORITY: u16 = 1 << 11;
const FLAG_CORRELATION_ID: u16 = 1 << 10;
const FLAG_REPLY_TO: u16 = 1 << 9;
const FLAG_EXPIRATION: u16 = 1 << 8;
const FLAG_MESSAGE_ID: u16 = 1 << 7;
const FLAG_TIMESTAMP: u16 = 1 << 6;
const FLAG_TYPE: u16 = 1 << 5;
const FLAG_USER_ID: u16 = 1 << 4;
const FLAG_APP_ID: u16 = 1 << 3;
const FLAG_CLUSTER_ID: u16 = 1 << 2;

impl BasicProperties {
    fn flags(&self) -> u16 {
        let mut flags = 0;
        let mut set = |present: bool, bit: u16| {
            if present {
                flags |= bit;
            }
        };
        set(self.content_type.is_some(), FLAG_CONTENT_TYPE);
        set(self.content_encoding.is_some(), FLAG_CONTENT_ENCODING);
        set(self.headers.is_some(), FLAG_HEADERS);
        set(self.delivery_mode.is_some(), FLAG_DELIVERY_MODE);
        set(self.priority.is_some(), FLAG_PRIORITY);
        set(self.correlation_id.is_some(), FLAG_CORRELATION_ID);
        set(self.reply_to.is_some(), FLAG_REPLY_TO);
        set(self.expiration.is_some(), FLAG_EXPIRATION);
        set(self.message_id.is_some(), FLAG_MESSAGE_ID);
        set(self.timestamp.is_some(), FLAG_TIMESTAMP);
        set(self.kind.is_some(), FLAG_TYPE);
        set(self.user_id.is_some(), FLAG_USER_ID);
        set(self.app_id.is_some(), FLAG_APP_ID);
        set(self.cluster_id.is_some(), FLAG_CLUSTER_ID);
        flags
    }

    fn encode(&self, dst: &mut BytesMut) -> io::Result<()> {
        dst.put_u16(self.flags());
        let short = |dst: &mut BytesMut, v: &Option<String>| match v {
            Some(s) => put_shortstr(dst, s),
            None => Ok(()),
        };
        short(dst, &self.content_type)?;
        short(dst, &self.content_encoding)?;
        if let Some(headers) = &self.headers {
            put_table(dst, headers)?;
        }
        if let Some(mode) = self.delivery_mode {
            dst.put_u8(mode);
        }
        if let Some(priority) = self.priority {
            dst.put_u8(priority);
        }
        short(dst, &self.correlation_id)?;
        short(dst, &self.reply_to)?;
        short(dst, &self.expiration)?;
        short(dst, &self.message_id)?;
        if let Some(ts) = self.timestamp {
            dst.put_u64(ts);
        }
        short(dst, &self.kind)?;
        short(dst, &self.user_id)?;
        short(dst, &self.app_id)?;
        short(dst, &self.cluster_id)?;
        Ok(())
    }

    fn decode(r: &mut Reader<'_>) -> io::Result<BasicProperties> {
        let flags = r.u16()?;
        if flags & 1 != 0 {
            return Err(invalid("property flag continuation is not supported"));
        }
        let has = |bit: u16| flags & bit != 0;
        let mut p = BasicProperties::default();
        if has(FLAG_CONTENT_TYPE) {
            p.content_type = Some(r.shortstr()?);
        }
        if has(FLAG_CONTENT_ENCODING) {
            p.content_encoding = Some(r.shortstr()?);
        }
        if has(FLAG_HEADERS) {
            p.headers = Some(r.table()?);
        }
        if has(FLAG_DELIVERY_MODE) {
            p.delivery_mode = Some(r.u8()?);
        }
        if has(FLAG_PRIORITY) {
            p.priority = Some(r.u8()?);
        }
        if has(FLAG_CORRELATION_ID) {
            p.correlation_id = Some(r.shortstr()?);
        }
        if has(FLAG_REPLY_TO) {
            p.reply_to = Some(r.shortstr()?);
        }
        if has(FLAG_EXPIRATION) {
            p.expiration = Some(r.shortstr()?);
        }
        if has(FLAG_MESSAGE_ID) {
            p.message_id = Some(r.shortstr()?);
        }
        if has(FLAG_TIMESTAMP) {
            p.timestamp = Some(r.u64()?);
        }
        if has(FLAG_TYPE) {
            p.kind = Some(r.shortstr()?);
        }
        if has(FLAG_USER_ID) {
            p.user_id = Some(r.shortstr()?);
        }
        if has(FLAG_APP_ID) {
            p.app_id = Some(r.shortstr()?);
        }
        if has(FLAG_CLUSTER_ID) {
            p.cluster_id = Some(r.shortstr()?);
        }
        Ok(p)
    }
}

impl ContentHeader {
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> io::Result<()> {
        dst.put_u16(self.class_id);
        // weight, unused
        dst.put_u16(0);
        dst.put_u64(self.body_size);
        self.properties.encode(dst)
    }

    pub(crate) fn decode(payload: &[u8]) -> io::Result<ContentHeader> {
        let mut r = Reader::new(payload);
        let class_id = r.u16()?;
        let _weight = r.u16()?;
        let body_size = r.u64()?;
        let properties = BasicProperties::decode(&mut r)?;
        Ok(ContentHeader {
            class_id,
            body_size,
            properties,
        })
    }
}

fn put_shortstr(dst: &mut BytesMut, s: &str) -> io::Result<()> {
    let len = u8::try_from(s.len()).map_err(|_| invalid(format!("short string too long ({} bytes)", s.len())))?;
    dst.put_u8(len);
    dst.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_longstr(dst: &mut BytesMut, s: &[u8]) {
    dst.put_u32(s.len() as u32);
    dst.extend_from_slice(s);
}

/// Write a `u32` length placeholder, run `body`, then patch the length.
fn put_sized(dst: &mut BytesMut, body: impl FnOnce(&mut BytesMut) -> io::Result<()>) -> io::Result<()> {
    let at = dst.len();
    dst.put_u32(0);
    body(dst)?;
    let len = (dst.len() - at - 4) as u32;
    dst[at..at + 4].copy_from_slice(&len.to_be_bytes());
    Ok(())
}

fn put_table(dst: &mut BytesMut, table: &FieldTable) -> io::Result<()> {
    put_sized(dst, |dst| {
        for (key, value) in &table.0 {
            put_shortstr(dst, key)?;
            put_value(dst, value)?;
        }
        Ok(())
    })
}

fn put_value(dst: &mut BytesMut, value: &FieldValue) -> io::Result<()> {
    match value {
        FieldValue::Bool(v) => {
            dst.put_u8(b't');
            dst.put_u8(u8::from(*v));
        }
        FieldValue::I8(v) => {
            dst.put_u8(b'b');
            dst.put_i8(*v);
        }
        FieldValue::U8(v) => {
            dst.put_u8(b'B');
            dst.put_u8(*v);
        }
        FieldValue::I16(v) => {
            dst.put_u8(b's');
            dst.put_i16(*v);
        }
        FieldValue::U16(v) => {
            dst.put_u8(b'u');
            dst.put_u16(*v);
        }
        FieldValue::I32(v) => {
            dst.put_u8(b'I');
            dst.put_i32(*v);
        }
        FieldValue::U32(v) => {
            dst.put_u8(b'i');
            dst.put_u32(*v);
        }
        FieldValue::I64(v) => {
            dst.put_u8(b'l');
            dst.put_i64(*v);
        }
        FieldValue::F32(v) => {
            dst.put_u8(b'f');
            dst.put_f32(*v);
        }
        FieldValue::F64(v) => {
            dst.put_u8(b'd');
            dst.put_f64(*v);
        }
        FieldValue::Decimal { scale, value } => {
            dst.put_u8(b'D');
            dst.put_u8(*scale);
            dst.put_u32(*value);
        }
        FieldValue::LongString(v) => {
            dst.put_u8(b'S');
            put_longstr(dst, v);
        }
        FieldValue::Array(values) => {
            dst.put_u8(b'A');
            put_sized(dst, |dst| values.iter().try_for_each(|v| put_value(dst, v)))?;
        }
        FieldValue::Timestamp(v) => {
            dst.put_u8(b'T');
            dst.put_u64(*v);
        }
        FieldValue::Table(t) => {
            dst.put_u8(b'F');
            put_table(dst, t)?;
        }
        FieldValue::Void => dst.put_u8(b'V'),
        FieldValue::ByteArray(v) => {
            dst.put_u8(b'x');
            put_longstr(dst, v);
        }
    }
    Ok(())
}

/// Bounds-checked big-endian reader over a frame payload.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(invalid(format!(
                "truncated payload: need {} bytes, have {}",
                n,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> io::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> io::Result<u16> {
        self.array().map(u16::from_be_bytes)
    }

    fn u32(&mut self) -> io::Result<u32> {
        self.array().map(u32::from_be_bytes)
    }

    fn u64(&mut self) -> io::Result<u64> {
        self.array().map(u64::from_be_bytes)
    }

    fn shortstr(&mut self) -> io::Result<String> {
        let len = self.u8()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec()).map_err(|e| invalid(format!("invalid utf8 in short string: {}", e)))
    }

    fn longstr(&mut self) -> io::Result<Vec<u8>> {
        let len = self.u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn longstr_lossy(&mut self) -> io::Result<String> {
        Ok(String::from_utf8_lossy(&self.longstr()?).into_owned())
    }

    fn table(&mut self) -> io::Result<FieldTable> {
        let len = self.u32()? as usize;
        let mut inner = Reader::new(self.take(len)?);
        let mut table = FieldTable::new();
        while !inner.buf.is_empty() {
            let key = inner.shortstr()?;
            let value = inner.value()?;
            table.0.push((key, value));
        }
        Ok(table)
    }

    fn value(&mut self) -> io::Result<FieldValue> {
        let value = match self.u8()? {
            b't' => FieldValue::Bool(self.u8()? != 0),
            b'b' => FieldValue::I8(self.u8()? as i8),
            b'B' => FieldValue::U8(self.u8()?),
            b's' => FieldValue::I16(self.array().map(i16::from_be_bytes)?),
            b'u' => FieldValue::U16(self.u16()?),
            b'I' => FieldValue::I32(self.array().map(i32::from_be_bytes)?),
            b'i' => FieldValue::U32(self.u32()?),
            b'l' => FieldValue::I64(self.array().map(i64::from_be_bytes)?),
            b'f' => FieldValue::F32(self.array().map(f32::from_be_bytes)?),
            b'd' => FieldValue::F64(self.array().map(f64::from_be_bytes)?),
            b'D' => FieldValue::Decimal {
                scale: self.u8()?,
                value: self.u32()?,
            },
            b'S' => FieldValue::LongString(self.longstr()?),
            b'A' => {
                let len = self.u32()? as usize;
                let mut inner = Reader::new(self.take(len)?);
                let mut values = Vec::new();
                while !inner.buf.is_empty() {
                    values.push(inner.value()?);
                }
                FieldValue::Array(values)
            }
            b'T' => FieldValue::Timestamp(self.u64()?),
            b'F' => FieldValue::Table(self.table()?),
            b'V' => FieldValue::Void,
            b'x' => FieldValue::ByteArray(self.longstr()?),
            other => return Err(invalid(format!("unknown field type '{}'", other as char))),
        };
        Ok(value)
    }
}
