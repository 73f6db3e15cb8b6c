//! Wire message codec
//!
//! # Wire Format
//!
//! Every message is a fixed 24-byte header, followed by the annotation chunks
//! and then the payload. All integers are big-endian.
//!
//! ```text
//! magic(4) version(2) type(2) flags(2) seq(2) payload_len(4)
//! serializer_id(2) annotations_len(2) reserved(2) checksum(2)
//! ```
//!
//! Annotation chunks are `key(4) length(2) value(length)`, repeated until the
//! declared annotation length is consumed.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use std::ops::{BitOr, BitOrAssign};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::auth::AuthKey;
use crate::config::Config;
use crate::protocol::error::{RemotoError, Result};
use crate::transport::Connection;

/// First four bytes of every message.
pub const MAGIC: [u8; 4] = *b"RMTO";

pub const PROTOCOL_VERSION: u16 = 48;

/// Size of the fixed header in bytes.
pub const HEADER_SIZE: usize = 24;

/// Constant mixed into the header checksum.
const CHECKSUM_MAGIC: u32 = 0x34E9;

/// Payloads smaller than this are never compressed.
const COMPRESSION_THRESHOLD: usize = 256;

/// Reserved annotation key of the authentication tag.
pub const ANNOTATION_AUTH: AnnotationKey = AnnotationKey(*b"HMAC");

/// Annotation key of the 16-byte correlation id.
pub const ANNOTATION_CORRELATION: AnnotationKey = AnnotationKey(*b"CORR");

/// Annotation key carrying an item-stream id.
pub const ANNOTATION_STREAM: AnnotationKey = AnnotationKey(*b"STRM");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Connect = 1,
    ConnectOk = 2,
    ConnectFail = 3,
    Invoke = 4,
    Result = 5,
    Ping = 6,
}

impl TryFrom<u16> for MessageType {
    type Error = RemotoError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(MessageType::Connect),
            2 => Ok(MessageType::ConnectOk),
            3 => Ok(MessageType::ConnectFail),
            4 => Ok(MessageType::Invoke),
            5 => Ok(MessageType::Result),
            6 => Ok(MessageType::Ping),
            other => Err(RemotoError::Protocol(format!("invalid message type {}", other))),
        }
    }
}

/// Message flag bitset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(pub u16);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const EXCEPTION: Flags = Flags(1 << 0);
    pub const COMPRESSED: Flags = Flags(1 << 1);
    pub const ONEWAY: Flags = Flags(1 << 2);
    pub const BATCH: Flags = Flags(1 << 3);
    pub const META_ON_CONNECT: Flags = Flags(1 << 4);
    pub const ITEM_STREAM_RESULT: Flags = Flags(1 << 5);
    pub const AUTH_TAG: Flags = Flags(1 << 6);

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

impl BitOrAssign for Flags {
    fn bitor_assign(&mut self, rhs: Flags) {
        self.0 |= rhs.0;
    }
}

/// Four-character annotation key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AnnotationKey(pub [u8; 4]);

impl AnnotationKey {
    /// Builds a key from a 4-character ASCII string.
    pub fn new(key: &str) -> Result<Self> {
        let bytes: [u8; 4] = key
            .as_bytes()
            .try_into()
            .map_err(|_| RemotoError::Protocol(format!("annotation key must be 4 characters: {:?}", key)))?;
        if !bytes.iter().all(|b| b.is_ascii_graphic()) {
            return Err(RemotoError::Protocol(format!("annotation key must be ascii: {:?}", key)));
        }
        Ok(Self(bytes))
    }
}

impl fmt::Debug for AnnotationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for AnnotationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Annotations keyed in sorted order, which the authentication tag relies on.
pub type Annotations = BTreeMap<AnnotationKey, Vec<u8>>;

/// Per-endpoint settings that shape how messages are encoded and checked.
#[derive(Debug, Clone, Default)]
pub struct WireConfig {
    pub auth_key: Option<AuthKey>,
    /// 0 means unlimited
    pub max_message_size: usize,
    pub compression: bool,
}

impl From<&Config> for WireConfig {
    fn from(config: &Config) -> Self {
        Self {
            auth_key: config.auth_key.clone(),
            max_message_size: config.max_message_size,
            compression: config.compression,
        }
    }
}

/// Decoded fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub msg_type: MessageType,
    pub flags: Flags,
    pub seq: u16,
    pub payload_size: u32,
    pub serializer_id: u16,
    pub annotations_size: u16,
}

impl Header {
    /// Parses and validates the fixed header.
    ///
    /// # Errors
    ///
    /// Returns a `Protocol` error on a short header, a bad magic tag or
    /// version, a checksum mismatch or an unknown message type.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != HEADER_SIZE {
            return Err(RemotoError::Protocol("header data size mismatch".to_string()));
        }
        if bytes[0..4] != MAGIC {
            return Err(RemotoError::Protocol(
                "invalid data or unsupported protocol version".to_string(),
            ));
        }

        let u16_at = |i: usize| u16::from_be_bytes([bytes[i], bytes[i + 1]]);
        let version = u16_at(4);
        if version != PROTOCOL_VERSION {
            return Err(RemotoError::Protocol(
                "invalid data or unsupported protocol version".to_string(),
            ));
        }

        let raw_type = u16_at(6);
        let flags = u16_at(8);
        let seq = u16_at(10);
        let payload_size = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
        let serializer_id = u16_at(16);
        let annotations_size = u16_at(18);
        let checksum = u16_at(22);

        let expected = header_checksum(raw_type, flags, seq, payload_size, serializer_id, annotations_size);
        if checksum != expected {
            return Err(RemotoError::Protocol("header checksum mismatch".to_string()));
        }

        Ok(Self {
            msg_type: MessageType::try_from(raw_type)?,
            flags: Flags(flags),
            seq,
            payload_size,
            serializer_id,
            annotations_size,
        })
    }

    /// Payload plus annotation size, the quantity the size limit applies to.
    pub fn data_size(&self) -> usize {
        self.payload_size as usize + self.annotations_size as usize
    }
}

fn header_checksum(
    msg_type: u16,
    flags: u16,
    seq: u16,
    payload_size: u32,
    serializer_id: u16,
    annotations_size: u16,
) -> u16 {
    let sum = (msg_type as u32)
        .wrapping_add(PROTOCOL_VERSION as u32)
        .wrapping_add(payload_size)
        .wrapping_add(annotations_size as u32)
        .wrapping_add(serializer_id as u32)
        .wrapping_add(flags as u32)
        .wrapping_add(seq as u32)
        .wrapping_add(CHECKSUM_MAGIC);
    (sum & 0xffff) as u16
}

/// One request or response on the wire.
///
/// # Example
///
/// ```
/// use remoto_common::protocol::{Flags, Message, MessageType, WireConfig};
///
/// let wire = WireConfig::default();
/// let msg = Message::new(MessageType::Invoke, b"payload".to_vec(), 2, Flags::ONEWAY, 7);
/// let bytes = msg.encode(&wire).unwrap();
/// let decoded = Message::decode(&bytes, &wire).unwrap();
/// assert_eq!(decoded.seq, 7);
/// assert!(decoded.flags.contains(Flags::ONEWAY));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: MessageType,
    pub flags: Flags,
    pub seq: u16,
    pub serializer_id: u16,
    pub annotations: Annotations,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(msg_type: MessageType, payload: Vec<u8>, serializer_id: u16, flags: Flags, seq: u16) -> Self {
        Self {
            msg_type,
            flags,
            seq,
            serializer_id,
            annotations: Annotations::new(),
            payload,
        }
    }

    pub fn with_annotations(mut self, annotations: Annotations) -> Self {
        self.annotations.extend(annotations);
        self
    }

    pub fn annotation(&self, key: AnnotationKey) -> Option<&[u8]> {
        self.annotations.get(&key).map(|v| v.as_slice())
    }

    /// Encodes the message, adding the authentication tag if a key is set.
    ///
    /// # Errors
    ///
    /// Returns a `Protocol` error if the message exceeds the configured maximum
    /// size or an annotation value is longer than 65535 bytes.
    pub fn encode(&self, wire: &WireConfig) -> Result<Vec<u8>> {
        let mut flags = self.flags;
        let mut payload = std::borrow::Cow::Borrowed(&self.payload);
        if wire.compression && !flags.contains(Flags::COMPRESSED) {
            if let Some(compressed) = compress(&self.payload)? {
                payload = std::borrow::Cow::Owned(compressed);
                flags.insert(Flags::COMPRESSED);
            }
        }

        let mut annotations = self.annotations.clone();
        annotations.remove(&ANNOTATION_AUTH);
        flags.remove(Flags::AUTH_TAG);
        if let Some(key) = &wire.auth_key {
            let tag = key.tag(&payload, annotations.values().map(|v| v.as_slice()));
            annotations.insert(ANNOTATION_AUTH, tag.to_vec());
            flags.insert(Flags::AUTH_TAG);
        }

        let mut annotation_bytes = Vec::new();
        for (key, value) in &annotations {
            let len = u16::try_from(value.len()).map_err(|_| {
                RemotoError::Protocol(format!("annotation {} too large: {} bytes", key, value.len()))
            })?;
            annotation_bytes.extend_from_slice(&key.0);
            annotation_bytes.extend_from_slice(&len.to_be_bytes());
            annotation_bytes.extend_from_slice(value);
        }
        let annotations_size = u16::try_from(annotation_bytes.len())
            .map_err(|_| RemotoError::Protocol("annotations too large".to_string()))?;
        let payload_size = u32::try_from(payload.len())
            .map_err(|_| RemotoError::Protocol("payload too large".to_string()))?;

        let data_size = payload.len() + annotation_bytes.len();
        if wire.max_message_size > 0 && data_size > wire.max_message_size {
            return Err(RemotoError::Protocol(format!(
                "max message size exceeded ({} where max={})",
                data_size, wire.max_message_size
            )));
        }

        let checksum = header_checksum(
            self.msg_type as u16,
            flags.0,
            self.seq,
            payload_size,
            self.serializer_id,
            annotations_size,
        );

        let mut out = Vec::with_capacity(HEADER_SIZE + data_size);
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&PROTOCOL_VERSION.to_be_bytes());
        out.extend_from_slice(&(self.msg_type as u16).to_be_bytes());
        out.extend_from_slice(&flags.0.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out.extend_from_slice(&payload_size.to_be_bytes());
        out.extend_from_slice(&self.serializer_id.to_be_bytes());
        out.extend_from_slice(&annotations_size.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&checksum.to_be_bytes());
        out.extend_from_slice(&annotation_bytes);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decodes a complete message held in memory.
    pub fn decode(bytes: &[u8], wire: &WireConfig) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(RemotoError::Protocol("header data size mismatch".to_string()));
        }
        let header = Header::decode(&bytes[..HEADER_SIZE])?;
        check_size(&header, wire)?;

        let body = &bytes[HEADER_SIZE..];
        if body.len() != header.data_size() {
            return Err(RemotoError::Protocol("message data size mismatch".to_string()));
        }
        let (annotation_bytes, payload) = body.split_at(header.annotations_size as usize);
        Self::assemble(header, annotation_bytes, payload.to_vec(), wire)
    }

    /// Reads the annotations and payload announced by `header` from the
    /// connection.
    ///
    /// An oversized message is refused before its payload is read, and the
    /// connection is closed: the sequence number of such a message cannot be
    /// trusted for an error reply.
    pub fn decode_body(conn: &Connection, header: Header, wire: &WireConfig) -> Result<Self> {
        if let Err(err) = check_size(&header, wire) {
            tracing::error!(connection = conn.id(), peer = %conn.peer(), "{}", err);
            conn.close();
            return Err(err);
        }
        let annotation_bytes = if header.annotations_size > 0 {
            conn.recv(header.annotations_size as usize)?
        } else {
            Vec::new()
        };
        let payload = conn.recv(header.payload_size as usize)?;
        Self::assemble(header, &annotation_bytes, payload, wire)
    }

    /// Receives one message, optionally restricted to the given types.
    pub fn recv(conn: &Connection, accepted: Option<&[MessageType]>, wire: &WireConfig) -> Result<Self> {
        let header_bytes = conn.recv(HEADER_SIZE)?;
        let header = Header::decode(&header_bytes)?;
        if let Some(accepted) = accepted {
            if !accepted.contains(&header.msg_type) {
                return Err(RemotoError::Protocol(format!(
                    "invalid msg type {} received",
                    header.msg_type as u16
                )));
            }
        }
        Self::decode_body(conn, header, wire)
    }

    /// Encodes and sends the message.
    pub fn send(&self, conn: &Connection, wire: &WireConfig) -> Result<()> {
        let bytes = self.encode(wire)?;
        conn.send(&bytes)
    }

    fn assemble(header: Header, annotation_bytes: &[u8], payload: Vec<u8>, wire: &WireConfig) -> Result<Self> {
        let annotations = parse_annotations(annotation_bytes)?;
        verify_auth(&annotations, &payload, wire.auth_key.as_ref())?;

        let mut flags = header.flags;
        let payload = if flags.contains(Flags::COMPRESSED) {
            flags.remove(Flags::COMPRESSED);
            decompress(&payload, wire.max_message_size)?
        } else {
            payload
        };

        Ok(Self {
            msg_type: header.msg_type,
            flags,
            seq: header.seq,
            serializer_id: header.serializer_id,
            annotations,
            payload,
        })
    }
}

fn check_size(header: &Header, wire: &WireConfig) -> Result<()> {
    if wire.max_message_size > 0 && header.data_size() > wire.max_message_size {
        return Err(RemotoError::Protocol(format!(
            "max message size exceeded ({} where max={})",
            header.data_size(),
            wire.max_message_size
        )));
    }
    Ok(())
}

fn parse_annotations(mut data: &[u8]) -> Result<Annotations> {
    let mut annotations = Annotations::new();
    while !data.is_empty() {
        if data.len() < 6 {
            return Err(RemotoError::Protocol("truncated annotation chunk".to_string()));
        }
        let key = AnnotationKey([data[0], data[1], data[2], data[3]]);
        let len = u16::from_be_bytes([data[4], data[5]]) as usize;
        if data.len() < 6 + len {
            return Err(RemotoError::Protocol(format!("truncated annotation {}", key)));
        }
        annotations.insert(key, data[6..6 + len].to_vec());
        data = &data[6 + len..];
    }
    Ok(annotations)
}

/// Applies the symmetry rule and checks the tag.
fn verify_auth(annotations: &Annotations, payload: &[u8], key: Option<&AuthKey>) -> Result<()> {
    let received = annotations.get(&ANNOTATION_AUTH);
    match (key, received) {
        (Some(key), Some(tag)) => {
            let others = annotations
                .iter()
                .filter(|(k, _)| **k != ANNOTATION_AUTH)
                .map(|(_, v)| v.as_slice());
            if key.verify(tag, payload, others) {
                Ok(())
            } else {
                Err(RemotoError::Security("message hmac mismatch".to_string()))
            }
        }
        (None, None) => Ok(()),
        _ => Err(RemotoError::Security("hmac key config not symmetric".to_string())),
    }
}

/// Returns the compressed payload, or `None` when compressing does not pay off.
fn compress(payload: &[u8]) -> Result<Option<Vec<u8>>> {
    if payload.len() < COMPRESSION_THRESHOLD {
        return Ok(None);
    }
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    let compressed = encoder.finish()?;
    Ok((compressed.len() < payload.len()).then_some(compressed))
}

/// Inflates a payload; with a nonzero `limit` the inflated size is bounded too.
fn decompress(payload: &[u8], limit: usize) -> Result<Vec<u8>> {
    let bound = if limit > 0 { limit as u64 + 1 } else { u64::MAX };
    let mut out = Vec::new();
    ZlibDecoder::new(payload)
        .take(bound)
        .read_to_end(&mut out)
        .map_err(|e| RemotoError::Protocol(format!("invalid compressed payload: {}", e)))?;
    if limit > 0 && out.len() > limit {
        return Err(RemotoError::Protocol(format!(
            "max message size exceeded (decompressed payload over max={})",
            limit
        )));
    }
    Ok(out)
}
