// src/core/protocol/codec.rs

//! Implements the command wire format and the corresponding `Encoder` and
//! `Decoder` for network communication.
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! [name: u16 len + UTF-8][argc: i32]{[key: u16 len + UTF-8][value]} x argc
//! ```
//!
//! A plain value is `u32 len + UTF-8`. A typed value is a one-byte kind tag
//! followed by the kind's payload.

use super::command::Command;
use super::command_type::CommandType;
use super::value::ArgValue;
use crate::core::SessionError;
use bytes::{Buf, BufMut, BytesMut};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

/// The 8-byte preamble a client writes before its first command ("QESTLNK1").
pub const HANDSHAKE_MAGIC: u64 = 0x5145_5354_4C4E_4B31;

// Protocol-level limits to prevent denial-of-service attacks.
pub(crate) const MAX_ARGUMENTS: usize = 64 * 1024;
pub(crate) const MAX_VALUE_SIZE: usize = 16 * 1024 * 1024;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_LONG: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_DOUBLE: u8 = 5;
const TAG_STRING: u8 = 6;
const TAG_STRUCTURED: u8 = 7;

/// Which value encoding a connection uses. Both peers must agree; it is not negotiated.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    /// Every value travels as its string form.
    #[default]
    Plain,
    /// Values carry a kind tag so numbers round-trip exactly.
    Typed,
}

/// A `tokio_util::codec` implementation for encoding and decoding `Command`s.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandCodec {
    kind: CodecKind,
}

impl CommandCodec {
    pub fn new(kind: CodecKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> CodecKind {
        self.kind
    }

    /// A convenience method to encode a command into a `Vec<u8>`.
    pub fn encode_to_vec(&self, command: &Command) -> Result<Vec<u8>, SessionError> {
        let mut buf = BytesMut::new();
        let mut codec = *self;
        codec.encode(command.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }
}

impl Encoder<Command> for CommandCodec {
    type Error = SessionError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_ARGUMENTS {
            return Err(SessionError::FrameTooLarge(format!(
                "{} arguments",
                item.len()
            )));
        }
        put_short_str(dst, item.name())?;
        dst.put_i32(item.len() as i32);
        for (key, value) in item.arguments() {
            put_short_str(dst, key)?;
            match self.kind {
                CodecKind::Plain => put_long_str(dst, &value.to_wire_string())?,
                CodecKind::Typed => put_typed(dst, value)?,
            }
        }
        Ok(())
    }
}

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = SessionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut bytes = &src[..];
        match self.parse_frame(&mut bytes) {
            Ok((type_name, arguments)) => {
                // The whole frame is consumed before the type is resolved, so an
                // unknown type never leaves a partial frame behind.
                let len = src.len() - bytes.len();
                src.advance(len);
                let command_type = CommandType::lookup(&type_name)?;
                Ok(Some(Command::from_parts(command_type, arguments)))
            }
            // If the error is `IncompleteData`, we return `Ok(None)` to signal that
            // we need more data. For any other error, we propagate it up.
            Err(SessionError::IncompleteData) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl CommandCodec {
    fn parse_frame(
        &self,
        bytes: &mut &[u8],
    ) -> Result<(String, IndexMap<String, ArgValue>), SessionError> {
        let type_name = read_short_str(bytes)?;
        let argc = read_i32(bytes)?;
        if argc < 0 {
            return Err(SessionError::MalformedFrame(format!(
                "negative argument count {argc} for '{type_name}'"
            )));
        }
        let argc = argc as usize;
        if argc > MAX_ARGUMENTS {
            return Err(SessionError::MalformedFrame(format!(
                "argument count {argc} for '{type_name}' exceeds {MAX_ARGUMENTS}"
            )));
        }

        let mut arguments = IndexMap::with_capacity(argc);
        for _ in 0..argc {
            let key = read_short_str(bytes)?;
            let value = match self.kind {
                CodecKind::Plain => ArgValue::Str(read_long_str(bytes)?),
                CodecKind::Typed => read_typed(bytes)?,
            };
            arguments.insert(key, value);
        }
        Ok((type_name, arguments))
    }
}

pub(crate) fn check_short_len(len: usize) -> Result<u16, SessionError> {
    u16::try_from(len).map_err(|_| SessionError::FrameTooLarge(format!("{len} byte name or key")))
}

pub(crate) fn check_long_len(len: usize) -> Result<u32, SessionError> {
    if len > MAX_VALUE_SIZE {
        return Err(SessionError::FrameTooLarge(format!(
            "{len} byte argument value"
        )));
    }
    Ok(len as u32)
}

fn put_short_str(dst: &mut BytesMut, s: &str) -> Result<(), SessionError> {
    dst.put_u16(check_short_len(s.len())?);
    dst.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_long_str(dst: &mut BytesMut, s: &str) -> Result<(), SessionError> {
    dst.put_u32(check_long_len(s.len())?);
    dst.extend_from_slice(s.as_bytes());
    Ok(())
}

fn put_typed(dst: &mut BytesMut, value: &ArgValue) -> Result<(), SessionError> {
    match value {
        ArgValue::Null => dst.put_u8(TAG_NULL),
        ArgValue::Bool(b) => {
            dst.put_u8(TAG_BOOL);
            dst.put_u8(u8::from(*b));
        }
        ArgValue::Int(i) => {
            dst.put_u8(TAG_INT);
            dst.put_i32(*i);
        }
        ArgValue::Long(l) => {
            dst.put_u8(TAG_LONG);
            dst.put_i64(*l);
        }
        ArgValue::Float(f) => {
            dst.put_u8(TAG_FLOAT);
            dst.put_u32(f.to_bits());
        }
        ArgValue::Double(d) => {
            dst.put_u8(TAG_DOUBLE);
            dst.put_u64(d.to_bits());
        }
        ArgValue::Str(s) => {
            dst.put_u8(TAG_STRING);
            put_long_str(dst, s)?;
        }
        ArgValue::Structured(s) => {
            dst.put_u8(TAG_STRUCTURED);
            put_long_str(dst, s)?;
        }
    }
    Ok(())
}

/// Splits `n` bytes off the front of the buffer.
fn take<'a>(bytes: &mut &'a [u8], n: usize) -> Result<&'a [u8], SessionError> {
    if bytes.len() < n {
        return Err(SessionError::IncompleteData);
    }
    let (head, tail) = bytes.split_at(n);
    *bytes = tail;
    Ok(head)
}

fn read_u8(bytes: &mut &[u8]) -> Result<u8, SessionError> {
    Ok(take(bytes, 1)?[0])
}

fn read_u16(bytes: &mut &[u8]) -> Result<u16, SessionError> {
    Ok(take(bytes, 2)?.get_u16())
}

fn read_u32(bytes: &mut &[u8]) -> Result<u32, SessionError> {
    Ok(take(bytes, 4)?.get_u32())
}

fn read_i32(bytes: &mut &[u8]) -> Result<i32, SessionError> {
    Ok(take(bytes, 4)?.get_i32())
}

fn read_u64(bytes: &mut &[u8]) -> Result<u64, SessionError> {
    Ok(take(bytes, 8)?.get_u64())
}

fn read_short_str(bytes: &mut &[u8]) -> Result<String, SessionError> {
    let len = read_u16(bytes)? as usize;
    let raw = take(bytes, len)?;
    Ok(String::from_utf8(raw.to_vec())?)
}

fn read_long_str(bytes: &mut &[u8]) -> Result<String, SessionError> {
    let len = read_u32(bytes)? as usize;
    if len > MAX_VALUE_SIZE {
        return Err(SessionError::FrameTooLarge(format!(
            "{len} byte argument value"
        )));
    }
    let raw = take(bytes, len)?;
    Ok(String::from_utf8(raw.to_vec())?)
}

fn read_typed(bytes: &mut &[u8]) -> Result<ArgValue, SessionError> {
    let tag = read_u8(bytes)?;
    let value = match tag {
        TAG_NULL => ArgValue::Null,
        TAG_BOOL => ArgValue::Bool(read_u8(bytes)? != 0),
        TAG_INT => ArgValue::Int(read_i32(bytes)?),
        TAG_LONG => ArgValue::Long(read_u64(bytes)? as i64),
        TAG_FLOAT => ArgValue::Float(f32::from_bits(read_u32(bytes)?)),
        TAG_DOUBLE => ArgValue::Double(f64::from_bits(read_u64(bytes)?)),
        TAG_STRING => ArgValue::Str(read_long_str(bytes)?),
        TAG_STRUCTURED => ArgValue::Structured(read_long_str(bytes)?),
        other => {
            return Err(SessionError::MalformedFrame(format!(
                "unknown value tag {other}"
            )));
        }
    };
    Ok(value)
}
