//! A partial implementation of the [Thrift Binary Protocol].
//!
//! Only the pieces a Scribe endpoint needs are here: message headers,
//! field and list headers, 16/32-bit integers, binary strings, and skipping
//! of values whose field id is not recognized.
//!
//! [Thrift Binary Protocol]:
//! https://github.com/apache/thrift/blob/master/doc/specs/thrift-binary-protocol.md

use nom::bytes::complete::take;
use nom::error::{ErrorKind, ParseError};
use nom::number::complete::{be_i16, be_i32, be_u8};
use nom::{IResult, Parser};
use thiserror::Error;

const VERSION_1: u32 = 0x8001_0000;
const VERSION_MASK: u32 = 0xffff_0000;
const MESSAGE_TYPE_MASK: u32 = 0x0000_00ff;

/// Maximum nesting of containers and structs accepted while skipping.
pub const MAX_DEPTH: usize = 64;

/// Type tags of the binary protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TType {
    Stop = 0,
    Bool = 2,
    Byte = 3,
    Double = 4,
    I16 = 6,
    I32 = 8,
    I64 = 10,
    String = 11,
    Struct = 12,
    Map = 13,
    Set = 14,
    List = 15,
}

impl TryFrom<u8> for TType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let ttype = match value {
            0 => Self::Stop,
            2 => Self::Bool,
            3 => Self::Byte,
            4 => Self::Double,
            6 => Self::I16,
            8 => Self::I32,
            10 => Self::I64,
            11 => Self::String,
            12 => Self::Struct,
            13 => Self::Map,
            14 => Self::Set,
            15 => Self::List,
            _ => return Err(ProtocolError::UnknownType(value)),
        };
        Ok(ttype)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Call = 1,
    Reply = 2,
    Exception = 3,
    Oneway = 4,
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Call),
            2 => Ok(Self::Reply),
            3 => Ok(Self::Exception),
            4 => Ok(Self::Oneway),
            _ => Err(ProtocolError::UnknownMessageType(value)),
        }
    }
}

/// The envelope that precedes every call and reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader<'a> {
    pub name: &'a [u8],
    pub kind: MessageType,
    pub seq_id: i32,
}

/// The error type for malformed binary protocol data.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message is truncated")]
    Truncated,
    #[error("unsupported protocol version {0:#010x}")]
    BadVersion(u32),
    #[error("unknown type tag {0}")]
    UnknownType(u8),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("unexpected {0:?} message")]
    UnexpectedMessage(MessageType),
    #[error("negative length {0}")]
    NegativeLength(i32),
    #[error("length {0} does not fit in the protocol")]
    TooLong(usize),
    #[error("field {id} has type {found:?}, expected {expected:?}")]
    FieldType {
        id: i16,
        expected: TType,
        found: TType,
    },
    #[error("list holds {found:?} elements, expected {expected:?}")]
    ElementType { expected: TType, found: TType },
    #[error("required field {0} is missing")]
    MissingField(i16),
    #[error("invalid enum value {0}")]
    InvalidEnum(i32),
    #[error("values nested deeper than {} levels", MAX_DEPTH)]
    TooDeep,
}

impl<'a> ParseError<&'a [u8]> for ProtocolError {
    fn from_error_kind(_input: &'a [u8], _kind: ErrorKind) -> Self {
        // Complete parsers only fail on missing input.
        Self::Truncated
    }

    fn append(_input: &'a [u8], _kind: ErrorKind, other: Self) -> Self {
        other
    }
}

pub type Res<'a, T> = IResult<&'a [u8], T, ProtocolError>;

/// Aborts parsing with `e`.
pub fn failure<'a, T>(e: ProtocolError) -> Res<'a, T> {
    Err(nom::Err::Failure(e))
}

/// Converts the error of a top-level parse.
#[must_use]
pub fn finish(e: nom::Err<ProtocolError>) -> ProtocolError {
    match e {
        nom::Err::Error(e) | nom::Err::Failure(e) => e,
        nom::Err::Incomplete(_) => ProtocolError::Truncated,
    }
}

pub fn read_byte(input: &[u8]) -> Res<'_, u8> {
    be_u8(input)
}

pub fn read_i16(input: &[u8]) -> Res<'_, i16> {
    be_i16(input)
}

pub fn read_i32(input: &[u8]) -> Res<'_, i32> {
    be_i32(input)
}

fn read_bytes(input: &[u8], len: usize) -> Res<'_, &[u8]> {
    take(len).parse(input)
}

fn read_length(input: &[u8]) -> Res<'_, usize> {
    let (input, len) = read_i32(input)?;
    match usize::try_from(len) {
        Ok(len) => Ok((input, len)),
        Err(_) => failure(ProtocolError::NegativeLength(len)),
    }
}

/// Reads a length-prefixed byte string. No encoding is assumed.
pub fn read_binary(input: &[u8]) -> Res<'_, &[u8]> {
    let (input, len) = read_length(input)?;
    read_bytes(input, len)
}

pub fn read_type(input: &[u8]) -> Res<'_, TType> {
    let (input, tag) = read_byte(input)?;
    match TType::try_from(tag) {
        Ok(ttype) => Ok((input, ttype)),
        Err(e) => failure(e),
    }
}

/// Reads a field header, or `None` at the stop marker ending a struct.
pub fn read_field_header(input: &[u8]) -> Res<'_, Option<(TType, i16)>> {
    let (input, ttype) = read_type(input)?;
    if ttype == TType::Stop {
        return Ok((input, None));
    }
    let (input, id) = read_i16(input)?;
    Ok((input, Some((ttype, id))))
}

/// Reads the element type and element count of a list or set.
pub fn read_list_header(input: &[u8]) -> Res<'_, (TType, usize)> {
    let (input, ttype) = read_type(input)?;
    let (input, len) = read_length(input)?;
    Ok((input, (ttype, len)))
}

/// Reads a message header in either the strict or the legacy layout.
///
/// Strict headers start with the negative version word; legacy ones start
/// with the length of the method name.
pub fn read_message_header(input: &[u8]) -> Res<'_, MessageHeader<'_>> {
    let (input, word) = read_i32(input)?;
    let (input, name, kind) = if word < 0 {
        let version = word as u32;
        if version & VERSION_MASK != VERSION_1 {
            return failure(ProtocolError::BadVersion(version));
        }
        let kind = message_type((version & MESSAGE_TYPE_MASK) as u8)?;
        let (input, name) = read_binary(input)?;
        (input, name, kind)
    } else {
        let (input, name) = read_bytes(input, word as usize)?;
        let (input, kind) = read_byte(input)?;
        (input, name, message_type(kind)?)
    };
    let (input, seq_id) = read_i32(input)?;
    Ok((input, MessageHeader { name, kind, seq_id }))
}

fn message_type(value: u8) -> Result<MessageType, nom::Err<ProtocolError>> {
    MessageType::try_from(value).map_err(nom::Err::Failure)
}

/// Splits a frame payload into its message header and body.
///
/// # Errors
///
/// Returns an error if the header is malformed or truncated.
pub fn decode_message(payload: &[u8]) -> Result<(MessageHeader<'_>, &[u8]), ProtocolError> {
    read_message_header(payload)
        .map(|(body, header)| (header, body))
        .map_err(finish)
}

/// Consumes one value of type `ttype` without interpreting it.
pub fn skip(input: &[u8], ttype: TType) -> Res<'_, ()> {
    skip_nested(input, ttype, 0)
}

fn skip_nested(input: &[u8], ttype: TType, depth: usize) -> Res<'_, ()> {
    if depth > MAX_DEPTH {
        return failure(ProtocolError::TooDeep);
    }
    match ttype {
        TType::Stop => failure(ProtocolError::UnknownType(TType::Stop as u8)),
        TType::Bool | TType::Byte => discard(read_bytes(input, 1)),
        TType::I16 => discard(read_bytes(input, 2)),
        TType::I32 => discard(read_bytes(input, 4)),
        TType::Double | TType::I64 => discard(read_bytes(input, 8)),
        TType::String => discard(read_binary(input)),
        TType::Struct => {
            let mut input = input;
            loop {
                let (rest, field) = read_field_header(input)?;
                input = rest;
                match field {
                    Some((ttype, _)) => input = skip_nested(input, ttype, depth + 1)?.0,
                    None => break,
                }
            }
            Ok((input, ()))
        }
        TType::Map => {
            let (input, key) = read_type(input)?;
            let (input, value) = read_type(input)?;
            let (mut input, len) = read_length(input)?;
            for _ in 0..len {
                input = skip_nested(input, key, depth + 1)?.0;
                input = skip_nested(input, value, depth + 1)?.0;
            }
            Ok((input, ()))
        }
        TType::Set | TType::List => {
            let (mut input, (element, len)) = read_list_header(input)?;
            for _ in 0..len {
                input = skip_nested(input, element, depth + 1)?.0;
            }
            Ok((input, ()))
        }
    }
}

fn discard<'a, T>(res: Res<'a, T>) -> Res<'a, ()> {
    res.map(|(input, _)| (input, ()))
}

/// Builds binary protocol messages into an owned buffer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a strict (versioned) message header.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is longer than the protocol allows.
    pub fn message_begin(
        &mut self,
        name: &[u8],
        kind: MessageType,
        seq_id: i32,
    ) -> Result<&mut Self, ProtocolError> {
        let version = VERSION_1 | kind as u32;
        self.buf.extend_from_slice(&version.to_be_bytes());
        self.write_binary(name)?;
        Ok(self.write_i32(seq_id))
    }

    /// Writes a legacy message header, as sent by clients that disable
    /// strict writes.
    ///
    /// # Errors
    ///
    /// Returns an error if `name` is longer than the protocol allows.
    pub fn legacy_message_begin(
        &mut self,
        name: &[u8],
        kind: MessageType,
        seq_id: i32,
    ) -> Result<&mut Self, ProtocolError> {
        self.write_binary(name)?;
        self.buf.push(kind as u8);
        Ok(self.write_i32(seq_id))
    }

    pub fn field_begin(&mut self, ttype: TType, id: i16) -> &mut Self {
        self.buf.push(ttype as u8);
        self.buf.extend_from_slice(&id.to_be_bytes());
        self
    }

    pub fn field_stop(&mut self) -> &mut Self {
        self.buf.push(TType::Stop as u8);
        self
    }

    /// # Errors
    ///
    /// Returns an error if `len` does not fit in a 32-bit count.
    pub fn list_begin(&mut self, element: TType, len: usize) -> Result<&mut Self, ProtocolError> {
        let len = i32::try_from(len).map_err(|_| ProtocolError::TooLong(len))?;
        self.buf.push(element as u8);
        Ok(self.write_i32(len))
    }

    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    /// # Errors
    ///
    /// Returns an error if `bytes` is longer than a 32-bit length allows.
    pub fn write_binary(&mut self, bytes: &[u8]) -> Result<&mut Self, ProtocolError> {
        let len = i32::try_from(bytes.len()).map_err(|_| ProtocolError::TooLong(bytes.len()))?;
        self.write_i32(len);
        self.buf.extend_from_slice(bytes);
        Ok(self)
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}
