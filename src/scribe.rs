//! The Scribe `Log` service.
//!
//! Scribe defines a single call,
//!
//! ```text
//! struct LogEntry { 1: string category, 2: string message }
//! enum ResultCode { OK, TRY_LATER }
//! ResultCode Log(1: list<LogEntry> messages)
//! ```
//!
//! carried by the Thrift binary protocol over a framed transport.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::Config;
use crate::frame::{self, FrameError};
use crate::router::Router;
use crate::thrift::{self, Encoder, MessageType, ProtocolError, Res, TType};
use crate::transform::Transformer;
use crate::Error;

/// Name of the only method Scribe defines.
pub const LOG_METHOD: &[u8] = b"Log";

const MESSAGES_FIELD: i16 = 1;
const CATEGORY_FIELD: i16 = 1;
const MESSAGE_FIELD: i16 = 2;
const SUCCESS_FIELD: i16 = 0;

/// Smallest encoding of a `LogEntry`: two empty strings and a stop byte.
const MIN_ENTRY_SIZE: usize = 2 * (1 + 2 + 4) + 1;

/// One entry of a `Log` call, borrowed from the request payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEntry<'a> {
    pub category: &'a [u8],
    pub message: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResultCode {
    Ok = 0,
    TryLater = 1,
}

impl TryFrom<i32> for ResultCode {
    type Error = ProtocolError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::TryLater),
            _ => Err(ProtocolError::InvalidEnum(value)),
        }
    }
}

/// Decodes the body of a `Log` call.
///
/// Fields other than `messages` are skipped.
///
/// # Errors
///
/// Returns an error if the body is malformed, lacks a required field, or
/// has a known field of the wrong type.
pub fn decode_log_args(body: &[u8]) -> Result<Vec<LogEntry<'_>>, ProtocolError> {
    log_args(body).map(|(_, entries)| entries).map_err(thrift::finish)
}

fn log_args(mut input: &[u8]) -> Res<'_, Vec<LogEntry<'_>>> {
    let mut messages = None;
    loop {
        let (rest, field) = thrift::read_field_header(input)?;
        input = rest;
        match field {
            None => break,
            Some((TType::List, MESSAGES_FIELD)) => {
                let (rest, entries) = log_entries(input)?;
                input = rest;
                messages = Some(entries);
            }
            Some((found, MESSAGES_FIELD)) => {
                return thrift::failure(ProtocolError::FieldType {
                    id: MESSAGES_FIELD,
                    expected: TType::List,
                    found,
                })
            }
            Some((ttype, _)) => input = thrift::skip(input, ttype)?.0,
        }
    }
    match messages {
        Some(entries) => Ok((input, entries)),
        None => thrift::failure(ProtocolError::MissingField(MESSAGES_FIELD)),
    }
}

fn log_entries(input: &[u8]) -> Res<'_, Vec<LogEntry<'_>>> {
    let (mut input, (element, len)) = thrift::read_list_header(input)?;
    if element != TType::Struct {
        return thrift::failure(ProtocolError::ElementType {
            expected: TType::Struct,
            found: element,
        });
    }
    // The count is untrusted; never reserve more than the input can hold.
    let mut entries = Vec::with_capacity(len.min(input.len() / MIN_ENTRY_SIZE));
    for _ in 0..len {
        let (rest, entry) = log_entry(input)?;
        input = rest;
        entries.push(entry);
    }
    Ok((input, entries))
}

fn log_entry(mut input: &[u8]) -> Res<'_, LogEntry<'_>> {
    let mut category = None;
    let mut message = None;
    loop {
        let (rest, field) = thrift::read_field_header(input)?;
        input = rest;
        let Some((ttype, id)) = field else {
            break;
        };
        let slot = match id {
            CATEGORY_FIELD => &mut category,
            MESSAGE_FIELD => &mut message,
            _ => {
                input = thrift::skip(input, ttype)?.0;
                continue;
            }
        };
        if ttype != TType::String {
            return thrift::failure(ProtocolError::FieldType {
                id,
                expected: TType::String,
                found: ttype,
            });
        }
        let (rest, value) = thrift::read_binary(input)?;
        input = rest;
        *slot = Some(value);
    }
    match (category, message) {
        (Some(category), Some(message)) => Ok((input, LogEntry { category, message })),
        (None, _) => thrift::failure(ProtocolError::MissingField(CATEGORY_FIELD)),
        (_, None) => thrift::failure(ProtocolError::MissingField(MESSAGE_FIELD)),
    }
}

/// Encodes a complete `Log` call.
///
/// # Errors
///
/// Returns an error if an entry or the list is too long for the protocol.
pub fn encode_log_call(
    seq_id: i32,
    entries: &[LogEntry<'_>],
    strict: bool,
) -> Result<Vec<u8>, ProtocolError> {
    let mut enc = Encoder::new();
    if strict {
        enc.message_begin(LOG_METHOD, MessageType::Call, seq_id)?;
    } else {
        enc.legacy_message_begin(LOG_METHOD, MessageType::Call, seq_id)?;
    }
    enc.field_begin(TType::List, MESSAGES_FIELD)
        .list_begin(TType::Struct, entries.len())?;
    for entry in entries {
        enc.field_begin(TType::String, CATEGORY_FIELD)
            .write_binary(entry.category)?
            .field_begin(TType::String, MESSAGE_FIELD)
            .write_binary(entry.message)?
            .field_stop();
    }
    enc.field_stop();
    Ok(enc.into_inner())
}

/// Encodes the reply to a `Log` call.
#[must_use]
pub fn encode_log_reply(seq_id: i32, code: ResultCode) -> Vec<u8> {
    let mut enc = Encoder::new();
    // "Log" always fits.
    if enc.message_begin(LOG_METHOD, MessageType::Reply, seq_id).is_ok() {
        enc.field_begin(TType::I32, SUCCESS_FIELD)
            .write_i32(code as i32)
            .field_stop();
    }
    enc.into_inner()
}

/// Decodes the body of a `Log` reply.
///
/// # Errors
///
/// Returns an error if the body is malformed or carries no result.
pub fn decode_log_result(body: &[u8]) -> Result<ResultCode, ProtocolError> {
    log_result(body).map(|(_, code)| code).map_err(thrift::finish)
}

fn log_result(mut input: &[u8]) -> Res<'_, ResultCode> {
    let mut success = None;
    loop {
        let (rest, field) = thrift::read_field_header(input)?;
        input = rest;
        match field {
            None => break,
            Some((TType::I32, SUCCESS_FIELD)) => {
                let (rest, value) = thrift::read_i32(input)?;
                input = rest;
                success = Some(value);
            }
            Some((ttype, _)) => input = thrift::skip(input, ttype)?.0,
        }
    }
    match success.map(ResultCode::try_from) {
        Some(Ok(code)) => Ok((input, code)),
        Some(Err(e)) => thrift::failure(e),
        None => thrift::failure(ProtocolError::MissingField(SUCCESS_FIELD)),
    }
}

/// Counters shared by every connection of an input.
#[derive(Debug, Default)]
pub struct Stats {
    batches: AtomicU64,
    emitted: AtomicU64,
    dropped: AtomicU64,
    try_later: AtomicU64,
    rejected_connections: AtomicU64,
}

/// A point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// `Log` calls received.
    pub batches: u64,
    /// Events accepted by the router.
    pub emitted: u64,
    /// Entries that could not be transformed.
    pub dropped: u64,
    /// `Log` calls answered with `TRY_LATER`.
    pub try_later: u64,
    /// Connections turned away because every worker was busy.
    pub rejected_connections: u64,
}

impl Stats {
    #[must_use]
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            batches: self.batches.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            try_later: self.try_later.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn connection_rejected(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    fn try_later(&self) -> ResultCode {
        self.try_later.fetch_add(1, Ordering::Relaxed);
        ResultCode::TryLater
    }
}

/// Serves `Log` calls by transforming entries and handing them to a
/// [`Router`].
pub struct Service<R> {
    transformer: Transformer,
    router: R,
    stats: Arc<Stats>,
}

impl<R: Router> Service<R> {
    pub fn new(config: &Config, router: R) -> Self {
        Self {
            transformer: Transformer::new(config),
            router,
            stats: Arc::default(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> &Arc<Stats> {
        &self.stats
    }

    /// Handles one request payload and returns the reply payload.
    ///
    /// # Errors
    ///
    /// Returns an error, after which the connection must be closed, if the
    /// envelope is malformed, is not a call, or names a method other than
    /// `Log`.
    pub fn process(&self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let (header, body) = thrift::decode_message(payload)?;
        if header.kind != MessageType::Call {
            return Err(ProtocolError::UnexpectedMessage(header.kind).into());
        }
        let code = self.handle_call(header.name, body)?;
        Ok(encode_log_reply(header.seq_id, code))
    }

    /// Answers a request with `TRY_LATER` without looking at its entries.
    ///
    /// # Errors
    ///
    /// Same as [`Service::process`].
    pub fn reject(&self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        let (header, _) = thrift::decode_message(payload)?;
        if header.kind != MessageType::Call {
            return Err(ProtocolError::UnexpectedMessage(header.kind).into());
        }
        check_method(header.name)?;
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        Ok(encode_log_reply(header.seq_id, self.stats.try_later()))
    }

    /// Dispatches a call by method name.
    ///
    /// A body that cannot be decoded is answered with `TRY_LATER`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownMethod`] for any method other than `Log`.
    pub fn handle_call(&self, method: &[u8], body: &[u8]) -> Result<ResultCode, Error> {
        check_method(method)?;
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        match decode_log_args(body) {
            Ok(entries) => Ok(self.log(&entries)),
            Err(e) => {
                debug!(error = %e, "cannot decode Log arguments");
                Ok(self.stats.try_later())
            }
        }
    }

    /// Transforms and emits `entries` in order.
    ///
    /// Entries that cannot be transformed are dropped. Returns `TRY_LATER`
    /// only if the router refuses an event.
    pub fn log(&self, entries: &[LogEntry<'_>]) -> ResultCode {
        let (mut emitted, mut dropped) = (0_u64, 0_u64);
        let mut code = ResultCode::Ok;
        for entry in entries {
            let event = match self.transformer.transform(entry, self.router.now()) {
                Ok(event) => event,
                Err(e) => {
                    debug!(
                        error = %e,
                        category = %String::from_utf8_lossy(entry.category),
                        "dropping log entry"
                    );
                    dropped += 1;
                    continue;
                }
            };
            if let Err(e) = self.router.emit(event) {
                warn!(error = %e, "event router refused a batch");
                code = self.stats.try_later();
                break;
            }
            emitted += 1;
        }
        self.stats.emitted.fetch_add(emitted, Ordering::Relaxed);
        self.stats.dropped.fetch_add(dropped, Ordering::Relaxed);
        code
    }
}

fn check_method(method: &[u8]) -> Result<(), Error> {
    if method == LOG_METHOD {
        Ok(())
    } else {
        Err(Error::UnknownMethod(
            String::from_utf8_lossy(method).into_owned(),
        ))
    }
}

/// A blocking Scribe client over any byte stream.
pub struct Client<S> {
    stream: S,
    seq_id: i32,
    strict: bool,
    max_frame_size: usize,
}

impl<S: Read + Write> Client<S> {
    /// Creates a client that sends strict message headers.
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            seq_id: 0,
            strict: true,
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Creates a client that sends legacy (non-strict) message headers.
    pub fn legacy(stream: S) -> Self {
        Self {
            strict: false,
            ..Self::new(stream)
        }
    }

    /// Sends one batch and waits for its result.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream fails or closes, or the reply is not
    /// a well-formed `Log` reply to this call.
    pub fn log(&mut self, entries: &[LogEntry<'_>]) -> Result<ResultCode, Error> {
        self.seq_id = self.seq_id.wrapping_add(1);
        let request = encode_log_call(self.seq_id, entries, self.strict)?;
        frame::write_frame(&mut self.stream, &request)?;
        let reply = frame::read_frame(&mut self.stream, self.max_frame_size)?
            .ok_or(FrameError::Truncated)?;
        let (header, body) = thrift::decode_message(&reply)?;
        if header.kind != MessageType::Reply {
            return Err(ProtocolError::UnexpectedMessage(header.kind).into());
        }
        check_method(header.name)?;
        if header.seq_id != self.seq_id {
            return Err(Error::SequenceMismatch {
                expected: self.seq_id,
                found: header.seq_id,
            });
        }
        Ok(decode_log_result(body)?)
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessageFormat;
    use crate::fluentd::Event;
    use crate::router::RouterError;
    use serde_json::json;
    use std::sync::Mutex;

    const TIME: i64 = 1_293_973_455;

    #[derive(Default)]
    struct Collect {
        events: Mutex<Vec<Event>>,
        capacity: Option<usize>,
    }

    impl Router for Collect {
        fn emit(&self, event: Event) -> Result<(), RouterError> {
            let mut events = self.events.lock().unwrap();
            if self.capacity.is_some_and(|c| events.len() >= c) {
                return Err(RouterError::Backpressure);
            }
            events.push(event);
            Ok(())
        }

        fn now(&self) -> i64 {
            TIME
        }
    }

    fn service(f: impl FnOnce(&mut Config)) -> Service<Collect> {
        let mut config = Config::new(0);
        f(&mut config);
        Service::new(&config, Collect::default())
    }

    fn entry<'a>(category: &'a str, message: &'a str) -> LogEntry<'a> {
        LogEntry {
            category: category.as_bytes(),
            message: message.as_bytes(),
        }
    }

    fn tags(service: &Service<Collect>) -> Vec<String> {
        let events = service.router.events.lock().unwrap();
        events.iter().map(|e| e.tag.clone()).collect()
    }

    fn reply_code(reply: &[u8], seq_id: i32) -> ResultCode {
        let (header, body) = thrift::decode_message(reply).unwrap();
        assert_eq!(header.kind, MessageType::Reply);
        assert_eq!(header.name, LOG_METHOD);
        assert_eq!(header.seq_id, seq_id);
        decode_log_result(body).unwrap()
    }

    #[test]
    fn call_round_trip() {
        let entries = [entry("tag1", "aiueo"), entry("", "")];
        for strict in [true, false] {
            let payload = encode_log_call(3, &entries, strict).unwrap();
            let (header, body) = thrift::decode_message(&payload).unwrap();
            assert_eq!(header.name, LOG_METHOD);
            assert_eq!(header.seq_id, 3);
            assert_eq!(decode_log_args(body).unwrap(), entries);
        }
    }

    #[test]
    fn reply_layout() {
        let reply = encode_log_reply(5, ResultCode::TryLater);
        assert_eq!(
            reply,
            [
                0x80, 0x01, 0x00, 0x02, 0, 0, 0, 3, b'L', b'o', b'g', 0, 0, 0, 5, // header
                8, 0, 0, 0, 0, 0, 1, // success: i32 = 1
                0, // stop
            ]
        );
        assert_eq!(reply_code(&reply, 5), ResultCode::TryLater);
    }

    #[test]
    fn batch_is_emitted_in_order() {
        let service = service(|c| c.add_prefix = Some("scribe".into()));
        let payload =
            encode_log_call(1, &[entry("a", "1"), entry("b", "2"), entry("c", "3")], true)
                .unwrap();
        let reply = service.process(&payload).unwrap();
        assert_eq!(reply_code(&reply, 1), ResultCode::Ok);
        assert_eq!(tags(&service), ["scribe.a", "scribe.b", "scribe.c"]);
        let events = service.router.events.lock().unwrap();
        assert!(events.iter().all(|e| e.time == TIME));
        assert_eq!(json!(events[1].record), json!({"message": "2"}));
    }

    #[test]
    fn bad_entries_are_dropped() {
        let service = service(|c| c.message_format = MessageFormat::Json);
        let entries = [
            entry("tag1", r#"{"a":1}"#),
            entry("tag2", "[1]"),
            entry("tag3", "not json"),
            LogEntry {
                category: b"\xff",
                message: b"{}",
            },
            entry("tag5", r#"{"b":2}"#),
        ];
        assert_eq!(service.log(&entries), ResultCode::Ok);
        assert_eq!(tags(&service), ["tag1", "tag5"]);
        let stats = service.stats().snapshot();
        assert_eq!(stats.emitted, 2);
        assert_eq!(stats.dropped, 3);
    }

    #[test]
    fn undecodable_batch_is_try_later() {
        let service = service(|_| {});
        let mut payload = encode_log_call(9, &[entry("tag1", "aiueo")], true).unwrap();
        payload.truncate(payload.len() - 4);
        let reply = service.process(&payload).unwrap();
        assert_eq!(reply_code(&reply, 9), ResultCode::TryLater);
        assert!(tags(&service).is_empty());
        assert_eq!(service.stats().snapshot().try_later, 1);
    }

    #[test]
    fn wrong_field_types_are_try_later() {
        let service = service(|_| {});
        // messages: i32 instead of a list
        let body = [8, 0, 1, 0, 0, 0, 1, 0];
        assert_eq!(
            service.handle_call(LOG_METHOD, &body).unwrap(),
            ResultCode::TryLater
        );
        // an entry whose category is an i32
        let body = [15, 0, 1, 12, 0, 0, 0, 1, 8, 0, 1, 0, 0, 0, 1, 0, 0];
        assert_eq!(
            service.handle_call(LOG_METHOD, &body).unwrap(),
            ResultCode::TryLater
        );
        // no messages field at all
        assert_eq!(
            service.handle_call(LOG_METHOD, &[0]).unwrap(),
            ResultCode::TryLater
        );
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let mut enc = Encoder::new();
        enc.field_begin(TType::I32, 7).write_i32(1);
        enc.field_begin(TType::List, MESSAGES_FIELD)
            .list_begin(TType::Struct, 1)
            .unwrap();
        enc.field_begin(TType::String, 3).write_binary(b"extra").unwrap();
        enc.field_begin(TType::String, MESSAGE_FIELD)
            .write_binary(b"m")
            .unwrap();
        enc.field_begin(TType::String, CATEGORY_FIELD)
            .write_binary(b"c")
            .unwrap();
        enc.field_stop();
        enc.field_stop();
        let body = enc.into_inner();
        assert_eq!(decode_log_args(&body).unwrap(), [entry("c", "m")]);
    }

    #[test]
    fn huge_list_count_does_not_allocate() {
        // list<struct> claiming i32::MAX entries followed by nothing
        let body = [15, 0, 1, 12, 0x7f, 0xff, 0xff, 0xff];
        assert_eq!(decode_log_args(&body), Err(ProtocolError::Truncated));
    }

    #[test]
    fn unknown_method_is_fatal() {
        let service = service(|_| {});
        let mut enc = Encoder::new();
        enc.message_begin(b"getStatus", MessageType::Call, 1)
            .unwrap()
            .field_stop();
        assert!(matches!(
            service.process(&enc.into_inner()),
            Err(Error::UnknownMethod(name)) if name == "getStatus"
        ));
    }

    #[test]
    fn reply_message_is_fatal() {
        let service = service(|_| {});
        let reply = encode_log_reply(1, ResultCode::Ok);
        assert!(matches!(
            service.process(&reply),
            Err(Error::Protocol(ProtocolError::UnexpectedMessage(
                MessageType::Reply
            )))
        ));
    }

    #[test]
    fn router_refusal_is_try_later() {
        let mut config = Config::new(0);
        config.remove_newline = true;
        let service = Service::new(
            &config,
            Collect {
                capacity: Some(1),
                ..Collect::default()
            },
        );
        let code = service.log(&[entry("a", "1\n"), entry("b", "2\n"), entry("c", "3\n")]);
        assert_eq!(code, ResultCode::TryLater);
        assert_eq!(tags(&service), ["a"]);
        let stats = service.stats().snapshot();
        assert_eq!(stats.emitted, 1);
        assert_eq!(stats.try_later, 1);
    }

    #[test]
    fn reject_answers_try_later() {
        let service = service(|_| {});
        let payload = encode_log_call(4, &[entry("a", "1")], false).unwrap();
        let reply = service.reject(&payload).unwrap();
        assert_eq!(reply_code(&reply, 4), ResultCode::TryLater);
        assert!(tags(&service).is_empty());
    }

    #[test]
    fn client_against_service() {
        // The client writes its request into a buffer that holds no reply.
        let service = service(|_| {});
        let mut request = Vec::new();
        {
            let mut client = Client::new(std::io::Cursor::new(&mut request));
            assert!(matches!(
                client.log(&[entry("tag1", "aiueo")]),
                Err(Error::Transport(FrameError::Truncated))
            ));
        }
        let payload = frame::read_frame(&mut request.as_slice(), 1024)
            .unwrap()
            .unwrap();
        let reply = service.process(&payload).unwrap();
        assert_eq!(reply_code(&reply, 1), ResultCode::Ok);
        assert_eq!(tags(&service), ["tag1"]);
    }
}
