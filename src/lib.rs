//! A Scribe input for event-processing applications.
//!
//! This crate accepts batches of log entries from [Scribe] clients over
//! Thrift's framed binary protocol, turns each entry into a Fluentd-style
//! event, and hands the events to a [`Router`](router::Router), typically
//! the sending half of a `crossbeam_channel`.
//!
//! [Scribe]: https://github.com/facebookarchive/scribe

pub mod config;
pub mod fluentd;
pub mod frame;
pub mod router;
pub mod scribe;
pub mod server;
pub mod thrift;
pub mod transform;

use std::io;

use thiserror::Error;

pub use config::{Config, MessageFormat};
pub use fluentd::{Event, Record};

/// A data source that runs until it is exhausted or shut down.
pub trait Input {
    /// # Errors
    ///
    /// Returns an error if the source cannot be read at all.
    fn run(self) -> Result<(), Error>;
}

/// The error type for Scribe input operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot listen on {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("transport error: {0}")]
    Transport(#[from] frame::FrameError),
    #[error("protocol error: {0}")]
    Protocol(#[from] thrift::ProtocolError),
    /// A call named a method other than `Log`.
    #[error("unknown method {0:?}")]
    UnknownMethod(String),
    /// A reply did not answer the call that was sent.
    #[error("reply to call {found} while waiting for call {expected}")]
    SequenceMismatch { expected: i32, found: i32 },
    #[error(transparent)]
    Io(#[from] io::Error),
}
