//! The downstream side of the input: where transformed events go.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{SendTimeoutError, TrySendError};
use thiserror::Error;

use crate::fluentd::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RouterError {
    /// The router cannot take more events right now.
    #[error("event router is full")]
    Backpressure,
    #[error("event router is closed")]
    Closed,
}

/// A sink for events, shared by every connection.
pub trait Router: Send + Sync {
    /// Hands one event over for delivery.
    ///
    /// # Errors
    ///
    /// Returns an error if the event was not admitted.
    fn emit(&self, event: Event) -> Result<(), RouterError>;

    /// The time stamped on events, in seconds since the Unix epoch.
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Admits an event only if the channel has room for it right away.
impl Router for crossbeam_channel::Sender<Event> {
    fn emit(&self, event: Event) -> Result<(), RouterError> {
        self.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => RouterError::Backpressure,
            TrySendError::Disconnected(_) => RouterError::Closed,
        })
    }
}

impl<R: Router + ?Sized> Router for Arc<R> {
    fn emit(&self, event: Event) -> Result<(), RouterError> {
        (**self).emit(event)
    }

    fn now(&self) -> i64 {
        (**self).now()
    }
}

/// A channel-backed router that waits a bounded time for room.
#[derive(Debug, Clone)]
pub struct ChannelRouter {
    data_channel: crossbeam_channel::Sender<Event>,
    admission_timeout: Duration,
    fixed_time: Option<i64>,
}

impl ChannelRouter {
    #[must_use]
    pub fn new(
        data_channel: crossbeam_channel::Sender<Event>,
        admission_timeout: Duration,
    ) -> Self {
        Self {
            data_channel,
            admission_timeout,
            fixed_time: None,
        }
    }

    /// Stamps every event with `time` instead of reading the clock.
    #[must_use]
    pub fn with_fixed_time(mut self, time: i64) -> Self {
        self.fixed_time = Some(time);
        self
    }
}

impl Router for ChannelRouter {
    fn emit(&self, event: Event) -> Result<(), RouterError> {
        self.data_channel
            .send_timeout(event, self.admission_timeout)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(_) => RouterError::Backpressure,
                SendTimeoutError::Disconnected(_) => RouterError::Closed,
            })
    }

    fn now(&self) -> i64 {
        self.fixed_time
            .unwrap_or_else(|| chrono::Utc::now().timestamp())
    }
}
