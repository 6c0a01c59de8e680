//! Turning Scribe log entries into events.

use std::str::Utf8Error;

use serde_json::Value;
use thiserror::Error;

use crate::config::{Config, MessageFormat};
use crate::fluentd::{Event, Record};
use crate::scribe::LogEntry;

/// Key of the single field in a text record.
pub const MESSAGE_KEY: &str = "message";

#[derive(Debug, Error)]
pub enum TransformError {
    #[error("category is not valid UTF-8: {0}")]
    InvalidCategory(Utf8Error),
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] MessageError),
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("not JSON: {0}")]
    Json(serde_json::Error),
    #[error("a JSON {0} is not an object")]
    NotAnObject(&'static str),
}

/// Maps entries to events according to a [`Config`].
#[derive(Debug, Clone)]
pub struct Transformer {
    prefix: Option<String>,
    remove_newline: bool,
    format: MessageFormat,
}

impl Transformer {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            prefix: config.add_prefix.clone(),
            remove_newline: config.remove_newline,
            format: config.message_format,
        }
    }

    /// Builds the event for `entry`, stamped with `time`.
    ///
    /// # Errors
    ///
    /// Returns an error if the category is not text, or the message does not
    /// match the configured format.
    pub fn transform(&self, entry: &LogEntry<'_>, time: i64) -> Result<Event, TransformError> {
        Ok(Event {
            tag: self.tag(entry.category)?,
            time,
            record: self.record(entry.message)?,
        })
    }

    /// Derives the tag from a category, adding the prefix if one is set.
    ///
    /// # Errors
    ///
    /// Returns [`TransformError::InvalidCategory`] if `category` is not
    /// UTF-8.
    pub fn tag(&self, category: &[u8]) -> Result<String, TransformError> {
        let category = std::str::from_utf8(category).map_err(TransformError::InvalidCategory)?;
        Ok(match &self.prefix {
            Some(prefix) => format!("{prefix}.{category}"),
            None => category.to_string(),
        })
    }

    /// Parses a message into a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the format is JSON and the message is not a JSON
    /// object.
    pub fn record(&self, message: &[u8]) -> Result<Record, TransformError> {
        match self.format {
            MessageFormat::Text => {
                let body = if self.remove_newline {
                    message.strip_suffix(b"\n").unwrap_or(message)
                } else {
                    message
                };
                let mut record = Record::new();
                record.insert(
                    MESSAGE_KEY.to_string(),
                    Value::String(String::from_utf8_lossy(body).into_owned()),
                );
                Ok(record)
            }
            MessageFormat::Json => {
                let value = serde_json::from_slice::<Value>(message).map_err(MessageError::Json)?;
                let kind = match value {
                    Value::Object(record) => return Ok(record),
                    Value::Array(_) => "array",
                    Value::String(_) => "string",
                    Value::Number(_) => "number",
                    Value::Bool(_) => "boolean",
                    Value::Null => "null",
                };
                Err(MessageError::NotAnObject(kind).into())
            }
            MessageFormat::UrlParam => Ok(url::form_urlencoded::parse(message)
                .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
                .collect()),
        }
    }
}
