//! Settings of a Scribe input, fixed at startup.

use std::time::Duration;

use serde::Deserialize;

use crate::frame::DEFAULT_MAX_FRAME_SIZE;
use crate::Error;

const DEFAULT_BIND: &str = "0.0.0.0";
const DEFAULT_MAX_CONNECTIONS: usize = 64;
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;

/// How the message of a log entry is turned into a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageFormat {
    /// `{"message": <message>}`
    #[default]
    Text,
    /// The message is a JSON object.
    Json,
    /// The message is a URL-encoded query string.
    UrlParam,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub add_prefix: Option<String>,
    #[serde(default)]
    pub remove_newline: bool,
    #[serde(default, alias = "msg_format")]
    pub message_format: MessageFormat,
    #[serde(default = "default_max_frame_size", alias = "body_size_limit")]
    pub max_frame_size: usize,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}

fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_shutdown_timeout_secs() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_SECS
}

impl Config {
    /// Creates a configuration listening on `port` with every other option
    /// at its default.
    #[must_use]
    pub fn new(port: u16) -> Self {
        Self {
            port,
            bind: default_bind(),
            add_prefix: None,
            remove_newline: false,
            message_format: MessageFormat::default(),
            max_frame_size: default_max_frame_size(),
            max_connections: default_max_connections(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }

    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the document is malformed, names an
    /// unknown option, or sets an option to an unusable value.
    pub fn from_toml(s: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(s).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first unusable option.
    pub fn validate(&self) -> Result<(), Error> {
        if self.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".into()));
        }
        if self.max_frame_size == 0 {
            return Err(Error::Config("max_frame_size must be at least 1".into()));
        }
        if self.add_prefix.as_deref() == Some("") {
            return Err(Error::Config("add_prefix must not be empty".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}
