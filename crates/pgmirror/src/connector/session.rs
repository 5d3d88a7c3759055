//! Driver seam between the connector and a concrete database client

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::ConnectionError;
use pgmirror_api::{QueryError, QueryOutcome};

/// Channel the mirror listens on for row change payloads
pub const DEFAULT_CHANNEL: &str = "data_change_event";

pub const DEFAULT_PORT: u16 = 5432;

/// Everything a driver needs to open a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub channel: String,
}

impl ConnectionParams {
    pub fn new(host: impl Into<String>, port: u16, database: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            ..Self::default()
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }
}

impl Default for ConnectionParams {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_PORT,
            database: String::new(),
            username: String::new(),
            password: String::new(),
            channel: DEFAULT_CHANNEL.to_string(),
        }
    }
}

/// Payload of a notification as the driver hands it over
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationPayload {
    /// Already decoded by the client library, e.g. `tokio-postgres`, which
    /// always runs with `client_encoding = UTF8`
    Text(String),
    /// Bytes in the server's encoding, decoded by the connector's codec
    /// (UTF-8 without one)
    Bytes(Vec<u8>),
}

/// Notification as received from the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawNotification {
    /// Backend process that raised it
    pub process_id: i32,
    pub channel: String,
    pub payload: NotificationPayload,
}

/// One open database session.
///
/// Owned exclusively by the connector's worker task, so implementations
/// never see two concurrent calls.
#[async_trait]
pub trait SqlSession: Send {
    /// Run one statement. Failures are reported inside the outcome.
    async fn execute(&mut self, query: &str) -> QueryOutcome;

    /// Subscribe the session to a notification channel
    async fn listen(&mut self, channel: &str) -> Result<(), QueryError>;

    /// Hand over the stream of inbound notifications. Returns `None` once
    /// the stream was taken.
    fn take_notifications(&mut self) -> Option<mpsc::UnboundedReceiver<RawNotification>>;

    async fn close(&mut self);
}

/// Factory for sessions
#[async_trait]
pub trait SqlDriver: Send + Sync {
    fn name(&self) -> &str;

    async fn open(&self, params: &ConnectionParams) -> Result<Box<dyn SqlSession>, ConnectionError>;
}
