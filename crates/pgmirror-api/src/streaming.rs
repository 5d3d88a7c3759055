use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::Row;

/// Opaque identifier linking a submitted command to its outcome.
///
/// Generated fresh for every submission, so ids are never reused while a
/// command is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

/// Why a command did not produce a normal result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum QueryError {
    #[error("query failed: {0}")]
    Execution(String),

    #[error("query cancelled before execution")]
    Cancelled,

    #[error("connection is not open")]
    NotConnected,
}

/// Result of one executed command. Immutable once produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryOutcome {
    pub rows: Vec<Row>,
    /// True when the statement produced a result set (SELECT and friends)
    pub is_query: bool,
    pub error: Option<QueryError>,
}

impl QueryOutcome {
    /// Outcome of a statement that returned a result set
    pub fn rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            is_query: true,
            error: None,
        }
    }

    /// Outcome of a statement without a result set (INSERT/UPDATE/DELETE, DDL)
    pub fn command() -> Self {
        Self::default()
    }

    pub fn failed(error: QueryError) -> Self {
        Self {
            rows: Vec::new(),
            is_query: false,
            error: Some(error),
        }
    }

    pub fn cancelled() -> Self {
        Self::failed(QueryError::Cancelled)
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// A finished command, as delivered to completion listeners
#[derive(Debug, Clone)]
pub struct Completion {
    pub id: CorrelationId,
    pub outcome: Arc<QueryOutcome>,
}

/// Connection state machine of a single connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Disconnected,
    Idle,
    Busy,
}

/// Events raised by a connector
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    StateChanged(ConnectionState),
    Connected,
    Disconnected,
    QueryFinished(Completion),
    QueryError { id: CorrelationId, error: QueryError },
}

/// Kind of row-level change announced by the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

impl ChangeAction {
    /// Parse the `action` tag of a notification payload
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "INSERT" => Some(Self::Insert),
            "UPDATE" => Some(Self::Update),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// A single parsed change notification.
///
/// Consumed by the table manager whose schema and table match, or dropped.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeNotification {
    /// Backend process that raised the notification
    pub source: i32,
    pub row_id: String,
    pub table: String,
    pub schema: String,
    pub action: ChangeAction,
    pub data: Row,
    pub old_data: Row,
}

impl ChangeNotification {
    pub fn matches(&self, schema: &str, table: &str) -> bool {
        self.schema == schema && self.table == table
    }
}

/// Load state of a table mirror
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum LoadState {
    #[default]
    NotLoaded,
    Loading,
    Loaded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum WarningKind {
    /// UPDATE for a row id that is not in the mirror
    UpdateForUnknownRow,
    /// DELETE for a row id that is not in the mirror
    DeleteForUnknownRow,
    /// A reloaded or notified row could not be turned into an item
    UnparseableRow(String),
}

/// Non-fatal reconciliation problem recorded by a table manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationWarning {
    pub kind: WarningKind,
    pub row_id: String,
}

impl fmt::Display for ReconciliationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            WarningKind::UpdateForUnknownRow => {
                write!(f, "UPDATE for non-existing item {}", self.row_id)
            }
            WarningKind::DeleteForUnknownRow => {
                write!(f, "DELETE for non-existing item {}", self.row_id)
            }
            WarningKind::UnparseableRow(reason) => {
                write!(f, "row {} could not be parsed: {}", self.row_id, reason)
            }
        }
    }
}

/// Events raised by a table manager
#[derive(Debug, Clone)]
pub enum MirrorEvent {
    /// Mirror content changed, no specific row
    Updated,
    /// A specific row changed or was removed
    UpdatedItem(String),
    LoadStateChanged(LoadState),
    QueryError { id: CorrelationId, error: QueryError },
    Warning(ReconciliationWarning),
}

/// Fan-out of events to any number of listeners.
///
/// Every listener gets its own unbounded channel, so each one sees every
/// event in emission order. Listeners that dropped their receiver are
/// pruned on the next emit.
pub struct Subscribers<E> {
    senders: Arc<Mutex<Vec<mpsc::UnboundedSender<E>>>>,
}

impl<E> Clone for Subscribers<E> {
    fn clone(&self) -> Self {
        Self {
            senders: Arc::clone(&self.senders),
        }
    }
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self {
            senders: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<E: Clone> Subscribers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    /// Deliver an event to every live listener, returns how many got it
    pub fn emit(&self, event: E) -> usize {
        let mut senders = self.lock();
        senders.retain(|tx| tx.send(event.clone()).is_ok());
        senders.len()
    }

    pub fn len(&self) -> usize {
        let mut senders = self.lock();
        senders.retain(|tx| !tx.is_closed());
        senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<E>>> {
        // A poisoned list of senders is still a valid list of senders
        self.senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
