//! Change notification parsing and routing
//!
//! Payloads arrive on the `data_change_event` channel as JSON objects:
//!
//! ```json
//! {"action": "UPDATE", "schema": "public", "table": "users",
//!  "data": {"_uuid": "...", ...}, "data_old": {"_uuid": "...", ...}}
//! ```
//!
//! The router turns each payload into a `ChangeNotification` and delivers it
//! to the listeners registered for its (schema, table) pair only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::TextCodec;
use crate::connector::{DatabaseConnector, NotificationPayload, RawNotification};
use crate::error::NotificationParseError;
use pgmirror_api::{
    normalize_id, ChangeAction, ChangeNotification, Row, Subscribers, Value, IDENTITY_FIELD,
};

struct Route {
    identity_field: String,
    subscribers: Subscribers<ChangeNotification>,
}

pub struct NotificationRouter {
    identity_field: String,
    routes: Mutex<HashMap<(String, String), Route>>,
    all: Subscribers<ChangeNotification>,
}

impl Default for NotificationRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn row_of(value: Option<&serde_json::Value>) -> Row {
    match value.and_then(serde_json::Value::as_object) {
        Some(obj) => Row::from_json_object(obj),
        None => Row::new(),
    }
}

impl NotificationRouter {
    pub fn new() -> Self {
        Self {
            identity_field: IDENTITY_FIELD.to_string(),
            routes: Mutex::new(HashMap::new()),
            all: Subscribers::new(),
        }
    }

    /// Identity column used for tables registered without their own
    pub fn with_identity_field(mut self, field: impl Into<String>) -> Self {
        self.identity_field = field.into();
        self
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, String), Route>> {
        self.routes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn identity_for(&self, schema: &str, table: &str) -> String {
        self.lock()
            .get(&(schema.to_string(), table.to_string()))
            .map(|route| route.identity_field.clone())
            .unwrap_or_else(|| self.identity_field.clone())
    }

    /// Parse a UTF-8 payload
    pub fn parse(&self, payload: &[u8]) -> Result<ChangeNotification, NotificationParseError> {
        let json: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| NotificationParseError::InvalidJson(e.to_string()))?;
        self.parse_json(&json)
    }

    /// Parse a notification. Byte payloads are decoded through `codec`
    /// first when one is given; text payloads are used as they are.
    pub fn decode(
        &self,
        raw: &RawNotification,
        codec: Option<&dyn TextCodec>,
    ) -> Result<ChangeNotification, NotificationParseError> {
        let mut change = match (&raw.payload, codec) {
            (NotificationPayload::Text(text), _) => self.parse(text.as_bytes())?,
            (NotificationPayload::Bytes(bytes), Some(codec)) => {
                self.parse(codec.decode(bytes).as_bytes())?
            }
            (NotificationPayload::Bytes(bytes), None) => self.parse(bytes)?,
        };
        change.source = raw.process_id;
        Ok(change)
    }

    fn parse_json(
        &self,
        json: &serde_json::Value,
    ) -> Result<ChangeNotification, NotificationParseError> {
        let obj = json.as_object().ok_or(NotificationParseError::NotAnObject)?;
        let text = |key: &'static str| {
            obj.get(key)
                .and_then(serde_json::Value::as_str)
                .filter(|s| !s.is_empty())
                .ok_or(NotificationParseError::MissingField(key))
        };

        let tag = text("action")?;
        let action = ChangeAction::from_tag(tag)
            .ok_or_else(|| NotificationParseError::UnknownAction(tag.to_string()))?;
        let schema = text("schema")?;
        let table = text("table")?;

        let data = row_of(obj.get("data"));
        let old_data = row_of(obj.get("data_old"));

        // DELETE payloads may only carry the old row
        let identity_field = self.identity_for(schema, table);
        let row_id = [&data, &old_data]
            .iter()
            .find_map(|row| row.get(&identity_field).and_then(Value::to_text))
            .map(|id| normalize_id(&id))
            .filter(|id| !id.is_empty())
            .ok_or_else(|| NotificationParseError::MissingRowId {
                schema: schema.to_string(),
                table: table.to_string(),
                field: identity_field.clone(),
            })?;

        Ok(ChangeNotification {
            source: 0,
            row_id,
            table: table.to_string(),
            schema: schema.to_string(),
            action,
            data,
            old_data,
        })
    }

    /// Receive the changes of one table, identified by the default identity
    /// column
    pub fn register(
        &self,
        schema: impl Into<String>,
        table: impl Into<String>,
    ) -> mpsc::UnboundedReceiver<ChangeNotification> {
        let field = self.identity_field.clone();
        self.register_with_identity(schema, table, field)
    }

    /// Receive the changes of one table whose rows are identified by
    /// `identity_field`. The last registration decides the field for the pair.
    pub fn register_with_identity(
        &self,
        schema: impl Into<String>,
        table: impl Into<String>,
        identity_field: impl Into<String>,
    ) -> mpsc::UnboundedReceiver<ChangeNotification> {
        let key = (schema.into(), table.into());
        let mut routes = self.lock();
        let route = routes.entry(key).or_insert_with(|| Route {
            identity_field: String::new(),
            subscribers: Subscribers::new(),
        });
        route.identity_field = identity_field.into();
        route.subscribers.subscribe()
    }

    /// Receive every parsed change regardless of table
    pub fn subscribe_all(&self) -> mpsc::UnboundedReceiver<ChangeNotification> {
        self.all.subscribe()
    }

    /// Deliver a change to the listeners of its table, returns how many got it
    pub fn route(&self, change: ChangeNotification) -> usize {
        self.all.emit(change.clone());

        let subscribers = self
            .lock()
            .get(&(change.schema.clone(), change.table.clone()))
            .map(|route| route.subscribers.clone());

        let delivered = match subscribers {
            Some(subscribers) => subscribers.emit(change.clone()),
            None => 0,
        };
        if delivered == 0 {
            tracing::trace!(
                "[NotificationRouter] no listener for {}.{}, dropping {} {}",
                change.schema,
                change.table,
                change.action,
                change.row_id
            );
        }
        delivered
    }

    /// Parse and route one inbound notification. Malformed payloads are
    /// logged and dropped.
    pub fn dispatch(&self, raw: &RawNotification, codec: Option<&dyn TextCodec>) -> usize {
        match self.decode(raw, codec) {
            Ok(change) => {
                tracing::debug!(
                    "[NotificationRouter] {} {}.{} {}",
                    change.action,
                    change.schema,
                    change.table,
                    change.row_id
                );
                self.route(change)
            }
            Err(e) => {
                tracing::warn!(
                    "[NotificationRouter] dropping notification from pid {}: {}",
                    raw.process_id,
                    e
                );
                0
            }
        }
    }

    /// Spawn a task routing every notification the connector receives.
    ///
    /// The connector's codec is read once, when listening starts.
    pub fn listen(self: &Arc<Self>, connector: &DatabaseConnector) -> JoinHandle<()> {
        let mut rx = connector.subscribe_notifications();
        let codec = connector.codec();
        let router = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(raw) = rx.recv().await {
                router.dispatch(&raw, codec.as_deref());
            }
            tracing::debug!("[NotificationRouter] notification stream ended");
        })
    }
}
