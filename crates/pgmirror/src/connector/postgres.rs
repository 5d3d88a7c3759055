//! PostgreSQL driver on top of `tokio-postgres`
//!
//! Statements go through the simple query protocol, so every result column
//! arrives as text (or NULL) and is typed later by the table descriptor.
//! Notifications are pulled off the connection future with `poll_message`.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_postgres::{AsyncMessage, Client, NoTls, SimpleQueryMessage, SimpleQueryRow};

use super::session::{
    ConnectionParams, NotificationPayload, RawNotification, SqlDriver, SqlSession,
};
use crate::error::ConnectionError;
use pgmirror_api::{QueryError, QueryOutcome, Row, Value};

#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDriver;

impl PostgresDriver {
    pub fn new() -> Self {
        Self
    }
}

/// Quote an identifier for statements that can't take parameters (LISTEN)
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn error_message(e: &tokio_postgres::Error) -> String {
    match e.as_db_error() {
        Some(db) => db.message().to_string(),
        None => e.to_string(),
    }
}

/// `tokio-postgres` has already decoded the payload from the UTF-8 client
/// encoding, so it is passed on as text and no codec applies to it.
fn to_raw_notification(process_id: i32, channel: &str, payload: &str) -> RawNotification {
    RawNotification {
        process_id,
        channel: channel.to_string(),
        payload: NotificationPayload::Text(payload.to_string()),
    }
}

fn to_row(row: &SimpleQueryRow) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let value = match row.get(i) {
                Some(text) => Value::String(text.to_string()),
                None => Value::Null,
            };
            (column.name().to_string(), value)
        })
        .collect()
}

#[async_trait]
impl SqlDriver for PostgresDriver {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn open(&self, params: &ConnectionParams) -> Result<Box<dyn SqlSession>, ConnectionError> {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&params.host)
            .port(params.port)
            .dbname(&params.database)
            .application_name("pgmirror");
        if !params.username.is_empty() {
            config.user(&params.username);
        }
        if !params.password.is_empty() {
            config.password(&params.password);
        }

        let (client, mut connection) = config
            .connect(NoTls)
            .await
            .map_err(|e| ConnectionError::Open(error_message(&e)))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let messages = futures::stream::poll_fn(move |cx| connection.poll_message(cx));
            futures::pin_mut!(messages);
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) => {
                        let notification =
                            to_raw_notification(n.process_id(), n.channel(), n.payload());
                        if tx.send(notification).is_err() {
                            tracing::trace!("[PostgresDriver] notification receiver gone");
                        }
                    }
                    Ok(AsyncMessage::Notice(notice)) => {
                        tracing::debug!("[PostgresDriver] server notice: {}", notice.message());
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("[PostgresDriver] connection error: {}", e);
                        break;
                    }
                }
            }
            tracing::debug!("[PostgresDriver] connection task finished");
        });

        Ok(Box::new(PostgresSession {
            client: Some(client),
            notifications: Some(rx),
        }))
    }
}

struct PostgresSession {
    client: Option<Client>,
    notifications: Option<mpsc::UnboundedReceiver<RawNotification>>,
}

#[async_trait]
impl SqlSession for PostgresSession {
    async fn execute(&mut self, query: &str) -> QueryOutcome {
        let Some(client) = &self.client else {
            return QueryOutcome::failed(QueryError::NotConnected);
        };

        let messages = match client.simple_query(query).await {
            Ok(messages) => messages,
            Err(e) => return QueryOutcome::failed(QueryError::Execution(error_message(&e))),
        };

        let mut rows = Vec::new();
        let mut is_query = false;
        for message in messages {
            match message {
                SimpleQueryMessage::RowDescription(_) => is_query = true,
                SimpleQueryMessage::Row(row) => {
                    is_query = true;
                    rows.push(to_row(&row));
                }
                SimpleQueryMessage::CommandComplete(_) => {}
                _ => {}
            }
        }

        QueryOutcome {
            rows,
            is_query,
            error: None,
        }
    }

    async fn listen(&mut self, channel: &str) -> Result<(), QueryError> {
        let client = self.client.as_ref().ok_or(QueryError::NotConnected)?;
        client
            .batch_execute(&format!("LISTEN {}", quote_ident(channel)))
            .await
            .map_err(|e| QueryError::Execution(error_message(&e)))
    }

    fn take_notifications(&mut self) -> Option<mpsc::UnboundedReceiver<RawNotification>> {
        self.notifications.take()
    }

    async fn close(&mut self) {
        // Dropping the last client makes the connection task terminate
        self.client.take();
    }
}
