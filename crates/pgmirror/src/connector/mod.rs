//! Single-connection command dispatcher
//!
//! A `DatabaseConnector` owns one database session through a worker task.
//! Commands are queued FIFO and executed one at a time; every submission gets
//! a fresh `CorrelationId` and exactly one completion, broadcast as
//! `ConnectorEvent::QueryFinished` and optionally sent to a direct reply
//! channel.

pub mod postgres;
pub mod session;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, oneshot, Notify};

use crate::codec::TextCodec;
use crate::error::ConnectionError;
use pgmirror_api::{
    Completion, ConnectionState, ConnectorEvent, CorrelationId, QueryOutcome, Subscribers,
};

pub use postgres::PostgresDriver;
pub use session::{
    ConnectionParams, NotificationPayload, RawNotification, SqlDriver, SqlSession,
    DEFAULT_CHANNEL, DEFAULT_PORT,
};

struct PendingCommand {
    id: CorrelationId,
    query: String,
    reply: Option<oneshot::Sender<Arc<QueryOutcome>>>,
}

struct Inner {
    name: String,
    params: ConnectionParams,
    codec: Option<Arc<dyn TextCodec>>,
    state: ConnectionState,
    connecting: bool,
    /// Bumped on every connect and disconnect. A worker only acts while the
    /// epoch it was started for is current.
    epoch: u64,
    pending: VecDeque<PendingCommand>,
    wake: Option<Arc<Notify>>,
}

struct Shared {
    inner: Mutex<Inner>,
    events: Subscribers<ConnectorEvent>,
    notifications: Subscribers<RawNotification>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, inner: &mut Inner, state: ConnectionState) {
        if inner.state != state {
            inner.state = state;
            self.events.emit(ConnectorEvent::StateChanged(state));
        }
    }

    /// Deliver the single completion of a command
    fn finish(&self, command: PendingCommand, outcome: Arc<QueryOutcome>) {
        if let Some(error) = &outcome.error {
            self.events.emit(ConnectorEvent::QueryError {
                id: command.id,
                error: error.clone(),
            });
        }
        self.events.emit(ConnectorEvent::QueryFinished(Completion {
            id: command.id,
            outcome: Arc::clone(&outcome),
        }));
        if let Some(reply) = command.reply {
            // Caller may have stopped waiting
            let _ = reply.send(outcome);
        }
    }

    /// Cancel queued work and retire the current worker.
    fn shut_down(&self) {
        let cancelled: Vec<PendingCommand> = {
            let mut inner = self.lock();
            inner.epoch += 1;
            if let Some(wake) = inner.wake.take() {
                wake.notify_one();
            }
            let was_open = inner.state != ConnectionState::Disconnected;
            self.set_state(&mut inner, ConnectionState::Disconnected);
            if was_open {
                tracing::info!("[DatabaseConnector] {} disconnected", inner.name);
                self.events.emit(ConnectorEvent::Disconnected);
            }
            inner.pending.drain(..).collect()
        };

        if !cancelled.is_empty() {
            tracing::debug!(
                "[DatabaseConnector] cancelling {} queued command(s)",
                cancelled.len()
            );
        }
        for command in cancelled {
            self.finish(command, Arc::new(QueryOutcome::cancelled()));
        }
    }
}

enum Step {
    Run(PendingCommand),
    Wait,
    Stop,
}

/// Worker loop for one open session.
///
/// While the state is Idle and the queue is non-empty it dequeues the next
/// command, goes Busy, executes and goes back to Idle. The queue is checked
/// again before waiting, so queued work never sits behind an idle worker.
async fn run_worker(
    shared: Arc<Shared>,
    mut session: Box<dyn SqlSession>,
    epoch: u64,
    wake: Arc<Notify>,
) {
    loop {
        let step = {
            let mut inner = shared.lock();
            if inner.epoch != epoch {
                Step::Stop
            } else if let Some(command) = inner.pending.pop_front() {
                shared.set_state(&mut inner, ConnectionState::Busy);
                Step::Run(command)
            } else {
                Step::Wait
            }
        };

        match step {
            Step::Stop => break,
            Step::Wait => wake.notified().await,
            Step::Run(command) => {
                tracing::debug!(
                    "[DatabaseConnector] executing {}: {}",
                    command.id,
                    command.query
                );
                let outcome = Arc::new(session.execute(&command.query).await);
                if let Some(error) = &outcome.error {
                    tracing::error!("[DatabaseConnector] command {} failed: {}", command.id, error);
                }
                {
                    let mut inner = shared.lock();
                    if inner.epoch == epoch {
                        shared.set_state(&mut inner, ConnectionState::Idle);
                    }
                }
                shared.finish(command, outcome);
            }
        }
    }

    session.close().await;
    tracing::debug!("[DatabaseConnector] session closed");
}

async fn forward_notifications(
    shared: Arc<Shared>,
    mut rx: mpsc::UnboundedReceiver<RawNotification>,
    epoch: u64,
) {
    while let Some(notification) = rx.recv().await {
        if shared.lock().epoch != epoch {
            break;
        }
        tracing::trace!(
            "[DatabaseConnector] notification from pid {} on {}",
            notification.process_id,
            notification.channel
        );
        shared.notifications.emit(notification);
    }
}

/// Command dispatcher over one database connection
pub struct DatabaseConnector {
    driver: Arc<dyn SqlDriver>,
    shared: Arc<Shared>,
}

impl DatabaseConnector {
    pub fn new(driver: Arc<dyn SqlDriver>) -> Self {
        Self::with_params(driver, ConnectionParams::default())
    }

    pub fn with_params(driver: Arc<dyn SqlDriver>, params: ConnectionParams) -> Self {
        let name = if params.database.is_empty() {
            "default".to_string()
        } else {
            params.database.clone()
        };
        Self {
            driver,
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    name,
                    params,
                    codec: None,
                    state: ConnectionState::Disconnected,
                    connecting: false,
                    epoch: 0,
                    pending: VecDeque::new(),
                    wake: None,
                }),
                events: Subscribers::new(),
                notifications: Subscribers::new(),
            }),
        }
    }

    /// Queue a command. Never blocks; the outcome arrives as
    /// `ConnectorEvent::QueryFinished` carrying the returned id.
    pub fn submit(&self, query: impl Into<String>) -> CorrelationId {
        let id = CorrelationId::new();
        self.enqueue(PendingCommand {
            id,
            query: query.into(),
            reply: None,
        });
        id
    }

    /// Like [`DatabaseConnector::submit`], with a direct reply channel
    pub fn submit_with_reply(
        &self,
        query: impl Into<String>,
    ) -> (CorrelationId, oneshot::Receiver<Arc<QueryOutcome>>) {
        let id = CorrelationId::new();
        let (tx, rx) = oneshot::channel();
        self.enqueue(PendingCommand {
            id,
            query: query.into(),
            reply: Some(tx),
        });
        (id, rx)
    }

    /// Submit and wait for the outcome
    pub async fn execute(&self, query: impl Into<String>) -> Arc<QueryOutcome> {
        let (_, rx) = self.submit_with_reply(query);
        rx.await
            .unwrap_or_else(|_| Arc::new(QueryOutcome::cancelled()))
    }

    fn enqueue(&self, command: PendingCommand) {
        let mut inner = self.shared.lock();
        tracing::debug!(
            "[DatabaseConnector] queued {} ({} ahead, state {:?})",
            command.id,
            inner.pending.len(),
            inner.state
        );
        inner.pending.push_back(command);
        if let Some(wake) = &inner.wake {
            wake.notify_one();
        }
    }

    /// Open the session with the configured host, port and database.
    ///
    /// Commands queued while disconnected start running once this returns.
    pub async fn connect(
        &self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        let (params, start_epoch) = {
            let mut inner = self.shared.lock();
            if inner.params.host.is_empty() {
                return Err(ConnectionError::HostNotSet);
            }
            if inner.params.database.is_empty() {
                return Err(ConnectionError::DatabaseNotSet);
            }
            if inner.connecting || inner.state != ConnectionState::Disconnected {
                return Err(ConnectionError::AlreadyConnected);
            }
            inner.connecting = true;
            inner.params.username = username.into();
            inner.params.password = password.into();
            (inner.params.clone(), inner.epoch)
        };

        tracing::info!(
            "[DatabaseConnector] connecting to {}:{}/{} via {}",
            params.host,
            params.port,
            params.database,
            self.driver.name()
        );

        let mut session = match self.driver.open(&params).await {
            Ok(session) => session,
            Err(e) => {
                self.shared.lock().connecting = false;
                tracing::error!("[DatabaseConnector] {}", e);
                return Err(e);
            }
        };

        if let Err(e) = session.listen(&params.channel).await {
            tracing::warn!(
                "[DatabaseConnector] LISTEN {} failed, change notifications will not arrive: {}",
                params.channel,
                e
            );
        }
        let notifications = session.take_notifications();

        let wake = Arc::new(Notify::new());
        let epoch = {
            let mut inner = self.shared.lock();
            inner.connecting = false;
            if inner.epoch == start_epoch {
                inner.epoch += 1;
                inner.wake = Some(Arc::clone(&wake));
                self.shared.set_state(&mut inner, ConnectionState::Idle);
                self.shared.events.emit(ConnectorEvent::Connected);
                tracing::info!(
                    "[DatabaseConnector] {} connected ({} queued)",
                    inner.name,
                    inner.pending.len()
                );
                Some(inner.epoch)
            } else {
                None
            }
        };
        let Some(epoch) = epoch else {
            session.close().await;
            return Err(ConnectionError::Open(
                "disconnected while the connection was being opened".to_string(),
            ));
        };

        tokio::spawn(run_worker(
            Arc::clone(&self.shared),
            session,
            epoch,
            wake,
        ));
        if let Some(rx) = notifications {
            tokio::spawn(forward_notifications(Arc::clone(&self.shared), rx, epoch));
        }
        Ok(())
    }

    /// Set host, port and database, then connect
    pub async fn connect_to(
        &self,
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<(), ConnectionError> {
        {
            let mut inner = self.shared.lock();
            if inner.connecting || inner.state != ConnectionState::Disconnected {
                return Err(ConnectionError::AlreadyConnected);
            }
            inner.params.host = host.into();
            inner.params.port = port;
            inner.params.database = database.into();
        }
        self.connect(username, password).await
    }

    /// Close the session.
    ///
    /// Queued commands complete with `QueryError::Cancelled`. A command that
    /// is already executing finishes and its outcome is still delivered.
    pub fn disconnect(&self) {
        self.shared.shut_down();
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectorEvent> {
        self.shared.events.subscribe()
    }

    /// Inbound change notifications of every session this connector opens
    pub fn subscribe_notifications(&self) -> mpsc::UnboundedReceiver<RawNotification> {
        self.shared.notifications.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() != ConnectionState::Disconnected
    }

    pub fn pending_len(&self) -> usize {
        self.shared.lock().pending.len()
    }

    pub fn name(&self) -> String {
        self.shared.lock().name.clone()
    }

    pub fn set_connection_name(&self, name: impl Into<String>) {
        self.shared.lock().name = name.into();
    }

    pub fn host(&self) -> String {
        self.shared.lock().params.host.clone()
    }

    pub fn set_host(&self, host: impl Into<String>) {
        self.shared.lock().params.host = host.into();
    }

    pub fn port(&self) -> u16 {
        self.shared.lock().params.port
    }

    pub fn set_port(&self, port: u16) {
        self.shared.lock().params.port = port;
    }

    pub fn database(&self) -> String {
        self.shared.lock().params.database.clone()
    }

    pub fn set_database(&self, database: impl Into<String>) {
        self.shared.lock().params.database = database.into();
    }

    pub fn username(&self) -> String {
        self.shared.lock().params.username.clone()
    }

    pub fn channel(&self) -> String {
        self.shared.lock().params.channel.clone()
    }

    pub fn set_channel(&self, channel: impl Into<String>) {
        self.shared.lock().params.channel = channel.into();
    }

    pub fn codec(&self) -> Option<Arc<dyn TextCodec>> {
        self.shared.lock().codec.clone()
    }

    pub fn set_codec(&self, codec: Option<Arc<dyn TextCodec>>) {
        self.shared.lock().codec = codec;
    }
}

impl Drop for DatabaseConnector {
    fn drop(&mut self) {
        self.shared.shut_down();
    }
}

impl std::fmt::Debug for DatabaseConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.lock();
        f.debug_struct("DatabaseConnector")
            .field("name", &inner.name)
            .field("host", &inner.params.host)
            .field("port", &inner.params.port)
            .field("database", &inner.params.database)
            .field("state", &inner.state)
            .field("pending", &inner.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeDriver;
    use pgmirror_api::QueryError;

    fn connector(driver: &FakeDriver) -> DatabaseConnector {
        DatabaseConnector::with_params(
            Arc::new(driver.clone()),
            ConnectionParams::new("localhost", 5432, "app"),
        )
    }

    async fn next_finished(rx: &mut mpsc::UnboundedReceiver<ConnectorEvent>) -> Completion {
        loop {
            match rx.recv().await {
                Some(ConnectorEvent::QueryFinished(completion)) => return completion,
                Some(_) => continue,
                None => panic!("connector event stream closed"),
            }
        }
    }

    async fn wait_for_state(
        rx: &mut mpsc::UnboundedReceiver<ConnectorEvent>,
        wanted: ConnectionState,
    ) {
        loop {
            match rx.recv().await {
                Some(ConnectorEvent::StateChanged(state)) if state == wanted => return,
                Some(_) => continue,
                None => panic!("connector event stream closed"),
            }
        }
    }

    #[tokio::test]
    async fn test_connect_requires_host_and_database() {
        let driver = FakeDriver::new();
        let conn = DatabaseConnector::new(Arc::new(driver.clone()));
        assert_eq!(
            conn.connect("u", "p").await,
            Err(ConnectionError::HostNotSet)
        );

        conn.set_host("localhost");
        assert_eq!(
            conn.connect("u", "p").await,
            Err(ConnectionError::DatabaseNotSet)
        );
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(driver.open_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_listens_and_rejects_second_connect() {
        let driver = FakeDriver::new();
        let conn = connector(&driver);
        let mut events = conn.subscribe();

        conn.connect("alice", "secret").await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(conn.username(), "alice");
        assert_eq!(driver.listened(), vec![DEFAULT_CHANNEL.to_string()]);

        assert!(matches!(
            events.recv().await,
            Some(ConnectorEvent::StateChanged(ConnectionState::Idle))
        ));
        assert!(matches!(events.recv().await, Some(ConnectorEvent::Connected)));

        assert_eq!(
            conn.connect("alice", "secret").await,
            Err(ConnectionError::AlreadyConnected)
        );
        assert_eq!(driver.open_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_open_leaves_disconnected() {
        let driver = FakeDriver::new();
        driver.fail_open("password authentication failed");
        let conn = connector(&driver);

        let err = conn.connect("u", "bad").await.unwrap_err();
        assert!(matches!(err, ConnectionError::Open(_)));
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        // A later attempt is allowed
        driver.clear_open_failure();
        conn.connect("u", "good").await.unwrap();
        assert!(conn.is_open());
    }

    #[tokio::test]
    async fn test_commands_complete_in_submission_order() {
        let driver = FakeDriver::new();
        driver.pause();
        let conn = connector(&driver);
        conn.connect("u", "p").await.unwrap();
        let mut events = conn.subscribe();

        let q1 = conn.submit("SELECT 1;");
        wait_for_state(&mut events, ConnectionState::Busy).await;
        let q2 = conn.submit("SELECT 2;");
        let q3 = conn.submit("SELECT 3;");
        assert_eq!(conn.pending_len(), 2);

        driver.release(3);
        let order = vec![
            next_finished(&mut events).await.id,
            next_finished(&mut events).await.id,
            next_finished(&mut events).await.id,
        ];
        assert_eq!(order, vec![q1, q2, q3]);
        assert_eq!(driver.max_concurrency(), 1);
        assert_eq!(
            driver.executed(),
            vec!["SELECT 1;", "SELECT 2;", "SELECT 3;"]
        );
    }

    #[tokio::test]
    async fn test_commands_queued_while_disconnected_run_after_connect() {
        let driver = FakeDriver::new();
        let conn = connector(&driver);
        let (_, reply) = conn.submit_with_reply("DELETE FROM public.t WHERE _uuid='1';");
        assert_eq!(conn.pending_len(), 1);

        conn.connect("u", "p").await.unwrap();
        let outcome = reply.await.unwrap();
        assert!(outcome.is_ok());
        assert!(!outcome.is_query);
    }

    #[tokio::test]
    async fn test_failed_command_reports_error_and_queue_continues() {
        let driver = FakeDriver::new();
        driver.fail("SELECT broken;", "relation does not exist");
        let conn = connector(&driver);
        conn.connect("u", "p").await.unwrap();
        let mut events = conn.subscribe();

        let bad = conn.submit("SELECT broken;");
        let good = conn.execute("SELECT 1;").await;
        assert!(good.is_ok());

        let mut saw_error = false;
        let mut finished = Vec::new();
        while finished.len() < 2 {
            match events.recv().await {
                Some(ConnectorEvent::QueryError { id, error }) => {
                    assert_eq!(id, bad);
                    assert_eq!(
                        error,
                        QueryError::Execution("relation does not exist".to_string())
                    );
                    saw_error = true;
                }
                Some(ConnectorEvent::QueryFinished(c)) => finished.push(c.id),
                _ => {}
            }
        }
        assert!(saw_error);
        assert_eq!(finished[0], bad);
    }

    #[tokio::test]
    async fn test_disconnect_cancels_queued_but_finishes_in_flight() {
        let driver = FakeDriver::new();
        driver.pause();
        let conn = connector(&driver);
        conn.connect("u", "p").await.unwrap();
        let mut events = conn.subscribe();

        let (_, running) = conn.submit_with_reply("SELECT 1;");
        wait_for_state(&mut events, ConnectionState::Busy).await;
        let (_, queued) = conn.submit_with_reply("SELECT 2;");

        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.pending_len(), 0);
        assert_eq!(queued.await.unwrap().error, Some(QueryError::Cancelled));

        driver.release(1);
        assert!(running.await.unwrap().is_ok());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(driver.executed(), vec!["SELECT 1;"]);
    }

    #[tokio::test]
    async fn test_reconnect_after_disconnect() {
        let driver = FakeDriver::new();
        let conn = connector(&driver);
        conn.connect("u", "p").await.unwrap();
        conn.disconnect();
        conn.connect("u", "p").await.unwrap();

        assert!(conn.execute("SELECT 1;").await.is_ok());
        assert_eq!(driver.open_count(), 2);
    }

    #[tokio::test]
    async fn test_notifications_are_forwarded() {
        let driver = FakeDriver::new();
        let conn = connector(&driver);
        let mut notes = conn.subscribe_notifications();
        conn.connect("u", "p").await.unwrap();

        driver.notify(r#"{"action":"INSERT"}"#);
        let note = notes.recv().await.unwrap();
        assert_eq!(note.channel, DEFAULT_CHANNEL);
        assert_eq!(
            note.payload,
            NotificationPayload::Text(r#"{"action":"INSERT"}"#.to_string())
        );
    }

    #[tokio::test]
    async fn test_connect_to_sets_parameters() {
        let driver = FakeDriver::new();
        let conn = DatabaseConnector::new(Arc::new(driver.clone()));
        assert_eq!(conn.name(), "default");

        conn.set_connection_name("reporting");
        conn.set_channel("audit_event");
        conn.set_codec(Some(Arc::new(crate::codec::Latin1)));
        conn.connect_to("db.internal", 6543, "sales", "bob", "pw")
            .await
            .unwrap();

        assert_eq!(conn.name(), "reporting");
        assert_eq!(conn.host(), "db.internal");
        assert_eq!(conn.port(), 6543);
        assert_eq!(conn.database(), "sales");
        assert_eq!(conn.username(), "bob");
        assert_eq!(conn.codec().map(|c| c.name().to_string()).as_deref(), Some("ISO-8859-1"));

        let params = &driver.opened_with()[0];
        assert_eq!(params.password, "pw");
        assert_eq!(params.channel, "audit_event");
        assert_eq!(driver.listened(), vec!["audit_event".to_string()]);

        conn.set_port(1);
        assert_eq!(
            conn.connect_to("elsewhere", 1, "x", "u", "p").await,
            Err(ConnectionError::AlreadyConnected)
        );
        assert_eq!(conn.host(), "db.internal");
    }
}
