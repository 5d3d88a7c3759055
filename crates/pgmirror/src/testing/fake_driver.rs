//! In-process driver with scripted responses
//!
//! `FakeDriver` stands in for a database server: it records every executed
//! statement, answers from scripted outcomes or stored table rows, can hold
//! execution at a gate to make interleavings deterministic, and pushes
//! notifications into the most recently opened session.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::{mpsc, Semaphore};

use crate::connector::{
    ConnectionParams, NotificationPayload, RawNotification, SqlDriver, SqlSession,
};
use crate::error::ConnectionError;
use pgmirror_api::{QueryError, QueryOutcome, Row};

/// Backend process id stamped on pushed notifications
pub const FAKE_PROCESS_ID: i32 = 4242;

#[derive(Default)]
struct Script {
    /// One-shot outcomes per exact statement text, consumed in order
    responses: HashMap<String, VecDeque<QueryOutcome>>,
    /// Rows answered for `SELECT * FROM <qualified name>;` until replaced
    tables: HashMap<String, Vec<Row>>,
    /// Persistent failures per statement text
    failures: HashMap<String, String>,
    fail_open: Option<String>,
}

#[derive(Default)]
struct State {
    script: Mutex<Script>,
    executed: Mutex<Vec<String>>,
    listened: Mutex<Vec<String>>,
    params: Mutex<Vec<ConnectionParams>>,
    notifier: Mutex<Option<mpsc::UnboundedSender<RawNotification>>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Clone, Default)]
pub struct FakeDriver {
    state: Arc<State>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a one-shot outcome for the exact statement text
    pub fn respond(&self, query: impl Into<String>, outcome: QueryOutcome) {
        lock(&self.state.script)
            .responses
            .entry(query.into())
            .or_default()
            .push_back(outcome);
    }

    /// Make every execution of the statement fail
    pub fn fail(&self, query: impl Into<String>, message: impl Into<String>) {
        lock(&self.state.script)
            .failures
            .insert(query.into(), message.into());
    }

    /// Rows returned by `SELECT * FROM qualified_name;`
    pub fn set_table(&self, qualified_name: impl Into<String>, rows: Vec<Row>) {
        lock(&self.state.script)
            .tables
            .insert(qualified_name.into(), rows);
    }

    pub fn fail_open(&self, message: impl Into<String>) {
        lock(&self.state.script).fail_open = Some(message.into());
    }

    pub fn clear_open_failure(&self) {
        lock(&self.state.script).fail_open = None;
    }

    /// Hold every following execution until [`FakeDriver::release`] hands
    /// out a permit for it
    pub fn pause(&self) {
        *lock(&self.state.gate) = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, executions: usize) {
        if let Some(gate) = lock(&self.state.gate).as_ref() {
            gate.add_permits(executions);
        }
    }

    /// Stop gating. Executions already waiting are let through.
    pub fn resume(&self) {
        if let Some(gate) = lock(&self.state.gate).take() {
            gate.close();
        }
    }

    /// Push a text payload, as a client library that decodes for us would
    pub fn notify(&self, payload: impl Into<String>) -> bool {
        self.push(NotificationPayload::Text(payload.into()))
    }

    /// Push payload bytes in the server's encoding, for codec tests
    pub fn notify_raw(&self, payload: Vec<u8>) -> bool {
        self.push(NotificationPayload::Bytes(payload))
    }

    fn push(&self, payload: NotificationPayload) -> bool {
        let channel = lock(&self.state.listened)
            .last()
            .cloned()
            .unwrap_or_else(|| crate::connector::DEFAULT_CHANNEL.to_string());
        match lock(&self.state.notifier).as_ref() {
            Some(tx) => tx
                .send(RawNotification {
                    process_id: FAKE_PROCESS_ID,
                    channel,
                    payload,
                })
                .is_ok(),
            None => false,
        }
    }

    pub fn executed(&self) -> Vec<String> {
        lock(&self.state.executed).clone()
    }

    pub fn listened(&self) -> Vec<String> {
        lock(&self.state.listened).clone()
    }

    /// Parameters of every successful open, in order
    pub fn opened_with(&self) -> Vec<ConnectionParams> {
        lock(&self.state.params).clone()
    }

    /// Highest number of statements observed executing at the same time
    pub fn max_concurrency(&self) -> usize {
        self.state.max_active.load(Ordering::SeqCst)
    }

    pub fn open_count(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    fn answer(&self, query: &str) -> QueryOutcome {
        let mut script = lock(&self.state.script);
        if let Some(message) = script.failures.get(query) {
            return QueryOutcome::failed(QueryError::Execution(message.clone()));
        }
        if let Some(outcome) = script.responses.get_mut(query).and_then(VecDeque::pop_front) {
            return outcome;
        }
        let select_all = query
            .strip_prefix("SELECT * FROM ")
            .map(|rest| rest.trim_end_matches(';').trim());
        if let Some(rows) = select_all.and_then(|name| script.tables.get(name)) {
            return QueryOutcome::rows(rows.clone());
        }
        if query.trim_start().to_ascii_uppercase().starts_with("SELECT") {
            QueryOutcome::rows(Vec::new())
        } else {
            QueryOutcome::command()
        }
    }
}

#[async_trait]
impl SqlDriver for FakeDriver {
    fn name(&self) -> &str {
        "fake"
    }

    async fn open(&self, params: &ConnectionParams) -> Result<Box<dyn SqlSession>, ConnectionError> {
        if let Some(message) = lock(&self.state.script).fail_open.clone() {
            return Err(ConnectionError::Open(message));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.state.notifier) = Some(tx);
        lock(&self.state.params).push(params.clone());
        self.state.opened.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(FakeSession {
            driver: self.clone(),
            notifications: Some(rx),
        }))
    }
}

struct FakeSession {
    driver: FakeDriver,
    notifications: Option<mpsc::UnboundedReceiver<RawNotification>>,
}

#[async_trait]
impl SqlSession for FakeSession {
    async fn execute(&mut self, query: &str) -> QueryOutcome {
        let state = &self.driver.state;
        lock(&state.executed).push(query.to_string());

        let active = state.active.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_active.fetch_max(active, Ordering::SeqCst);

        let gate = lock(&state.gate).clone();
        if let Some(gate) = gate {
            // A closed gate means resume() was called
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        tokio::task::yield_now().await;

        state.active.fetch_sub(1, Ordering::SeqCst);
        self.driver.answer(query)
    }

    async fn listen(&mut self, channel: &str) -> Result<(), QueryError> {
        lock(&self.driver.state.listened).push(channel.to_string());
        Ok(())
    }

    fn take_notifications(&mut self) -> Option<mpsc::UnboundedReceiver<RawNotification>> {
        self.notifications.take()
    }

    async fn close(&mut self) {
        self.driver.state.closed.fetch_add(1, Ordering::SeqCst);
    }
}
