//! Per-table mirror manager
//!
//! A `TableManager` keeps the rows of one table in memory, keyed by row id.
//! It writes through the shared `DatabaseConnector` and learns about the
//! results from two independent sources: completions of its own SELECTs
//! (full snapshots) and routed change notifications (single rows).
//!
//! Snapshots and notifications are not ordered relative to each other. Every
//! load is stamped with the manager's sequence number and, while a SELECT is
//! in flight, applied notifications are journaled with their own number. When
//! the snapshot lands, [`ReconcilePolicy::ReplayNewer`] replays the journaled
//! changes that are newer than the load, so nothing applied during the reload
//! is lost.

pub mod queries;
pub mod validation;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::connector::DatabaseConnector;
use crate::error::{MirrorError, Result, ValidationError};
use crate::notification::NotificationRouter;
use crate::schema::TableDescriptor;
use pgmirror_api::{
    ChangeAction, ChangeNotification, Completion, ConnectorEvent, CorrelationId, LoadState,
    MirrorEvent, MirroredItem, QueryError, ReconciliationWarning, Subscribers, WarningKind,
};

pub use validation::{AcceptAll, FnValidator, ItemValidator, RequiredFields, MISSING_REQUIRED_FIELD};

/// What wins when a snapshot lands after notifications were applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcilePolicy {
    /// Re-apply notifications newer than the load on top of the snapshot
    #[default]
    ReplayNewer,
    /// The snapshot replaces everything
    SnapshotWins,
}

/// Effect of one change notification on the mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationDisposition {
    /// Notification for another table
    Ignored,
    Inserted,
    /// INSERT for a row id already present
    Replaced,
    Updated,
    Deleted,
    /// Mirror left unchanged, a warning was recorded
    Warned(WarningKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy)]
enum Awaited {
    Load { stamp: u64, superseded: bool },
    Write(WriteKind),
}

#[derive(Default)]
struct MirrorState {
    items: BTreeMap<String, MirroredItem>,
    load_state: LoadState,
    has_snapshot: bool,
    awaited: HashMap<CorrelationId, Awaited>,
    warnings: Vec<ReconciliationWarning>,
    last_check_message: String,
    seq: u64,
    journal: Vec<Journaled>,
}

/// A change applied while a load was in flight
struct Journaled {
    seq: u64,
    change: ChangeNotification,
    /// The live application already recorded a warning for it
    warned: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Apply {
    Live,
    /// Re-applied on top of a snapshot: no per-row events, and a warning only
    /// if the live application did not already record one
    Replay { warned: bool },
}

impl MirrorState {
    fn active_loads(&self) -> impl Iterator<Item = u64> + '_ {
        self.awaited.values().filter_map(|awaited| match awaited {
            Awaited::Load {
                stamp,
                superseded: false,
            } => Some(*stamp),
            _ => None,
        })
    }

    fn loading(&self) -> bool {
        self.active_loads().next().is_some()
    }

    /// Forget journaled changes no in-flight load can need anymore
    fn prune_journal(&mut self) {
        match self.active_loads().min() {
            Some(oldest) => self.journal.retain(|entry| entry.seq > oldest),
            None => self.journal.clear(),
        }
    }
}

pub struct TableManager {
    connector: Arc<DatabaseConnector>,
    descriptor: TableDescriptor,
    validator: Box<dyn ItemValidator>,
    policy: ReconcilePolicy,
    state: RwLock<MirrorState>,
    events: Subscribers<MirrorEvent>,
}

impl TableManager {
    pub fn new(connector: Arc<DatabaseConnector>, descriptor: TableDescriptor) -> Self {
        Self {
            connector,
            descriptor,
            validator: Box::new(AcceptAll),
            policy: ReconcilePolicy::default(),
            state: RwLock::new(MirrorState::default()),
            events: Subscribers::new(),
        }
    }

    pub fn with_validator(mut self, validator: impl ItemValidator + 'static) -> Self {
        self.validator = Box::new(validator);
        self
    }

    pub fn with_policy(mut self, policy: ReconcilePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<MirrorEvent> {
        self.events.subscribe()
    }

    /// [`TableManager::subscribe`] as a `Stream`
    pub fn event_stream(&self) -> UnboundedReceiverStream<MirrorEvent> {
        UnboundedReceiverStream::new(self.subscribe())
    }

    pub fn descriptor(&self) -> &TableDescriptor {
        &self.descriptor
    }

    pub fn policy(&self) -> ReconcilePolicy {
        self.policy
    }

    pub fn connector(&self) -> &Arc<DatabaseConnector> {
        &self.connector
    }

    fn set_load_state(&self, st: &mut MirrorState, load_state: LoadState) {
        if st.load_state != load_state {
            st.load_state = load_state;
            self.events.emit(MirrorEvent::LoadStateChanged(load_state));
        }
    }

    fn warn(&self, st: &mut MirrorState, kind: WarningKind, row_id: &str) {
        let warning = ReconciliationWarning {
            kind,
            row_id: row_id.to_string(),
        };
        tracing::warn!(
            "[TableManager] {}: {}",
            self.descriptor.qualified_name(),
            warning
        );
        st.warnings.push(warning.clone());
        self.events.emit(MirrorEvent::Warning(warning));
    }

    fn submit_locked(&self, st: &mut MirrorState, query: String, awaited: Awaited) -> CorrelationId {
        // Recorded under the lock, so the completion can't be handled first
        let id = self.connector.submit(query);
        st.awaited.insert(id, awaited);
        id
    }

    fn begin_load(&self, st: &mut MirrorState) -> CorrelationId {
        st.seq += 1;
        let stamp = st.seq;
        self.set_load_state(st, LoadState::Loading);
        let query = queries::select_query(&self.descriptor);
        tracing::debug!(
            "[TableManager] loading {} (stamp {})",
            self.descriptor.qualified_name(),
            stamp
        );
        self.submit_locked(
            st,
            query,
            Awaited::Load {
                stamp,
                superseded: false,
            },
        )
    }

    /// Request a snapshot of the table
    pub async fn load(&self) -> CorrelationId {
        let mut st = self.state.write().await;
        self.begin_load(&mut st)
    }

    /// Drop every row and go back to NotLoaded
    pub async fn unload(&self) {
        let mut st = self.state.write().await;
        st.items.clear();
        st.has_snapshot = false;
        self.set_load_state(&mut st, LoadState::NotLoaded);
        self.events.emit(MirrorEvent::Updated);
    }

    /// Reload from scratch.
    ///
    /// The current rows stay visible until the new snapshot replaces them.
    /// Loads issued earlier are superseded and their outcomes discarded.
    pub async fn full_reload(&self) -> CorrelationId {
        let mut st = self.state.write().await;
        for awaited in st.awaited.values_mut() {
            if let Awaited::Load { superseded, .. } = awaited {
                *superseded = true;
            }
        }
        self.begin_load(&mut st)
    }

    fn check(&self, st: &mut MirrorState, item: &MirroredItem) -> Result<()> {
        match self.validator.check_valid(item) {
            // Code 0 means valid
            Ok(()) | Err(ValidationError { code: 0, .. }) => {
                st.last_check_message.clear();
                Ok(())
            }
            Err(e) => {
                tracing::debug!(
                    "[TableManager] {} rejected item {}: {}",
                    self.descriptor.qualified_name(),
                    item.id(),
                    e
                );
                st.last_check_message = e.message.clone();
                Err(MirrorError::Validation(e))
            }
        }
    }

    /// Validate and submit an INSERT. The mirror changes once the
    /// notification or a reload arrives.
    pub async fn insert(&self, item: &MirroredItem) -> Result<CorrelationId> {
        let mut st = self.state.write().await;
        self.check(&mut st, item)?;
        let query = queries::insert_query(&self.descriptor, item)?;
        Ok(self.submit_locked(&mut st, query, Awaited::Write(WriteKind::Insert)))
    }

    pub async fn update(&self, item: &MirroredItem) -> Result<CorrelationId> {
        let mut st = self.state.write().await;
        self.check(&mut st, item)?;
        let query = queries::update_query(&self.descriptor, item)?;
        Ok(self.submit_locked(&mut st, query, Awaited::Write(WriteKind::Update)))
    }

    /// Submit a DELETE. Deletes are not validated.
    pub async fn remove(&self, item: &MirroredItem) -> CorrelationId {
        self.remove_id(item.id()).await
    }

    pub async fn remove_id(&self, id: &str) -> CorrelationId {
        let mut st = self.state.write().await;
        let query = queries::delete_query(&self.descriptor, id);
        self.submit_locked(&mut st, query, Awaited::Write(WriteKind::Delete))
    }

    /// Apply the outcome of a command. Returns false for ids this manager
    /// did not submit.
    pub async fn handle_completion(&self, completion: &Completion) -> bool {
        let mut st = self.state.write().await;
        let Some(awaited) = st.awaited.remove(&completion.id) else {
            return false;
        };
        let outcome = &completion.outcome;

        match awaited {
            Awaited::Write(kind) => {
                if let Some(error) = &outcome.error {
                    tracing::warn!(
                        "[TableManager] {:?} on {} failed: {}",
                        kind,
                        self.descriptor.qualified_name(),
                        error
                    );
                    self.events.emit(MirrorEvent::QueryError {
                        id: completion.id,
                        error: error.clone(),
                    });
                }
            }
            Awaited::Load {
                superseded: true, ..
            } => {
                tracing::debug!(
                    "[TableManager] discarding superseded snapshot of {}",
                    self.descriptor.qualified_name()
                );
            }
            Awaited::Load { stamp, .. } => match &outcome.error {
                Some(error) => self.load_failed(&mut st, completion.id, error.clone()),
                None if !outcome.is_query => self.load_failed(
                    &mut st,
                    completion.id,
                    QueryError::Execution("load returned no result set".to_string()),
                ),
                None => self.apply_snapshot(&mut st, stamp, completion),
            },
        }

        st.prune_journal();
        true
    }

    fn load_failed(&self, st: &mut MirrorState, id: CorrelationId, error: QueryError) {
        tracing::warn!(
            "[TableManager] loading {} failed: {}",
            self.descriptor.qualified_name(),
            error
        );
        if !st.loading() {
            let previous = if st.has_snapshot {
                LoadState::Loaded
            } else {
                LoadState::NotLoaded
            };
            self.set_load_state(st, previous);
        }
        self.events.emit(MirrorEvent::QueryError { id, error });
    }

    fn apply_snapshot(&self, st: &mut MirrorState, stamp: u64, completion: &Completion) {
        let mut items = BTreeMap::new();
        for row in &completion.outcome.rows {
            match self.descriptor.row_to_item(row) {
                Ok(item) => {
                    items.insert(item.id().to_string(), item);
                }
                Err(e) => {
                    let row_id = self
                        .descriptor
                        .row_id(row)
                        .unwrap_or_else(|| "?".to_string());
                    self.warn(st, WarningKind::UnparseableRow(e.to_string()), &row_id);
                }
            }
        }
        st.items = items;
        st.has_snapshot = true;

        if self.policy == ReconcilePolicy::ReplayNewer {
            let newer: Vec<(ChangeNotification, bool)> = st
                .journal
                .iter()
                .filter(|entry| entry.seq > stamp)
                .map(|entry| (entry.change.clone(), entry.warned))
                .collect();
            if !newer.is_empty() {
                tracing::debug!(
                    "[TableManager] replaying {} change(s) on top of {} snapshot",
                    newer.len(),
                    self.descriptor.qualified_name()
                );
            }
            for (change, warned) in &newer {
                self.apply_change(st, change, Apply::Replay { warned: *warned });
            }
        }

        tracing::info!(
            "[TableManager] {} loaded with {} item(s)",
            self.descriptor.qualified_name(),
            st.items.len()
        );
        if !st.loading() {
            self.set_load_state(st, LoadState::Loaded);
        }
        self.events.emit(MirrorEvent::Updated);
    }

    /// Apply one routed change notification.
    ///
    /// A change for another table is ignored without events; a known row id
    /// in it is only logged.
    pub async fn apply_notification(&self, change: &ChangeNotification) -> NotificationDisposition {
        let mut st = self.state.write().await;

        if !change.matches(self.descriptor.schema(), self.descriptor.table()) {
            if st.items.contains_key(&change.row_id) {
                tracing::warn!(
                    "[TableManager] {} got a {} for {}.{} row {}, which it also holds",
                    self.descriptor.qualified_name(),
                    change.action,
                    change.schema,
                    change.table,
                    change.row_id
                );
            }
            return NotificationDisposition::Ignored;
        }

        st.seq += 1;
        let seq = st.seq;
        let disposition = self.apply_change(&mut st, change, Apply::Live);
        if st.loading() {
            st.journal.push(Journaled {
                seq,
                change: change.clone(),
                warned: matches!(disposition, NotificationDisposition::Warned(_)),
            });
        }
        disposition
    }

    /// Mutate the mirror for one change
    fn apply_change(
        &self,
        st: &mut MirrorState,
        change: &ChangeNotification,
        mode: Apply,
    ) -> NotificationDisposition {
        let row_id = change.row_id.as_str();
        let disposition = match change.action {
            ChangeAction::Update if !st.items.contains_key(row_id) => {
                NotificationDisposition::Warned(WarningKind::UpdateForUnknownRow)
            }
            ChangeAction::Insert | ChangeAction::Update => {
                let known = st.items.contains_key(row_id);
                match self.descriptor.row_to_item(&change.data) {
                    Ok(mut item) => {
                        item.set_id(row_id);
                        st.items.insert(row_id.to_string(), item);
                        match (change.action, known) {
                            (ChangeAction::Update, _) => NotificationDisposition::Updated,
                            (_, true) => NotificationDisposition::Replaced,
                            (_, false) => NotificationDisposition::Inserted,
                        }
                    }
                    Err(e) => NotificationDisposition::Warned(WarningKind::UnparseableRow(
                        e.to_string(),
                    )),
                }
            }
            ChangeAction::Delete => match st.items.remove(row_id) {
                Some(_) => NotificationDisposition::Deleted,
                None => NotificationDisposition::Warned(WarningKind::DeleteForUnknownRow),
            },
        };

        if let NotificationDisposition::Warned(kind) = &disposition {
            if mode != (Apply::Replay { warned: true }) {
                self.warn(st, kind.clone(), row_id);
            }
        }

        if mode == Apply::Live {
            tracing::debug!(
                "[TableManager] {} {} {}: {:?}",
                self.descriptor.qualified_name(),
                change.action,
                row_id,
                disposition
            );
            // Raised for declined changes too
            self.events.emit(MirrorEvent::Updated);
            self.events.emit(MirrorEvent::UpdatedItem(row_id.to_string()));
        }
        disposition
    }

    /// Snapshot of all rows, ordered by row id
    pub async fn items(&self) -> Vec<MirroredItem> {
        self.state.read().await.items.values().cloned().collect()
    }

    pub async fn item(&self, id: &str) -> Option<MirroredItem> {
        self.state
            .read()
            .await
            .items
            .get(&pgmirror_api::normalize_id(id))
            .cloned()
    }

    pub async fn count(&self) -> usize {
        self.state.read().await.items.len()
    }

    pub async fn load_state(&self) -> LoadState {
        self.state.read().await.load_state
    }

    pub async fn warnings(&self) -> Vec<ReconciliationWarning> {
        self.state.read().await.warnings.clone()
    }

    pub async fn clear_warnings(&self) {
        self.state.write().await.warnings.clear();
    }

    /// Explanation of the last rejected insert or update, empty after a
    /// successful check
    pub async fn last_check_message(&self) -> String {
        self.state.read().await.last_check_message.clone()
    }

    /// Number of submitted commands whose outcome has not arrived yet
    pub async fn awaited_len(&self) -> usize {
        self.state.read().await.awaited.len()
    }

    /// Spawn the task feeding this manager with its connector's completions
    /// and the router's notifications for its table.
    ///
    /// The task holds the manager weakly and stops once the manager is gone
    /// or both streams have closed.
    pub fn attach(self: &Arc<Self>, router: &NotificationRouter) -> JoinHandle<()> {
        let mut completions = self.connector.subscribe();
        let mut changes = router.register_with_identity(
            self.descriptor.schema(),
            self.descriptor.table(),
            self.descriptor.identity_field(),
        );
        let manager: Weak<Self> = Arc::downgrade(self);
        let name = self.descriptor.qualified_name();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = completions.recv() => {
                        let ConnectorEvent::QueryFinished(completion) = event else {
                            continue;
                        };
                        let Some(manager) = manager.upgrade() else { break };
                        manager.handle_completion(&completion).await;
                    }
                    Some(change) = changes.recv() => {
                        let Some(manager) = manager.upgrade() else { break };
                        manager.apply_notification(&change).await;
                    }
                    else => break,
                }
            }
            tracing::debug!("[TableManager] pump for {} stopped", name);
        })
    }
}
