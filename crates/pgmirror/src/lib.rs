//! In-memory mirrors of PostgreSQL tables
//!
//! - `connector`: one session per `DatabaseConnector`, FIFO command queue
//!   with correlated completions
//! - `notification`: `data_change_event` payload parsing and routing
//! - `mirror`: per-table `TableManager` reconciling snapshots and changes
//! - `schema`: static table descriptors, literals and row parsing

pub mod codec;
pub mod config;
pub mod connector;
pub mod error;
pub mod mapper;
pub mod mirror;
pub mod notification;
pub mod registry;
pub mod schema;
pub mod testing;

pub use codec::{Latin1, TextCodec};
pub use config::MirrorConfig;
pub use connector::{
    ConnectionParams, DatabaseConnector, NotificationPayload, PostgresDriver, RawNotification,
    SqlDriver, SqlSession,
};
pub use error::{
    ConnectionError, MirrorError, NotificationParseError, RegistryError, Result, RowParseError,
    ValidationError,
};
pub use mapper::ValueMapper;
pub use mirror::{
    AcceptAll, FnValidator, ItemValidator, NotificationDisposition, ReconcilePolicy,
    RequiredFields, TableManager,
};
pub use notification::NotificationRouter;
pub use registry::ConnectorRegistry;
pub use schema::{FieldDescriptor, FieldType, TableDescriptor};

pub use pgmirror_api::*;
