use thiserror::Error;

pub use pgmirror_api::QueryError;

/// Problems opening a connection. The connector state is left
/// Disconnected (or untouched when already connected).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("can't connect to base with an unknown host")]
    HostNotSet,

    #[error("can't connect to base with an unknown name")]
    DatabaseNotSet,

    #[error("already connected")]
    AlreadyConnected,

    #[error("could not connect to database: {0}")]
    Open(String),
}

/// Item rejected by a validator before anything was submitted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("item rejected with code {code}: {message}")]
pub struct ValidationError {
    /// Non-zero reason code
    pub code: i32,
    pub message: String,
}

impl ValidationError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        debug_assert!(code != 0, "0 is the code for a valid item");
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotificationParseError {
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("payload has no {0}")]
    MissingField(&'static str),

    #[error("unknown action {0:?}")]
    UnknownAction(String),

    #[error("payload for {schema}.{table} carries no row id in {field}")]
    MissingRowId {
        schema: String,
        table: String,
        field: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RowParseError {
    #[error("row has no identity column {0}")]
    MissingIdentity(String),

    #[error("row has no value for required field {0}")]
    MissingField(String),

    #[error("field {field}: expected {expected}, found {found}")]
    InvalidValue {
        field: String,
        expected: &'static str,
        found: String,
    },

    #[error("item JSON is not an object")]
    NotAnObject,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MirrorError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("item can't be written: {0}")]
    InvalidItem(#[from] RowParseError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("connection name already exists: {0}")]
    DuplicateName(String),

    #[error("don't have connection named {0}")]
    UnknownConnection(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

pub type Result<T> = std::result::Result<T, MirrorError>;
