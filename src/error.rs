//! Crate-wide error type.
//!
//! Every subsystem gets its own `thiserror` enum; `Error` wraps each behind
//! a transparent variant plus a catch-all for ad-hoc `anyhow::Context`.

use serde::Serialize;

pub type Result<T> = std::result::Result<T, Error>;

/// Closed taxonomy every domain error maps to, so HTTP handlers never have
/// to match on every leaf variant of every subsystem enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    BadRequest,
    Conflict,
    PermissionDenied,
    DependencyUnavailable,
    Timeout,
    AdapterParseError,
    AdapterRuntimeError,
    Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Webhook(#[from] WebhookError),

    #[error(transparent)]
    Cron(#[from] CronError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Secrets(#[from] SecretsError),

    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(e) => e.kind(),
            Error::Db(e) => e.kind(),
            Error::Adapter(e) => e.kind(),
            Error::Container(e) => e.kind(),
            Error::Session(e) => e.kind(),
            Error::Task(e) => e.kind(),
            Error::Batch(e) => e.kind(),
            Error::Webhook(e) => e.kind(),
            Error::Cron(e) => e.kind(),
            Error::Channel(e) => e.kind(),
            Error::Secrets(e) => e.kind(),
            Error::Auth(e) => e.kind(),
            Error::Other(_) => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("invalid configuration value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error("record not found")]
    NotFound,
    #[error("failed to allocate a unique identifier after {0} retries")]
    RetriesExhausted(u32),
}

impl DbError {
    fn kind(&self) -> ErrorKind {
        match self {
            DbError::NotFound => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("unknown engine adapter: {0}")]
    UnknownAdapter(String),
    #[error("failed to spawn adapter process: {0}")]
    Spawn(String),
    #[error("adapter produced unparseable output: {0}")]
    Parse(String),
    #[error("adapter process exited abnormally: {0}")]
    Runtime(String),
    #[error("adapter call timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("operation cancelled")]
    Cancelled,
}

impl AdapterError {
    fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::UnknownAdapter(_) => ErrorKind::BadRequest,
            AdapterError::Spawn(_) | AdapterError::Runtime(_) => ErrorKind::AdapterRuntimeError,
            AdapterError::Parse(_) => ErrorKind::AdapterParseError,
            AdapterError::Timeout(_) => ErrorKind::Timeout,
            AdapterError::Cancelled => ErrorKind::Internal,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("container not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),
    #[error("container engine unavailable: {0}")]
    DependencyUnavailable(String),
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl ContainerError {
    fn kind(&self) -> ErrorKind {
        match self {
            ContainerError::NotFound(_) => ErrorKind::NotFound,
            ContainerError::DependencyUnavailable(_) => ErrorKind::DependencyUnavailable,
            ContainerError::Timeout(_) => ErrorKind::Timeout,
            ContainerError::Docker(_) => ErrorKind::AdapterRuntimeError,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),
    #[error("session {0} is not in a state that allows this operation")]
    InvalidState(String),
}

impl SessionError {
    fn kind(&self) -> ErrorKind {
        match self {
            SessionError::NotFound(_) => ErrorKind::NotFound,
            SessionError::InvalidState(_) => ErrorKind::Conflict,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("task not found: {0}")]
    NotFound(String),
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
    #[error("task {0} already has a turn in flight")]
    TurnInFlight(String),
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl TaskError {
    fn kind(&self) -> ErrorKind {
        match self {
            TaskError::NotFound(_) => ErrorKind::NotFound,
            TaskError::InvalidTransition { .. } | TaskError::TurnInFlight(_) => ErrorKind::Conflict,
            TaskError::BadRequest(_) => ErrorKind::BadRequest,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("batch not found: {0}")]
    NotFound(String),
    #[error("batch task not found: {0}")]
    TaskNotFound(String),
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },
}

impl BatchError {
    fn kind(&self) -> ErrorKind {
        match self {
            BatchError::NotFound(_) | BatchError::TaskNotFound(_) => ErrorKind::NotFound,
            BatchError::InvalidTransition { .. } => ErrorKind::Conflict,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("webhook subscription not found: {0}")]
    NotFound(String),
    #[error("invalid target url: {0}")]
    InvalidUrl(String),
}

impl WebhookError {
    fn kind(&self) -> ErrorKind {
        match self {
            WebhookError::NotFound(_) => ErrorKind::NotFound,
            WebhookError::InvalidUrl(_) => ErrorKind::BadRequest,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CronError {
    #[error("cron job not found: {0}")]
    NotFound(String),
    #[error("invalid cron expression: {0}")]
    InvalidExpression(String),
    #[error("cron job {0} already registered")]
    AlreadyExists(String),
}

impl CronError {
    fn kind(&self) -> ErrorKind {
        match self {
            CronError::NotFound(_) => ErrorKind::NotFound,
            CronError::InvalidExpression(_) => ErrorKind::BadRequest,
            CronError::AlreadyExists(_) => ErrorKind::AlreadyExists,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel session not found: {0}")]
    NotFound(String),
}

impl ChannelError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::NotFound
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SecretsError {
    #[error("failed to encrypt secret")]
    Encrypt,
    #[error("failed to decrypt secret, key may have changed")]
    Decrypt,
}

impl SecretsError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing credentials")]
    Missing,
    #[error("invalid credentials")]
    Invalid,
}

impl AuthError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::PermissionDenied
    }
}
