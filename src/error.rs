use thiserror::Error;

#[derive(Error, Debug)]
pub enum SaucrError {
    #[error("module failed to start: duplicated start")]
    DuplicateStart,

    #[error("module failed to comply: cannot change {0} while running")]
    Unchangeable(&'static str),

    #[error("module failed to start: response channel is not set")]
    ResponseChannelUnset,

    #[error("{kind} not found for rack {rack:?} file {file:?}")]
    NotFound {
        kind: &'static str,
        rack: String,
        file: String,
    },

    #[error("message file denied the operation: {0}")]
    ImfDenied(String),

    #[error("message file operation timed out: {0}")]
    ImfTimeout(String),

    #[error("message file internal error: {0}")]
    ImfInternal(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("illegal monitor config: {0}")]
    MonitorConfig(String),

    #[error("illegal persistence config: {0}")]
    PersistentConfig(String),

    #[error("monitor activation is disabled")]
    ActivationDisabled,

    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SaucrError>;
