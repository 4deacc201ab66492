use std::{error::Error as StdError, fmt, sync::Arc};
use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum BatchError {
    #[error("Processing failed for message {message_id}: {source}")]
    ProcessingError {
        message_id: String,
        #[source]
        source: ConsumerError,
    },

    #[error("Processing of message {message_id} exceeded {timeout_ms} ms")]
    ProcessingTimeout { message_id: String, timeout_ms: u64 },

    #[error("Consumer is closed")]
    ConsumerClosed,

    #[error("Acknowledgement error: {0}")]
    AcknowledgeError(String),

    #[error("Source connection error: {0}")]
    ConnectionError(String),

    #[error("Message serialization error: {0}")]
    SerializationError(String),

    #[error("Message deserialization error: {0}")]
    DeserializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type BatchResult<T> = Result<T, BatchError>;

impl BatchError {
    /// Id of the message whose processing failed, if this is a processing failure.
    pub fn message_id(&self) -> Option<&str> {
        match self {
            BatchError::ProcessingError { message_id, .. }
            | BatchError::ProcessingTimeout { message_id, .. } => Some(message_id),
            _ => None,
        }
    }
}

#[cfg(feature = "redis")]
impl From<fred::error::Error> for BatchError {
    fn from(err: fred::error::Error) -> Self {
        BatchError::ConnectionError(err.to_string())
    }
}

impl From<serde_json::Error> for BatchError {
    fn from(err: serde_json::Error) -> Self {
        match err.classify() {
            serde_json::error::Category::Io => BatchError::SerializationError(err.to_string()),
            serde_json::error::Category::Syntax
            | serde_json::error::Category::Data
            | serde_json::error::Category::Eof => {
                BatchError::DeserializationError(err.to_string())
            }
        }
    }
}

/// Error returned by a [`Processor`](crate::Processor) or an
/// [`Acknowledger`](crate::Acknowledger). Cheap to clone so a single failure
/// can be logged and surfaced to the caller of `flush`.
#[derive(Debug, Clone)]
pub struct ConsumerError(Arc<dyn StdError + Send + Sync>);

impl fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl StdError for ConsumerError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

impl ConsumerError {
    pub fn new<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        ConsumerError(Arc::new(error))
    }

    /// Build an error from a plain message.
    pub fn msg(message: impl Into<String>) -> Self {
        let message: String = message.into();
        let boxed: Box<dyn StdError + Send + Sync> = message.into();

        ConsumerError(Arc::from(boxed))
    }
}

impl From<BatchError> for ConsumerError {
    fn from(error: BatchError) -> Self {
        ConsumerError(Arc::new(error))
    }
}

#[cfg(feature = "anyhow")]
impl From<anyhow::Error> for ConsumerError {
    fn from(error: anyhow::Error) -> Self {
        let boxed: Box<dyn StdError + Send + Sync> = error.into();

        ConsumerError(Arc::from(boxed))
    }
}

#[cfg(feature = "eyre")]
impl From<eyre::Report> for ConsumerError {
    fn from(error: eyre::Report) -> Self {
        let boxed: Box<dyn StdError + Send + Sync> = error.into();

        ConsumerError(Arc::from(boxed))
    }
}
