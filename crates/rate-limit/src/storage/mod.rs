//! Storage backends executing atomic scripts.

use std::time::Duration;

use redis::{FromRedisValue, Value};

use crate::script::Script;

pub mod memory;
mod redis_pool;
pub mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// A backing store that executes atomic scripts.
///
/// Every call runs the whole script without interleaving other operations on the
/// same keys. Implementations must load a script on demand when the store does not
/// know it yet, retrying the call exactly once.
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Execute `script` with the given keys and arguments.
    async fn exec(&self, script: &'static Script, keys: &[String], args: &[String]) -> Result<Value, StorageError>;
}

/// Errors that can occur in storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The store could not be reached. The command was not sent.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The connection failed while the command was in flight.
    #[error("Connection interrupted: {0}")]
    Interrupted(String),

    /// The store did not answer in time.
    #[error("Store did not respond within {0:?}")]
    Timeout(Duration),

    /// The store does not know the script hash.
    #[error("Script is not loaded in the store")]
    NoScript,

    /// The store rejected the command.
    #[error("Query error: {0}")]
    Query(String),

    /// The script replied with something the caller cannot decode.
    #[error("Unexpected reply from script {script}: {message}")]
    UnexpectedReply {
        /// Name of the script.
        script: &'static str,
        /// What went wrong.
        message: String,
    },

    /// Internal storage error.
    #[error("Storage error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Connection(_) | StorageError::Interrupted(_) | StorageError::Timeout(_)
        )
    }

    /// Whether the store may have run the command despite the error.
    pub fn may_have_run(&self) -> bool {
        matches!(self, StorageError::Interrupted(_) | StorageError::Timeout(_))
    }
}

impl From<redis::RedisError> for StorageError {
    fn from(error: redis::RedisError) -> Self {
        if error.kind() == redis::ErrorKind::NoScriptError {
            StorageError::NoScript
        } else if error.is_connection_refusal() {
            StorageError::Connection(error.to_string())
        } else if error.is_io_error() || error.is_connection_dropped() || error.is_timeout() {
            StorageError::Interrupted(error.to_string())
        } else {
            StorageError::Query(error.to_string())
        }
    }
}

/// Decode a script reply into `T`.
pub(crate) fn decode<T: FromRedisValue>(script: &Script, value: &Value) -> Result<T, StorageError> {
    T::from_redis_value(value).map_err(|e| StorageError::UnexpectedReply {
        script: script.name(),
        message: e.to_string(),
    })
}
