use thiserror::Error;

/// Errors raised by a single cache-store adapter.
///
/// The [`Broker`](crate::broker::Broker) swallows these for the fast backend and
/// only hands them out when the fallback adapter fails as well.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl BrokerError {
    /// Whether the backend could not be reached at all, as opposed to refusing
    /// a command (wrong type, not an integer, ...).
    pub fn is_unavailable(&self) -> bool {
        match self {
            BrokerError::Unavailable(_) => true,
            BrokerError::Redis(err) => {
                err.is_io_error()
                    || err.is_connection_dropped()
                    || err.is_connection_refusal()
                    || err.is_timeout()
            }
            BrokerError::Database(err) => matches!(
                err,
                sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed
            ),
            BrokerError::InvalidData(_) => false,
        }
    }
}

/// Errors raised by the persisted job table.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invalid data: {0}")]
    InvalidData(String),
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("no handler registered for queue '{0}'")]
    UnknownHandler(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_handler_names_the_queue() {
        let err = QueueError::UnknownHandler("webhooks".into());
        assert_eq!(err.to_string(), "no handler registered for queue 'webhooks'");
    }

    #[test]
    fn broker_errors_pass_through_queue_errors() {
        let err: QueueError = BrokerError::Unavailable("connection refused".into()).into();
        assert_eq!(err.to_string(), "backend unavailable: connection refused");
    }

    #[test]
    fn command_errors_are_not_outages() {
        assert!(BrokerError::Unavailable("timed out".into()).is_unavailable());
        assert!(!BrokerError::InvalidData("not an integer".into()).is_unavailable());

        let wrong_type: redis::RedisError = (
            redis::ErrorKind::TypeError,
            "WRONGTYPE Operation against a key holding the wrong kind of value",
        )
            .into();
        assert!(!BrokerError::from(wrong_type).is_unavailable());

        let refused: redis::RedisError =
            std::io::Error::from(std::io::ErrorKind::ConnectionRefused).into();
        assert!(BrokerError::from(refused).is_unavailable());
    }
}
