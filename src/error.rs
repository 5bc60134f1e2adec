use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors raised while reading the upstream instrument feed.
#[derive(Debug, Error)]
pub enum FeedError {
    /// Dialing the upstream endpoint failed.
    #[error("failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tungstenite::Error,
    },

    /// The frame was not valid JSON.
    #[error("failed to decode frame: {0}")]
    Decode(#[from] serde_json::Error),

    /// An "update" frame whose record is missing fields or has wrong types.
    #[error("update frame does not match the instrument schema: {0}")]
    SchemaMismatch(String),

    /// Reading from an established upstream session failed.
    #[error("upstream transport error: {0}")]
    Transport(#[source] tungstenite::Error),

    /// The upstream closed the session.
    #[error("upstream closed the connection")]
    Closed,

    #[error("maximum reconnection attempts ({0}) exceeded")]
    MaxReconnectAttemptsExceeded(u32),
}

/// Errors raised while decoding a subscriber command frame.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to decode command: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("command has no action")]
    MissingAction,

    #[error("unknown command action: {0}")]
    UnknownAction(String),
}

/// Errors that terminate a single subscriber connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("write deadline of {0:?} exceeded")]
    WriteTimeout(std::time::Duration),

    #[error("no frames received for {0:?}")]
    ReadTimeout(std::time::Duration),

    #[error("failed to encode update: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = FeedError::SchemaMismatch("missing field `symbol`".to_string());
        assert_eq!(
            err.to_string(),
            "update frame does not match the instrument schema: missing field `symbol`"
        );

        let err = CommandError::UnknownAction("resubscribe".to_string());
        assert_eq!(err.to_string(), "unknown command action: resubscribe");

        let err = ConfigError::Invalid {
            name: "SINK_QUEUE_CAPACITY",
            value: "zero".to_string(),
            reason: "invalid digit found in string".to_string(),
        };
        assert!(err.to_string().contains("SINK_QUEUE_CAPACITY"));
    }
}
