use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("broker did not confirm the connection within {0:?}")]
    Timeout(Duration),

    #[error("broker refused the connection: {0}")]
    Refused(String),

    #[error("failed to resubscribe to '{address}': {reason}")]
    Resubscribe { address: String, reason: String },
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("publish to '{address}' timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },

    #[error("publish to '{address}' failed: {reason}")]
    Transport { address: String, reason: String },

    #[error("reconnect before publishing to '{address}' failed: {source}")]
    Reconnect {
        address: String,
        #[source]
        source: ConnectError,
    },
}

#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("subscribing to '{address}' needs a connection: {source}")]
    Connect {
        address: String,
        #[source]
        source: ConnectError,
    },

    #[error("subscribe to '{address}' timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },

    #[error("subscribe to '{address}' failed: {reason}")]
    Transport { address: String, reason: String },
}
