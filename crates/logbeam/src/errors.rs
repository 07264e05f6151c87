// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::io;

/// Failures a transport reports back to the dispatcher.
///
/// None of these cause a batch to be discarded: the dispatcher keeps the batch
/// and retries, re-authorizing first when the failure is `NotAuthorized`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No collector endpoint has been configured yet. A valid quiescent state.
    #[error("transport not configured")]
    NotConfigured,

    /// The handshake is missing or was rejected by the collector.
    #[error("not authorized")]
    NotAuthorized,

    #[error("network error: {0}")]
    Network(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl TransportError {
    pub fn network(err: impl std::fmt::Display) -> Self {
        Self::Network(err.to_string())
    }

    pub fn serialization(err: impl std::fmt::Display) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Network(err.to_string())
    }
}

/// Errors from the durable local state (positions and archive batches).
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage io error: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt persisted data: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("corrupt persisted data: {0}")]
    Invalid(String),
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}")]
    InvalidValue { var: &'static str, value: String },

    #[error("{0} must be set")]
    Missing(&'static str),
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery socket error: {0}")]
    Io(#[from] io::Error),

    #[error("discovery packet error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("live view server error: {0}")]
    Io(#[from] io::Error),
}

/// Failures while assembling a pipeline at startup.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            TransportError::Network("connection refused".into()).to_string(),
            "network error: connection refused"
        );
        assert_eq!(TransportError::NotAuthorized.to_string(), "not authorized");
        let err = ConfigError::InvalidValue {
            var: "LOGBEAM_LIVE_CAPACITY",
            value: "lots".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid value \"lots\" for LOGBEAM_LIVE_CAPACITY"
        );
    }

    #[test]
    fn test_storage_error_from_io() {
        let err: StorageError = io::Error::new(io::ErrorKind::Other, "disk full").into();
        assert!(matches!(err, StorageError::Io(_)));
        assert_eq!(err.to_string(), "storage io error: disk full");
    }
}
