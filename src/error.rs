//! Error types for the Cluster State Registry
//!
//! Stale or missing distributed state is never an error here: removing an
//! unknown entry or cleaning up an unknown node are defined no-ops. Errors
//! are reserved for malformed input at the protocol boundary, transport
//! failures, configuration problems and lifecycle misuse.

use thiserror::Error;

/// Unified error type for the registry
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Configuration parse error: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    #[error("Malformed cluster message: {0}")]
    MalformedMessage(String),

    #[error("Cluster message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Transport error on topic {topic}: {reason}")]
    Transport { topic: String, reason: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    #[error("Registry has been shut down")]
    Shutdown,

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is transient
    ///
    /// Transient errors may succeed when retried by a higher layer. The
    /// registry itself never retries: publishes are fire-and-forget.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }

    /// Check if this error came from decoding inbound wire data
    pub fn is_protocol_error(&self) -> bool {
        matches!(self, Error::MalformedMessage(_) | Error::Codec(_))
    }
}

/// Result type alias for the registry
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let err = Error::Transport {
            topic: "state".into(),
            reason: "connection reset".into(),
        };
        assert!(err.is_transient());
        assert!(!err.is_protocol_error());

        let err = Error::MalformedMessage("empty entry name".into());
        assert!(err.is_protocol_error());
        assert!(!err.is_transient());

        let err = Error::Configuration("bad config".into());
        assert!(!err.is_transient());
        assert!(!err.is_protocol_error());
    }

    #[test]
    fn test_codec_error_conversion() {
        let parse = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = parse.into();
        assert!(err.is_protocol_error());
        assert!(err.to_string().starts_with("Cluster message codec error"));
    }
}
