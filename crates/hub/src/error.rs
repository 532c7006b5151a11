//! Error types for outbound HTTP calls (forecast provider and sprinkler device).
//!
//! Every variant is recoverable: callers log it and try again on the next
//! retry or poll tick.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HubError>;

#[derive(Error, Debug)]
pub enum HubError {
    /// Network failure or timeout reaching the endpoint
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// Endpoint answered with a non-success HTTP status
    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },

    /// Body could not be parsed, or was structurally short
    #[error("malformed response from {endpoint}: {reason}")]
    Parse { endpoint: String, reason: String },

    #[error("zone {0} is not configured")]
    UnknownZone(usize),
}

impl HubError {
    pub fn parse(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        Self::Parse {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }
}
