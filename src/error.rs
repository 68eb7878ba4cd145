//! Errors raised while talking to Home Assistant.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HaError>;

#[derive(Debug, Error)]
pub enum HaError {
    /// Home Assistant answered with a non-success status.
    #[error("HA API {status}: {reason} - {body}")]
    Status {
        status: u16,
        reason: String,
        body: String,
    },

    #[error("Cannot connect to Home Assistant at '{url}'. Check the URL and that Home Assistant is running.")]
    Connect { url: String },

    #[error("Timeout talking to Home Assistant at '{url}'")]
    Timeout { url: String },

    #[error("Network error accessing {endpoint}: {source}")]
    Network {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// The body did not have the shape the caller asked for.
    #[error("Failed to decode response from {endpoint}: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    /// A decoded body is not a list of state objects.
    #[error("Unexpected state list from {endpoint}: {source}")]
    Shape {
        endpoint: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl HaError {
    pub(crate) fn from_reqwest(err: reqwest::Error, base_url: &str, endpoint: &str) -> Self {
        if err.is_connect() {
            HaError::Connect {
                url: base_url.to_string(),
            }
        } else if err.is_timeout() {
            HaError::Timeout {
                url: base_url.to_string(),
            }
        } else if err.is_decode() {
            HaError::Decode {
                endpoint: endpoint.to_string(),
                source: err,
            }
        } else {
            HaError::Network {
                endpoint: endpoint.to_string(),
                source: err,
            }
        }
    }
}
