//! Library error type

use thiserror::Error;

use crate::messages::AssetKey;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to start discovery command `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("discovery command `{command}` exited with {status}")]
    CommandFailed { command: String, status: String },

    #[error("invalid value for {key}: {reason}")]
    InvalidSetting { key: AssetKey, reason: String },

    #[error("invalid hardware address {0:?}")]
    InvalidMac(String),

    #[error("failed to publish {key}: {reason}")]
    Publish { key: String, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn invalid_setting(key: AssetKey, reason: impl Into<String>) -> Self {
        Self::InvalidSetting {
            key,
            reason: reason.into(),
        }
    }

    pub fn publish(key: impl Into<String>, reason: impl ToString) -> Self {
        Self::Publish {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}
