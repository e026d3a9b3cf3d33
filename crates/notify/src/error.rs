//! Notification error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unknown subscriber: {0}")]
    UnknownSubscriber(String),

    #[error("subscriber channel closed: {0}")]
    ChannelClosed(String),
}
