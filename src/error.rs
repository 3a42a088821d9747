use thiserror::Error;

use crate::topic::TopicError;

pub type Result<T, E = RouteError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum RouteError {
    ///`subscribe` was handed something that cannot receive messages.
    #[error("invalid subscriber")]
    InvalidSubscriber,
    ///`unsubscribe` for a filter the owner never held.
    #[error("subscription not found")]
    NotFound,
    #[error("topic error, {0}")]
    Topic(#[from] TopicError),
    ///The peer's mailbox is gone.
    #[error("mailbox closed")]
    Closed,
    #[error("{0}")]
    Msg(String),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Anyhow(#[from] anyhow::Error),
}

impl From<String> for RouteError {
    #[inline]
    fn from(e: String) -> Self {
        RouteError::Msg(e)
    }
}

impl From<&str> for RouteError {
    #[inline]
    fn from(e: &str) -> Self {
        RouteError::Msg(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RouteError {
    #[inline]
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RouteError::Closed
    }
}
