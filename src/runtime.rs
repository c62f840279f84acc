//! Deadlines and blocking-work helpers shared by the async layers

use std::future::Future;
use std::io;
use std::time::Duration;

use crate::error::{Result, TransferError};

/// Bound `fut` by `limit`; an expired deadline becomes `ErrorKind::TimedOut`
pub(crate) async fn with_deadline<T, F>(limit: Option<Duration>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("deadline of {:?} elapsed", limit),
            ))
        }),
        None => fut.await,
    }
}

/// Bound a fallible protocol step; expiry is a `Transport` error tagged with `context`
pub(crate) async fn bounded<T, F>(limit: Option<Duration>, context: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
            Err(TransferError::Transport {
                context,
                source: io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("deadline of {:?} elapsed", limit),
                ),
            })
        }),
        None => fut.await,
    }
}

/// Run CPU or filesystem bound work off the async workers
pub(crate) async fn run_blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| TransferError::Io(io::Error::new(io::ErrorKind::Other, e)))?
}
