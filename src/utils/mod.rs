//! The `utils` module provides utilities shared across `msgbus`: the error
//! taxonomy, logging initialization and the deadline helpers that bound
//! every broker round-trip.

pub mod error;
pub mod logging;

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use error::{Error, Result};

/// Awaits `fut`, failing with [`Error::Timeout`] once `limit` elapses.
pub async fn deadline<F: Future>(limit: Duration, fut: F) -> Result<F::Output> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| Error::Timeout(limit))
}

/// Runs a mid-session broker operation: client errors become
/// [`Error::Backend`], overruns become [`Error::Timeout`].
pub async fn within<T, E, F>(limit: Duration, fut: F) -> Result<T>
where
    E: Display,
    F: Future<Output = std::result::Result<T, E>>,
{
    deadline(limit, fut).await?.map_err(Error::backend)
}

/// Runs a construction-time handshake step. Any failure, including running
/// out of time, is reported as [`Error::FailedConnect`].
pub async fn connect_within<T, E, F>(backend: &'static str, limit: Duration, fut: F) -> Result<T>
where
    E: Display,
    F: Future<Output = std::result::Result<T, E>>,
{
    match deadline(limit, fut).await {
        Ok(res) => res.map_err(|e| Error::connect(backend, e)),
        Err(e) => Err(Error::connect(backend, e)),
    }
}
