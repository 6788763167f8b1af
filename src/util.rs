//! Helpers for running synchronous work from async code.

use tokio::task::spawn_blocking;

use crate::{Error, Result};

/// Run `f` on the blocking pool so libgit2 and filesystem calls stay off
/// the async workers.
pub async fn blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    spawn_blocking(f)
        .await
        .map_err(|e| Error::TaskJoin(e.to_string()))?
}
