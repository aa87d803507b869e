//! Cleanup bookkeeping for the `with_*` helpers.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt as _;

use crate::{Error, Result};

pub(crate) type Panic = Box<dyn Any + Send + 'static>;

/// Runs a scoped body, capturing a panic so cleanup can still run.
pub(crate) async fn run_body<Fut, T>(body: Fut) -> std::result::Result<anyhow::Result<T>, Panic>
where
    Fut: Future<Output = anyhow::Result<T>>,
{
    AssertUnwindSafe(body).catch_unwind().await
}

/// Resolves a scope once cleanup has run.
///
/// A panicking body is resumed after cleanup. A failing body wins over a
/// failing cleanup, whose error is logged; when the body succeeded, a
/// cleanup failure becomes the result.
pub(crate) fn finish<T>(
    body: std::result::Result<anyhow::Result<T>, Panic>,
    cleanup: Result<()>,
    what: &str,
) -> anyhow::Result<T> {
    match body {
        Ok(result) => finish_scope(result, cleanup, what),
        Err(panic) => {
            if let Err(err) = cleanup {
                tracing::warn!(error = %err, scope = what, "cleanup failed after a panic");
            }
            std::panic::resume_unwind(panic)
        }
    }
}

pub(crate) fn finish_scope<T>(
    body: anyhow::Result<T>,
    cleanup: Result<()>,
    what: &str,
) -> anyhow::Result<T> {
    merge(body, cleanup, what, |err| {
        anyhow::Error::new(err).context(format!("cleanup of {what} failed"))
    })
}

/// [`finish_scope`] for crate-internal steps that return [`crate::Error`].
pub(crate) fn merge_cleanup<T>(body: Result<T>, cleanup: Result<()>, what: &str) -> Result<T> {
    merge(body, cleanup, what, |err| err)
}

fn merge<T, E>(
    body: std::result::Result<T, E>,
    cleanup: Result<()>,
    what: &str,
    surface: impl FnOnce(Error) -> E,
) -> std::result::Result<T, E> {
    match (body, cleanup) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(err)) => Err(surface(err)),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(cleanup_err)) => {
            tracing::warn!(
                error = %cleanup_err,
                scope = what,
                "cleanup failed after an earlier error"
            );
            Err(err)
        }
    }
}
