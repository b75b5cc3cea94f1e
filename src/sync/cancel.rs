//! Cooperative cancellation
//!
//! One token per run; database and collection work get child tokens so a
//! fatal error can stop the remaining work without marking the run aborted.

use std::time::Duration;

pub use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Fail with `Cancelled` once the token has fired
pub fn ensure_active(token: &CancellationToken) -> Result<()> {
    if token.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

/// Sleep for `duration` unless the token fires first
pub async fn sleep_or_cancel(token: &CancellationToken, duration: Duration) -> Result<()> {
    tokio::select! {
        _ = token.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_child_observes_parent() {
        let run = CancellationToken::new();
        let work = run.child_token();
        assert!(ensure_active(&work).is_ok());

        run.cancel();
        assert!(matches!(ensure_active(&work), Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_sleep_interrupted() {
        let token = CancellationToken::new();
        let sleeper = token.clone();
        let handle = tokio::spawn(async move {
            sleep_or_cancel(&sleeper, Duration::from_secs(60)).await
        });
        token.cancel();
        assert!(matches!(handle.await.unwrap(), Err(Error::Cancelled)));
    }
}
