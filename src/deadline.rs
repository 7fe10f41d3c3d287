//! Time helpers for async service code.

use std::future::Future;
use std::time::Duration;

use crate::types::{Error, Result};

/// Fail with [`Error::Timeout`] if `future` does not settle within `duration`.
pub async fn timeout<F, T>(duration: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!(
            "operation did not finish within {duration:?}"
        ))),
    }
}

/// Sleep for `duration`.
pub async fn delay(duration: Duration) {
    tokio::time::sleep(duration).await;
}

/// Apply `limit` to `future` if set, naming `label` in the error.
pub(crate) async fn within<F, T>(limit: Option<Duration>, label: &str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let Some(limit) = limit else {
        return future.await;
    };
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::timeout(format!(
            "{label} did not finish within {limit:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_timeout_expires() {
        let result: Result<()> = timeout(Duration::from_millis(50), async {
            delay(Duration::from_millis(100)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_timeout_passes_result_through() {
        let ok = tokio_test::assert_ok!(timeout(Duration::from_millis(50), async { Ok(7) }).await);
        assert_eq!(ok, 7);

        let err: Result<()> =
            timeout(Duration::from_millis(50), async { Err(Error::internal("boom")) }).await;
        assert!(matches!(err, Err(Error::Internal(_))));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_within_names_the_call() {
        let err = tokio_test::assert_err!(
            within(Some(Duration::from_millis(10)), "Store::created", async {
                delay(Duration::from_secs(1)).await;
                Ok(())
            })
            .await
        );
        assert!(err.to_string().contains("Store::created"));

        let unlimited = within(None, "x", async { Ok(1) }).await.unwrap();
        assert_eq!(unlimited, 1);
    }
}
