//! Fixed-count retry for transient device failures.

use std::future::Future;
use tracing::warn;

use crate::error::{MxdcError, Result};

/// Run `op` up to `attempts` times, logging each failure.
///
/// The last failure is returned as [`MxdcError::Device`] for `device`.
pub async fn with_retries<T, F, Fut>(device: &str, action: &str, attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                warn!(
                    device = %device,
                    action = %action,
                    attempt,
                    error = %err,
                    "{} could not {}. Retrying",
                    device,
                    action
                );
                attempt += 1;
            }
            Err(err) => {
                return Err(MxdcError::device(
                    device,
                    err.context(format!("{action} failed after {attempts} attempts")),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tracing_test::traced_test;

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let value = with_retries("mca", "start", 3, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("not counting")
            }
            Ok(42)
        })
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        let err = with_retries("mca", "read", 3, move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(anyhow::anyhow!("no data"))
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, MxdcError::Device { ref device, .. } if device == "mca"));
        assert!(err.to_string().contains("read failed after 3 attempts"));
    }

    #[tokio::test]
    #[traced_test]
    async fn each_retry_is_logged() {
        let calls = AtomicU32::new(0);
        let calls = &calls;
        with_retries("ccd", "start", 3, move || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 1 {
                anyhow::bail!("busy")
            }
            Ok(())
        })
        .await
        .unwrap();
        assert!(logs_contain("ccd could not start. Retrying"));
    }
}
