//! Bounded retry of backend calls with exponential backoff.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

use blockdex_core::error::{BackendError, BlockdexError, SyncError};

/// First backoff delay.
pub const BACKOFF_START: Duration = Duration::from_millis(500);
/// Backoff never grows beyond this.
pub const BACKOFF_MAX: Duration = Duration::from_secs(16);

/// Retry policy shared by the sync and mempool loops.
#[derive(Debug, Clone)]
pub struct Retry {
    pub attempts: u32,
    pub timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

impl Retry {
    pub fn new(attempts: u32, timeout: Duration, shutdown: watch::Receiver<bool>) -> Self {
        Self { attempts: attempts.max(1), timeout, shutdown }
    }

    pub fn is_interrupted(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn check_interrupted(&self) -> Result<(), BlockdexError> {
        if self.is_interrupted() {
            return Err(SyncError::OperationInterrupted.into());
        }
        Ok(())
    }

    /// Run `f` once under the call timeout, without retrying.
    pub async fn once<T, F, Fut>(&self, f: F) -> Result<T, BackendError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        match tokio::time::timeout(self.timeout, f()).await {
            Ok(r) => r,
            Err(_) => Err(BackendError::Timeout(self.timeout.as_secs())),
        }
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, or the
    /// attempts are used up. Sleeps between attempts are cut short by the
    /// shutdown signal.
    pub async fn call<T, F, Fut>(&self, what: &str, mut f: F) -> Result<T, BlockdexError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let mut backoff = BACKOFF_START;
        let mut attempt = 0;
        loop {
            self.check_interrupted()?;
            let err = match self.once(&mut f).await {
                Ok(v) => return Ok(v),
                Err(e) if !e.is_retryable() => return Err(e.into()),
                Err(e) => e,
            };
            attempt += 1;
            if attempt >= self.attempts {
                return Err(SyncError::RetriesExhausted { attempts: attempt, last: err.to_string() }.into());
            }
            warn!(what, attempt, error = %err, backoff_ms = backoff.as_millis() as u64, "backend call failed, retrying");
            self.sleep(backoff).await?;
            backoff = next_backoff(backoff);
        }
    }

    /// Sleep for `d` unless shutdown is signalled first.
    pub async fn sleep(&self, d: Duration) -> Result<(), BlockdexError> {
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(d) => Ok(()),
            _ = shutdown.wait_for(|v| *v) => Err(SyncError::OperationInterrupted.into()),
        }
    }
}

pub fn next_backoff(d: Duration) -> Duration {
    (d * 2).min(BACKOFF_MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn retry(attempts: u32) -> (Retry, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        (Retry::new(attempts, Duration::from_secs(1), rx), tx)
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut d = BACKOFF_START;
        let mut seen = vec![d];
        for _ in 0..7 {
            d = next_backoff(d);
            seen.push(d);
        }
        assert_eq!(seen[1], Duration::from_secs(1));
        assert_eq!(seen[5], Duration::from_secs(16));
        assert_eq!(seen[7], BACKOFF_MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried() {
        let (r, _tx) = retry(5);
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let v = r
            .call("test", || {
                let n = c.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 { Err(BackendError::Unavailable("down".into())) } else { Ok(n) }
                }
            })
            .await
            .unwrap();
        assert_eq!(v, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn not_found_is_not_retried() {
        let (r, _tx) = retry(5);
        let calls = AtomicU32::new(0);
        let err = r
            .call("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(BackendError::NotFound("x".into())) }
            })
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_are_bounded() {
        let (r, _tx) = retry(3);
        let err = r
            .call("test", || async { Err::<(), _>(BackendError::Timeout(1)) })
            .await
            .unwrap_err();
        assert!(matches!(err, BlockdexError::Sync(SyncError::RetriesExhausted { attempts: 3, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out() {
        let (r, _tx) = retry(1);
        let err = r
            .once(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, BackendError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err, BackendError::Timeout(1));
    }

    #[tokio::test]
    async fn shutdown_interrupts_backoff() {
        let (r, tx) = retry(10);
        tx.send(true).unwrap();
        let err = r.sleep(Duration::from_secs(3600)).await.unwrap_err();
        assert!(err.is_interrupted());
        let err = r.call("test", || async { Ok::<_, BackendError>(1) }).await.unwrap_err();
        assert!(err.is_interrupted());
    }
}
