//! Optimistic-concurrency retry for read-modify-write cycles
//!
//! The Gateway is owned by the control plane and edited by many agents, so
//! it cannot be locked. Writers re-read and retry when the API server
//! rejects a write made against a stale resource version.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::Result;

/// Exponential backoff schedule
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    /// Delay before the second attempt
    pub duration: Duration,
    /// Multiplier applied after every attempt
    pub factor: f64,
    /// Random extra delay as a fraction of the current delay
    pub jitter: f64,
    /// Total number of attempts
    pub steps: u32,
    /// Upper bound for a single delay
    pub cap: Option<Duration>,
}

impl Default for Backoff {
    /// 10ms, 50ms, 250ms between four attempts
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(10),
            factor: 5.0,
            jitter: 0.1,
            steps: 4,
            cap: None,
        }
    }
}

impl Backoff {
    /// Delay to wait after the `attempt`-th failure (1-based), without jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16) as i32;
        let delay = self.duration.mul_f64(self.factor.max(1.0).powi(exp));
        match self.cap {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..self.jitter);
        delay + delay.mul_f64(extra)
    }
}

/// Run `op` until it succeeds, fails with a non-conflict error, or the
/// backoff runs out of steps. On exhaustion the last conflict is returned.
pub async fn retry_on_conflict<T, F, Fut>(backoff: &Backoff, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let steps = backoff.steps.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt < steps => {
                let delay = backoff.jittered(backoff.delay(attempt));
                debug!(attempt, ?delay, "write conflict, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> Backoff {
        Backoff {
            duration: Duration::from_millis(1),
            factor: 2.0,
            jitter: 0.0,
            steps: 4,
            cap: None,
        }
    }

    fn conflict() -> Error {
        Error::Conflict {
            name: "gw-1".to_string(),
        }
    }

    #[test]
    fn test_default_schedule() {
        let b = Backoff::default();
        assert_eq!(b.delay(1), Duration::from_millis(10));
        assert_eq!(b.delay(2), Duration::from_millis(50));
        assert_eq!(b.delay(3), Duration::from_millis(250));
    }

    #[test]
    fn test_cap() {
        let b = Backoff {
            cap: Some(Duration::from_millis(30)),
            ..Backoff::default()
        };
        assert_eq!(b.delay(3), Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_succeeds_after_conflicts() {
        let calls = AtomicU32::new(0);
        let result = retry_on_conflict(&fast(), || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(conflict())
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_conflict() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict(&fast(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(conflict())
        })
        .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict(&fast(), || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::NotFound {
                name: "gw-1".to_string(),
            })
        })
        .await;

        assert!(matches!(result, Err(Error::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
