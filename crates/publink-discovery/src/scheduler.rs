//! Bounded request scheduler shared by every external search client.
//!
//! One instance fronts all PubMed traffic for the whole process
//! (concurrency ≤ 4, ≤ 8 request starts per rolling second, 30 s per
//! request, 3 retries with exponential backoff); the web-search client
//! gets its own instance with its own quota. The scheduler is created
//! by the driver and passed down explicitly.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use publink_common::{PublinkError, Result};
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

pub struct RequestScheduler {
    semaphore: Semaphore,
    window: Mutex<VecDeque<Instant>>,
    max_per_second: usize,
    request_timeout: Duration,
    max_retries: u32,
}

impl RequestScheduler {
    pub fn new(
        max_in_flight: usize,
        max_per_second: usize,
        request_timeout: Duration,
        max_retries: u32,
    ) -> Self {
        Self {
            semaphore: Semaphore::new(max_in_flight),
            window: Mutex::new(VecDeque::new()),
            max_per_second,
            request_timeout,
            max_retries,
        }
    }

    /// The process-wide PubMed policy.
    pub fn pubmed() -> Self {
        Self::new(4, 8, Duration::from_secs(30), 3)
    }

    /// The web-search quota.
    pub fn web_search() -> Self {
        Self::new(2, 2, Duration::from_secs(30), 3)
    }

    /// Run `op` under the concurrency cap, rate window, timeout, and
    /// retry policy. Non-transient errors stop retries immediately.
    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            let permit = self
                .semaphore
                .acquire()
                .await
                .expect("scheduler semaphore closed");
            self.wait_for_rate_slot().await;

            let outcome = tokio::time::timeout(self.request_timeout, op()).await;
            drop(permit);

            match outcome {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if !is_transient(&e) => return Err(e),
                Ok(Err(e)) if attempt >= self.max_retries => {
                    warn!(label, attempt, error = %e, "Request failed, retries exhausted");
                    return Err(e);
                }
                Ok(Err(e)) => {
                    debug!(label, attempt, error = %e, "Transient failure, backing off");
                }
                Err(_) if attempt >= self.max_retries => {
                    return Err(PublinkError::Pubmed(format!(
                        "{label}: timed out after {:?} ({} attempts)",
                        self.request_timeout,
                        attempt + 1
                    )));
                }
                Err(_) => {
                    debug!(label, attempt, "Request timed out, backing off");
                }
            }

            attempt += 1;
            tokio::time::sleep(backoff_delay(attempt)).await;
        }
    }

    /// Block until starting a request keeps us within the rolling
    /// one-second window.
    async fn wait_for_rate_slot(&self) {
        loop {
            let wait = {
                let mut window = self.window.lock().await;
                let now = Instant::now();
                while let Some(front) = window.front() {
                    if now.duration_since(*front) >= Duration::from_secs(1) {
                        window.pop_front();
                    } else {
                        break;
                    }
                }
                if window.len() < self.max_per_second {
                    window.push_back(now);
                    None
                } else {
                    window
                        .front()
                        .map(|front| Duration::from_secs(1).saturating_sub(now.duration_since(*front)))
                }
            };

            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d.max(Duration::from_millis(5))).await,
            }
        }
    }
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(500u64.saturating_mul(1 << attempt.min(6)))
}

/// Network-level failures retry; everything the caller produced
/// deliberately (parse failures, cancellation) does not.
fn is_transient(e: &PublinkError) -> bool {
    match e {
        PublinkError::Http(inner) => !inner.is_builder(),
        PublinkError::Pubmed(msg) | PublinkError::WebSearch(msg) => {
            msg.contains("HTTP 5") || msg.contains("HTTP 429") || msg.contains("timed out")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_success_passes_through() {
        let sched = RequestScheduler::new(2, 100, Duration::from_secs(5), 3);
        let out: String = sched
            .run("ok", || async { Ok("done".to_string()) })
            .await
            .unwrap();
        assert_eq!(out, "done");
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let sched = RequestScheduler::new(2, 100, Duration::from_secs(5), 3);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let out = sched
            .run("flaky", move || {
                let calls = calls2.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(PublinkError::Pubmed("HTTP 503".to_string()))
                    } else {
                        Ok(42u32)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_transient_error_stops_immediately() {
        let sched = RequestScheduler::new(2, 100, Duration::from_secs(5), 3);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let out: Result<u32> = sched
            .run("fatal", move || {
                let calls = calls2.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(PublinkError::Parse("bad payload".to_string()))
                }
            })
            .await;
        assert!(out.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_window_spaces_out_bursts() {
        let sched = Arc::new(RequestScheduler::new(16, 4, Duration::from_secs(5), 0));
        let start = std::time::Instant::now();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let sched = sched.clone();
            handles.push(tokio::spawn(async move {
                sched.run("burst", || async { Ok(()) }).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        // 8 requests at 4/s need at least one full window rollover.
        assert!(start.elapsed() >= Duration::from_millis(900));
    }
}
