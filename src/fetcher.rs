use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use crate::client::{FetchError, PlatformApi};
use crate::config::ApiConfig;

/// Process-wide request pacing: one slot queue shared by every worker, so
/// aggregate request rate stays within the platform's tolerance regardless
/// of parallelism.
pub struct RateLimiter {
    min_interval: Duration,
    next_slot: Mutex<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    /// Block until this caller's reserved slot arrives.
    pub fn acquire(&self) {
        let wait = {
            let mut next = self
                .next_slot
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let now = Instant::now();
            let slot = (*next).max(now);
            *next = slot + self.min_interval;
            slot.saturating_duration_since(now)
        };
        // Sleep outside the lock so concurrent callers queue up slots
        // instead of serializing on the mutex.
        if !wait.is_zero() {
            thread::sleep(wait);
        }
    }
}

/// Bounded exponential backoff for transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        (self.backoff_base.saturating_mul(factor)).min(self.backoff_max)
    }
}

/// Outcome of one paginated crawl. `error` is set when a page failed after
/// retries; items already handed to the sink stay persisted.
#[derive(Debug)]
pub struct PageOutcome {
    pub fetched: usize,
    pub pages: usize,
    pub error: Option<FetchError>,
}

/// Wraps the platform API collaborator with shared rate limiting, bounded
/// retry, and restartable offset pagination.
pub struct Fetcher {
    api: Arc<dyn PlatformApi>,
    limiter: RateLimiter,
    retry: RetryPolicy,
    page_size: usize,
}

impl Fetcher {
    pub fn new(api: Arc<dyn PlatformApi>, config: &ApiConfig) -> Self {
        Self {
            api,
            limiter: RateLimiter::new(Duration::from_millis(config.request_delay_ms)),
            retry: RetryPolicy {
                max_attempts: config.max_retries,
                backoff_base: Duration::from_millis(config.backoff_base_ms),
                backoff_max: Duration::from_millis(config.backoff_max_ms),
            },
            page_size: config.page_size,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Issue one logical API call: acquire a rate-limit slot per attempt,
    /// retry transient failures with backoff, surface the typed error on
    /// exhaustion.
    pub fn call<T>(
        &self,
        op: impl Fn(&dyn PlatformApi) -> Result<T, FetchError>,
    ) -> Result<T, FetchError> {
        let mut attempt = 0u32;
        loop {
            self.limiter.acquire();
            match op(self.api.as_ref()) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    log::warn!(
                        "transient fetch failure (attempt {}/{}): {e}; backing off {delay:?}",
                        attempt + 1,
                        self.retry.max_attempts
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Drive a paginated endpoint until exhaustion or `max_items`.
    ///
    /// Every page is handed to `on_page` before the next page is requested
    /// (spill-first), so an interrupted crawl leaves durable state behind
    /// and can resume. Sink errors propagate; fetch errors end the crawl
    /// and are reported in the outcome.
    pub fn paginated<T, E>(
        &self,
        max_items: usize,
        fetch_page: impl Fn(&dyn PlatformApi, usize, usize) -> Result<Vec<T>, FetchError>,
        mut on_page: impl FnMut(&[T]) -> Result<(), E>,
    ) -> Result<PageOutcome, E> {
        let mut outcome = PageOutcome {
            fetched: 0,
            pages: 0,
            error: None,
        };
        let mut offset = 0usize;

        while outcome.fetched < max_items {
            let limit = self.page_size.min(max_items - outcome.fetched);
            let batch = match self.call(|api| fetch_page(api, limit, offset)) {
                Ok(batch) => batch,
                Err(e) => {
                    outcome.error = Some(e);
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }

            on_page(&batch)?;
            outcome.fetched += batch.len();
            outcome.pages += 1;

            if batch.len() < limit {
                break; // Last page
            }
            offset += batch.len();
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ApiPlaylist, ApiTrack, ApiUser};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Minimal stub; fetcher tests drive it through closures, so the trait
    /// methods themselves never run.
    struct NoopApi;

    impl PlatformApi for NoopApi {
        fn resolve(&self, _url: &str) -> Result<ApiTrack, FetchError> {
            Err(FetchError::NotFound)
        }
        fn track(&self, _id: i64) -> Result<ApiTrack, FetchError> {
            Err(FetchError::NotFound)
        }
        fn track_likers(&self, _: i64, _: usize, _: usize) -> Result<Vec<ApiUser>, FetchError> {
            Ok(Vec::new())
        }
        fn track_reposters(&self, _: i64, _: usize, _: usize) -> Result<Vec<ApiUser>, FetchError> {
            Ok(Vec::new())
        }
        fn user_likes(&self, _: i64, _: usize, _: usize) -> Result<Vec<ApiTrack>, FetchError> {
            Ok(Vec::new())
        }
        fn user_playlists(&self, _: i64, _: usize, _: usize) -> Result<Vec<ApiPlaylist>, FetchError> {
            Ok(Vec::new())
        }
        fn playlist(&self, _: i64) -> Result<ApiPlaylist, FetchError> {
            Err(FetchError::NotFound)
        }
        fn user_tracks(&self, _: i64, _: usize, _: usize) -> Result<Vec<ApiTrack>, FetchError> {
            Ok(Vec::new())
        }
        fn search_tracks(&self, _: &str, _: usize, _: usize) -> Result<Vec<ApiTrack>, FetchError> {
            Ok(Vec::new())
        }
    }

    fn fast_fetcher(page_size: usize) -> Fetcher {
        Fetcher::new(
            Arc::new(NoopApi),
            &ApiConfig {
                request_delay_ms: 0,
                max_retries: 3,
                backoff_base_ms: 1,
                backoff_max_ms: 2,
                page_size,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_rate_limiter_spaces_calls() {
        let limiter = RateLimiter::new(Duration::from_millis(20));
        let start = Instant::now();
        limiter.acquire();
        limiter.acquire();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_backoff_caps_at_max() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(250),
        };
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(250));
        assert_eq!(policy.delay_for(10), Duration::from_millis(250));
    }

    #[test]
    fn test_call_retries_transient_then_succeeds() {
        let fetcher = fast_fetcher(50);
        let calls = AtomicUsize::new(0);
        let result = fetcher.call(|_| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(FetchError::Server(503))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_call_does_not_retry_not_found() {
        let fetcher = fast_fetcher(50);
        let calls = AtomicUsize::new(0);
        let result: Result<i32, _> = fetcher.call(|_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::NotFound)
        });
        assert!(matches!(result, Err(FetchError::NotFound)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_call_exhausts_attempts() {
        let fetcher = fast_fetcher(50);
        let calls = AtomicUsize::new(0);
        let result: Result<i32, _> = fetcher.call(|_| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(FetchError::RateLimited)
        });
        assert!(matches!(result, Err(FetchError::RateLimited)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_paginated_stops_on_short_page() {
        let fetcher = fast_fetcher(10);
        let mut sunk: Vec<usize> = Vec::new();
        let outcome = fetcher
            .paginated(
                100,
                |_, limit, offset| {
                    // 23 items total
                    let remaining = 23usize.saturating_sub(offset);
                    Ok((offset..offset + remaining.min(limit)).collect())
                },
                |page: &[usize]| -> Result<(), std::convert::Infallible> {
                    sunk.extend_from_slice(page);
                    Ok(())
                },
            )
            .unwrap();
        assert_eq!(outcome.fetched, 23);
        assert_eq!(outcome.pages, 3);
        assert!(outcome.error.is_none());
        assert_eq!(sunk.len(), 23);
    }

    #[test]
    fn test_paginated_respects_cap() {
        let fetcher = fast_fetcher(10);
        let outcome = fetcher
            .paginated(
                25,
                |_, limit, offset| Ok((offset..offset + limit).collect()),
                |_: &[usize]| -> Result<(), std::convert::Infallible> { Ok(()) },
            )
            .unwrap();
        assert_eq!(outcome.fetched, 25);
        // Final page was trimmed to the remaining budget
        assert_eq!(outcome.pages, 3);
    }

    #[test]
    fn test_paginated_persists_pages_before_failure() {
        let fetcher = fast_fetcher(10);
        let mut sunk: Vec<usize> = Vec::new();
        let outcome = fetcher
            .paginated(
                100,
                |_, limit, offset| {
                    if offset >= 10 {
                        Err(FetchError::Unexpected(403))
                    } else {
                        Ok((offset..offset + limit).collect())
                    }
                },
                |page: &[usize]| -> Result<(), std::convert::Infallible> {
                    sunk.extend_from_slice(page);
                    Ok(())
                },
            )
            .unwrap();
        // First page was sunk before the second page failed
        assert_eq!(sunk.len(), 10);
        assert_eq!(outcome.fetched, 10);
        assert!(matches!(outcome.error, Some(FetchError::Unexpected(403))));
    }
}
