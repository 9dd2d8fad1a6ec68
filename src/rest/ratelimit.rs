use std::{
    future::Future,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::common::{
    cancel::{or_cancel, sleep_or_cancel},
    errors::LinkResult,
};

pub const HEADER_BUCKET: &str = "X-RateLimit-Bucket";
pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_RETRY_AFTER: &str = "Retry-After";

const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// Used when a 429 arrives without a usable `Retry-After`.
const FALLBACK_RETRY_AFTER: Duration = Duration::from_secs(1);

/// The bits of an HTTP response the limiter reads.
pub trait RateLimitHeaders {
    fn status_code(&self) -> u16;
    fn header_value(&self, name: &str) -> Option<&str>;
}

impl RateLimitHeaders for reqwest::Response {
    fn status_code(&self) -> u16 {
        self.status().as_u16()
    }

    fn header_value(&self, name: &str) -> Option<&str> {
        self.headers().get(name).and_then(|v| v.to_str().ok())
    }
}

/// Quota state for one server-assigned bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub id: String,
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_at: Option<SystemTime>,
}

impl Bucket {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            limit: None,
            remaining: None,
            reset_at: None,
        }
    }

    /// How long the next request has to hold off, if the quota is spent.
    pub fn wait_time(&self, now: SystemTime) -> Option<Duration> {
        if self.remaining != Some(0) {
            return None;
        }
        self.reset_at?.duration_since(now).ok()
    }

    /// Headers that are missing leave the previous value alone.
    pub fn update<R: RateLimitHeaders>(&mut self, response: &R) {
        if let Some(limit) = parse_header::<u32>(response, HEADER_LIMIT) {
            self.limit = Some(limit);
        }
        if let Some(remaining) = parse_header::<u32>(response, HEADER_REMAINING) {
            self.remaining = Some(remaining);
        }
        if let Some(reset_at) = parse_header::<f64>(response, HEADER_RESET)
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .and_then(|since_epoch| UNIX_EPOCH.checked_add(since_epoch))
        {
            self.reset_at = Some(reset_at);
        }
    }
}

fn parse_header<T: std::str::FromStr>(response: &impl RateLimitHeaders, name: &str) -> Option<T> {
    response.header_value(name)?.trim().parse().ok()
}

fn retry_after(response: &impl RateLimitHeaders) -> Duration {
    parse_header::<f64>(response, HEADER_RETRY_AFTER)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .unwrap_or(FALLBACK_RETRY_AFTER)
}

/// Serializes requests against one bucket and honours its quota.
///
/// The bucket lock is held for the whole of [`RateLimiter::perform`], waits
/// included, so at most one request per bucket is in flight. Separate limiters
/// never contend with each other.
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            bucket: Mutex::new(Bucket::new(id)),
        }
    }

    pub async fn snapshot(&self) -> Bucket {
        self.bucket.lock().await.clone()
    }

    /// Re-labels a provisional limiter once the server names its bucket.
    pub async fn rename(&self, id: &str) {
        let mut bucket = self.bucket.lock().await;
        if bucket.id != id {
            bucket.id = id.to_string();
        }
    }

    /// Runs `request` until the server stops answering 429.
    ///
    /// No retry cap. `cancel` interrupts every wait,
    /// including the wait for the bucket lock.
    pub async fn perform<F, Fut, R>(&self, mut request: F, cancel: &CancellationToken) -> LinkResult<R>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = LinkResult<R>>,
        R: RateLimitHeaders,
    {
        let mut bucket = or_cancel(self.bucket.lock(), cancel).await?;

        loop {
            if let Some(wait) = bucket.wait_time(SystemTime::now()) {
                debug!("[bucket {}] quota exhausted, waiting {:?}", bucket.id, wait);
                sleep_or_cancel(wait, cancel).await?;
            }

            let response = request().await?;
            bucket.update(&response);

            if response.status_code() != STATUS_TOO_MANY_REQUESTS {
                return Ok(response);
            }

            let wait = retry_after(&response);
            warn!("[bucket {}] rate limited, retrying in {:?}", bucket.id, wait);
            sleep_or_cancel(wait, cancel).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::errors::LinkError;
    use std::{
        collections::HashMap,
        sync::{
            Arc,
            atomic::{AtomicUsize, Ordering},
        },
        time::Instant,
    };

    #[derive(Clone, Debug)]
    struct MockResponse {
        status: u16,
        headers: HashMap<&'static str, String>,
    }

    impl MockResponse {
        fn ok() -> Self {
            Self {
                status: 200,
                headers: HashMap::new(),
            }
        }

        fn limited(retry_after_secs: f64) -> Self {
            Self::ok()
                .status(429)
                .header(HEADER_RETRY_AFTER, retry_after_secs.to_string())
        }

        fn status(mut self, status: u16) -> Self {
            self.status = status;
            self
        }

        fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
            self.headers.insert(name, value.into());
            self
        }
    }

    impl RateLimitHeaders for MockResponse {
        fn status_code(&self) -> u16 {
            self.status
        }

        fn header_value(&self, name: &str) -> Option<&str> {
            self.headers.get(name).map(String::as_str)
        }
    }

    fn epoch_secs_in(delay: Duration) -> f64 {
        (SystemTime::now() + delay)
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs_f64()
    }

    /// Replays `responses` in order, counting invocations.
    fn scripted(
        responses: Vec<MockResponse>,
        calls: Arc<AtomicUsize>,
    ) -> impl FnMut() -> std::future::Ready<LinkResult<MockResponse>> {
        move || {
            let i = calls.fetch_add(1, Ordering::SeqCst);
            let response = responses
                .get(i)
                .cloned()
                .unwrap_or_else(|| responses.last().cloned().unwrap());
            std::future::ready(Ok(response))
        }
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        for k in 0..3usize {
            let limiter = RateLimiter::new("channels/1");
            let calls = Arc::new(AtomicUsize::new(0));
            let mut script: Vec<MockResponse> =
                (0..k).map(|_| MockResponse::limited(0.05)).collect();
            script.push(MockResponse::ok());

            let start = Instant::now();
            let response = limiter
                .perform(scripted(script, calls.clone()), &CancellationToken::new())
                .await
                .unwrap();

            assert_eq!(response.status, 200);
            assert_eq!(calls.load(Ordering::SeqCst), k + 1);
            let elapsed = start.elapsed();
            assert!(elapsed >= Duration::from_millis(50 * k as u64));
            assert!(elapsed < Duration::from_millis(50 * k as u64 + 500));
        }
    }

    #[tokio::test]
    async fn test_waits_for_reset_when_quota_spent() {
        let limiter = RateLimiter::new("guilds/1");
        let calls = Arc::new(AtomicUsize::new(0));
        let first = MockResponse::ok()
            .header(HEADER_LIMIT, "5")
            .header(HEADER_REMAINING, "0")
            .header(HEADER_RESET, epoch_secs_in(Duration::from_millis(300)).to_string());
        let cancel = CancellationToken::new();

        limiter
            .perform(scripted(vec![first], calls.clone()), &cancel)
            .await
            .unwrap();

        let start = Instant::now();
        limiter
            .perform(scripted(vec![MockResponse::ok()], Arc::new(AtomicUsize::new(0))), &cancel)
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "waited {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(900), "waited {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_absent_headers_keep_previous_values() {
        let mut bucket = Bucket::new("b");
        bucket.update(
            &MockResponse::ok()
                .header(HEADER_LIMIT, "10")
                .header(HEADER_REMAINING, "7")
                .header(HEADER_RESET, "1700000000.5"),
        );
        bucket.update(&MockResponse::ok().header(HEADER_REMAINING, "6"));

        assert_eq!(bucket.limit, Some(10));
        assert_eq!(bucket.remaining, Some(6));
        assert_eq!(
            bucket.reset_at,
            Some(UNIX_EPOCH + Duration::from_secs_f64(1_700_000_000.5))
        );
    }

    #[tokio::test]
    async fn test_out_of_range_numbers_are_ignored() {
        let mut bucket = Bucket::new("b");
        bucket.update(&MockResponse::ok().header(HEADER_RESET, "1700000000"));
        for reset in ["1e20", "-5", "NaN", "inf"] {
            bucket.update(&MockResponse::ok().header(HEADER_RESET, reset));
        }
        assert_eq!(bucket.reset_at, Some(UNIX_EPOCH + Duration::from_secs(1_700_000_000)));

        for retry in ["1e20", "-1", "NaN"] {
            let response = MockResponse::ok().status(429).header(HEADER_RETRY_AFTER, retry);
            assert_eq!(retry_after(&response), FALLBACK_RETRY_AFTER);
        }
        assert_eq!(
            retry_after(&MockResponse::limited(0.25)),
            Duration::from_millis(250)
        );
    }

    #[tokio::test]
    async fn test_reset_in_the_past_does_not_block() {
        let mut bucket = Bucket::new("b");
        bucket.remaining = Some(0);
        bucket.reset_at = Some(SystemTime::now() - Duration::from_secs(5));
        assert_eq!(bucket.wait_time(SystemTime::now()), None);
    }

    #[tokio::test]
    async fn test_distinct_buckets_progress_in_parallel() {
        let a = Arc::new(RateLimiter::new("a"));
        let b = Arc::new(RateLimiter::new("b"));
        let cancel = CancellationToken::new();

        let slow = {
            let a = a.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let script = vec![
                    MockResponse::limited(0.4),
                    MockResponse::limited(0.4),
                    MockResponse::ok(),
                ];
                a.perform(scripted(script, Arc::new(AtomicUsize::new(0))), &cancel)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        let start = Instant::now();
        b.perform(scripted(vec![MockResponse::ok()], Arc::new(AtomicUsize::new(0))), &cancel)
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(200));
        assert!(!slow.is_finished());

        slow.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_same_bucket_is_serialized() {
        let limiter = Arc::new(RateLimiter::new("same"));
        let cancel = CancellationToken::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                limiter
                    .perform(
                        || {
                            let in_flight = in_flight.clone();
                            let peak = peak.clone();
                            async move {
                                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                tokio::time::sleep(Duration::from_millis(10)).await;
                                in_flight.fetch_sub(1, Ordering::SeqCst);
                                Ok::<_, LinkError>(MockResponse::ok())
                            }
                        },
                        &cancel,
                    )
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_retry_wait() {
        let limiter = RateLimiter::new("c");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let result = limiter
            .perform(
                scripted(vec![MockResponse::limited(30.0)], Arc::new(AtomicUsize::new(0))),
                &cancel,
            )
            .await;
        assert!(matches!(result, Err(LinkError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(2));

        // the lock was released on the way out
        let ok = limiter
            .perform(
                scripted(vec![MockResponse::ok()], Arc::new(AtomicUsize::new(0))),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status, 200);
    }
}
