use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use governor::{DefaultKeyedRateLimiter, Jitter, Quota, RateLimiter};
use tracing::warn;
use url::Url;

use crate::error::FetchError;

const USER_AGENT: &str = "webnovel-archiver <https://github.com/ValentinLeTallec/AutEBook>";
const MAX_TOO_MANY_REQUESTS_BOUNCES: u8 = 10;

/// Per-host leaky-bucket rate limiter shared by every fetcher, keyed by hostname so that one
/// slow/strict source never throttles requests to another.
pub struct HostRateLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
}

impl HostRateLimiter {
    pub fn new(requests_per_second: u32, burst: u32) -> Self {
        #[allow(clippy::unwrap_used)]
        let quota = Quota::per_second(NonZeroU32::new(requests_per_second.max(1)).unwrap())
            .allow_burst(NonZeroU32::new(burst.max(1)).unwrap());
        Self {
            limiter: RateLimiter::keyed(quota),
        }
    }

    pub fn acquire(&self, host: &str) {
        while self.limiter.check_key(&host.to_string()).is_err() {
            thread::sleep(Jitter::up_to(Duration::from_millis(30)) + Duration::from_millis(50));
        }
    }
}

static DEFAULT_LIMITER: LazyLock<HostRateLimiter> = LazyLock::new(|| HostRateLimiter::new(2, 1));

pub fn get_text(url: &str) -> Result<String, FetchError> {
    let mut response = send_get_request_rec(url, 0)?;
    response
        .body_mut()
        .read_to_string()
        .map_err(|e| FetchError::Parse {
            url: url.to_string(),
            reason: e.to_string(),
        })
}

pub fn get_bytes(url: &str) -> Result<Vec<u8>, FetchError> {
    let mut response = send_get_request_rec(url, 0)?;
    response
        .body_mut()
        .read_to_vec()
        .map_err(|e| FetchError::Parse {
            url: url.to_string(),
            reason: e.to_string(),
        })
}

fn send_get_request_rec(url: &str, bounce: u8) -> Result<ureq::http::Response<ureq::Body>, FetchError> {
    static BOUNCE: AtomicU8 = AtomicU8::new(0);

    let host = Url::parse(url)
        .map_err(|_| FetchError::MalformedUrl(url.to_string()))?
        .host()
        .map(|h| h.to_string())
        .unwrap_or_default();

    DEFAULT_LIMITER.acquire(&host);

    let response = ureq::get(url)
        .header("User-Agent", USER_AGENT)
        .call()
        .map_err(|e| to_fetch_error(url, e));

    match response {
        Ok(response) => {
            BOUNCE.store(0, Ordering::Relaxed);
            Ok(response)
        }
        Err(FetchError::Network { source, .. })
            if matches!(*source, ureq::Error::StatusCode(429)) && bounce <= MAX_TOO_MANY_REQUESTS_BOUNCES =>
        {
            let secs = 8 * 2_u64.pow(u32::from(bounce + 1));
            warn!(url, secs, "too many requests, backing off");
            thread::sleep(Duration::from_secs(secs));
            BOUNCE.fetch_add(1, Ordering::Relaxed);
            send_get_request_rec(url, bounce + 1)
        }
        Err(FetchError::Network { source, .. }) if matches!(*source, ureq::Error::StatusCode(404)) => {
            Err(FetchError::ChapterGone(url.to_string()))
        }
        Err(e) => Err(e),
    }
}

fn to_fetch_error(url: &str, e: ureq::Error) -> FetchError {
    FetchError::Network {
        url: url.to_string(),
        source: Box::new(e),
    }
}
