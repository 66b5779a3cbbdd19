// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HASHPASS - ABUSE LIMITS
//
// Two per-IP bounds on the public surface:
//   - a token-bucket rate limiter for HTTP requests (integer millitoken
//     math, no f64, deterministic across platforms)
//   - a live-connection counter capping simultaneous realtime channels
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Recover from poisoned mutex instead of panicking
fn safe_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Precision multiplier: 1 token = 1000 millitokens
const MILLITOKEN: u64 = 1000;

/// Buckets idle longer than this are dropped by the periodic cleanup.
const BUCKET_IDLE_EVICT: Duration = Duration::from_secs(600);

struct TokenBucket {
    tokens_milli: u64,
    last_refill: Instant,
}

/// Token-bucket rate limiter, one bucket per client IP.
/// Allows burst traffic but bounds the average request rate.
#[derive(Clone)]
pub struct RateLimiter {
    buckets: Arc<Mutex<HashMap<IpAddr, TokenBucket>>>,
    max_tokens_milli: u64,
    refill_rate: u32,
    cleanup_interval: Duration,
    last_cleanup: Arc<Mutex<Instant>>,
}

impl RateLimiter {
    /// `requests_per_second` average; burst capacity is 2× that.
    pub fn new(requests_per_second: u32) -> Self {
        RateLimiter {
            buckets: Arc::new(Mutex::new(HashMap::new())),
            max_tokens_milli: requests_per_second as u64 * 2 * MILLITOKEN,
            refill_rate: requests_per_second,
            cleanup_interval: Duration::from_secs(300),
            last_cleanup: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Returns true if the request may proceed.
    pub fn check(&self, ip: IpAddr) -> bool {
        self.cleanup_if_needed();

        let mut buckets = safe_lock(&self.buckets);
        let bucket = buckets.entry(ip).or_insert_with(|| TokenBucket {
            tokens_milli: self.max_tokens_milli,
            last_refill: Instant::now(),
        });

        // elapsed_ms * rate tokens/s * 1000 milli / 1000 ms = elapsed_ms * rate
        let now = Instant::now();
        let elapsed_ms = now.duration_since(bucket.last_refill).as_millis() as u64;
        bucket.tokens_milli =
            (bucket.tokens_milli + elapsed_ms * self.refill_rate as u64).min(self.max_tokens_milli);
        bucket.last_refill = now;

        if bucket.tokens_milli >= MILLITOKEN {
            bucket.tokens_milli -= MILLITOKEN;
            true
        } else {
            false
        }
    }

    fn cleanup_if_needed(&self) {
        let mut last_cleanup = safe_lock(&self.last_cleanup);
        if last_cleanup.elapsed() >= self.cleanup_interval {
            let now = Instant::now();
            safe_lock(&self.buckets)
                .retain(|_, b| now.duration_since(b.last_refill) < BUCKET_IDLE_EVICT);
            *last_cleanup = now;
        }
    }

    pub fn tracked_ips(&self) -> usize {
        safe_lock(&self.buckets).len()
    }
}

/// Live realtime-connection counter, one slot count per IP.
#[derive(Clone)]
pub struct ConnLimiter {
    counts: Arc<Mutex<HashMap<IpAddr, u32>>>,
    max_per_ip: u32,
}

impl ConnLimiter {
    pub fn new(max_per_ip: u32) -> Self {
        ConnLimiter {
            counts: Arc::new(Mutex::new(HashMap::new())),
            max_per_ip,
        }
    }

    /// Reserve one slot for `ip`; false when the cap is reached.
    pub fn try_acquire(&self, ip: IpAddr) -> bool {
        let mut counts = safe_lock(&self.counts);
        let slot = counts.entry(ip).or_insert(0);
        if *slot >= self.max_per_ip {
            return false;
        }
        *slot += 1;
        true
    }

    /// Release a slot previously acquired for `ip`.
    pub fn release(&self, ip: IpAddr) {
        let mut counts = safe_lock(&self.counts);
        if let Some(slot) = counts.get_mut(&ip) {
            *slot = slot.saturating_sub(1);
            if *slot == 0 {
                counts.remove(&ip);
            }
        }
    }

    pub fn count(&self, ip: IpAddr) -> u32 {
        safe_lock(&self.counts).get(&ip).copied().unwrap_or(0)
    }
}

/// Warp plumbing for the HTTP rate limit.
pub mod filters {
    use super::RateLimiter;
    use prometheus::IntCounter;
    use std::net::IpAddr;
    use warp::Filter;

    /// Extract the client IP from the connection's remote address.
    pub fn client_ip() -> impl Filter<Extract = (IpAddr,), Error = std::convert::Infallible> + Clone
    {
        warp::addr::remote().map(|addr: Option<std::net::SocketAddr>| {
            addr.map(|a| a.ip())
                .unwrap_or_else(|| IpAddr::from([127, 0, 0, 1]))
        })
    }

    /// Rejects with RateLimitExceeded once an IP exceeds its budget.
    pub fn rate_limit(
        limiter: RateLimiter,
        rejections: IntCounter,
    ) -> impl Filter<Extract = (), Error = warp::Rejection> + Clone {
        client_ip()
            .and(warp::any().map(move || (limiter.clone(), rejections.clone())))
            .and_then(
                |ip: IpAddr, (limiter, rejections): (RateLimiter, IntCounter)| async move {
                    if limiter.check(ip) {
                        Ok(())
                    } else {
                        rejections.inc();
                        Err(warp::reject::custom(RateLimitExceeded { ip }))
                    }
                },
            )
            .untuple_one()
    }

    #[derive(Debug)]
    pub struct RateLimitExceeded {
        pub ip: IpAddr,
    }

    impl warp::reject::Reject for RateLimitExceeded {}
}
