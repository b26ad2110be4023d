use crate::storage::store::{now_ms, Store};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitDecision {
    pub allowed: bool,
    pub remaining: u32,
    /// When the current window rolls over, epoch millis.
    pub reset_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyDecision {
    pub allowed: bool,
    pub current: i64,
    pub max: i64,
}

/// Fixed-window per-tenant request counters plus a live concurrency cap for
/// background jobs. Both mechanisms fail open on storage errors so a broken
/// store degrades to allowing traffic rather than blocking the product.
#[derive(Clone)]
pub struct RateLimiter {
    store: Store,
    max_requests: u32,
    window_ms: i64,
    max_concurrent_jobs: i64,
    cleanup_windows: i64,
}

impl RateLimiter {
    pub fn new(
        store: Store,
        max_requests: u32,
        window_ms: i64,
        max_concurrent_jobs: i64,
        cleanup_windows: i64,
    ) -> Self {
        Self {
            store,
            max_requests,
            window_ms,
            max_concurrent_jobs,
            cleanup_windows,
        }
    }

    pub fn check_limit(&self, tenant_id: &str, endpoint: &str) -> LimitDecision {
        self.check_limit_at(tenant_id, endpoint, now_ms())
    }

    /// Window arithmetic with an explicit clock, for deterministic tests.
    pub fn check_limit_at(&self, tenant_id: &str, endpoint: &str, now_ms: i64) -> LimitDecision {
        let window_start = now_ms - now_ms.rem_euclid(self.window_ms);
        let reset_at = window_start + self.window_ms;

        match self.store.rate_increment(tenant_id, endpoint, window_start) {
            Ok(count) => LimitDecision {
                allowed: count <= self.max_requests as i64,
                remaining: (self.max_requests as i64 - count).max(0) as u32,
                reset_at,
            },
            Err(e) => {
                tracing::warn!(error = %e, tenant = tenant_id, "rate limit check failed, allowing request");
                LimitDecision {
                    allowed: true,
                    remaining: 0,
                    reset_at,
                }
            }
        }
    }

    /// Counts live (queued/running) job rows rather than keeping an
    /// in-memory counter, so the cap survives process restarts.
    pub fn check_concurrent_jobs(&self, tenant_id: &str) -> ConcurrencyDecision {
        match self.store.count_live_jobs(tenant_id) {
            Ok(current) => ConcurrencyDecision {
                allowed: current < self.max_concurrent_jobs,
                current,
                max: self.max_concurrent_jobs,
            },
            Err(e) => {
                tracing::warn!(error = %e, tenant = tenant_id, "concurrency check failed, allowing job");
                ConcurrencyDecision {
                    allowed: true,
                    current: 0,
                    max: self.max_concurrent_jobs,
                }
            }
        }
    }

    /// Deletes windows past the cleanup horizon; run on the periodic sweep.
    pub fn cleanup(&self) -> anyhow::Result<usize> {
        let cutoff = now_ms() - self.window_ms * self.cleanup_windows;
        self.store.rate_delete_before(cutoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: u32, window_ms: i64) -> RateLimiter {
        let store = Store::memory().unwrap();
        store.init_schema().unwrap();
        RateLimiter::new(store, max, window_ms, 3, 2)
    }

    #[test]
    fn window_exhaustion_and_rollover() {
        let rl = limiter(30, 60_000);
        let now = 1_700_000_030_000; // mid-window
        let window_start = now - now % 60_000;

        for i in 0..30 {
            let d = rl.check_limit_at("t1", "ask", now);
            assert!(d.allowed, "call {} should pass", i + 1);
        }
        let d = rl.check_limit_at("t1", "ask", now);
        assert!(!d.allowed);
        assert_eq!(d.remaining, 0);
        assert_eq!(d.reset_at, window_start + 60_000);

        // next window starts fresh
        let d = rl.check_limit_at("t1", "ask", window_start + 60_000);
        assert!(d.allowed);
        assert_eq!(d.remaining, 29);
    }

    #[test]
    fn tenants_and_endpoints_are_independent() {
        let rl = limiter(1, 60_000);
        let now = 120_000;
        assert!(rl.check_limit_at("t1", "ask", now).allowed);
        assert!(!rl.check_limit_at("t1", "ask", now).allowed);
        assert!(rl.check_limit_at("t2", "ask", now).allowed);
        assert!(rl.check_limit_at("t1", "jobs", now).allowed);
    }

    #[test]
    fn concurrency_cap_counts_live_rows() {
        let store = Store::memory().unwrap();
        store.init_schema().unwrap();
        let rl = RateLimiter::new(store.clone(), 30, 60_000, 2, 2);

        assert!(rl.check_concurrent_jobs("t1").allowed);
        let a = store.insert_job("t1", "p1", 1.0).unwrap();
        store.insert_job("t1", "p1", 1.0).unwrap();
        let d = rl.check_concurrent_jobs("t1");
        assert!(!d.allowed);
        assert_eq!(d.current, 2);

        // terminal jobs stop counting
        store
            .finalize_job(a, crate::model::JobStatus::Completed, 0.1, &[], Some("done"), None)
            .unwrap();
        assert!(rl.check_concurrent_jobs("t1").allowed);
    }

    #[test]
    fn cleanup_drops_stale_windows() {
        let rl = limiter(30, 60_000);
        let old = now_ms() - 10 * 60_000;
        rl.check_limit_at("t1", "ask", old);
        rl.check_limit_at("t1", "ask", now_ms());
        assert_eq!(rl.cleanup().unwrap(), 1);
    }
}
