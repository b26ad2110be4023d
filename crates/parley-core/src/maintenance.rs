use crate::cache::QueryCache;
use crate::ratelimit::RateLimiter;

#[derive(Debug, Clone, Copy, Default)]
pub struct SweepReport {
    pub cache_entries_removed: usize,
    pub rate_windows_removed: usize,
}

/// One housekeeping pass: expired cache rows and stale rate windows.
/// Callers own the schedule; hourly is plenty. Each half is independent, a
/// failure in one never blocks the other.
pub fn sweep(cache: &QueryCache, limiter: &RateLimiter) -> SweepReport {
    let mut report = SweepReport::default();
    match cache.cleanup() {
        Ok(n) => report.cache_entries_removed = n,
        Err(e) => tracing::warn!(error = %e, "cache sweep failed"),
    }
    match limiter.cleanup() {
        Ok(n) => report.rate_windows_removed = n,
        Err(e) => tracing::warn!(error = %e, "rate window sweep failed"),
    }
    report
}
