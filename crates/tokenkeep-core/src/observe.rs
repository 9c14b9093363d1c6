//! Optional metrics instrumentation for tokenkeep.
//!
//! When the `observe` feature is enabled, key operations emit counters and
//! histograms via the [`metrics`] crate. A downstream application must
//! install a metrics recorder (e.g. `metrics-exporter-prometheus`) to
//! collect the data.
//!
//! When the feature is **not** enabled every function in this module is a
//! zero-cost no-op.

/// Record an atomic-write commit (counter + latency histogram).
///
/// - `tokenkeep.write.commits_total` – incremented on every commit
/// - `tokenkeep.write.commit_duration_seconds` – histogram of commit latency
#[inline]
pub fn record_commit(duration: std::time::Duration) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("tokenkeep.write.commits_total").increment(1);
        metrics::histogram!("tokenkeep.write.commit_duration_seconds")
            .record(duration.as_secs_f64());
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = duration;
    }
}

/// Record a published status event.
///
/// - `tokenkeep.status.events_total` – counter with `status` label
#[inline]
pub fn record_status_event(status: &str) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("tokenkeep.status.events_total", "status" => status.to_string())
            .increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = status;
    }
}

/// Record a token-request cache hit or miss.
///
/// - `tokenkeep.request_cache.lookups_total` – counter with `result` label (`hit` / `miss`)
#[inline]
pub fn record_cache_lookup(hit: bool) {
    #[cfg(feature = "observe")]
    {
        let result = if hit { "hit" } else { "miss" };
        metrics::counter!("tokenkeep.request_cache.lookups_total", "result" => result)
            .increment(1);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = hit;
    }
}

/// Record the number of mismatches found by a reconciliation run.
///
/// - `tokenkeep.reconcile.runs_total` – counter
/// - `tokenkeep.reconcile.mismatches` – histogram
#[inline]
pub fn record_reconcile(mismatches: usize) {
    #[cfg(feature = "observe")]
    {
        metrics::counter!("tokenkeep.reconcile.runs_total").increment(1);
        metrics::histogram!("tokenkeep.reconcile.mismatches").record(mismatches as f64);
    }
    #[cfg(not(feature = "observe"))]
    {
        let _ = mismatches;
    }
}
