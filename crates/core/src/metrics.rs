//! Metric names and descriptions.
//!
//! Every component records through the `metrics` facade using these constants;
//! the daemon installs the Prometheus recorder and calls [`describe_all`].
//!
//! Naming: `dockwatch_` prefix, `_total` for counters, `_seconds` for
//! histograms, no suffix for gauges.

// ─── label keys ─────────────────────────────────────────────────────

/// success, failure
pub const LABEL_RESULT: &str = "result";

/// UpToDate, UpdateAvailable, Skipped, Error
pub const LABEL_STATUS: &str = "status";

/// Updater stage of a failed rollback step
pub const LABEL_STAGE: &str = "stage";

// ─── scanner ────────────────────────────────────────────────────────

/// Completed scans (counter)
pub const SCANS_TOTAL: &str = "dockwatch_scans_total";

/// Scan wall time (histogram, seconds)
pub const SCAN_DURATION_SECONDS: &str = "dockwatch_scan_duration_seconds";

/// Containers per status in the latest scan (gauge, label: status)
pub const CONTAINERS_BY_STATUS: &str = "dockwatch_containers_by_status";

// ─── registry ───────────────────────────────────────────────────────

/// Manifest fetches (counter, label: result)
pub const REGISTRY_REQUESTS_TOTAL: &str = "dockwatch_registry_requests_total";

/// Digest cache hits (counter)
pub const REGISTRY_CACHE_HITS_TOTAL: &str = "dockwatch_registry_cache_hits_total";

// ─── updater ────────────────────────────────────────────────────────

/// Container updates (counter, label: result)
pub const UPDATES_TOTAL: &str = "dockwatch_updates_total";

/// Best-effort rollback/cleanup steps that failed (counter, label: stage)
pub const ROLLBACK_FAILURES_TOTAL: &str = "dockwatch_rollback_failures_total";

// ─── scheduler ──────────────────────────────────────────────────────

/// Scheduled scan-and-update runs (counter, label: result)
pub const SCHEDULER_RUNS_TOTAL: &str = "dockwatch_scheduler_runs_total";

/// Build info (gauge, always 1, label: version)
pub const BUILD_INFO: &str = "dockwatch_build_info";

/// Registers HELP text for every metric. Call once after installing a recorder.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    describe_counter!(SCANS_TOTAL, "Total number of completed container scans");
    describe_histogram!(SCAN_DURATION_SECONDS, "Container scan duration in seconds");
    describe_gauge!(
        CONTAINERS_BY_STATUS,
        "Containers per update status in the most recent scan"
    );

    describe_counter!(
        REGISTRY_REQUESTS_TOTAL,
        "Registry manifest requests by result"
    );
    describe_counter!(
        REGISTRY_CACHE_HITS_TOTAL,
        "Remote digest lookups served from the cache"
    );

    describe_counter!(UPDATES_TOTAL, "Container updates by result");
    describe_counter!(
        ROLLBACK_FAILURES_TOTAL,
        "Best-effort rollback or cleanup steps that failed, by stage"
    );

    describe_counter!(SCHEDULER_RUNS_TOTAL, "Scheduled scan-and-update runs by result");
    describe_gauge!(BUILD_INFO, "dockwatch build information");
}
