//! Telemetry metric name constants.
//!
//! Centralised metric names for huginn operations. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `huginn_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `status`: outcome of a fetch or mutation: "success" or "error"
//! - `decision`: external event handling: "invalidate" or "recompute"

/// Total cache entries constructed.
pub const ENTRIES_CREATED_TOTAL: &str = "huginn_entries_created_total";

/// Total `get_or_create` calls answered by an existing entry.
pub const ENTRY_HITS_TOTAL: &str = "huginn_entry_hits_total";

/// Total entries evicted (delayed GC, manual eviction and reset).
pub const EVICTIONS_TOTAL: &str = "huginn_evictions_total";

/// Total completed fetch cycles.
///
/// Labels: `status` ("success" | "error").
pub const FETCHES_TOTAL: &str = "huginn_fetches_total";

/// Fetch cycle duration in seconds, retries included.
pub const FETCH_DURATION_SECONDS: &str = "huginn_fetch_duration_seconds";

/// Total retry attempts (not counting the initial request).
pub const RETRIES_TOTAL: &str = "huginn_retries_total";

/// Total fetch cycles abandoned because the transport faulted.
pub const TRANSPORT_FAULTS_TOTAL: &str = "huginn_transport_faults_total";

/// Total fetch results discarded because a newer fetch superseded them.
pub const STALE_RESULTS_TOTAL: &str = "huginn_stale_results_total";

/// Total build re-evaluations (initial construction included).
pub const RECOMPUTES_TOTAL: &str = "huginn_recomputes_total";

/// Total external events handled by entries.
///
/// Labels: `decision` ("invalidate" | "recompute").
pub const EXTERNAL_EVENTS_TOTAL: &str = "huginn_external_events_total";

/// Total completed mutation writes.
///
/// Labels: `status` ("success" | "error").
pub const MUTATIONS_TOTAL: &str = "huginn_mutations_total";
