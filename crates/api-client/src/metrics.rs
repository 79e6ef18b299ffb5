//! Pipeline metrics
//!
//! Recorded through the `metrics` facade; the embedding application decides
//! whether to install a recorder. Without one these calls are no-ops.
//!
//! - `api_requests_total` (counter): label `outcome` (`ok` or an error kind)
//! - `auth_refresh_total` (counter): labels `outcome`, `trigger`
//! - `auth_replays_total` (counter): label `outcome`

/// Record the final outcome of one pipeline call.
pub fn record_request(outcome: &'static str) {
    metrics::counter!("api_requests_total", "outcome" => outcome).increment(1);
}

/// Record a completed refresh cycle.
pub fn record_refresh(outcome: &'static str, trigger: &'static str) {
    metrics::counter!("auth_refresh_total", "outcome" => outcome, "trigger" => trigger)
        .increment(1);
}

/// Record one replayed call after a refresh.
pub fn record_replay(outcome: &'static str) {
    metrics::counter!("auth_replays_total", "outcome" => outcome).increment(1);
}
