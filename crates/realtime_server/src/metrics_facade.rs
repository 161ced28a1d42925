//! Thin wrapper over the `metrics` crate's facade macros (spec §4.M). No
//! exporter is installed here -- wiring a `metrics-exporter-*` recorder is
//! the embedding binary's job; tests run against the crate's default no-op
//! recorder.

use std::time::Duration;

pub fn session_opened() {
    metrics::counter!("realtime_sessions_opened_total").increment(1);
}

pub fn session_closed(reason: &'static str) {
    metrics::counter!("realtime_sessions_closed_total", "reason" => reason).increment(1);
}

pub fn envelope_dispatched(kind: &'static str) {
    metrics::counter!("realtime_envelopes_dispatched_total", "kind" => kind).increment(1);
}

pub fn envelope_dispatch_failed(kind: &'static str, error_code: i32) {
    metrics::counter!(
        "realtime_envelopes_dispatch_failed_total",
        "kind" => kind,
        "code" => error_code.to_string(),
    )
    .increment(1);
}

pub fn match_created(handler_name: &str) {
    metrics::counter!("realtime_matches_created_total", "handler" => handler_name.to_string()).increment(1);
}

pub fn match_terminated(handler_name: &str) {
    metrics::counter!("realtime_matches_terminated_total", "handler" => handler_name.to_string()).increment(1);
}

pub fn match_tick_duration(handler_name: &str, elapsed: Duration) {
    metrics::histogram!("realtime_match_tick_seconds", "handler" => handler_name.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn matchmaker_pass_matched_groups(count: u64) {
    metrics::counter!("realtime_matchmaker_groups_total").increment(count);
}

pub fn matchmaker_tickets_outstanding(count: i64) {
    metrics::gauge!("realtime_matchmaker_tickets_outstanding").set(count as f64);
}

pub fn presence_diff_emitted(kind: &'static str) {
    metrics::counter!("realtime_presence_diffs_total", "kind" => kind).increment(1);
}
