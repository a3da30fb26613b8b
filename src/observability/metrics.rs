//! TLS metrics.
//!
//! # Metrics
//! - `mta_tls_handshakes_total` (counter): handshakes by role, result
//! - `mta_tls_verification_total` (counter): peer checks by role, outcome
//! - `mta_tls_dh_params_total` (counter): DH parameter loads by origin
//! - `mta_tls_plaintext_fallback_total` (counter): close_notify followed by
//!   plaintext
//! - `mta_tls_active_sessions` (gauge): live sessions in the registry

pub fn record_handshake(role: &'static str, result: &'static str) {
    metrics::counter!("mta_tls_handshakes_total", "role" => role, "result" => result).increment(1);
}

pub fn record_verification(role: &'static str, outcome: &'static str) {
    metrics::counter!("mta_tls_verification_total", "role" => role, "outcome" => outcome).increment(1);
}

pub fn record_dh_params(origin: &'static str) {
    metrics::counter!("mta_tls_dh_params_total", "origin" => origin).increment(1);
}

pub fn record_fallback() {
    metrics::counter!("mta_tls_plaintext_fallback_total").increment(1);
}

pub fn record_active_sessions(count: usize) {
    metrics::gauge!("mta_tls_active_sessions").set(count as f64);
}
