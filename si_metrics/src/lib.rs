//! Prometheus counters for the sidb transaction core.
use anyhow::Result;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, TextEncoder};

/// Root and child transactions created.
pub static TXN_BEGUN_TOTAL: Lazy<IntCounter> = Lazy::new(|| counter("si_txn_begun_total", "Transactions created (root and child)"));
/// Transactions committed.
pub static TXN_COMMITTED_TOTAL: Lazy<IntCounter> = Lazy::new(|| counter("si_txn_committed_total", "Transactions committed"));
/// Transactions rolled back.
pub static TXN_ROLLED_BACK_TOTAL: Lazy<IntCounter> = Lazy::new(|| counter("si_txn_rolled_back_total", "Transactions rolled back"));
/// Read-only transactions made writable.
pub static TXN_ELEVATIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| counter("si_txn_elevations_total", "Read-only transactions elevated to writable"));
/// Read resolutions accepted by the resolver queue.
pub static RESOLUTIONS_ENQUEUED_TOTAL: Lazy<IntCounter> = Lazy::new(|| counter("si_resolutions_enqueued_total", "Read resolutions queued"));
/// Read resolutions dropped because the queue was full or closed.
pub static RESOLUTIONS_DROPPED_TOTAL: Lazy<IntCounter> = Lazy::new(|| counter("si_resolutions_dropped_total", "Read resolutions dropped on a full or closed queue"));
/// Read resolutions written back onto row versions.
pub static RESOLUTIONS_APPLIED_TOTAL: Lazy<IntCounter> = Lazy::new(|| counter("si_resolutions_applied_total", "Read resolutions written back to storage"));
/// Row versions skipped because their writer could not be resolved.
pub static UNRESOLVABLE_WRITERS_TOTAL: Lazy<IntCounter> = Lazy::new(|| counter("si_unresolvable_writers_total", "Row versions skipped for an unresolvable writer"));

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("static metric name is valid");
    // Duplicate registration is ignored.
    let _ = prometheus::register(Box::new(c.clone()));
    c
}

/// Render every registered metric in the Prometheus text format.
pub fn render() -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_show_up_in_exposition() {
        TXN_BEGUN_TOTAL.inc();
        let text = render().unwrap();
        assert!(text.contains("si_txn_begun_total"));
    }
}
