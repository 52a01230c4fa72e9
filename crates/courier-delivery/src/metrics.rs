//! Delivery metrics shared between workers and the HTTP surface.
//!
//! The three outcome counters (sent, failed, bounced) are incremented in
//! exactly one place, the delivery worker, so dashboards never double-count
//! an attempt. The feedback consumer keeps its own observed tallies and is
//! deliberately not wired into these counters.

/// Counters and gauges for delivery monitoring.
///
/// Shared as `Arc<RwLock<DeliveryMetrics>>` between the engine, its workers,
/// and the metrics endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryMetrics {
    /// Number of active delivery workers.
    pub active_workers: usize,
    /// Jobs claimed from the queue since startup.
    pub jobs_claimed: u64,
    /// Emails successfully delivered.
    pub delivered: u64,
    /// Transient delivery failures.
    pub failed: u64,
    /// Permanent failures routed straight to dead-letter.
    pub bounced: u64,
    /// Retries scheduled with backoff.
    pub retries_scheduled: u64,
    /// Jobs that exhausted their retry budget or bounced.
    pub dead_lettered: u64,
}

impl DeliveryMetrics {
    /// Renders the Prometheus text exposition format.
    ///
    /// The outcome counter names (`email_sent_total`, `email_failed_total`,
    /// `email_bounced_total`) are part of the dashboard contract and must
    /// not change.
    #[must_use]
    pub fn prometheus_text(&self) -> String {
        let mut out = String::with_capacity(1024);

        write_counter(&mut out, "email_sent_total", "Total emails successfully sent", self.delivered);
        write_counter(
            &mut out,
            "email_failed_total",
            "Total emails failed (transient)",
            self.failed,
        );
        write_counter(
            &mut out,
            "email_bounced_total",
            "Total emails permanently failed/bounced",
            self.bounced,
        );
        write_counter(
            &mut out,
            "courier_jobs_claimed_total",
            "Jobs claimed from the queue",
            self.jobs_claimed,
        );
        write_counter(
            &mut out,
            "courier_retries_scheduled_total",
            "Retries scheduled with backoff",
            self.retries_scheduled,
        );
        write_counter(
            &mut out,
            "courier_dead_lettered_total",
            "Jobs routed to the dead letter state",
            self.dead_lettered,
        );
        write_gauge(
            &mut out,
            "courier_active_workers",
            "Currently running delivery workers",
            u64::try_from(self.active_workers).unwrap_or(u64::MAX),
        );

        out
    }
}

fn write_counter(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"));
}

fn write_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!("# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_reports_outcome_counters() {
        let metrics = DeliveryMetrics {
            active_workers: 4,
            jobs_claimed: 46,
            delivered: 42,
            failed: 3,
            bounced: 1,
            retries_scheduled: 3,
            dead_lettered: 1,
        };

        let text = metrics.prometheus_text();
        assert!(text.contains("email_sent_total 42\n"));
        assert!(text.contains("email_failed_total 3\n"));
        assert!(text.contains("email_bounced_total 1\n"));
        assert!(text.contains("courier_jobs_claimed_total 46\n"));
        assert!(text.contains("courier_active_workers 4\n"));
    }

    #[test]
    fn exposition_declares_types() {
        let text = DeliveryMetrics::default().prometheus_text();
        assert!(text.contains("# TYPE email_sent_total counter"));
        assert!(text.contains("# TYPE courier_active_workers gauge"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn zeroed_metrics_render_zeroes() {
        let text = DeliveryMetrics::default().prometheus_text();
        assert!(text.contains("email_sent_total 0\n"));
        assert!(text.contains("email_bounced_total 0\n"));
    }
}
