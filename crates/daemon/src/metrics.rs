use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Prometheus-compatible metrics for the detour daemon.
///
/// Updated from the notification loop, read by the optional HTTP endpoint.
pub struct Metrics {
    // === Kernel Notifications ===
    /// REQUEST notifications handled
    pub requests_total: AtomicU64,
    /// Notifications dropped because they could not be decoded
    pub notifications_malformed_total: AtomicU64,

    // === Negotiation ===
    /// Detour server responses accepted
    pub negotiations_ok_total: AtomicU64,
    /// Negotiations that failed (I/O, protocol, timeout)
    pub negotiations_failed_total: AtomicU64,
    /// Route ADD commands acknowledged by the kernel
    pub routes_installed_total: AtomicU64,

    // === Tunnels ===
    /// Tunnels currently ready and reported to the kernel
    pub tunnels_up: AtomicU64,
    /// Configured detour server links
    pub detour_servers: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new_inner()
    }
}

impl Metrics {
    fn new_inner() -> Self {
        Self {
            requests_total: AtomicU64::new(0),
            notifications_malformed_total: AtomicU64::new(0),
            negotiations_ok_total: AtomicU64::new(0),
            negotiations_failed_total: AtomicU64::new(0),
            routes_installed_total: AtomicU64::new(0),
            tunnels_up: AtomicU64::new(0),
            detour_servers: AtomicU64::new(0),
        }
    }

    pub fn new() -> Arc<Self> {
        Arc::new(Self::new_inner())
    }

    pub fn inc_requests(&self) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_malformed(&self) {
        self.notifications_malformed_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_negotiations_ok(&self) {
        self.negotiations_ok_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_negotiations_failed(&self) {
        self.negotiations_failed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_routes_installed(&self) {
        self.routes_installed_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_tunnels_up(&self, count: u64) {
        self.tunnels_up.store(count, Ordering::Relaxed);
    }

    pub fn set_detour_servers(&self, count: u64) {
        self.detour_servers.store(count, Ordering::Relaxed);
    }

    /// Format metrics in Prometheus exposition format.
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP detour_requests_total Detour requests received from the kernel\n\
             # TYPE detour_requests_total counter\n\
             detour_requests_total {}\n\
             # HELP detour_notifications_malformed_total Kernel notifications dropped as malformed\n\
             # TYPE detour_notifications_malformed_total counter\n\
             detour_notifications_malformed_total {}\n\
             # HELP detour_negotiations_ok_total Successful detour server negotiations\n\
             # TYPE detour_negotiations_ok_total counter\n\
             detour_negotiations_ok_total {}\n\
             # HELP detour_negotiations_failed_total Failed detour server negotiations\n\
             # TYPE detour_negotiations_failed_total counter\n\
             detour_negotiations_failed_total {}\n\
             # HELP detour_routes_installed_total Routes added to the kernel\n\
             # TYPE detour_routes_installed_total counter\n\
             detour_routes_installed_total {}\n\
             # HELP detour_tunnels_up Tunnels ready and reported to the kernel\n\
             # TYPE detour_tunnels_up gauge\n\
             detour_tunnels_up {}\n\
             # HELP detour_servers Configured detour servers\n\
             # TYPE detour_servers gauge\n\
             detour_servers {}\n",
            self.requests_total.load(Ordering::Relaxed),
            self.notifications_malformed_total.load(Ordering::Relaxed),
            self.negotiations_ok_total.load(Ordering::Relaxed),
            self.negotiations_failed_total.load(Ordering::Relaxed),
            self.routes_installed_total.load(Ordering::Relaxed),
            self.tunnels_up.load(Ordering::Relaxed),
            self.detour_servers.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        assert_eq!(metrics.requests_total.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.tunnels_up.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_negotiation_metrics() {
        let metrics = Metrics::new();
        metrics.inc_requests();
        metrics.inc_negotiations_ok();
        metrics.inc_negotiations_ok();
        metrics.inc_negotiations_failed();
        metrics.inc_routes_installed();

        assert_eq!(metrics.requests_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.negotiations_ok_total.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.negotiations_failed_total.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.routes_installed_total.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.inc_malformed();
        metrics.set_tunnels_up(2);
        metrics.set_detour_servers(3);

        let output = metrics.to_prometheus();
        assert!(output.contains("detour_notifications_malformed_total 1\n"));
        assert!(output.contains("# TYPE detour_tunnels_up gauge"));
        assert!(output.contains("detour_tunnels_up 2\n"));
        assert!(output.contains("detour_servers 3\n"));
    }
}
