//! `/health` endpoint body.

use serde::Serialize;
use std::time::Instant;

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` while the server is serving.
    pub status: &'static str,
    pub uptime_secs: u64,
    /// Connections with a mapped worker.
    pub active_connections: usize,
    /// Workers in the live set.
    pub active_workers: usize,
}

pub fn health_check(start_time: Instant, connections: usize, workers: usize) -> HealthResponse {
    HealthResponse {
        status: "ok",
        uptime_secs: start_time.elapsed().as_secs(),
        active_connections: connections,
        active_workers: workers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_server_reports_ok() {
        let resp = health_check(Instant::now(), 0, 0);
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn uptime_counts_from_start() {
        let start = Instant::now()
            .checked_sub(std::time::Duration::from_secs(60))
            .unwrap();
        assert!(health_check(start, 0, 0).uptime_secs >= 59);
    }

    #[test]
    fn serialized_field_names() {
        let resp = health_check(Instant::now(), 4, 3);
        let parsed = serde_json::to_value(&resp).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["active_connections"], 4);
        assert_eq!(parsed["active_workers"], 3);
        assert!(parsed["uptime_secs"].is_number());
    }
}
