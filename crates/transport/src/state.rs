//! Connection state, cumulative metrics, and the reconnect backoff schedule.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
    Closed,
}

/// Snapshot of the channel's connection state. Mutated only by the channel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub url: Option<String>,
    pub protocol: Option<String>,
    pub reconnect_attempts: u32,
    pub last_error: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
}

/// Cumulative channel counters. Monotonic except `uptime_ms`, which is
/// recomputed from `connected_at` on snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionMetrics {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub reconnections: u64,
    pub errors: u64,
    pub average_latency_ms: f64,
    pub latency_samples: u64,
    pub uptime_ms: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

impl ConnectionMetrics {
    /// Fold one round-trip sample into the running average.
    pub fn record_latency(&mut self, latency_ms: u64) {
        self.latency_samples += 1;
        let n = self.latency_samples as f64;
        self.average_latency_ms += (latency_ms as f64 - self.average_latency_ms) / n;
    }

    pub fn touch(&mut self) {
        self.last_activity = Some(Utc::now());
    }
}

/// Declarative HTTP fallback record handed to the facade once the channel
/// has exhausted its reconnection budget. The channel itself never performs
/// HTTP delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FallbackTransport {
    pub url: String,
    pub retry_interval_ms: u64,
}

/// Delay before reconnect attempt number `attempts_made + 1`:
/// `base * 1.5^attempts_made`, so the first retry waits exactly `base`.
pub fn reconnect_delay(base: Duration, attempts_made: u32) -> Duration {
    let factor = 1.5f64.powi(attempts_made.min(24) as i32);
    Duration::from_millis((base.as_millis() as f64 * factor) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule_is_exponential() {
        let base = Duration::from_millis(1000);
        assert_eq!(reconnect_delay(base, 0), Duration::from_millis(1000));
        assert_eq!(reconnect_delay(base, 1), Duration::from_millis(1500));
        assert_eq!(reconnect_delay(base, 2), Duration::from_millis(2250));
        assert_eq!(reconnect_delay(base, 3), Duration::from_millis(3375));
    }

    #[test]
    fn test_backoff_is_monotonically_increasing() {
        let base = Duration::from_millis(250);
        let mut previous = Duration::ZERO;
        for attempts in 0..10 {
            let delay = reconnect_delay(base, attempts);
            assert!(delay > previous, "delay must grow with each attempt");
            previous = delay;
        }
    }

    #[test]
    fn test_backoff_exponent_is_capped() {
        // Very large attempt counts must not overflow into nonsense.
        let base = Duration::from_millis(1000);
        assert_eq!(reconnect_delay(base, 1000), reconnect_delay(base, 24));
    }

    #[test]
    fn test_latency_running_average() {
        let mut metrics = ConnectionMetrics::default();
        metrics.record_latency(10);
        metrics.record_latency(20);
        metrics.record_latency(30);
        assert!((metrics.average_latency_ms - 20.0).abs() < f64::EPSILON);
        assert_eq!(metrics.latency_samples, 3);
    }

    #[test]
    fn test_default_status_is_disconnected() {
        assert_eq!(ConnectionState::default().status, ConnectionStatus::Disconnected);
    }
}
