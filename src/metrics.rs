//! Prometheus-compatible metrics endpoint
//!
//! Counters are plain atomics updated from the tick loop and read by the
//! HTTP task. Default endpoint: http://localhost:9090/metrics

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info};

const TICK_HISTORY: usize = 1000;

#[derive(Debug)]
pub struct Metrics {
    // Client slots
    pub clients_connected: AtomicU64,
    pub clients_active: AtomicU64,
    pub clients_zombie: AtomicU64,

    // Traffic
    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub packets_malformed: AtomicU64,
    pub packets_rate_limited: AtomicU64,
    pub queue_dropped: AtomicU64,

    // Snapshots
    pub snapshots_full: AtomicU64,
    pub snapshots_delta: AtomicU64,
    pub snapshot_entities: AtomicU64,
    pub fragments_sent: AtomicU64,
    pub rate_delayed: AtomicU64,

    // Lifecycle
    pub connects_accepted: AtomicU64,
    pub connects_rejected: AtomicU64,
    pub drops: AtomicU64,
    pub timeouts: AtomicU64,

    // Tick timing (microseconds)
    pub tick_time_us: AtomicU64,
    pub tick_time_p95_us: AtomicU64,
    pub tick_time_p99_us: AtomicU64,
    pub tick_time_max_us: AtomicU64,
    pub tick_count: AtomicU64,

    start_time: Instant,
    tick_history: RwLock<VecDeque<u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            clients_connected: AtomicU64::new(0),
            clients_active: AtomicU64::new(0),
            clients_zombie: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            packets_malformed: AtomicU64::new(0),
            packets_rate_limited: AtomicU64::new(0),
            queue_dropped: AtomicU64::new(0),
            snapshots_full: AtomicU64::new(0),
            snapshots_delta: AtomicU64::new(0),
            snapshot_entities: AtomicU64::new(0),
            fragments_sent: AtomicU64::new(0),
            rate_delayed: AtomicU64::new(0),
            connects_accepted: AtomicU64::new(0),
            connects_rejected: AtomicU64::new(0),
            drops: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            tick_time_us: AtomicU64::new(0),
            tick_time_p95_us: AtomicU64::new(0),
            tick_time_p99_us: AtomicU64::new(0),
            tick_time_max_us: AtomicU64::new(0),
            tick_count: AtomicU64::new(0),
            start_time: Instant::now(),
            tick_history: RwLock::new(VecDeque::with_capacity(TICK_HISTORY)),
        }
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    /// Record a tick time and update percentiles
    pub fn record_tick_time(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.tick_time_us.store(us, Ordering::Relaxed);
        self.tick_count.fetch_add(1, Ordering::Relaxed);

        let mut history = self.tick_history.write();
        history.push_back(us);
        while history.len() > TICK_HISTORY {
            history.pop_front();
        }

        if history.len() >= 10 {
            let mut sorted: Vec<u64> = history.iter().copied().collect();
            sorted.sort_unstable();

            let p95_idx = (sorted.len() as f32 * 0.95) as usize;
            let p99_idx = (sorted.len() as f32 * 0.99) as usize;

            self.tick_time_p95_us
                .store(sorted[p95_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_p99_us
                .store(sorted[p99_idx.min(sorted.len() - 1)], Ordering::Relaxed);
            self.tick_time_max_us
                .store(sorted.last().copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Update the per-state slot gauges
    pub fn set_clients(&self, connected: u64, active: u64, zombie: u64) {
        self.clients_connected.store(connected, Ordering::Relaxed);
        self.clients_active.store(active, Ordering::Relaxed);
        self.clients_zombie.store(zombie, Ordering::Relaxed);
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Generate Prometheus-format metrics output
    pub fn to_prometheus(&self) -> String {
        let mut output = String::with_capacity(4096);

        macro_rules! metric {
            ($name:expr, $help:expr, $type:expr, $value:expr) => {
                output.push_str(&format!(
                    "# HELP {} {}\n# TYPE {} {}\n{} {}\n",
                    $name, $help, $name, $type, $name, $value
                ));
            };
        }

        metric!("snapwire_clients_connected", "Clients connecting or primed", "gauge",
            self.clients_connected.load(Ordering::Relaxed));
        metric!("snapwire_clients_active", "Clients in the world", "gauge",
            self.clients_active.load(Ordering::Relaxed));
        metric!("snapwire_clients_zombie", "Slots in their post-drop grace period", "gauge",
            self.clients_zombie.load(Ordering::Relaxed));

        metric!("snapwire_packets_received_total", "Datagrams received", "counter",
            self.packets_received.load(Ordering::Relaxed));
        metric!("snapwire_packets_sent_total", "Datagrams sent", "counter",
            self.packets_sent.load(Ordering::Relaxed));
        metric!("snapwire_bytes_received_total", "Bytes received", "counter",
            self.bytes_received.load(Ordering::Relaxed));
        metric!("snapwire_bytes_sent_total", "Bytes sent", "counter",
            self.bytes_sent.load(Ordering::Relaxed));
        metric!("snapwire_packets_malformed_total", "Undecodable datagrams ignored", "counter",
            self.packets_malformed.load(Ordering::Relaxed));
        metric!("snapwire_packets_rate_limited_total", "Requests dropped by the address limiter", "counter",
            self.packets_rate_limited.load(Ordering::Relaxed));
        metric!("snapwire_queue_dropped_total", "Datagrams dropped on a full receive queue", "counter",
            self.queue_dropped.load(Ordering::Relaxed));

        metric!("snapwire_snapshots_full_total", "Snapshots sent without a baseline", "counter",
            self.snapshots_full.load(Ordering::Relaxed));
        metric!("snapwire_snapshots_delta_total", "Snapshots delta compressed", "counter",
            self.snapshots_delta.load(Ordering::Relaxed));
        metric!("snapwire_snapshot_entities_total", "Entity updates written into snapshots", "counter",
            self.snapshot_entities.load(Ordering::Relaxed));
        metric!("snapwire_fragments_sent_total", "Message fragments sent", "counter",
            self.fragments_sent.load(Ordering::Relaxed));
        metric!("snapwire_rate_delayed_total", "Snapshots delayed by client bandwidth", "counter",
            self.rate_delayed.load(Ordering::Relaxed));

        metric!("snapwire_connects_accepted_total", "Connections accepted", "counter",
            self.connects_accepted.load(Ordering::Relaxed));
        metric!("snapwire_connects_rejected_total", "Connections refused", "counter",
            self.connects_rejected.load(Ordering::Relaxed));
        metric!("snapwire_drops_total", "Clients dropped", "counter",
            self.drops.load(Ordering::Relaxed));
        metric!("snapwire_timeouts_total", "Clients dropped for inactivity", "counter",
            self.timeouts.load(Ordering::Relaxed));

        metric!("snapwire_tick_time_microseconds", "Current tick time in microseconds", "gauge",
            self.tick_time_us.load(Ordering::Relaxed));
        metric!("snapwire_tick_time_p95_microseconds", "95th percentile tick time", "gauge",
            self.tick_time_p95_us.load(Ordering::Relaxed));
        metric!("snapwire_tick_time_p99_microseconds", "99th percentile tick time", "gauge",
            self.tick_time_p99_us.load(Ordering::Relaxed));
        metric!("snapwire_tick_time_max_microseconds", "Maximum tick time", "gauge",
            self.tick_time_max_us.load(Ordering::Relaxed));
        metric!("snapwire_tick_count", "Total ticks processed", "counter",
            self.tick_count.load(Ordering::Relaxed));
        metric!("snapwire_uptime_seconds", "Server uptime in seconds", "counter",
            self.uptime_seconds());

        output
    }

    /// JSON view for direct API access
    pub fn to_json(&self) -> String {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        let value = json!({
            "clients": {
                "connected": load(&self.clients_connected),
                "active": load(&self.clients_active),
                "zombie": load(&self.clients_zombie),
            },
            "network": {
                "packets_received": load(&self.packets_received),
                "packets_sent": load(&self.packets_sent),
                "bytes_received": load(&self.bytes_received),
                "bytes_sent": load(&self.bytes_sent),
                "malformed": load(&self.packets_malformed),
                "rate_limited": load(&self.packets_rate_limited),
                "queue_dropped": load(&self.queue_dropped),
            },
            "snapshots": {
                "full": load(&self.snapshots_full),
                "delta": load(&self.snapshots_delta),
                "entities": load(&self.snapshot_entities),
                "fragments": load(&self.fragments_sent),
                "rate_delayed": load(&self.rate_delayed),
            },
            "lifecycle": {
                "accepted": load(&self.connects_accepted),
                "rejected": load(&self.connects_rejected),
                "drops": load(&self.drops),
                "timeouts": load(&self.timeouts),
            },
            "performance": {
                "tick_time_us": load(&self.tick_time_us),
                "tick_time_p95_us": load(&self.tick_time_p95_us),
                "tick_time_p99_us": load(&self.tick_time_p99_us),
                "tick_time_max_us": load(&self.tick_time_max_us),
                "tick_count": load(&self.tick_count),
                "uptime_seconds": self.uptime_seconds(),
            },
        });
        serde_json::to_string_pretty(&value).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn http_response(status: &str, content_type: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    )
}

/// Route one request line
fn respond(metrics: &Metrics, request: &str) -> String {
    let path = request
        .lines()
        .next()
        .and_then(|line| line.strip_prefix("GET "))
        .and_then(|rest| rest.split_whitespace().next());

    match path {
        Some("/metrics/json") | Some("/json") => {
            http_response("200 OK", "application/json", &metrics.to_json())
        }
        Some("/metrics") => http_response(
            "200 OK",
            "text/plain; version=0.0.4",
            &metrics.to_prometheus(),
        ),
        Some("/health") | Some("/") => http_response("200 OK", "text/plain", "OK"),
        _ => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
    }
}

/// Start the metrics HTTP server
pub async fn start_metrics_server(metrics: Arc<Metrics>, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr).await?;

    info!("Metrics server listening on http://{}/metrics", addr);

    loop {
        let (mut socket, peer) = listener.accept().await?;
        let metrics = metrics.clone();

        tokio::spawn(async move {
            let mut buffer = [0u8; 1024];

            match socket.read(&mut buffer).await {
                Ok(n) if n > 0 => {
                    let request = String::from_utf8_lossy(&buffer[..n]);
                    let response = respond(&metrics, &request);
                    if let Err(e) = socket.write_all(response.as_bytes()).await {
                        debug!("Failed to write metrics response to {}: {}", peer, e);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Failed to read from metrics socket {}: {}", peer, e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.clients_active.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_record_tick_time() {
        let metrics = Metrics::new();
        for i in 0..100 {
            metrics.record_tick_time(Duration::from_micros(100 + i * 10));
        }

        assert_eq!(metrics.tick_count.load(Ordering::Relaxed), 100);
        assert!(metrics.tick_time_p95_us.load(Ordering::Relaxed) > 0);
        assert_eq!(metrics.tick_time_max_us.load(Ordering::Relaxed), 1090);
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.set_clients(2, 5, 1);
        Metrics::incr(&metrics.snapshots_delta);

        let output = metrics.to_prometheus();
        assert!(output.contains("snapwire_clients_active 5"));
        assert!(output.contains("snapwire_clients_zombie 1"));
        assert!(output.contains("snapwire_snapshots_delta_total 1"));
        assert!(output.contains("# HELP"));
        assert!(output.contains("# TYPE"));
    }

    #[test]
    fn test_json_format() {
        let metrics = Metrics::new();
        Metrics::add(&metrics.bytes_sent, 1200);

        let value: serde_json::Value = serde_json::from_str(&metrics.to_json()).unwrap();
        assert_eq!(value["network"]["bytes_sent"], 1200);
        assert!(value["performance"]["tick_count"].is_u64());
    }

    #[test]
    fn test_routes() {
        let metrics = Metrics::new();
        assert!(respond(&metrics, "GET /metrics HTTP/1.1\r\n").contains("# TYPE"));
        assert!(respond(&metrics, "GET /metrics/json HTTP/1.1\r\n").contains("application/json"));
        assert!(respond(&metrics, "GET /health HTTP/1.1\r\n").ends_with("OK"));
        assert!(respond(&metrics, "POST /metrics HTTP/1.1\r\n").starts_with("HTTP/1.1 404"));
    }
}
