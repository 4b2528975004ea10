//! Connection registry and periodic resource reporting.
//!
//! The monitor samples the registry on a fixed interval, independent of
//! traffic, and appends one [`ResourceReport`] to its sink per tick. A
//! failing or slow sink costs that one report and nothing else.

pub mod registry;
pub mod sink;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

pub use registry::ConnectionRegistry;
pub use sink::{default_report_dir, CsvReportSink, MemorySink, ReportSink, SinkError};

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub interval: Duration,
    /// Upper bound on one sink append.
    pub sink_timeout: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30 * 60),
            sink_timeout: Duration::from_secs(10),
        }
    }
}

impl MonitorConfig {
    pub fn for_testing() -> Self {
        Self {
            interval: Duration::from_millis(20),
            sink_timeout: Duration::from_millis(200),
        }
    }
}

/// Connection-age percentiles in seconds, nearest-rank.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgePercentiles {
    pub p10: f64,
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl AgePercentiles {
    /// `ages` must be sorted ascending. All zero when empty.
    fn from_sorted(ages: &[f64]) -> Self {
        let rank = |p: f64| -> f64 {
            if ages.is_empty() {
                return 0.0;
            }
            let n = ages.len();
            let index = (p * n as f64 / 100.0).ceil() as usize;
            ages[index.clamp(1, n) - 1]
        };
        Self {
            p10: rank(10.0),
            p50: rank(50.0),
            p75: rank(75.0),
            p90: rank(90.0),
            p95: rank(95.0),
            p99: rank(99.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceReport {
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    pub uptime_secs: u64,
    pub connection_count: usize,
    pub mean_age_secs: f64,
    pub age_percentiles: AgePercentiles,
    pub subscribed_documents: usize,
    pub subscribed_queries: usize,
    pub resident_memory_bytes: u64,
}

impl ResourceReport {
    #[cfg(test)]
    pub(crate) fn empty_for_test() -> Self {
        Self {
            timestamp: Utc::now(),
            pid: std::process::id(),
            uptime_secs: 0,
            connection_count: 0,
            mean_age_secs: 0.0,
            age_percentiles: AgePercentiles::default(),
            subscribed_documents: 0,
            subscribed_queries: 0,
            resident_memory_bytes: 0,
        }
    }
}

pub struct ResourceMonitor {
    registry: Arc<ConnectionRegistry>,
    sink: Arc<dyn ReportSink>,
    config: MonitorConfig,
    started: Instant,
    system: Mutex<System>,
}

impl ResourceMonitor {
    pub fn new(registry: Arc<ConnectionRegistry>, sink: Arc<dyn ReportSink>, config: MonitorConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            sink,
            config,
            started: Instant::now(),
            system: Mutex::new(System::new()),
        })
    }

    async fn resident_memory(&self) -> u64 {
        let pid = Pid::from_u32(std::process::id());
        let mut system = self.system.lock().await;
        if !system.refresh_process(pid) {
            return 0;
        }
        system.process(pid).map_or(0, |p| p.memory())
    }

    /// Sample the registry now.
    pub async fn report(&self) -> ResourceReport {
        let connections = self.registry.snapshot().await;
        let mut ages: Vec<f64> = connections.iter().map(|c| c.age().as_secs_f64()).collect();
        ages.sort_by(|a, b| a.total_cmp(b));
        let mean_age_secs = if ages.is_empty() {
            0.0
        } else {
            ages.iter().sum::<f64>() / ages.len() as f64
        };

        let mut subscribed_documents = 0;
        let mut subscribed_queries = 0;
        for conn in &connections {
            subscribed_documents += conn.subscribed_document_count().await;
            subscribed_queries += conn.subscribed_query_count().await;
        }

        ResourceReport {
            timestamp: Utc::now(),
            pid: std::process::id(),
            uptime_secs: self.started.elapsed().as_secs(),
            connection_count: connections.len(),
            mean_age_secs,
            age_percentiles: AgePercentiles::from_sorted(&ages),
            subscribed_documents,
            subscribed_queries,
            resident_memory_bytes: self.resident_memory().await,
        }
    }

    /// Sweep, report, append. Returns whether the report reached the sink.
    pub async fn tick(&self) -> bool {
        self.registry.sweep().await;
        let report = self.report().await;
        match tokio::time::timeout(self.config.sink_timeout, self.sink.append(&report)).await {
            Ok(Ok(())) => {
                log::debug!(
                    "Resource report: {} connection(s), {} bytes resident",
                    report.connection_count,
                    report.resident_memory_bytes
                );
                true
            }
            Ok(Err(e)) => {
                log::warn!("Dropping resource report: {e}");
                false
            }
            Err(_) => {
                log::warn!(
                    "Dropping resource report: sink did not finish within {:?}",
                    self.config.sink_timeout
                );
                false
            }
        }
    }

    /// Report once immediately, then every `interval` until the handle is stopped.
    pub fn start(self: Arc<Self>) -> MonitorHandle {
        let (stop, mut stopped) = watch::channel(false);
        let period = self.config.interval;
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::info!("Resource monitor started, reporting every {period:?}");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.tick().await;
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }
            log::info!("Resource monitor stopped");
        });
        MonitorHandle { stop, task }
    }
}

pub struct MonitorHandle {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    /// Cancel the periodic task and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            log::error!("Resource monitor task failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Session;
    use crate::connection::Connection;
    use async_trait::async_trait;

    struct FailingSink;

    #[async_trait]
    impl ReportSink for FailingSink {
        async fn append(&self, _report: &ResourceReport) -> Result<(), SinkError> {
            Err(SinkError::Unavailable("disk full".into()))
        }
    }

    struct StuckSink;

    #[async_trait]
    impl ReportSink for StuckSink {
        async fn append(&self, _report: &ResourceReport) -> Result<(), SinkError> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[test]
    fn test_nearest_rank_percentiles() {
        let ages: Vec<f64> = (1..=10).map(f64::from).collect();
        let p = AgePercentiles::from_sorted(&ages);
        assert_eq!(p.p10, 1.0);
        assert_eq!(p.p50, 5.0);
        assert_eq!(p.p75, 8.0);
        assert_eq!(p.p90, 9.0);
        assert_eq!(p.p99, 10.0);
        assert_eq!(AgePercentiles::from_sorted(&[]), AgePercentiles::default());
    }

    #[tokio::test]
    async fn test_report_counts_open_connections() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (a, _rx_a) = Connection::new(Session::server());
        let (b, _rx_b) = Connection::new(Session::server());
        a.add_subscription("projects", "p1").await;
        a.add_subscription("projects", "p2").await;
        b.add_query(1).await;
        registry.register(a).await;
        registry.register(b.clone()).await;

        let sink = Arc::new(MemorySink::new());
        let monitor = ResourceMonitor::new(registry.clone(), sink.clone(), MonitorConfig::for_testing());
        let report = monitor.report().await;
        assert_eq!(report.connection_count, 2);
        assert_eq!(report.subscribed_documents, 2);
        assert_eq!(report.subscribed_queries, 1);

        b.close();
        assert!(monitor.tick().await);
        let reports = sink.reports().await;
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].connection_count, 1);
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_sink_failures_are_swallowed() {
        let registry = Arc::new(ConnectionRegistry::new());
        let failing = ResourceMonitor::new(registry.clone(), Arc::new(FailingSink), MonitorConfig::for_testing());
        assert!(!failing.tick().await);
        let stuck = ResourceMonitor::new(registry, Arc::new(StuckSink), MonitorConfig::for_testing());
        assert!(!stuck.tick().await);
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let sink = Arc::new(MemorySink::new());
        let monitor = ResourceMonitor::new(
            Arc::new(ConnectionRegistry::new()),
            sink.clone(),
            MonitorConfig::for_testing(),
        );
        let handle = monitor.start();
        tokio::time::sleep(Duration::from_millis(120)).await;
        handle.stop().await;
        let count = sink.reports().await.len();
        assert!(count >= 1, "expected periodic reports, got {count}");

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(sink.reports().await.len(), count);
    }

    #[tokio::test]
    async fn test_first_report_is_immediate() {
        let sink = Arc::new(MemorySink::new());
        let monitor = ResourceMonitor::new(
            Arc::new(ConnectionRegistry::new()),
            sink.clone(),
            MonitorConfig {
                interval: Duration::from_secs(3600),
                ..MonitorConfig::for_testing()
            },
        );
        let handle = monitor.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.stop().await;
        assert_eq!(sink.reports().await.len(), 1);
    }
}
