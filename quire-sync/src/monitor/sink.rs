//! Report sinks.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::ResourceReport;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn append(&self, report: &ResourceReport) -> Result<(), SinkError>;
}

pub const REPORTS_PATH_ENV: &str = "QUIRE_RESOURCE_REPORTS_PATH";
const REPORTS_DIR_NAME: &str = "quire-resource-reports";
const REPORT_FILE_NAME: &str = "resource-usage.csv";

const CSV_HEADER: &str = "timestamp,pid,uptime_secs,connections,mean_age_secs,p10,p50,p75,p90,p95,p99,subscribed_documents,subscribed_queries,resident_memory_bytes";

/// Resolve the report directory from an environment lookup.
pub fn report_dir_from(get_env: impl Fn(&str) -> Option<String>, cwd: &Path) -> PathBuf {
    let non_empty = |name: &str| get_env(name).filter(|v| !v.is_empty());
    if let Some(dir) = non_empty(REPORTS_PATH_ENV) {
        return PathBuf::from(dir);
    }
    if let Some(xdg) = non_empty("XDG_DATA_HOME") {
        return Path::new(&xdg).join(REPORTS_DIR_NAME);
    }
    if let Some(home) = non_empty("HOME") {
        return Path::new(&home).join(".local/share").join(REPORTS_DIR_NAME);
    }
    cwd.join(REPORTS_DIR_NAME)
}

pub fn default_report_dir() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    report_dir_from(|name| std::env::var(name).ok(), &cwd)
}

/// Appends one CSV row per report, writing the header when the file is new.
pub struct CsvReportSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl CsvReportSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join(REPORT_FILE_NAME),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn row(report: &ResourceReport) -> String {
        let p = &report.age_percentiles;
        format!(
            "{},{},{},{},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{:.3},{},{},{}\n",
            report.timestamp.to_rfc3339(),
            report.pid,
            report.uptime_secs,
            report.connection_count,
            report.mean_age_secs,
            p.p10,
            p.p50,
            p.p75,
            p.p90,
            p.p95,
            p.p99,
            report.subscribed_documents,
            report.subscribed_queries,
            report.resident_memory_bytes
        )
    }
}

#[async_trait]
impl ReportSink for CsvReportSink {
    async fn append(&self, report: &ResourceReport) -> Result<(), SinkError> {
        let _guard = self.write_lock.lock().await;
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let is_new = !tokio::fs::try_exists(&self.path).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut text = String::new();
        if is_new {
            text.push_str(CSV_HEADER);
            text.push('\n');
        }
        text.push_str(&Self::row(report));
        file.write_all(text.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Keeps reports in memory.
#[derive(Default)]
pub struct MemorySink {
    reports: Mutex<Vec<ResourceReport>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reports(&self) -> Vec<ResourceReport> {
        self.reports.lock().await.clone()
    }
}

#[async_trait]
impl ReportSink for MemorySink {
    async fn append(&self, report: &ResourceReport) -> Result<(), SinkError> {
        self.reports.lock().await.push(report.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_report_dir_resolution() {
        let cwd = Path::new("/srv/app");
        assert_eq!(
            report_dir_from(env(&[(REPORTS_PATH_ENV, "/var/reports"), ("HOME", "/home/q")]), cwd),
            PathBuf::from("/var/reports")
        );
        assert_eq!(
            report_dir_from(env(&[("XDG_DATA_HOME", "/data"), ("HOME", "/home/q")]), cwd),
            PathBuf::from("/data/quire-resource-reports")
        );
        assert_eq!(
            report_dir_from(env(&[("XDG_DATA_HOME", ""), ("HOME", "/home/q")]), cwd),
            PathBuf::from("/home/q/.local/share/quire-resource-reports")
        );
        assert_eq!(
            report_dir_from(env(&[]), cwd),
            PathBuf::from("/srv/app/quire-resource-reports")
        );
    }

    #[tokio::test]
    async fn test_csv_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvReportSink::new(dir.path().join("nested"));
        let report = ResourceReport::empty_for_test();
        sink.append(&report).await.unwrap();
        sink.append(&report).await.unwrap();

        let text = tokio::fs::read_to_string(sink.path()).await.unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER);
        assert_eq!(lines[1].split(',').count(), CSV_HEADER.split(',').count());
    }
}
