use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::info;

use crate::error::{Result as WafResult, WafError};
use crate::waf::{Decision, FeatureVector, RequestRecord};

/// Completed request plus the decision taken on it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub method: String,
    pub path: String,
    pub origin: Option<String>,
    /// Absent when extraction itself failed
    pub features: Option<FeatureVector>,
    #[serde(flatten)]
    pub decision: Decision,
}

impl DecisionRecord {
    pub fn new(record: &RequestRecord, features: Option<FeatureVector>, decision: Decision) -> Self {
        Self {
            method: record.method.clone(),
            path: record.path.clone(),
            origin: record.origin.clone(),
            features,
            decision,
        }
    }
}

/// Durable destination for decision records. Failures never abort a decision.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &DecisionRecord) -> WafResult<()>;

    fn statistics(&self) -> serde_json::Value {
        json!({})
    }
}

/// Appends one JSON document per line to a file
pub struct JsonLinesAuditSink {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
    records_written: AtomicU64,
    write_errors: AtomicU64,
}

impl JsonLinesAuditSink {
    pub fn open(path: impl AsRef<Path>) -> WafResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        info!("Writing decision audit log to {}", path.display());

        Ok(Self {
            path,
            file: Mutex::new(tokio::fs::File::from_std(file)),
            records_written: AtomicU64::new(0),
            write_errors: AtomicU64::new(0),
        })
    }

    async fn write_line(&self, line: &[u8]) -> std::io::Result<()> {
        let mut file = self.file.lock().await;
        file.write_all(line).await?;
        file.flush().await
    }
}

#[async_trait]
impl AuditSink for JsonLinesAuditSink {
    async fn record(&self, record: &DecisionRecord) -> WafResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        self.write_line(&line).await.map_err(|e| {
            self.write_errors.fetch_add(1, Ordering::Relaxed);
            WafError::Audit(format!("Failed to write {}: {}", self.path.display(), e))
        })?;

        self.records_written.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn statistics(&self) -> serde_json::Value {
        json!({
            "output": self.path.display().to_string(),
            "records_written": self.records_written.load(Ordering::Relaxed),
            "write_errors": self.write_errors.load(Ordering::Relaxed),
        })
    }
}

/// Keeps records in memory (for tests and embedding)
#[derive(Default)]
pub struct InMemoryAuditSink {
    records: RwLock<Vec<DecisionRecord>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<DecisionRecord> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn record(&self, record: &DecisionRecord) -> WafResult<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    fn statistics(&self) -> serde_json::Value {
        json!({ "output": "memory" })
    }
}

/// Discards everything; used when the audit log is disabled
pub struct NullAuditSink;

#[async_trait]
impl AuditSink for NullAuditSink {
    async fn record(&self, _record: &DecisionRecord) -> WafResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waf::{Action, OperatingMode};

    fn sample(path: &str) -> DecisionRecord {
        let record = RequestRecord::new("GET", path).with_origin("203.0.113.9");
        let decision = Decision::fail_open(OperatingMode::Enforce, "extraction failed".to_string(), 0.1);
        DecisionRecord::new(&record, None, decision)
    }

    #[tokio::test]
    async fn test_json_lines_sink_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("decisions.jsonl");

        let sink = JsonLinesAuditSink::open(&path).unwrap();
        sink.record(&sample("/a")).await.unwrap();
        sink.record(&sample("/b")).await.unwrap();
        drop(sink);

        let sink = JsonLinesAuditSink::open(&path).unwrap();
        sink.record(&sample("/c")).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["path"], "/a");
        assert_eq!(lines[2]["path"], "/c");
        assert_eq!(lines[0]["origin"], "203.0.113.9");
        assert_eq!(lines[0]["final_action"], "allow");
        assert_eq!(sink.statistics()["records_written"], 1);
    }

    #[tokio::test]
    async fn test_in_memory_sink_keeps_records() {
        let sink = InMemoryAuditSink::new();
        sink.record(&sample("/x")).await.unwrap();

        let records = sink.records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].decision.final_action, Action::Allow);
        assert!(records[0].decision.error.is_some());
    }
}
