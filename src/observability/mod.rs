pub mod audit;
pub mod metrics;

pub use audit::{AuditSink, DecisionRecord, InMemoryAuditSink, JsonLinesAuditSink, NullAuditSink};
pub use metrics::MetricsCollector;
