use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::config::{Config, RewardConfig};
use crate::error::Result as WafResult;
use crate::observability::{AuditSink, DecisionRecord, JsonLinesAuditSink, MetricsCollector, NullAuditSink};
use super::{
    Action, ActionExecutor, ExecutionResult, FeatureExtractor, FeatureVector, Outcome, PolicyAgent,
    RequestRecord, RewardCalculator, SafetyLayer,
};

/// Prefix of the error carried by fail-open decisions
pub const PIPELINE_ERROR_MARKER: &str = "DECISION_PIPELINE_ERROR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    /// Every final action becomes LogOnly; decisions are learned from but not enforced.
    ObserveOnly,
    Enforce,
}

impl OperatingMode {
    pub fn from_observe_only(observe_only: bool) -> Self {
        if observe_only {
            OperatingMode::ObserveOnly
        } else {
            OperatingMode::Enforce
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperatingMode::ObserveOnly => "observe_only",
            OperatingMode::Enforce => "enforce",
        }
    }
}

/// Everything decided for one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub mode: OperatingMode,
    /// Action chosen by the policy, before constraints
    pub policy_action: Option<Action>,
    /// Action after the safety layer
    pub safety_action: Option<Action>,
    /// Action actually executed
    pub final_action: Action,
    pub allowed: bool,
    pub modified: bool,
    pub execution: Option<ExecutionResult>,
    pub reward: Option<f64>,
    pub is_attack: Option<bool>,
    pub attack_probability: Option<f64>,
    pub latency_ms: f64,
    pub error: Option<String>,
}

impl Decision {
    /// Allow-and-log fallback used when a stage fails
    pub fn fail_open(mode: OperatingMode, message: String, latency_ms: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            mode,
            policy_action: None,
            safety_action: None,
            final_action: Action::Allow,
            allowed: true,
            modified: false,
            execution: None,
            reward: None,
            is_attack: None,
            attack_probability: None,
            latency_ms,
            error: Some(format!("{}: {}", PIPELINE_ERROR_MARKER, message)),
        }
    }

    pub fn is_fail_open(&self) -> bool {
        self.error.is_some()
    }
}

/// Per-request orchestrator: extract, select, constrain, gate on mode,
/// execute, score, update, and periodically checkpoint.
pub struct DecisionPipeline {
    extractor: FeatureExtractor,
    agent: Arc<PolicyAgent>,
    safety: SafetyLayer,
    executor: ActionExecutor,
    rewards: RwLock<RewardCalculator>,
    checkpoint_store: Arc<dyn CheckpointStore>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<MetricsCollector>,
    observe_only: AtomicBool,
    checkpoint_interval: u64,
    requests_processed: AtomicU64,
    fail_open_count: AtomicU64,
}

impl DecisionPipeline {
    /// Build the pipeline and restore the policy from `checkpoint_store`.
    /// A missing or unreadable checkpoint starts a fresh policy.
    pub async fn new(
        config: &Config,
        checkpoint_store: Arc<dyn CheckpointStore>,
        audit: Arc<dyn AuditSink>,
        metrics: Arc<MetricsCollector>,
    ) -> WafResult<Self> {
        let agent = Arc::new(PolicyAgent::new(&config.policy));

        match agent.load_checkpoint(checkpoint_store.as_ref()).await {
            Ok(true) => {
                agent.set_exploration_rate(config.policy.exploration_rate).await;
                let stats = agent.statistics().await;
                info!(
                    "Loaded policy checkpoint from {} ({} updates, {} states)",
                    checkpoint_store.location(),
                    stats["total_updates"],
                    stats["states_learned"]
                );
            }
            Ok(false) => info!("No policy checkpoint at {}, starting fresh", checkpoint_store.location()),
            Err(e) => warn!(
                "Could not load policy checkpoint from {}: {}; starting fresh",
                checkpoint_store.location(),
                e
            ),
        }

        Ok(Self {
            extractor: FeatureExtractor::new(),
            agent,
            safety: SafetyLayer::new(&config.safety)?,
            executor: ActionExecutor::new(&config.executor),
            rewards: RwLock::new(RewardCalculator::new(config.reward.clone())),
            checkpoint_store,
            audit,
            metrics,
            observe_only: AtomicBool::new(config.pipeline.observe_only),
            checkpoint_interval: config.pipeline.checkpoint_interval.max(1),
            requests_processed: AtomicU64::new(0),
            fail_open_count: AtomicU64::new(0),
        })
    }

    /// Pipeline backed by the configured checkpoint file and audit log.
    pub async fn from_config(config: &Config, metrics: Arc<MetricsCollector>) -> WafResult<Self> {
        let store: Arc<dyn CheckpointStore> =
            Arc::new(FileCheckpointStore::new(&config.pipeline.checkpoint_path));
        let audit: Arc<dyn AuditSink> = if config.logging.audit_log.enabled {
            Arc::new(JsonLinesAuditSink::open(&config.logging.audit_log.output)?)
        } else {
            Arc::new(NullAuditSink)
        };
        Self::new(config, store, audit, metrics).await
    }

    pub fn agent(&self) -> &Arc<PolicyAgent> {
        &self.agent
    }

    pub fn extractor(&self) -> &FeatureExtractor {
        &self.extractor
    }

    pub fn mode(&self) -> OperatingMode {
        OperatingMode::from_observe_only(self.observe_only.load(Ordering::Relaxed))
    }

    pub fn set_observe_only(&self, observe_only: bool) {
        self.observe_only.store(observe_only, Ordering::Relaxed);
        info!("Operating mode set to {}", OperatingMode::from_observe_only(observe_only).as_str());
    }

    pub async fn set_exploration_rate(&self, rate: f64) {
        self.agent.set_exploration_rate(rate).await;
    }

    pub fn set_throttle_delay(&self, delay: Duration) {
        self.executor.set_throttle_delay(delay);
    }

    pub async fn reward_weights(&self) -> RewardConfig {
        self.rewards.read().await.weights().clone()
    }

    /// Retune reward weights without a restart. Applies to every request
    /// scored after the call.
    pub async fn set_reward_weights(&self, weights: RewardConfig) -> WafResult<()> {
        self.rewards.write().await.set_weights(weights)?;
        info!("Reward weights updated");
        Ok(())
    }

    /// Decide using the heuristic attack label for the reward.
    pub async fn process(&self, record: &RequestRecord) -> Decision {
        self.run(record, None).await
    }

    /// Decide using caller-supplied ground truth for the reward.
    pub async fn process_labeled(&self, record: &RequestRecord, is_attack: bool) -> Decision {
        self.run(record, Some(is_attack)).await
    }

    async fn run(&self, record: &RequestRecord, label: Option<bool>) -> Decision {
        let started = Instant::now();
        let mode = self.mode();

        let (decision, features) = match self.try_process(record, label, mode, started).await {
            Ok((decision, features)) => {
                let processed = self.requests_processed.fetch_add(1, Ordering::Relaxed) + 1;
                if processed % self.checkpoint_interval == 0 {
                    debug!("Periodic checkpoint after {} requests", processed);
                    let _ = self.checkpoint().await;
                }
                (decision, Some(features))
            }
            Err(e) => {
                self.fail_open_count.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_fail_open();
                error!(
                    "Decision pipeline failed for {} {} from {}: {}; allowing request",
                    record.method,
                    record.path,
                    record.origin.as_deref().unwrap_or("unknown"),
                    e
                );
                let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                (Decision::fail_open(mode, e.to_string(), latency_ms), None)
            }
        };

        self.metrics
            .record_decision(decision.final_action, decision.reward, started.elapsed().as_secs_f64());

        let audit_record = DecisionRecord::new(record, features, decision.clone());
        if let Err(e) = self.audit.record(&audit_record).await {
            warn!("Failed to record decision {}: {}", decision.id, e);
        }

        decision
    }

    async fn try_process(
        &self,
        record: &RequestRecord,
        label: Option<bool>,
        mode: OperatingMode,
        started: Instant,
    ) -> WafResult<(Decision, FeatureVector)> {
        let features = self.extractor.extract(record)?;

        let policy_action = self.agent.select(&features).await;
        let safety_action = self.safety.constrain(
            policy_action,
            Some(record.path.as_str()),
            record.origin.as_deref(),
            None,
        );
        let final_action = match mode {
            OperatingMode::ObserveOnly => Action::LogOnly,
            OperatingMode::Enforce => safety_action,
        };

        let execution = self.executor.execute(final_action, record.request_data()).await;

        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        let observed = Outcome {
            is_attack: label.unwrap_or(false),
            http_status: if execution.allowed { 200 } else { 403 },
            latency_ms,
            ..Default::default()
        };
        let (outcome, attack_probability, reward) = {
            let rewards = self.rewards.read().await;
            let outcome = match label {
                Some(_) => observed,
                None => rewards.label_outcome(&features, &observed),
            };
            let attack_probability = outcome
                .attack_probability
                .unwrap_or_else(|| rewards.estimate_attack_probability(&features));
            let reward = rewards.score(final_action, &outcome);
            (outcome, attack_probability, reward)
        };

        self.agent.update(&features, final_action, reward).await?;

        info!(
            "{} {} | policy:{} -> safety:{} -> final:{} | reward:{:+.2} | attack:{:.2}",
            record.method,
            truncate(&record.path, 50),
            policy_action,
            safety_action,
            final_action,
            reward,
            attack_probability
        );

        let decision = Decision {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            mode,
            policy_action: Some(policy_action),
            safety_action: Some(safety_action),
            final_action,
            allowed: execution.allowed,
            modified: execution.modified,
            execution: Some(execution),
            reward: Some(reward),
            is_attack: Some(outcome.is_attack),
            attack_probability: Some(attack_probability),
            latency_ms,
            error: None,
        };
        Ok((decision, features))
    }

    /// Save the policy now. Failures are logged and returned; the in-memory
    /// policy keeps running either way.
    pub async fn checkpoint(&self) -> WafResult<()> {
        match self.agent.save_checkpoint(self.checkpoint_store.as_ref()).await {
            Ok(()) => {
                self.metrics.record_checkpoint(true);
                info!("Policy checkpoint saved to {}", self.checkpoint_store.location());
                Ok(())
            }
            Err(e) => {
                self.metrics.record_checkpoint(false);
                warn!("Failed to save policy checkpoint to {}: {}", self.checkpoint_store.location(), e);
                Err(e)
            }
        }
    }

    /// Final checkpoint and statistics summary
    pub async fn shutdown(&self) -> WafResult<()> {
        let result = self.checkpoint().await;
        let stats = self.statistics().await;
        info!(
            "Decision pipeline stopped: {} requests, {} fail-open, {} policy updates",
            stats["requests_processed"], stats["fail_open_count"], stats["policy"]["total_updates"]
        );
        result
    }

    pub async fn statistics(&self) -> serde_json::Value {
        json!({
            "mode": self.mode().as_str(),
            "requests_processed": self.requests_processed.load(Ordering::Relaxed),
            "fail_open_count": self.fail_open_count.load(Ordering::Relaxed),
            "checkpoint": {
                "location": self.checkpoint_store.location(),
                "interval": self.checkpoint_interval,
            },
            "throttle_delay_ms": self.executor.throttle_delay().as_millis() as u64,
            "policy": self.agent.statistics().await,
            "executor": self.executor.statistics(),
            "reward_weights": self.reward_weights().await,
            "audit": self.audit.statistics(),
        })
    }
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
