use anyhow::Result;
use axum::{routing::get, Router};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::info;

use crate::config::MetricsConfig;
use crate::error::{Result as WafResult, WafError};
use crate::waf::Action;

/// Metrics collector for decision pipeline metrics
pub struct MetricsCollector {
    config: MetricsConfig,
    prometheus_handle: Option<PrometheusHandle>,
}

impl MetricsCollector {
    /// Installs the global Prometheus recorder when metrics are enabled.
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        let prometheus_handle = if config.enabled {
            let handle = PrometheusBuilder::new()
                .install_recorder()
                .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

            Self::register_metrics();

            Some(handle)
        } else {
            None
        };

        Ok(Self {
            config: config.clone(),
            prometheus_handle,
        })
    }

    /// Collector that records nothing
    pub fn disabled() -> Self {
        Self {
            config: MetricsConfig::default(),
            prometheus_handle: None,
        }
    }

    fn register_metrics() {
        describe_counter!("waf_decisions_total", "Decisions taken, by final action");
        describe_counter!("waf_fail_open_total", "Requests allowed because the pipeline failed");
        describe_histogram!("waf_reward", "Reward applied to the policy per decision");
        describe_histogram!("waf_decision_latency_seconds", "Time spent deciding on a request");
        describe_counter!("waf_checkpoint_saves_total", "Policy checkpoints written");
        describe_counter!("waf_checkpoint_failures_total", "Policy checkpoint writes that failed");
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    pub fn record_decision(&self, action: Action, reward: Option<f64>, latency_seconds: f64) {
        if !self.is_enabled() {
            return;
        }

        counter!("waf_decisions_total", "action" => action.as_str()).increment(1);
        if let Some(reward) = reward {
            histogram!("waf_reward").record(reward);
        }
        histogram!("waf_decision_latency_seconds").record(latency_seconds);
    }

    pub fn record_fail_open(&self) {
        if !self.is_enabled() {
            return;
        }
        counter!("waf_fail_open_total").increment(1);
    }

    pub fn record_checkpoint(&self, success: bool) {
        if !self.is_enabled() {
            return;
        }
        if success {
            counter!("waf_checkpoint_saves_total").increment(1);
        } else {
            counter!("waf_checkpoint_failures_total").increment(1);
        }
    }

    /// Prometheus text exposition, if enabled
    pub fn render(&self) -> Option<String> {
        self.prometheus_handle.as_ref().map(|handle| handle.render())
    }

    /// Serve the exposition endpoint until the listener fails
    pub async fn start_server(&self) -> WafResult<()> {
        let handle = match &self.prometheus_handle {
            Some(handle) => handle.clone(),
            None => return Err(WafError::Internal("Prometheus handle not available".to_string())),
        };

        let app = Router::new()
            .route(&self.config.path, get(move || async move { handle.render() }))
            .route("/health", get(|| async { "OK" }));

        let addr = format!("0.0.0.0:{}", self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| WafError::Internal(format!("Failed to bind metrics server: {}", e)))?;

        info!("Metrics server listening on {}{}", addr, self.config.path);

        axum::serve(listener, app)
            .await
            .map_err(|e| WafError::Internal(format!("Metrics server error: {}", e)))?;

        Ok(())
    }
}
