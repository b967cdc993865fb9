use std::sync::Arc;

use axum::{
    extract::State,
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::{RewardConfig, ServerConfig};
use crate::error::{Result as WafResult, WafError};
use crate::waf::{Decision, DecisionPipeline, RequestRecord};

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    message: Option<String>,
    timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T> {
    fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            timestamp: chrono::Utc::now(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ModeRequest {
    observe_only: bool,
}

#[derive(Debug, Deserialize)]
struct ExplorationRateRequest {
    exploration_rate: f64,
}

/// Ingress and admin HTTP surface for the decision pipeline
pub struct ApiServer {
    config: ServerConfig,
    pipeline: Arc<DecisionPipeline>,
}

impl ApiServer {
    pub fn new(config: &ServerConfig, pipeline: Arc<DecisionPipeline>) -> Self {
        Self {
            config: config.clone(),
            pipeline,
        }
    }

    /// Serve until `shutdown` resolves
    pub async fn start<F>(&self, shutdown: F) -> WafResult<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = router(self.pipeline.clone());

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| WafError::Internal(format!("Failed to bind API server: {}", e)))?;

        info!("API server listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| WafError::Internal(format!("API server error: {}", e)))?;

        Ok(())
    }
}

pub fn router(pipeline: Arc<DecisionPipeline>) -> Router {
    Router::new()
        .route("/api/v1/inspect", post(inspect))
        .route("/api/v1/stats", get(get_statistics))
        .route("/api/v1/mode", put(set_mode))
        .route("/api/v1/exploration-rate", put(set_exploration_rate))
        .route("/api/v1/reward-weights", get(get_reward_weights).put(set_reward_weights))
        .route("/api/v1/checkpoint", post(save_checkpoint))
        .route("/api/v1/health", get(health_check))
        .layer(CorsLayer::permissive())
        .with_state(pipeline)
}

/// Decide on a request record. An optional boolean `is_attack` field supplies ground truth.
async fn inspect(
    State(pipeline): State<Arc<DecisionPipeline>>,
    Json(body): Json<Value>,
) -> WafResult<Json<ApiResponse<Decision>>> {
    let label = body.get("is_attack").and_then(Value::as_bool);
    let record = RequestRecord::from_json(body)?;

    let decision = match label {
        Some(is_attack) => pipeline.process_labeled(&record, is_attack).await,
        None => pipeline.process(&record).await,
    };
    Ok(Json(ApiResponse::success(decision)))
}

async fn get_statistics(State(pipeline): State<Arc<DecisionPipeline>>) -> Json<ApiResponse<Value>> {
    Json(ApiResponse::success(pipeline.statistics().await))
}

async fn set_mode(
    State(pipeline): State<Arc<DecisionPipeline>>,
    Json(request): Json<ModeRequest>,
) -> Json<ApiResponse<Value>> {
    pipeline.set_observe_only(request.observe_only);
    Json(ApiResponse::success(json!({ "mode": pipeline.mode().as_str() })))
}

async fn set_exploration_rate(
    State(pipeline): State<Arc<DecisionPipeline>>,
    Json(request): Json<ExplorationRateRequest>,
) -> WafResult<Json<ApiResponse<Value>>> {
    if !(0.0..=1.0).contains(&request.exploration_rate) {
        return Err(WafError::BadRequest(format!(
            "exploration_rate must be within [0, 1], got {}",
            request.exploration_rate
        )));
    }

    pipeline.set_exploration_rate(request.exploration_rate).await;
    let rate = pipeline.agent().exploration_rate().await;
    Ok(Json(ApiResponse::success(json!({ "exploration_rate": rate }))))
}

async fn get_reward_weights(State(pipeline): State<Arc<DecisionPipeline>>) -> Json<ApiResponse<RewardConfig>> {
    Json(ApiResponse::success(pipeline.reward_weights().await))
}

/// Replace the reward weights. Omitted fields take their default values.
async fn set_reward_weights(
    State(pipeline): State<Arc<DecisionPipeline>>,
    Json(weights): Json<RewardConfig>,
) -> WafResult<Json<ApiResponse<RewardConfig>>> {
    pipeline
        .set_reward_weights(weights)
        .await
        .map_err(|e| WafError::BadRequest(e.to_string()))?;
    Ok(Json(ApiResponse::success(pipeline.reward_weights().await)))
}

async fn save_checkpoint(State(pipeline): State<Arc<DecisionPipeline>>) -> WafResult<Json<ApiResponse<Value>>> {
    pipeline.checkpoint().await?;
    Ok(Json(ApiResponse::success(json!({ "saved": true }))))
}

async fn health_check(State(pipeline): State<Arc<DecisionPipeline>>) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "mode": pipeline.mode().as_str(),
        "timestamp": chrono::Utc::now(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointStore, InMemoryCheckpointStore};
    use crate::config::Config;
    use crate::observability::{InMemoryAuditSink, MetricsCollector};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn test_router() -> (Router, Arc<DecisionPipeline>, Arc<InMemoryCheckpointStore>) {
        let mut config = Config::default();
        config.executor.throttle_delay = std::time::Duration::ZERO;
        let store = Arc::new(InMemoryCheckpointStore::new());
        let pipeline = Arc::new(
            DecisionPipeline::new(
                &config,
                store.clone(),
                Arc::new(InMemoryAuditSink::new()),
                Arc::new(MetricsCollector::disabled()),
            )
            .await
            .unwrap(),
        );
        (router(pipeline.clone()), pipeline, store)
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_inspect_returns_decision() {
        let (app, _, _) = test_router().await;
        let request = json_request(
            "POST",
            "/api/v1/inspect",
            json!({ "method": "GET", "path": "/api/user?id=1", "origin": "203.0.113.2" }),
        );

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["final_action"], "log_only");
        assert_eq!(body["data"]["allowed"], true);
        assert_eq!(body["data"]["mode"], "observe_only");
    }

    #[tokio::test]
    async fn test_inspect_rejects_malformed_record() {
        let (app, _, _) = test_router().await;
        let request = json_request("POST", "/api/v1/inspect", json!({ "method": 42, "path": "/" }));

        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "MALFORMED_RECORD");
    }

    #[tokio::test]
    async fn test_mode_and_exploration_rate_updates() {
        let (app, pipeline, _) = test_router().await;

        let response = app
            .clone()
            .oneshot(json_request("PUT", "/api/v1/mode", json!({ "observe_only": false })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["data"]["mode"], "enforce");
        assert!(!pipeline.statistics().await["mode"].as_str().unwrap().contains("observe"));

        let response = app
            .clone()
            .oneshot(json_request("PUT", "/api/v1/exploration-rate", json!({ "exploration_rate": 0.3 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(pipeline.agent().exploration_rate().await, 0.3);

        let response = app
            .oneshot(json_request("PUT", "/api/v1/exploration-rate", json!({ "exploration_rate": 2.0 })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(pipeline.agent().exploration_rate().await, 0.3);
    }

    #[tokio::test]
    async fn test_reward_weights_endpoint() {
        let (app, pipeline, _) = test_router().await;

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/v1/reward-weights",
                json!({ "attack_blocked_reward": 2.0, "false_positive_penalty": -3.0 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["data"]["attack_blocked_reward"], 2.0);
        assert_eq!(pipeline.reward_weights().await.false_positive_penalty, -3.0);

        let response = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/api/v1/reward-weights",
                json!({ "false_positive_penalty": 3.0 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(pipeline.reward_weights().await.attack_blocked_reward, 2.0);

        let response = app
            .oneshot(Request::builder().uri("/api/v1/reward-weights").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(body_json(response).await["data"]["false_positive_penalty"], -3.0);
    }

    #[tokio::test]
    async fn test_checkpoint_endpoint_saves_policy() {
        let (app, _, store) = test_router().await;
        let response = app
            .oneshot(Request::builder().method("POST").uri("/api/v1/checkpoint").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(store.load().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_health_and_stats() {
        let (app, _, _) = test_router().await;
        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "healthy");

        let response = app
            .oneshot(Request::builder().uri("/api/v1/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["data"]["requests_processed"], 0);
        assert!(body["data"]["policy"]["exploration_rate"].is_number());
    }
}
