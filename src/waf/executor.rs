use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::config::ExecutorConfig;
use super::{Action, RequestData};

/// Keywords stripped by Sanitize (whole words, any case)
pub const SANITIZE_KEYWORDS: &[&str] = &[
    "select", "union", "insert", "update", "delete", "drop", "create", "alter", "exec", "execute",
    "script", "javascript", "or", "and",
];

const SANITIZE_COMMENT_TOKENS: &[&str] = &["--", "/*", "*/"];

static SANITIZE_KEYWORD_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"(?i)\b(?:{})\b", SANITIZE_KEYWORDS.join("|"))).unwrap()
});

static REPEATED_SINGLE_QUOTES: Lazy<Regex> = Lazy::new(|| Regex::new(r"'{2,}").unwrap());
static REPEATED_DOUBLE_QUOTES: Lazy<Regex> = Lazy::new(|| Regex::new(r#""{2,}"#).unwrap());

/// Effect of applying an action to a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub action: Action,
    /// Whether the request may proceed
    pub allowed: bool,
    /// Whether `request_data` differs from the input
    pub modified: bool,
    pub request_data: RequestData,
    pub metadata: serde_json::Value,
}

/// Applies final actions to request content
pub struct ActionExecutor {
    throttle_delay_ms: AtomicU64,
    execution_counts: [AtomicU64; 6],
}

impl ActionExecutor {
    pub fn new(config: &ExecutorConfig) -> Self {
        Self {
            throttle_delay_ms: AtomicU64::new(config.throttle_delay.as_millis() as u64),
            execution_counts: Default::default(),
        }
    }

    pub fn throttle_delay(&self) -> Duration {
        Duration::from_millis(self.throttle_delay_ms.load(Ordering::Relaxed))
    }

    pub fn set_throttle_delay(&self, delay: Duration) {
        self.throttle_delay_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Execute `action` on the request. Never fails.
    pub async fn execute(&self, action: Action, data: RequestData) -> ExecutionResult {
        self.execution_counts[action.index()].fetch_add(1, Ordering::Relaxed);

        let result = match action {
            Action::Allow => ExecutionResult {
                action,
                allowed: true,
                modified: false,
                request_data: data,
                metadata: json!({ "reason": "Request allowed by policy" }),
            },
            Action::LogOnly => ExecutionResult {
                action,
                allowed: true,
                modified: false,
                request_data: data,
                metadata: json!({
                    "reason": "Request allowed but flagged for review",
                    "requires_logging": true
                }),
            },
            Action::Sanitize => {
                let (request_data, modified) = sanitize_request(data);
                ExecutionResult {
                    action,
                    allowed: true,
                    modified,
                    request_data,
                    metadata: json!({
                        "reason": "Request sanitized to remove SQL injection patterns",
                        "sanitization_applied": modified
                    }),
                }
            }
            Action::Challenge => ExecutionResult {
                action,
                allowed: false,
                modified: false,
                request_data: data,
                metadata: json!({
                    "reason": "Request requires additional verification",
                    "challenge_required": true,
                    "challenge_type": "captcha"
                }),
            },
            Action::Throttle => {
                let delay = self.throttle_delay();
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                ExecutionResult {
                    action,
                    allowed: true,
                    modified: false,
                    request_data: data,
                    metadata: json!({
                        "reason": "Request throttled due to suspicious activity",
                        "delay_ms": delay.as_millis() as u64,
                        "rate_limit_applied": true
                    }),
                }
            }
            Action::Block => ExecutionResult {
                action,
                allowed: false,
                modified: false,
                request_data: data,
                metadata: json!({
                    "reason": "Request blocked by security policy",
                    "http_status": 403
                }),
            },
        };

        debug!("Executed {} (allowed: {}, modified: {})", action, result.allowed, result.modified);
        result
    }

    /// Execute an action given by name. Unrecognized names fail closed as Block.
    pub async fn execute_named(&self, name: &str, data: RequestData) -> ExecutionResult {
        let action = name.parse::<Action>().unwrap_or_else(|_| {
            warn!("Unknown action '{}', executing as block", name);
            Action::Block
        });
        self.execute(action, data).await
    }

    pub fn statistics(&self) -> serde_json::Value {
        let counts: Vec<(Action, u64)> = Action::ALL
            .iter()
            .map(|action| (*action, self.execution_counts[action.index()].load(Ordering::Relaxed)))
            .collect();
        let total: u64 = counts.iter().map(|(_, count)| count).sum();

        let mut action_counts = serde_json::Map::new();
        let mut action_percentages = serde_json::Map::new();
        for (action, count) in &counts {
            action_counts.insert(action.to_string(), json!(count));
            let percentage = if total > 0 {
                *count as f64 / total as f64 * 100.0
            } else {
                0.0
            };
            action_percentages.insert(action.to_string(), json!(percentage));
        }

        json!({
            "total_executions": total,
            "action_counts": action_counts,
            "action_percentages": action_percentages,
        })
    }
}

fn sanitize_request(mut data: RequestData) -> (RequestData, bool) {
    let mut modified = false;

    let path = sanitize_text(&data.path);
    if path != data.path {
        data.path = path;
        modified = true;
    }

    if let Some(body) = data.body.as_mut() {
        let sanitized = sanitize_text(body);
        if sanitized != *body {
            *body = sanitized;
            modified = true;
        }
    }

    (data, modified)
}

/// Strip SQL keywords, comment tokens and semicolons and collapse repeated
/// quotes. Repeats until nothing changes, so the output is a fixed point.
pub fn sanitize_text(text: &str) -> String {
    let mut current = text.to_string();
    loop {
        let next = sanitize_pass(&current);
        if next == current {
            return current;
        }
        current = next;
    }
}

fn sanitize_pass(text: &str) -> String {
    let mut sanitized = SANITIZE_KEYWORD_PATTERN.replace_all(text, "").into_owned();
    for token in SANITIZE_COMMENT_TOKENS {
        sanitized = sanitized.replace(token, "");
    }
    sanitized = REPEATED_SINGLE_QUOTES.replace_all(&sanitized, "'").into_owned();
    sanitized = REPEATED_DOUBLE_QUOTES.replace_all(&sanitized, "\"").into_owned();
    sanitized.replace(';', "")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn executor(throttle_ms: u64) -> ActionExecutor {
        ActionExecutor::new(&ExecutorConfig {
            throttle_delay: Duration::from_millis(throttle_ms),
        })
    }

    fn data(path: &str, body: Option<&str>) -> RequestData {
        RequestData {
            path: path.to_string(),
            body: body.map(str::to_string),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sanitize_strips_or_from_login_body() {
        let executor = executor(0);
        let input = data("/login", Some("username=admin&password=test' OR '1'='1"));
        let result = executor.execute(Action::Sanitize, input).await;

        assert!(result.allowed);
        assert!(result.modified);
        let body = result.request_data.body.as_deref().unwrap();
        assert!(!body.to_lowercase().contains(" or "));
        assert!(body.starts_with("username=admin&password=test'"));
        assert_eq!(result.request_data.path, "/login");
        assert_eq!(result.metadata["sanitization_applied"], true);
    }

    #[tokio::test]
    async fn test_sanitize_login_body_output_has_no_doubled_quotes() {
        let result = executor(0)
            .execute(Action::Sanitize, data("/login", Some("username=admin&password=test' OR '1'='1")))
            .await;
        assert_eq!(
            result.request_data.body.as_deref(),
            Some("username=admin&password=test'  '1'='1")
        );

        let doubled = executor(0)
            .execute(Action::Sanitize, data("/login", Some("password=test'' OR ''1''=''1")))
            .await;
        assert!(doubled.modified);
        let body = doubled.request_data.body.unwrap();
        assert_eq!(body, "password=test'  '1'='1");
        assert!(!body.contains("''"));
    }

    #[tokio::test]
    async fn test_sanitize_cleans_the_path() {
        let result = executor(0)
            .execute(Action::Sanitize, data("/api/user?id=1;DROP--", None))
            .await;

        assert!(result.allowed);
        assert!(result.modified);
        assert_eq!(result.request_data.path, "/api/user?id=1");
        assert_eq!(result.request_data.body, None);
    }

    #[test]
    fn test_sanitize_collapses_quotes_and_removes_tokens() {
        assert_eq!(sanitize_text("a''b"), "a'b");
        assert_eq!(sanitize_text("a\"\"\"b"), "a\"b");
        assert_eq!(sanitize_text("1; DROP TABLE users--"), "1  TABLE users");
        assert_eq!(sanitize_text("x/* c */y"), "x c y");
        assert_eq!(sanitize_text("Select password, organization"), " password, organization");
    }

    #[test]
    fn test_sanitize_is_idempotent() {
        let inputs = [
            "username=admin&password=test' OR '1'='1",
            "1 UNION SELECT username,password FROM users--",
            "sel--ect * from t; ''' \"\"",
            "o/**/r 1=1",
            "plain text",
            "",
        ];
        for input in inputs {
            let once = sanitize_text(input);
            assert_eq!(sanitize_text(&once), once, "input {:?}", input);
        }
    }

    #[test]
    fn test_sanitize_removes_keywords_formed_by_token_removal() {
        assert_eq!(sanitize_text("sel--ect 1"), " 1");
    }

    #[tokio::test]
    async fn test_sanitize_clean_request_is_unmodified() {
        let result = executor(0)
            .execute(Action::Sanitize, data("/api/user?id=1", Some("name=bob")))
            .await;
        assert!(!result.modified);
        assert_eq!(result.request_data, data("/api/user?id=1", Some("name=bob")));
    }

    #[tokio::test]
    async fn test_action_contract_table() {
        let executor = executor(0);
        let expected = [
            (Action::Allow, true),
            (Action::LogOnly, true),
            (Action::Challenge, false),
            (Action::Throttle, true),
            (Action::Block, false),
        ];
        for (action, allowed) in expected {
            let input = data("/a", Some("b"));
            let result = executor.execute(action, input.clone()).await;
            assert_eq!(result.action, action);
            assert_eq!(result.allowed, allowed, "{}", action);
            assert!(!result.modified);
            assert_eq!(result.request_data, input);
        }

        let block = executor.execute(Action::Block, data("/", None)).await;
        assert_eq!(block.metadata["http_status"], 403);
        let challenge = executor.execute(Action::Challenge, data("/", None)).await;
        assert_eq!(challenge.metadata["challenge_required"], true);
        assert_eq!(challenge.metadata["challenge_type"], "captcha");
        let log = executor.execute(Action::LogOnly, data("/", None)).await;
        assert_eq!(log.metadata["requires_logging"], true);
    }

    #[tokio::test]
    async fn test_throttle_waits_for_configured_delay() {
        let executor = executor(30);
        let started = Instant::now();
        let result = executor.execute(Action::Throttle, data("/", None)).await;
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(result.metadata["delay_ms"], 30);
        assert_eq!(result.metadata["rate_limit_applied"], true);

        executor.set_throttle_delay(Duration::ZERO);
        let result = executor.execute(Action::Throttle, data("/", None)).await;
        assert_eq!(result.metadata["delay_ms"], 0);
    }

    #[tokio::test]
    async fn test_unknown_action_name_fails_closed() {
        let executor = executor(0);
        let result = executor.execute_named("quarantine", data("/", None)).await;
        assert_eq!(result.action, Action::Block);
        assert!(!result.allowed);

        let result = executor.execute_named("allow", data("/", None)).await;
        assert_eq!(result.action, Action::Allow);
    }

    #[tokio::test]
    async fn test_statistics_counts_and_percentages() {
        let executor = executor(0);
        assert_eq!(executor.statistics()["total_executions"], 0);

        for _ in 0..3 {
            executor.execute(Action::Allow, data("/", None)).await;
        }
        executor.execute(Action::Block, data("/", None)).await;

        let stats = executor.statistics();
        assert_eq!(stats["total_executions"], 4);
        assert_eq!(stats["action_counts"]["allow"], 3);
        assert_eq!(stats["action_counts"]["block"], 1);
        assert_eq!(stats["action_counts"]["sanitize"], 0);
        assert_eq!(stats["action_percentages"]["allow"], 75.0);
        assert_eq!(stats["action_percentages"]["block"], 25.0);
    }
}
