pub mod executor;
pub mod features;
pub mod pipeline;
pub mod policy;
pub mod reward;
pub mod safety;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result as WafResult, WafError};

pub use executor::{ActionExecutor, ExecutionResult};
pub use features::{Feature, FeatureExtractor, FeatureVector, StateKey};
pub use pipeline::{Decision, DecisionPipeline, OperatingMode};
pub use policy::{PolicyAgent, PolicyCheckpoint, ValueTable};
pub use reward::{Outcome, RewardCalculator};
pub use safety::{SafetyContext, SafetyLayer};

/// Mitigation action the engine can take on a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Allow,
    LogOnly,
    Sanitize,
    Challenge,
    Throttle,
    Block,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::Allow,
        Action::LogOnly,
        Action::Sanitize,
        Action::Challenge,
        Action::Throttle,
        Action::Block,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::LogOnly => "log_only",
            Action::Sanitize => "sanitize",
            Action::Challenge => "challenge",
            Action::Throttle => "throttle",
            Action::Block => "block",
        }
    }

    /// Block and Challenge stop the request.
    pub fn is_restrictive(&self) -> bool {
        matches!(self, Action::Block | Action::Challenge)
    }

    pub fn is_permissive(&self) -> bool {
        matches!(self, Action::Allow | Action::LogOnly)
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            Action::Allow => 0,
            Action::LogOnly => 1,
            Action::Sanitize => 2,
            Action::Challenge => 3,
            Action::Throttle => 4,
            Action::Block => 5,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = WafError;

    fn from_str(s: &str) -> WafResult<Self> {
        match s {
            "allow" => Ok(Action::Allow),
            "log_only" => Ok(Action::LogOnly),
            "sanitize" => Ok(Action::Sanitize),
            "challenge" => Ok(Action::Challenge),
            "throttle" => Ok(Action::Throttle),
            "block" => Ok(Action::Block),
            _ => Err(WafError::BadRequest(format!("Unknown action: {}", s))),
        }
    }
}

/// Request record handed over by the ingress collaborator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestRecord {
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub origin: Option<String>,
}

impl RequestRecord {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Parse a record from loosely shaped JSON, rejecting wrong shapes.
    pub fn from_json(value: serde_json::Value) -> WafResult<Self> {
        let record: RequestRecord = serde_json::from_value(value)
            .map_err(|e| WafError::MalformedRecord(e.to_string()))?;
        record.validate()?;
        Ok(record)
    }

    /// Check the record shape. The method must be a non-empty HTTP token.
    pub fn validate(&self) -> WafResult<()> {
        if self.method.is_empty() {
            return Err(WafError::MalformedRecord("method is empty".to_string()));
        }
        if !self.method.bytes().all(is_token_byte) {
            return Err(WafError::MalformedRecord(format!(
                "method {:?} is not an HTTP token",
                self.method
            )));
        }
        if self.path.contains('\0') {
            return Err(WafError::MalformedRecord("path contains a NUL byte".to_string()));
        }
        Ok(())
    }

    /// Header lookup ignoring case and treating `_` like `-` (`User_Agent` == `user-agent`).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| header_name_eq(key, name))
            .map(|(_, value)| value.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    pub fn request_data(&self) -> RequestData {
        RequestData {
            path: self.path.clone(),
            body: self.body.clone(),
            headers: self.headers.clone(),
        }
    }
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn header_name_eq(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes().zip(b.bytes()).all(|(x, y)| {
            let x = if x == b'_' { b'-' } else { x.to_ascii_lowercase() };
            let y = if y == b'_' { b'-' } else { y.to_ascii_lowercase() };
            x == y
        })
}

/// Request content an action is applied to
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestData {
    pub path: String,
    pub body: Option<String>,
    pub headers: HashMap<String, String>,
}
