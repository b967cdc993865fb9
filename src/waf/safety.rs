use std::net::{IpAddr, SocketAddr};

use anyhow::Context;
use ipnet::IpNet;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SafetyConfig;
use crate::error::Result as WafResult;
use super::Action;

/// Administrative, auth and monitoring paths the policy may never block outright.
static PROTECTED_ENDPOINTS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"^/admin", r"^/api/auth", r"^/health", r"^/metrics"]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
});

/// Loopback, RFC1918 and IPv6 loopback/link-local ranges.
static INTERNAL_NETWORKS: Lazy<Vec<IpNet>> = Lazy::new(|| {
    [
        "127.0.0.0/8",
        "10.0.0.0/8",
        "172.16.0.0/12",
        "192.168.0.0/16",
        "::1/128",
        "fe80::/10",
    ]
    .iter()
    .map(|n| n.parse().unwrap())
    .collect()
});

/// Caller-supplied facts about a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyContext {
    /// Request matches a pattern known to be safe; always allowed.
    #[serde(default)]
    pub is_known_safe: bool,
}

impl SafetyContext {
    pub fn known_safe() -> Self {
        Self { is_known_safe: true }
    }
}

/// Hard, non-learned constraints applied on top of the policy's choice
#[derive(Debug, Clone)]
pub struct SafetyLayer {
    protected_endpoints: Vec<Regex>,
    internal_networks: Vec<IpNet>,
    health_paths: Vec<String>,
}

impl SafetyLayer {
    pub fn new(config: &SafetyConfig) -> WafResult<Self> {
        let mut protected_endpoints = PROTECTED_ENDPOINTS.clone();
        for pattern in &config.protected_endpoints {
            let regex = Regex::new(pattern)
                .with_context(|| format!("Invalid protected endpoint pattern: {}", pattern))?;
            protected_endpoints.push(regex);
        }

        let mut internal_networks = INTERNAL_NETWORKS.clone();
        for network in &config.internal_networks {
            let net: IpNet = network
                .parse()
                .with_context(|| format!("Invalid internal network: {}", network))?;
            internal_networks.push(net);
        }

        Ok(Self {
            protected_endpoints,
            internal_networks,
            health_paths: config.health_paths.clone(),
        })
    }

    /// Constrain `action`. Rules run in order, later rules win:
    ///
    /// 1. protected endpoint: Block becomes Challenge
    /// 2. internal origin: Block becomes Challenge
    /// 3. known-safe context: Allow
    /// 4. exact health path: Allow
    pub fn constrain(
        &self,
        action: Action,
        endpoint: Option<&str>,
        origin: Option<&str>,
        context: Option<&SafetyContext>,
    ) -> Action {
        let mut constrained = action;

        if constrained == Action::Block && endpoint.map_or(false, |e| self.is_protected_endpoint(e)) {
            constrained = Action::Challenge;
        }

        if constrained == Action::Block && origin.map_or(false, |o| self.is_internal_origin(o)) {
            constrained = Action::Challenge;
        }

        if context.map_or(false, |c| c.is_known_safe) {
            constrained = Action::Allow;
        }

        if endpoint.map_or(false, |e| self.is_health_path(e)) {
            constrained = Action::Allow;
        }

        if constrained != action {
            debug!(
                "Safety layer changed {} to {} (endpoint: {:?}, origin: {:?})",
                action, constrained, endpoint, origin
            );
        }
        constrained
    }

    /// Actions permitted up front for this endpoint and origin.
    pub fn allowed_actions(&self, endpoint: Option<&str>, origin: Option<&str>) -> Vec<Action> {
        let block_forbidden = endpoint.map_or(false, |e| self.is_protected_endpoint(e))
            || origin.map_or(false, |o| self.is_internal_origin(o));

        Action::ALL
            .into_iter()
            .filter(|action| !(block_forbidden && *action == Action::Block))
            .collect()
    }

    pub fn is_protected_endpoint(&self, endpoint: &str) -> bool {
        self.protected_endpoints.iter().any(|p| p.is_match(endpoint))
    }

    pub fn is_health_path(&self, endpoint: &str) -> bool {
        self.health_paths.iter().any(|p| p == endpoint)
    }

    /// Origins are IP addresses, optionally with a port. Anything unparseable
    /// other than `localhost` is treated as external.
    pub fn is_internal_origin(&self, origin: &str) -> bool {
        let origin = origin.trim();
        if origin.eq_ignore_ascii_case("localhost") {
            return true;
        }

        let ip = match parse_origin(origin) {
            Some(ip) => ip,
            None => return false,
        };
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };

        self.internal_networks.iter().any(|net| net.contains(&ip))
    }
}

fn parse_origin(origin: &str) -> Option<IpAddr> {
    origin
        .parse::<IpAddr>()
        .ok()
        .or_else(|| origin.parse::<SocketAddr>().ok().map(|s| s.ip()))
}
