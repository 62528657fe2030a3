//! Allow/block decisions per resource type and host.

use std::collections::{HashMap, HashSet};
use std::fmt;

use lowband_config::{PolicyConfig, RuleAction};
use lowband_http::ResourceType;
use tracing::warn;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    ResourceType(ResourceType),
    Host(String),
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::ResourceType(rt) => write!(f, "resource type '{rt}' is blocked"),
            BlockReason::Host(host) => write!(f, "host '{host}' is blocked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Block(BlockReason),
}

/// Compiled, immutable policy. Swapped whole on reload.
#[derive(Debug, Clone)]
pub struct ResourcePolicy {
    rules: HashMap<ResourceType, RuleAction>,
    default: RuleAction,
    blocked_hosts: HashSet<String>,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl ResourcePolicy {
    pub fn allow_all() -> Self {
        Self {
            rules: HashMap::new(),
            default: RuleAction::Allow,
            blocked_hosts: HashSet::new(),
        }
    }

    /// Compile a policy section. Unknown resource names are skipped;
    /// config validation already reports them.
    pub fn from_config(cfg: &PolicyConfig) -> Self {
        let mut policy = Self::allow_all().with_default(cfg.default_action());
        for rule in cfg.rules() {
            match rule.resource.parse::<ResourceType>() {
                Ok(rt) => policy = policy.with_rule(rt, rule.action),
                Err(e) => warn!(target: "lowband::policy", error = %e, "Skipping policy rule"),
            }
        }
        for host in cfg.blocked_hosts() {
            policy = policy.block_host(host);
        }
        policy
    }

    /// Add a rule unless one already names `resource_type`.
    pub fn with_rule(mut self, resource_type: ResourceType, action: RuleAction) -> Self {
        self.rules.entry(resource_type).or_insert(action);
        self
    }

    pub fn with_default(mut self, action: RuleAction) -> Self {
        self.default = action;
        self
    }

    pub fn block_host(mut self, host: &str) -> Self {
        let host = host.trim().trim_start_matches('.').to_ascii_lowercase();
        if !host.is_empty() {
            self.blocked_hosts.insert(host);
        }
        self
    }

    /// Pure function of the policy and its inputs.
    pub fn classify(&self, resource_type: ResourceType, url: &Url) -> Decision {
        if let Some(host) = url.host_str().and_then(|h| self.blocked_suffix(h)) {
            return Decision::Block(BlockReason::Host(host));
        }

        let action = self.rules.get(&resource_type).copied().unwrap_or(self.default);
        match action {
            RuleAction::Allow => Decision::Allow,
            RuleAction::Block => Decision::Block(BlockReason::ResourceType(resource_type)),
        }
    }

    fn blocked_suffix(&self, host: &str) -> Option<String> {
        if self.blocked_hosts.is_empty() {
            return None;
        }
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let mut candidate = host.as_str();
        loop {
            if self.blocked_hosts.contains(candidate) {
                return Some(candidate.to_string());
            }
            let (_, parent) = candidate.split_once('.')?;
            candidate = parent;
        }
    }
}
