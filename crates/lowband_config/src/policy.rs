use serde::Deserialize;

/// Resource type names accepted in `[[policy.rules]]`.
pub const KNOWN_RESOURCE_TYPES: &[&str] = &[
    "document",
    "image",
    "stylesheet",
    "media",
    "font",
    "script",
    "xhr",
    "other",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Block,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleConfig {
    pub resource: String,
    pub action: RuleAction,
}

// =======================================================
// POLICY CONFIG + DEFAULTS
// =======================================================
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Ordered rules; the first rule naming a type wins.
    pub rules: Vec<RuleConfig>,
    /// Catch-all for types no rule names.
    pub default: RuleAction,
    /// Hosts blocked together with all their subdomains.
    pub blocked_hosts: Vec<String>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rules: vec![
                RuleConfig {
                    resource: "image".into(),
                    action: RuleAction::Block,
                },
                RuleConfig {
                    resource: "media".into(),
                    action: RuleAction::Block,
                },
                RuleConfig {
                    resource: "font".into(),
                    action: RuleAction::Block,
                },
            ],
            default: RuleAction::Allow,
            blocked_hosts: Vec::new(),
        }
    }
}

impl PolicyConfig {
    pub fn rules(&self) -> &[RuleConfig] {
        &self.rules
    }

    pub fn default_action(&self) -> RuleAction {
        self.default
    }

    pub fn blocked_hosts(&self) -> &[String] {
        &self.blocked_hosts
    }

    pub(crate) fn apply_defaults(&mut self) {
        for rule in &mut self.rules {
            rule.resource = rule.resource.trim().to_ascii_lowercase();
        }
        for host in &mut self.blocked_hosts {
            *host = host.trim().trim_start_matches('.').to_ascii_lowercase();
        }
        self.blocked_hosts.retain(|host| !host.is_empty());
    }
}
