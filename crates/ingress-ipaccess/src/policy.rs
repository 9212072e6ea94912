use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

use crate::{PolicyError, Rule};

/// Ordered allow/deny rules for validating destination addresses.
///
/// Rules are evaluated in declaration order and the first match decides.
/// A broad rule listed before a narrower one therefore wins over it: order,
/// not specificity, breaks ties.
#[derive(Debug, Clone)]
pub struct Policy {
    default_allow: bool,
    rules: Vec<Rule>,
}

impl Policy {
    /// Create a policy
    ///
    /// # Arguments
    /// * `default_allow` - Verdict when no rule matches
    /// * `rules` - Rules in evaluation order
    pub fn new(default_allow: bool, rules: Vec<Rule>) -> Self {
        Self {
            default_allow,
            rules,
        }
    }

    /// Evaluate a destination.
    ///
    /// Returns the verdict and the rule that produced it (`None` when the
    /// default verdict applied).
    pub fn allowed(&self, ip: &IpAddr, port: u16) -> (bool, Option<&Rule>) {
        match self.rules.iter().find(|rule| rule.matches(ip, port)) {
            Some(rule) => (rule.allow(), Some(rule)),
            None => (self.default_allow, None),
        }
    }

    /// Check if a socket address is allowed by this policy
    pub fn is_allowed(&self, addr: &SocketAddr) -> bool {
        self.allowed(&addr.ip(), addr.port()).0
    }

    pub fn default_allow(&self) -> bool {
        self.default_allow
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }
}

/// Serialized form of a single rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuleConfig {
    /// CIDR or bare IP address
    pub prefix: String,

    /// Ports the rule applies to (empty = all)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<u16>,

    pub allow: bool,
}

/// Serialized form of a policy
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PolicyConfig {
    /// Verdict when no rule matches (deny unless set)
    #[serde(default)]
    pub default_allow: bool,

    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl TryFrom<&PolicyConfig> for Policy {
    type Error = PolicyError;

    fn try_from(config: &PolicyConfig) -> Result<Self, Self::Error> {
        let rules = config
            .rules
            .iter()
            .map(|rule| Rule::by_cidr(&rule.prefix, rule.ports.clone(), rule.allow))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Policy::new(config.default_allow, rules))
    }
}
