//! Ingress rules: which origin service serves which hostname

use ingress_websocket::http::Request;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::service::{Established, OriginRequest, OriginRequestConfig, OriginService, ServiceConfig};
use crate::OriginError;

/// Errors in the ingress rule list
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No ingress rules configured")]
    NoRules,

    #[error("The last ingress rule must match every hostname, but it only matches '{0}'")]
    LastRuleNotCatchAll(String),

    #[error("Ingress rule {index} has invalid hostname '{hostname}': {reason}")]
    InvalidHostname {
        index: usize,
        hostname: String,
        reason: String,
    },

    #[error("Ingress rule {index}: {source}")]
    InvalidRule {
        index: usize,
        #[source]
        source: OriginError,
    },
}

/// Serialized ingress rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngressRuleConfig {
    /// Exact hostname or `*.suffix`; matches everything when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    pub service: ServiceConfig,

    #[serde(default)]
    pub origin_request: OriginRequestConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostMatcher {
    Any,
    Exact(String),
    /// `*.example.com`, stored as `.example.com`
    Suffix(String),
}

impl HostMatcher {
    fn parse(hostname: Option<&str>) -> Result<Self, String> {
        let hostname = match hostname {
            None | Some("") | Some("*") => return Ok(HostMatcher::Any),
            Some(h) => h.to_ascii_lowercase(),
        };

        if hostname.contains(':') || hostname.contains('/') {
            return Err("hostnames cannot contain a port or path".to_string());
        }

        match hostname.strip_prefix('*') {
            Some(suffix) => {
                if !suffix.starts_with('.') || suffix.len() < 2 {
                    return Err("wildcards must be of the form *.domain".to_string());
                }
                if suffix.contains('*') {
                    return Err("only a single leading wildcard is supported".to_string());
                }
                Ok(HostMatcher::Suffix(suffix.to_string()))
            }
            None if hostname.contains('*') => {
                Err("only a single leading wildcard is supported".to_string())
            }
            None => Ok(HostMatcher::Exact(hostname)),
        }
    }

    fn matches(&self, host: &str) -> bool {
        match self {
            HostMatcher::Any => true,
            HostMatcher::Exact(name) => host == name,
            HostMatcher::Suffix(suffix) => host.len() > suffix.len() && host.ends_with(suffix.as_str()),
        }
    }
}

/// Strip the port (if any) and lowercase
fn normalize_host(host: &str) -> String {
    let host = host.trim();
    let without_port = if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        rest.split(']').next().unwrap_or(rest)
    } else {
        match host.rsplit_once(':') {
            Some((name, port)) if !name.contains(':') && port.parse::<u16>().is_ok() => name,
            _ => host,
        }
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}

/// A validated ingress rule
#[derive(Debug, Clone)]
pub struct IngressRule {
    hostname: Option<String>,
    matcher: HostMatcher,
    pub service: OriginService,
    pub origin_request: OriginRequest,
}

impl IngressRule {
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Whether this rule serves every hostname
    pub fn is_catch_all(&self) -> bool {
        self.matcher == HostMatcher::Any
    }

    /// Check a request host (port allowed) against the rule
    pub fn matches(&self, host: &str) -> bool {
        self.matcher.matches(&normalize_host(host))
    }

    /// Connect to this rule's origin for one tunnel stream
    pub async fn establish(&self, request: &Request<()>) -> Result<Established, OriginError> {
        self.service.establish(&self.origin_request, request).await
    }
}

/// Ordered ingress rules; the first matching rule wins and the last one
/// matches everything
#[derive(Debug, Clone)]
pub struct Ingress {
    rules: Vec<IngressRule>,
}

impl Ingress {
    /// Validate the rule list and build every service (policies, TLS configs)
    pub fn from_config(configs: &[IngressRuleConfig]) -> Result<Self, ConfigError> {
        if configs.is_empty() {
            return Err(ConfigError::NoRules);
        }

        let mut rules = Vec::with_capacity(configs.len());
        for (index, config) in configs.iter().enumerate() {
            let matcher = HostMatcher::parse(config.hostname.as_deref()).map_err(|reason| {
                ConfigError::InvalidHostname {
                    index,
                    hostname: config.hostname.clone().unwrap_or_default(),
                    reason,
                }
            })?;

            let service = OriginService::try_from(&config.service)
                .map_err(|source| ConfigError::InvalidRule { index, source })?;
            let origin_request = OriginRequest::build(&config.origin_request, &service)
                .map_err(|source| ConfigError::InvalidRule { index, source })?;

            rules.push(IngressRule {
                hostname: config.hostname.clone(),
                matcher,
                service,
                origin_request,
            });
        }

        if let Some(last) = rules.last() {
            if !last.is_catch_all() {
                return Err(ConfigError::LastRuleNotCatchAll(
                    last.hostname.clone().unwrap_or_default(),
                ));
            }
        }

        Ok(Self { rules })
    }

    /// First rule serving `host`
    pub fn find_match(&self, host: &str) -> Option<&IngressRule> {
        let host = normalize_host(host);
        self.rules.iter().find(|rule| rule.matcher.matches(&host))
    }

    pub fn rules(&self) -> &[IngressRule] {
        &self.rules
    }
}
