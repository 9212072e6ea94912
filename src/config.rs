//! YAML configuration file

use anyhow::{Context, Result};
use ingress_origin::{Ingress, IngressRule, IngressRuleConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Configuration file format
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigFile {
    /// Ordered ingress rules; the last one must match every hostname
    pub ingress: Vec<IngressRuleConfig>,
}

impl ConfigFile {
    /// Parse configuration from YAML text
    pub fn from_yaml(contents: &str) -> Result<Self> {
        serde_yaml::from_str(contents).context("Failed to parse configuration")
    }

    /// Validate the rules and build their services
    pub fn build_ingress(&self) -> Result<Ingress> {
        Ingress::from_config(&self.ingress).context("Invalid ingress configuration")
    }
}

/// Load configuration from YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    ConfigFile::from_yaml(&contents)
        .with_context(|| format!("Invalid config file: {}", path.display()))
}

/// Pick the rule serving `hostname` (the catch-all rule when `None`)
pub fn select_rule(ingress: &Ingress, hostname: Option<&str>) -> Result<IngressRule> {
    let rule = match hostname {
        Some(hostname) => ingress.find_match(hostname),
        None => ingress.rules().last(),
    };

    rule.cloned()
        .with_context(|| format!("No ingress rule matches {:?}", hostname))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"
ingress:
  - hostname: ssh.internal.example.com
    service: { type: tcp_over_websocket, address: "127.0.0.1:22" }
  - hostname: "*.ws.example.com"
    service: { type: websocket, url: "https://127.0.0.1:8443" }
    origin_request: { no_tls_verify: true, connect_timeout_seconds: 10 }
  - service:
      type: socks_proxy
      ip_rules:
        default_allow: false
        rules:
          - { prefix: "192.168.1.0/24", ports: [80, 443], allow: true }
          - { prefix: "192.168.1.8/32", allow: false }
"#;

    #[test]
    fn test_parse_example_config() {
        let config = ConfigFile::from_yaml(EXAMPLE).unwrap();
        assert_eq!(config.ingress.len(), 3);

        let ingress = config.build_ingress().unwrap();
        assert_eq!(ingress.rules().len(), 3);
    }

    #[test]
    fn test_select_rule() {
        let ingress = ConfigFile::from_yaml(EXAMPLE)
            .unwrap()
            .build_ingress()
            .unwrap();

        let rule = select_rule(&ingress, Some("ssh.internal.example.com")).unwrap();
        assert_eq!(rule.service.kind(), "tcp_over_websocket");

        let rule = select_rule(&ingress, Some("api.ws.example.com")).unwrap();
        assert_eq!(rule.service.kind(), "websocket");

        let rule = select_rule(&ingress, None).unwrap();
        assert_eq!(rule.service.kind(), "socks_proxy");
    }

    #[test]
    fn test_invalid_config() {
        let yaml = r#"
ingress:
  - hostname: only.example.com
    service: { type: tcp, address: "127.0.0.1:22" }
"#;
        let config = ConfigFile::from_yaml(yaml).unwrap();
        assert!(config.build_ingress().is_err());

        assert!(ConfigFile::from_yaml("ingress: [{ service: { type: ftp } }]").is_err());
    }

    #[test]
    fn test_missing_config_file() {
        assert!(load_config_file(Path::new("/nonexistent/ingress.yaml")).is_err());
    }

    #[test]
    fn test_load_config_file() {
        let dir = std::env::temp_dir();
        let valid = dir.join(format!("ingress-{}.yaml", uuid::Uuid::new_v4()));
        let invalid = dir.join(format!("ingress-{}.yaml", uuid::Uuid::new_v4()));
        fs::write(&valid, EXAMPLE).unwrap();
        fs::write(&invalid, "ingress: [{ service: { type: ftp } }]").unwrap();

        let config = load_config_file(&valid).unwrap();
        assert_eq!(config, ConfigFile::from_yaml(EXAMPLE).unwrap());

        // Same parse path as from_yaml, with the file name on top
        let err = format!("{:#}", load_config_file(&invalid).unwrap_err());
        assert!(err.contains(&invalid.display().to_string()), "{}", err);
        assert!(err.contains("Failed to parse configuration"), "{}", err);

        let _ = fs::remove_file(valid);
        let _ = fs::remove_file(invalid);
    }
}
