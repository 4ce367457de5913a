//! Architect process configuration.
//!
//! ```kdl
//! listen "0.0.0.0:7777"
//! http "0.0.0.0:3000"
//! database-url "postgres://architect@localhost/architect"
//!
//! link {
//!     heartbeat-ms 5000
//!     write-interval-ms 10
//!     retry-after-ms 5000
//!     reply-timeout-ms 30000
//! }
//! scheduler { tick-ms 1000; }
//! registry { page-size 25; }
//!
//! builder-token "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
//! ```
//!
//! Every node is optional. A zero `heartbeat-ms` disables liveness
//! monitoring and a zero `reply-timeout-ms` lets requests wait until the
//! link closes.

use std::path::Path;
use std::time::Duration;

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{ConfigError, ConfigResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSettings {
    pub heartbeat: Option<Duration>,
    pub write_interval: Duration,
    pub retry_after: Duration,
    pub reply_timeout: Option<Duration>,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            heartbeat: Some(Duration::from_secs(5)),
            write_interval: Duration::from_millis(10),
            retry_after: Duration::from_secs(5),
            reply_timeout: Some(Duration::from_secs(30)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    pub tick: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrySettings {
    pub page_size: usize,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self { page_size: 25 }
    }
}

/// SHA-256 digest of an accepted builder token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenDigest([u8; 32]);

impl TokenDigest {
    pub fn of(token: &str) -> Self {
        Self(Sha256::digest(token.as_bytes()).into())
    }

    pub fn from_hex(hex_digest: &str) -> ConfigResult<Self> {
        let bytes = hex::decode(hex_digest.trim()).map_err(|e| ConfigError::InvalidValue {
            field: "builder-token".to_string(),
            message: e.to_string(),
        })?;
        let digest: [u8; 32] = bytes.try_into().map_err(|_| ConfigError::InvalidValue {
            field: "builder-token".to_string(),
            message: "expected a 64 character SHA-256 hex digest".to_string(),
        })?;
        Ok(Self(digest))
    }

    pub fn matches(&self, token: &str) -> bool {
        *self == Self::of(token)
    }
}

/// Top-level configuration of the architect process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchitectConfig {
    /// Address builders connect to.
    pub listen: String,
    /// Address of the HTTP health and live-update endpoints.
    pub http: String,
    pub database_url: Option<String>,
    pub link: LinkSettings,
    pub scheduler: SchedulerSettings,
    pub registry: RegistrySettings,
    pub builder_tokens: Vec<TokenDigest>,
}

impl Default for ArchitectConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7777".to_string(),
            http: "0.0.0.0:3000".to_string(),
            database_url: None,
            link: LinkSettings::default(),
            scheduler: SchedulerSettings::default(),
            registry: RegistrySettings::default(),
            builder_tokens: Vec::new(),
        }
    }
}

impl ArchitectConfig {
    /// Whether `token` matches one of the configured builder tokens.
    pub fn accepts_token(&self, token: &str) -> bool {
        let digest = TokenDigest::of(token);
        self.builder_tokens.iter().any(|accepted| *accepted == digest)
    }
}

/// Read and parse a configuration file.
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<ArchitectConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_config(&text)
}

/// Parse configuration from KDL text.
pub fn parse_config(kdl: &str) -> ConfigResult<ArchitectConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = ArchitectConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "listen" => config.listen = require_string(node)?,
            "http" => config.http = require_string(node)?,
            "database-url" => config.database_url = Some(require_string(node)?),
            "builder-token" => {
                let digest = require_string(node)?;
                config.builder_tokens.push(TokenDigest::from_hex(&digest)?);
            }
            "link" => parse_link(node, &mut config.link)?,
            "scheduler" => {
                for child in children(node) {
                    if child.name().value() == "tick-ms" {
                        config.scheduler.tick = positive_millis(child)?;
                    }
                }
            }
            "registry" => {
                for child in children(node) {
                    if child.name().value() == "page-size" {
                        let size = require_integer(child)?;
                        if size == 0 {
                            return Err(invalid(child, "must be greater than zero"));
                        }
                        config.registry.page_size = size as usize;
                    }
                }
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_link(node: &KdlNode, link: &mut LinkSettings) -> ConfigResult<()> {
    for child in children(node) {
        match child.name().value() {
            "heartbeat-ms" => link.heartbeat = optional_millis(child)?,
            "write-interval-ms" => link.write_interval = positive_millis(child)?,
            "retry-after-ms" => link.retry_after = positive_millis(child)?,
            "reply-timeout-ms" => link.reply_timeout = optional_millis(child)?,
            _ => {}
        }
    }
    Ok(())
}

// Helper functions for extracting values from KDL nodes

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children()
        .map(|doc| doc.nodes().iter())
        .into_iter()
        .flatten()
}

fn invalid(node: &KdlNode, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: node.name().value().to_string(),
        message: message.to_string(),
    }
}

fn first_arg(node: &KdlNode) -> ConfigResult<&kdl::KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .map(|e| e.value())
        .ok_or_else(|| ConfigError::MissingValue(node.name().value().to_string()))
}

fn require_string(node: &KdlNode) -> ConfigResult<String> {
    first_arg(node)?
        .as_string()
        .map(|s| s.to_string())
        .ok_or_else(|| invalid(node, "expected a string"))
}

fn require_integer(node: &KdlNode) -> ConfigResult<u64> {
    let value = first_arg(node)?
        .as_integer()
        .ok_or_else(|| invalid(node, "expected an integer"))?;
    u64::try_from(value).map_err(|_| invalid(node, "must not be negative"))
}

fn optional_millis(node: &KdlNode) -> ConfigResult<Option<Duration>> {
    match require_integer(node)? {
        0 => Ok(None),
        ms => Ok(Some(Duration::from_millis(ms))),
    }
}

fn positive_millis(node: &KdlNode) -> ConfigResult<Duration> {
    optional_millis(node)?.ok_or_else(|| invalid(node, "must be greater than zero"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config, ArchitectConfig::default());
        assert_eq!(config.link.heartbeat, Some(Duration::from_secs(5)));
        assert_eq!(config.scheduler.tick, Duration::from_secs(1));
    }

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            listen "127.0.0.1:9000"
            http "127.0.0.1:9001"
            database-url "postgres://localhost/architect"

            link {
                heartbeat-ms 2000
                write-interval-ms 5
                retry-after-ms 3000
                reply-timeout-ms 0
            }
            scheduler {
                tick-ms 500
            }
            registry {
                page-size 10
            }
        "#;

        let config = parse_config(kdl).unwrap();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.http, "127.0.0.1:9001");
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/architect")
        );
        assert_eq!(config.link.heartbeat, Some(Duration::from_secs(2)));
        assert_eq!(config.link.write_interval, Duration::from_millis(5));
        assert_eq!(config.link.retry_after, Duration::from_secs(3));
        assert_eq!(config.link.reply_timeout, None);
        assert_eq!(config.scheduler.tick, Duration::from_millis(500));
        assert_eq!(config.registry.page_size, 10);
    }

    #[test]
    fn builder_tokens_are_matched_by_digest() {
        let digest = TokenDigest::of("s3cret");
        let kdl = format!("builder-token \"{}\"", hex::encode(digest.0));

        let config = parse_config(&kdl).unwrap();
        assert!(config.accepts_token("s3cret"));
        assert!(!config.accepts_token("guess"));
    }

    #[test]
    fn rejects_malformed_digest() {
        let err = parse_config(r#"builder-token "abc""#).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn rejects_zero_tick() {
        let err = parse_config("scheduler {\n tick-ms 0\n}").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "tick-ms"));
    }

    #[test]
    fn rejects_string_where_integer_expected() {
        let err = parse_config("registry {\n page-size \"ten\"\n}").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn missing_argument_is_reported() {
        let err = parse_config("listen").unwrap_err();
        assert!(matches!(err, ConfigError::MissingValue(ref name) if name == "listen"));
    }
}
