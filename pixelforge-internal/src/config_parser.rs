use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use crate::blocking_rules::BlockingRule;
use crate::error::{Error, ErrorDetails};
use crate::model_table::{ModelConfig, ModelTable};
use crate::providers::UninitializedProviderConfig;

/// Fully validated gateway configuration.
///
/// Built once at startup and handed to every component that needs it.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub gateway: GatewayConfig,
    pub usage: UsageConfig,
    pub auth: AuthConfig,
    pub blocking: BlockingConfig,
    pub provider: UninitializedProviderConfig,
    pub models: ModelTable,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub bind_address: Option<SocketAddr>,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UsageConfig {
    /// Free units per identity per window
    #[serde(default = "default_free_generations_per_window")]
    pub free_generations_per_window: u32,
    /// Window length; windows are aligned to the unix epoch, so 86400 resets at UTC midnight
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_free_generations_per_window() -> u32 {
    3
}

fn default_window_secs() -> u64 {
    86_400
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            free_generations_per_window: default_free_generations_per_window(),
            window_secs: default_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,
    #[serde(default = "default_fingerprint_header")]
    pub fingerprint_header: String,
    /// Lifetime of tokens minted by `SessionAuth::issue_token`
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

fn default_session_cookie() -> String {
    "pixelforge-session".to_string()
}

fn default_fingerprint_header() -> String {
    "x-fingerprint-hash".to_string()
}

fn default_session_ttl_secs() -> u64 {
    30 * 86_400
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            session_cookie: default_session_cookie(),
            fingerprint_header: default_fingerprint_header(),
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default)]
    pub rules: Vec<BlockingRule>,
}

fn default_true() -> bool {
    true
}

fn default_sync_interval_secs() -> u64 {
    60
}

impl Default for BlockingConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            sync_interval_secs: default_sync_interval_secs(),
            rules: Vec::new(),
        }
    }
}

/// The config file as written on disk, before validation
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct UninitializedConfig {
    #[serde(default)]
    gateway: GatewayConfig,
    #[serde(default)]
    usage: UsageConfig,
    #[serde(default)]
    auth: AuthConfig,
    #[serde(default)]
    blocking: BlockingConfig,
    #[serde(default)]
    provider: UninitializedProviderConfig,
    models: Option<BTreeMap<String, ModelConfig>>,
}

impl Config {
    pub async fn load_and_verify_from_path(config_path: &Path) -> Result<Config, Error> {
        let contents = tokio::fs::read_to_string(config_path).await.map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!(
                    "Failed to read config file `{}`: {e}",
                    config_path.to_string_lossy()
                ),
            })
        })?;
        Self::load_from_toml_str(&contents)
    }

    pub fn load_from_toml_str(contents: &str) -> Result<Config, Error> {
        let table: toml::Table = contents.parse().map_err(|e| {
            Error::new(ErrorDetails::Config {
                message: format!("Failed to parse config file as valid TOML: {e}"),
            })
        })?;
        let uninitialized: UninitializedConfig =
            serde_path_to_error::deserialize(toml::Value::Table(table)).map_err(|e| {
                Error::new(ErrorDetails::Config {
                    message: format!("Invalid config: `{}`: {}", e.path(), e.inner()),
                })
            })?;
        Self::load(uninitialized)
    }

    fn load(config: UninitializedConfig) -> Result<Config, Error> {
        let models = match config.models {
            Some(models) => ModelTable::new(models)?,
            None => ModelTable::default(),
        };
        let loaded = Config {
            gateway: config.gateway,
            usage: config.usage,
            auth: config.auth,
            blocking: config.blocking,
            provider: config.provider,
            models,
        };
        loaded.validate()?;
        Ok(loaded)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.usage.window_secs == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`usage.window_secs` must be greater than 0".to_string(),
            }));
        }
        if self.auth.session_cookie.trim().is_empty() {
            return Err(Error::new(ErrorDetails::Config {
                message: "`auth.session_cookie` must not be empty".to_string(),
            }));
        }
        if http::HeaderName::from_bytes(self.auth.fingerprint_header.as_bytes()).is_err() {
            return Err(Error::new(ErrorDetails::Config {
                message: format!(
                    "`auth.fingerprint_header` is not a valid header name: {}",
                    self.auth.fingerprint_header
                ),
            }));
        }
        if self.blocking.sync_interval_secs == 0 {
            return Err(Error::new(ErrorDetails::Config {
                message: "`blocking.sync_interval_secs` must be greater than 0".to_string(),
            }));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocking_rules::BlockingRuleType;
    use std::io::Write;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::load_from_toml_str("").unwrap();
        assert_eq!(config.usage.free_generations_per_window, 3);
        assert_eq!(config.usage.window_secs, 86_400);
        assert_eq!(config.auth.session_cookie, "pixelforge-session");
        assert!(config.blocking.enabled);
        assert!(config.models.get("flux-schnell").is_some());
        assert!(matches!(
            config.provider,
            UninitializedProviderConfig::Replicate { .. }
        ));
    }

    #[test]
    fn test_full_config() {
        let config = Config::load_from_toml_str(
            r#"
            [gateway]
            bind_address = "127.0.0.1:4000"

            [usage]
            free_generations_per_window = 5
            window_secs = 3600

            [auth]
            session_cookie = "next-auth.session-token"

            [provider]
            type = "dummy"

            [[blocking.rules]]
            rule_type = "IP_BLOCKING"
            name = "abusive range"
            priority = 10
            status = "ACTIVE"
            config = { cidrs = ["203.0.113.0/24"] }

            [models.flux-schnell]
            cost = 1
            provider_model = "black-forest-labs/flux-schnell"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.gateway.bind_address,
            Some("127.0.0.1:4000".parse().unwrap())
        );
        assert_eq!(config.usage.free_generations_per_window, 5);
        assert_eq!(config.auth.session_cookie, "next-auth.session-token");
        assert_eq!(config.auth.fingerprint_header, "x-fingerprint-hash");
        assert!(matches!(
            config.provider,
            UninitializedProviderConfig::Dummy { .. }
        ));
        assert_eq!(config.blocking.rules.len(), 1);
        assert!(matches!(
            config.blocking.rules[0].rule_type,
            BlockingRuleType::IpBlocking
        ));
        assert_eq!(config.models.len(), 1);
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = Config::load_from_toml_str(
            r#"
            [usage]
            free_generations = 5
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("free_generations"));
    }

    #[test]
    fn test_zero_window_rejected() {
        let err = Config::load_from_toml_str(
            r#"
            [usage]
            window_secs = 0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("window_secs"));
    }

    #[tokio::test]
    async fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [provider]
            type = "dummy"
            "#
        )
        .unwrap();

        let config = Config::load_and_verify_from_path(file.path())
            .await
            .unwrap();
        assert!(matches!(
            config.provider,
            UninitializedProviderConfig::Dummy { .. }
        ));

        let missing = Config::load_and_verify_from_path(Path::new("/nonexistent/pixelforge.toml"))
            .await
            .unwrap_err();
        assert!(missing.to_string().contains("Failed to read config file"));
    }
}
