//! Protocol configuration loaded from TOML.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const DEFAULT_KEY_VALIDITY_SECS: u64 = 900;
const DEFAULT_ONE_TAP_TIMEOUT_SECS: u64 = 10;
const DEFAULT_POPUP_TIMEOUT_SECS: u64 = 300;
const DEFAULT_CODE_TTL_SECS: u64 = 600;
const DEFAULT_PROVING_TIMEOUT_SECS: u64 = 120;
const DEFAULT_SUBMISSION_TIMEOUT_SECS: u64 = 60;
const DEFAULT_ALLOWLIST_CACHE_TTL_SECS: u64 = 3600;

/// Configuration for the verification protocol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub proving: ProvingConfig,
    #[serde(default)]
    pub submission: SubmissionConfig,
    #[serde(default)]
    pub allowlist: AllowlistConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeysConfig {
    /// Lifetime of an ephemeral key. Must cover identity acquisition and proving.
    #[serde(default = "default_key_validity_secs")]
    pub validity_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    #[serde(default = "default_one_tap_timeout_secs")]
    pub one_tap_timeout_secs: u64,
    /// Upper bound for the popup flow; the provider reports closure earlier.
    #[serde(default = "default_popup_timeout_secs")]
    pub popup_timeout_secs: u64,
    #[serde(default = "default_code_ttl_secs")]
    pub code_ttl_secs: u64,
    /// Accepted `iss` values of identity tokens.
    #[serde(default = "default_trusted_issuers")]
    pub trusted_issuers: Vec<String>,
    /// Accepted `aud` values. Empty accepts any audience.
    #[serde(default)]
    pub audiences: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvingConfig {
    #[serde(default = "default_proving_timeout_secs")]
    pub timeout_secs: u64,
    /// Pinned circuit id. When unset the backend's id at startup is pinned.
    #[serde(default)]
    pub circuit_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionConfig {
    #[serde(default = "default_submission_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllowlistConfig {
    /// Recognized organization domains (exact or parent-domain match).
    #[serde(default)]
    pub domains: Vec<String>,
    /// Fallback suffix patterns used when the remote source is unavailable.
    #[serde(default = "default_patterns")]
    pub patterns: Vec<String>,
    #[serde(default = "default_allowlist_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            validity_secs: DEFAULT_KEY_VALIDITY_SECS,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            one_tap_timeout_secs: DEFAULT_ONE_TAP_TIMEOUT_SECS,
            popup_timeout_secs: DEFAULT_POPUP_TIMEOUT_SECS,
            code_ttl_secs: DEFAULT_CODE_TTL_SECS,
            trusted_issuers: default_trusted_issuers(),
            audiences: Vec::new(),
        }
    }
}

impl Default for ProvingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_PROVING_TIMEOUT_SECS,
            circuit_id: None,
        }
    }
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_SUBMISSION_TIMEOUT_SECS,
        }
    }
}

impl Default for AllowlistConfig {
    fn default() -> Self {
        Self {
            domains: Vec::new(),
            patterns: default_patterns(),
            cache_ttl_secs: DEFAULT_ALLOWLIST_CACHE_TTL_SECS,
        }
    }
}

fn default_key_validity_secs() -> u64 {
    DEFAULT_KEY_VALIDITY_SECS
}

fn default_one_tap_timeout_secs() -> u64 {
    DEFAULT_ONE_TAP_TIMEOUT_SECS
}

fn default_popup_timeout_secs() -> u64 {
    DEFAULT_POPUP_TIMEOUT_SECS
}

fn default_code_ttl_secs() -> u64 {
    DEFAULT_CODE_TTL_SECS
}

fn default_trusted_issuers() -> Vec<String> {
    vec![
        "https://accounts.google.com".to_string(),
        "accounts.google.com".to_string(),
    ]
}

fn default_proving_timeout_secs() -> u64 {
    DEFAULT_PROVING_TIMEOUT_SECS
}

fn default_submission_timeout_secs() -> u64 {
    DEFAULT_SUBMISSION_TIMEOUT_SECS
}

fn default_patterns() -> Vec<String> {
    ["edu", "ac.uk", "edu.au", "ac.jp", "ac.in", "edu.cn", "ac.nz", "ac.za"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_allowlist_cache_ttl_secs() -> u64 {
    DEFAULT_ALLOWLIST_CACHE_TTL_SECS
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to load config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    /// The key must outlive the bounded steps of an attempt.
    pub fn validate(&self) -> Result<()> {
        let bounded = self.identity.one_tap_timeout_secs
            + self.identity.popup_timeout_secs
            + self.proving.timeout_secs
            + self.submission.timeout_secs;
        ensure!(
            self.keys.validity_secs > bounded,
            "keys.validity_secs ({}) must exceed the identity, proving and submission \
             timeouts ({})",
            self.keys.validity_secs,
            bounded
        );
        ensure!(
            !self.identity.trusted_issuers.is_empty(),
            "identity.trusted_issuers must not be empty"
        );
        ensure!(self.identity.code_ttl_secs > 0, "identity.code_ttl_secs must be positive");
        Ok(())
    }

    pub fn key_validity(&self) -> Duration {
        Duration::from_secs(self.keys.validity_secs)
    }

    pub fn one_tap_timeout(&self) -> Duration {
        Duration::from_secs(self.identity.one_tap_timeout_secs)
    }

    pub fn popup_timeout(&self) -> Duration {
        Duration::from_secs(self.identity.popup_timeout_secs)
    }

    pub fn code_ttl(&self) -> Duration {
        Duration::from_secs(self.identity.code_ttl_secs)
    }

    pub fn proving_timeout(&self) -> Duration {
        Duration::from_secs(self.proving.timeout_secs)
    }

    pub fn submission_timeout(&self) -> Duration {
        Duration::from_secs(self.submission.timeout_secs)
    }
}
