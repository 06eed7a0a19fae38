use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, VisitflowError};

/// Top-level Visitflow configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub email: EmailConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Cooldown applied when a trigger has no Frequency Cap.
    #[serde(default = "default_cooldown_secs")]
    pub default_cooldown_secs: u64,
    /// How long a Tag condition result stays cached per session.
    #[serde(default = "default_tag_cache_ttl_secs")]
    pub tag_cache_ttl_secs: u64,
    /// Number of paths returned by funnel analysis.
    #[serde(default = "default_top_paths")]
    pub top_paths: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_cooldown_secs: default_cooldown_secs(),
            tag_cache_ttl_secs: default_tag_cache_ttl_secs(),
            top_paths: default_top_paths(),
        }
    }
}

fn default_cooldown_secs() -> u64 { 24 * 60 * 60 }
fn default_tag_cache_ttl_secs() -> u64 { 300 }
fn default_top_paths() -> usize { 10 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Stop retrying on 4xx responses other than 408/429.
    #[serde(default)]
    pub classify_errors: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            queue_capacity: default_queue_capacity(),
            classify_errors: false,
        }
    }
}

fn default_concurrency() -> usize { 4 }
fn default_queue_capacity() -> usize { 1024 }

/// Exponential backoff parameters for one action class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    pub fn with_max_delay(max_delay_ms: u64) -> Self {
        Self {
            max_delay_ms,
            ..Self::default()
        }
    }
}

fn default_max_attempts() -> u32 { 5 }
fn default_initial_delay_ms() -> u64 { 1000 }
fn default_multiplier() -> f64 { 2.0 }
fn default_max_delay_ms() -> u64 { 30_000 }
fn default_jitter() -> bool { true }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    #[serde(default)]
    pub default: RetryConfig,
    #[serde(default = "default_webhook_retry")]
    pub webhook: RetryConfig,
    #[serde(default = "default_email_retry")]
    pub email: RetryConfig,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            default: RetryConfig::default(),
            webhook: default_webhook_retry(),
            email: default_email_retry(),
        }
    }
}

fn default_webhook_retry() -> RetryConfig { RetryConfig::with_max_delay(20_000) }
fn default_email_retry() -> RetryConfig { RetryConfig::with_max_delay(15_000) }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// When set, payloads are signed with HMAC-SHA256.
    #[serde(default)]
    pub hmac_secret: Option<String>,
    #[serde(default = "default_signature_header")]
    pub signature_header: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            hmac_secret: None,
            signature_header: default_signature_header(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_signature_header() -> String { "X-Visitflow-Signature".to_string() }
fn default_timeout_secs() -> u64 { 10 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    /// Provider API key. Without one, email delivery is simulated.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_email_from")]
    pub from: String,
    #[serde(default = "default_email_base_url")]
    pub base_url: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            from: default_email_from(),
            base_url: default_email_base_url(),
        }
    }
}

impl EmailConfig {
    /// API key, treating blanks and unexpanded `${VAR}` references as absent.
    pub fn effective_api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty() && !k.starts_with("${"))
    }
}

fn default_email_from() -> String { "Visitflow <noreply@visitflow.dev>".to_string() }
fn default_email_base_url() -> String { "https://api.resend.com".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database")]
    pub database: String,
    /// Directory of workflow JSON files loaded into the catalog.
    #[serde(default = "default_workflows_dir")]
    pub workflows_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
            workflows_dir: default_workflows_dir(),
        }
    }
}

fn default_database() -> String { "~/.visitflow/visitflow.db".to_string() }
fn default_workflows_dir() -> String { "~/.visitflow/workflows".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

fn default_bind() -> String { "127.0.0.1:18790".to_string() }

/// JSONL run log configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub dir: Option<String>,
    /// 1 = run boundaries, 2 = + actions, 3 = every step.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            dir: None,
            level: default_log_level(),
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| VisitflowError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| VisitflowError::Config(e.to_string()))
    }

    pub fn database_path(&self) -> PathBuf {
        expand_home(&self.storage.database)
    }

    pub fn workflows_dir(&self) -> PathBuf {
        expand_home(&self.storage.workflows_dir)
    }

    pub fn log_dir(&self) -> PathBuf {
        expand_home(self.log.dir.as_deref().unwrap_or("~/.visitflow/logs"))
    }
}

/// Resolve a leading `~/` against `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Keep the reference so the caller can tell it was unset
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_VISITFLOW_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_VISITFLOW_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_VISITFLOW_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_VISITFLOW_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_VISITFLOW_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.default_cooldown_secs, 86_400);
        assert_eq!(config.engine.tag_cache_ttl_secs, 300);
        assert_eq!(config.worker.concurrency, 4);
        assert!(!config.worker.classify_errors);
        assert_eq!(config.retry.default.max_delay_ms, 30_000);
        assert_eq!(config.retry.webhook.max_delay_ms, 20_000);
        assert_eq!(config.retry.email.max_delay_ms, 15_000);
        assert_eq!(config.retry.email.max_attempts, 5);
        assert!(config.retry.webhook.jitter);
        assert_eq!(config.webhook.signature_header, "X-Visitflow-Signature");
        assert!(config.email.effective_api_key().is_none());
    }

    #[test]
    fn test_partial_retry_section() {
        let config: AppConfig = toml::from_str(
            r#"
[retry.webhook]
max_attempts = 3
jitter = false
"#,
        )
        .unwrap();
        assert_eq!(config.retry.webhook.max_attempts, 3);
        assert!(!config.retry.webhook.jitter);
        assert_eq!(config.retry.webhook.initial_delay_ms, 1000);
        assert_eq!(config.retry.email.max_delay_ms, 15_000);
    }

    #[test]
    fn test_unexpanded_api_key_is_absent() {
        let email = EmailConfig {
            api_key: Some("${RESEND_API_KEY}".into()),
            ..EmailConfig::default()
        };
        assert!(email.effective_api_key().is_none());
    }

    #[test]
    fn test_expand_home() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(
            expand_home("~/.visitflow/x.db"),
            PathBuf::from("/home/tester/.visitflow/x.db")
        );
        assert_eq!(expand_home("/abs/x.db"), PathBuf::from("/abs/x.db"));
    }
}
