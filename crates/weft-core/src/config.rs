use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, WeftError};
use crate::types::Classification;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on concurrently executing node tasks.
    #[serde(default = "default_max_parallel_nodes")]
    pub max_parallel_nodes: usize,
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    /// Base delay before the single retry of a transient agent failure.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub catalog_path: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: default_max_parallel_nodes(),
            agent_timeout_secs: default_agent_timeout_secs(),
            retry_backoff_ms: default_retry_backoff_ms(),
            data_dir: default_data_dir(),
            catalog_path: None,
        }
    }
}

fn default_max_parallel_nodes() -> usize { 4 }
fn default_agent_timeout_secs() -> u64 { 30 }
fn default_retry_backoff_ms() -> u64 { 250 }
fn default_data_dir() -> String { "~/.weft".to_string() }

/// Score bands that pick a transform tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    #[serde(default = "default_direct")]
    pub direct: f64,
    #[serde(default = "default_deterministic")]
    pub deterministic: f64,
    #[serde(default = "default_assisted")]
    pub assisted: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            direct: default_direct(),
            deterministic: default_deterministic(),
            assisted: default_assisted(),
        }
    }
}

fn default_direct() -> f64 { 0.85 }
fn default_deterministic() -> f64 { 0.70 }
fn default_assisted() -> f64 { 0.40 }

impl ThresholdConfig {
    pub fn classify(&self, score: f64) -> Classification {
        if score >= self.direct {
            Classification::Direct
        } else if score >= self.deterministic {
            Classification::Deterministic
        } else if score >= self.assisted {
            Classification::Assisted
        } else {
            Classification::Generative
        }
    }

    /// Bands must be ordered and inside [0, 1].
    pub fn validate(&self) -> Result<()> {
        let ordered = 0.0 <= self.assisted
            && self.assisted <= self.deterministic
            && self.deterministic <= self.direct
            && self.direct <= 1.0;
        if ordered {
            Ok(())
        } else {
            Err(WeftError::Config(format!(
                "thresholds must satisfy 0 <= assisted ({}) <= deterministic ({}) <= direct ({}) <= 1",
                self.assisted, self.deterministic, self.direct
            )))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    /// Groups of field names treated as aliases of each other.
    #[serde(default = "default_alias_groups")]
    pub alias_groups: Vec<Vec<String>>,
    #[serde(default = "default_exact_quality")]
    pub exact_quality: f64,
    #[serde(default = "default_alias_quality")]
    pub alias_quality: f64,
    #[serde(default = "default_coercion_quality")]
    pub coercion_quality: f64,
    #[serde(default = "default_default_quality")]
    pub default_quality: f64,
    #[serde(default = "default_required_weight")]
    pub required_weight: f64,
    #[serde(default = "default_optional_weight")]
    pub optional_weight: f64,
    /// Score ceiling applied when any required field is unmatched.
    #[serde(default = "default_unmatched_cap")]
    pub unmatched_required_cap: f64,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            alias_groups: default_alias_groups(),
            exact_quality: default_exact_quality(),
            alias_quality: default_alias_quality(),
            coercion_quality: default_coercion_quality(),
            default_quality: default_default_quality(),
            required_weight: default_required_weight(),
            optional_weight: default_optional_weight(),
            unmatched_required_cap: default_unmatched_cap(),
        }
    }
}

fn default_alias_groups() -> Vec<Vec<String>> {
    [
        &["text", "summary", "content", "body"][..],
        &["translated", "translation", "translated_text"][..],
        &["language", "lang", "target_language"][..],
    ]
    .iter()
    .map(|group| group.iter().map(|s| s.to_string()).collect())
    .collect()
}
fn default_exact_quality() -> f64 { 1.0 }
fn default_alias_quality() -> f64 { 0.8 }
fn default_coercion_quality() -> f64 { 0.75 }
fn default_default_quality() -> f64 { 0.7 }
fn default_required_weight() -> f64 { 0.7 }
fn default_optional_weight() -> f64 { 0.3 }
fn default_unmatched_cap() -> f64 { 0.39 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    #[serde(default = "default_assisted_cost")]
    pub assisted_cost: f64,
    #[serde(default = "default_generative_cost")]
    pub generative_cost: f64,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            assisted_cost: default_assisted_cost(),
            generative_cost: default_generative_cost(),
        }
    }
}

fn default_assisted_cost() -> f64 { 0.001 }
fn default_generative_cost() -> f64 { 0.02 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerativeConfig {
    #[serde(default = "default_generative_enabled")]
    pub enabled: bool,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    /// Confidence recorded for generative transforms.
    #[serde(default = "default_generative_confidence")]
    pub confidence: f64,
    /// How long an interactive confirmation may stay pending.
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    /// Upper bound on a single completion request.
    #[serde(default = "default_generative_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GenerativeConfig {
    fn default() -> Self {
        Self {
            enabled: default_generative_enabled(),
            base_url: default_base_url(),
            model_id: default_model_id(),
            api_key: None,
            max_tokens: default_max_tokens(),
            max_output_bytes: default_max_output_bytes(),
            confidence: default_generative_confidence(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            timeout_secs: default_generative_timeout_secs(),
        }
    }
}

fn default_generative_enabled() -> bool { true }
fn default_base_url() -> String { "https://api.openai.com/v1".to_string() }
fn default_model_id() -> String { "gpt-4o-mini".to_string() }
fn default_max_tokens() -> u32 { 1024 }
fn default_max_output_bytes() -> usize { 16_384 }
fn default_generative_confidence() -> f64 { 0.6 }
fn default_confirmation_timeout_secs() -> u64 { 120 }
fn default_generative_timeout_secs() -> u64 { 60 }

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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for run logs. Default: <data_dir>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// 1 = run summary only, 2 = per node, 3 = per transform and confirmation.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

/// Top-level configuration, usually loaded from `weft.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WeftConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub thresholds: ThresholdConfig,
    #[serde(default)]
    pub matcher: MatcherConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub generative: GenerativeConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl WeftConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| WeftError::ConfigNotFound(path.display().to_string()))?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let expanded = expand_env_vars(content);
        let config: Self =
            toml::from_str(&expanded).map_err(|e| WeftError::Config(e.to_string()))?;
        config.thresholds.validate()?;
        if config.engine.max_parallel_nodes == 0 {
            return Err(WeftError::Config(
                "engine.max_parallel_nodes must be at least 1".into(),
            ));
        }
        Ok(config)
    }

    /// Resolve the data directory (expand ~).
    pub fn data_dir(&self) -> PathBuf {
        expand_home(&self.engine.data_dir)
    }

    pub fn log_dir(&self) -> PathBuf {
        match self.log.log_dir {
            Some(ref dir) => expand_home(dir),
            None => self.data_dir().join("logs"),
        }
    }

    pub fn catalog_path(&self) -> PathBuf {
        match self.engine.catalog_path {
            Some(ref path) => expand_home(path),
            None => self.data_dir().join("catalog.json"),
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir().join("weft.db")
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

/// Expand `${ENV_VAR}` patterns; unset variables are left as written.
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
