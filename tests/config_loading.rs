use std::io::Write;
use std::path::PathBuf;

use weft_core::config::WeftConfig;
use weft_core::{Classification, WeftError};

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_parallel_nodes = 8
agent_timeout_secs = 10
retry_backoff_ms = 50
data_dir = "/tmp/weft-test"
catalog_path = "/tmp/weft-test/agents.json"

[thresholds]
direct = 0.9
deterministic = 0.75
assisted = 0.5

[matcher]
alias_groups = [["text", "body"], ["lang", "language"]]
alias_quality = 0.85

[pricing]
assisted_cost = 0.002
generative_cost = 0.05

[generative]
enabled = true
base_url = "http://localhost:11434/v1"
model_id = "llama3.2"
api_key = "sk-test-key"
max_tokens = 512
max_output_bytes = 4096
timeout_secs = 15

[gateway]
bind = "0.0.0.0:9999"

[log]
enabled = false
log_dir = "/tmp/weft-test/run-logs"
level = 3
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = WeftConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_parallel_nodes, 8);
    assert_eq!(config.engine.agent_timeout_secs, 10);
    assert_eq!(config.catalog_path(), PathBuf::from("/tmp/weft-test/agents.json"));
    assert_eq!(config.database_path(), PathBuf::from("/tmp/weft-test/weft.db"));

    assert_eq!(config.thresholds.classify(0.8), Classification::Deterministic);
    assert_eq!(config.thresholds.classify(0.6), Classification::Assisted);
    assert_eq!(config.matcher.alias_groups.len(), 2);
    assert_eq!(config.matcher.alias_quality, 0.85);
    assert_eq!(config.matcher.exact_quality, 1.0);

    assert_eq!(config.pricing.generative_cost, 0.05);
    assert_eq!(config.generative.model_id, "llama3.2");
    assert_eq!(config.generative.api_key, Some("sk-test-key".to_string()));
    assert_eq!(config.generative.max_output_bytes, 4096);
    assert_eq!(config.generative.timeout_secs, 15);

    assert_eq!(config.gateway.bind, "0.0.0.0:9999");
    assert!(!config.log.enabled);
    assert_eq!(config.log.level, 3);
    assert_eq!(config.log_dir(), PathBuf::from("/tmp/weft-test/run-logs"));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("WEFT_TEST_API_KEY", "expanded-key-value");

    let toml_content = r#"
[generative]
api_key = "${WEFT_TEST_API_KEY}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = WeftConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.generative.api_key, Some("expanded-key-value".to_string()));

    std::env::remove_var("WEFT_TEST_API_KEY");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[gateway]
bind = "127.0.0.1:8080"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = WeftConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_parallel_nodes, 4);
    assert_eq!(config.engine.agent_timeout_secs, 30);
    assert_eq!(config.thresholds.direct, 0.85);
    assert_eq!(config.thresholds.deterministic, 0.70);
    assert_eq!(config.thresholds.assisted, 0.40);
    assert_eq!(config.matcher.unmatched_required_cap, 0.39);
    assert!(config.generative.enabled);
    assert_eq!(config.generative.confirmation_timeout_secs, 120);
    assert_eq!(config.generative.timeout_secs, 60);
    assert!(config.log.enabled);
    assert_eq!(config.log.level, 2);
}

#[test]
fn test_missing_config_file() {
    let err = WeftConfig::load(std::path::Path::new("/nonexistent/weft.toml")).unwrap_err();
    assert!(matches!(err, WeftError::ConfigNotFound(_)));
}

#[test]
fn test_malformed_config_is_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine\nmax_parallel_nodes = ").expect("write toml");
    assert!(matches!(
        WeftConfig::load(tmp.path()),
        Err(WeftError::Config(_))
    ));
}
