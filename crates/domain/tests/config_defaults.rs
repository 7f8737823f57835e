use cs_domain::config::{Config, ConfigSeverity};

#[test]
fn empty_file_yields_defaults() {
    let config: Config = toml::from_str("").unwrap();
    assert_eq!(config.server.host, "127.0.0.1");
    assert_eq!(config.server.port, 3300);
    assert_eq!(config.persistence.batch_size, 10);
    assert_eq!(config.persistence.debounce_ms, 50);
    assert!(config.thinking.simulate);
    assert_eq!(config.thinking.real_chunk_chars, 200);
    assert_eq!(config.supervisor.max_tokens, 2048);
}

#[test]
fn default_cors_allows_only_localhost() {
    let config = Config::default();
    assert!(config
        .server
        .cors
        .allowed_origins
        .contains(&"http://localhost:*".to_string()));
    assert!(config
        .server
        .cors
        .allowed_origins
        .contains(&"http://127.0.0.1:*".to_string()));
}

#[test]
fn sections_parse_together() {
    let toml_str = r#"
[server]
host = "0.0.0.0"

[server.rate_limit]
requests_per_minute = 60

[llm]
allowed_models = ["gpt-4o", "claude-*"]

[[llm.providers]]
id = "openai"
kind = "openai_compat"
base_url = "https://api.openai.com/v1"
auth = { env = "OPENAI_API_KEY" }

[thinking]
simulate = false
phase_scale = 0.5

[persistence]
state_path = "/tmp/cs.json"
batch_size = 4

[supervisor]
model = "claude-sonnet-4-20250514"
"#;
    let config: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(config.server.host, "0.0.0.0");
    assert_eq!(config.server.rate_limit.unwrap().requests_per_minute, 60);
    assert_eq!(config.llm.providers.len(), 1);
    assert!(!config.thinking.simulate);
    assert_eq!(config.persistence.batch_size, 4);
    assert_eq!(config.persistence.state_path.to_str(), Some("/tmp/cs.json"));
    assert_eq!(config.supervisor.model, "claude-sonnet-4-20250514");
}

#[test]
fn default_config_only_warns() {
    let issues = Config::default().validate();
    assert!(issues.iter().all(|i| i.severity == ConfigSeverity::Warning));
    assert!(issues.iter().any(|i| i.field == "llm.providers"));
}

#[test]
fn zero_batch_size_is_an_error() {
    let mut config = Config::default();
    config.persistence.batch_size = 0;
    let issues = config.validate();
    assert!(issues
        .iter()
        .any(|i| i.field == "persistence.batch_size" && i.severity == ConfigSeverity::Error));
}

#[test]
fn supervisor_model_outside_allow_list_warns() {
    let mut config = Config::default();
    config.llm.allowed_models = vec!["gpt-4o".into()];
    config.supervisor.model = "claude-sonnet-4-20250514".into();
    let issues = config.validate();
    assert!(issues
        .iter()
        .any(|i| i.field == "supervisor.model" && i.severity == ConfigSeverity::Warning));
}
