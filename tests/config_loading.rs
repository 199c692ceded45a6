use std::io::Write;

use trellis_core::config::AppConfig;
use trellis_core::types::ModelTier;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_steps = 64
max_call_depth = 4
playbook_dir = "books"
workspace = "/tmp/trellis-test"

[threads]
max_depth = 2
default_window_ratio = 0.5
root_window_tokens = 32000
anchor_recent_exchanges = 2

[profiles.router]
tier = "standard"
history_messages = 10

[profiles.worker]
tier = "light"

[memory]
database = "/tmp/trellis-test/mem.db"
recall_limit = 3

[log]
level = 3
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_steps, 64);
    assert_eq!(config.engine.max_call_depth, 4);
    assert_eq!(config.playbook_dir().to_str(), Some("/tmp/trellis-test/books"));
    assert_eq!(config.threads.max_depth, 2);
    assert_eq!(config.threads.default_window_ratio, 0.5);
    assert_eq!(config.threads.root_window_tokens, 32_000);
    assert_eq!(config.threads.anchor_recent_exchanges, 2);

    let router = config.profiles.router.as_ref().expect("router tuning");
    assert_eq!(router.tier, Some(ModelTier::Standard));
    assert_eq!(router.history_messages, Some(10));
    assert_eq!(
        config.profiles.worker.as_ref().and_then(|w| w.tier),
        Some(ModelTier::Light)
    );

    assert_eq!(config.memory.recall_limit, 3);
    assert_eq!(config.memory_db_path().to_str(), Some("/tmp/trellis-test/mem.db"));

    let log = config.log.as_ref().expect("log present");
    assert!(log.enabled);
    assert_eq!(log.level, 3);
    assert_eq!(config.log_dir().unwrap().to_str(), Some("/tmp/trellis-test/logs"));
}

#[test]
fn test_env_var_expansion_in_config() {
    std::env::set_var("TRELLIS_TEST_WORKSPACE", "/tmp/expanded-workspace");

    let toml_content = r#"
[engine]
workspace = "${TRELLIS_TEST_WORKSPACE}"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.engine.workspace, "/tmp/expanded-workspace");

    std::env::remove_var("TRELLIS_TEST_WORKSPACE");
}

#[test]
fn test_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[engine]\n").expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.engine.max_steps, 256);
    assert_eq!(config.engine.max_call_depth, 8);
    assert_eq!(config.engine.playbook_dir, "playbooks");
    assert_eq!(config.threads.max_depth, 3);
    assert_eq!(config.threads.default_window_ratio, 0.8);
    assert_eq!(config.threads.anchor_recent_exchanges, 4);
    assert!(config.profiles.router.is_none());
    assert!(config.memory.database.is_none());
    assert!(config.log.is_none());
}

#[test]
fn test_invalid_values_are_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[threads]\ndefault_window_ratio = 0.0\n")
        .expect("write toml");
    assert!(AppConfig::load(tmp.path()).is_err());

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[profiles.router]\ntier = \"gigantic\"\n")
        .expect("write toml");
    assert!(AppConfig::load(tmp.path()).is_err());
}

#[test]
fn test_missing_file_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = AppConfig::load(&dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().contains("absent.toml"));
}
