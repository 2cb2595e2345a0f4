//! Integration tests for modbus-bridge-common.

use std::io::Write;

use modbus_bridge_common::{Error, LogFormat, LoggingConfig, load_config};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct TestConfig {
    name: String,
    #[serde(default)]
    logging: LoggingConfig,
}

fn write_config(content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_json5_file() {
    let file = write_config(
        r#"{
            // comments and trailing commas are allowed
            name: "bridge",
            logging: { level: "debug", format: "json", },
        }"#,
    );

    let config: TestConfig = load_config(file.path()).unwrap();
    assert_eq!(config.name, "bridge");
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.logging.format, LogFormat::Json);
}

#[test]
fn test_load_plain_json_file() {
    let file = write_config(r#"{"name": "bridge"}"#);

    let config: TestConfig = load_config(file.path()).unwrap();
    assert_eq!(config.logging, LoggingConfig::default());
}

#[test]
fn test_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result: Result<TestConfig, _> = load_config(dir.path().join("missing.json5"));

    match result {
        Err(Error::Config(message)) => assert!(message.contains("missing.json5")),
        other => panic!("expected config error, got {:?}", other),
    }
}

#[test]
fn test_malformed_file() {
    let file = write_config("{ name: ");
    let result: Result<TestConfig, _> = load_config(file.path());
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_level_override() {
    let config = LoggingConfig {
        level: "info".to_string(),
        format: LogFormat::Json,
    };

    let overridden = config.with_level_override(Some("trace"));
    assert_eq!(overridden.level, "trace");
    assert_eq!(overridden.format, LogFormat::Json);
    assert_eq!(config.with_level_override(None), config);
}
