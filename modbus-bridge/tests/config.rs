//! Launcher configuration loaded from disk and applied to a bridge.

use std::time::Duration;

use modbus_bridge::config::ModbusBridgeConfig;
use modbus_bridge::{ModbusBridge, Role};

const REGISTERS: &str = r#"{
    connections: [
        { type: "tcp", unit: 1, address: "0.0.0.0", port: 502, mode: "master" },
    ],
    registers: [
        { name: "setpoint", address: 10, kind: "holding" },
    ],
}"#;

const CONFIG: &str = r#"{
    // relative to this file
    register_file: "registers.json5",
    host: { type: "tcp", unit: 1, address: "127.0.0.1", port: 5020, mode: "host" },
    client: { type: "tcp", unit: 10, address: "192.168.1.50", port: 502, mode: "client" },
    collection_interval_secs: 2,
    synchronisation_interval_secs: 5,
}"#;

#[test]
fn test_load_and_apply() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("registers.json5"), REGISTERS).unwrap();
    let config_path = dir.path().join("modbus-bridge.json5");
    std::fs::write(&config_path, CONFIG).unwrap();

    let config = ModbusBridgeConfig::load_from_file(&config_path).unwrap();
    assert_eq!(config.register_file, dir.path().join("registers.json5"));

    let mut bridge = ModbusBridge::new(&config.register_file).unwrap();
    // Seeded from the register file
    assert_eq!(bridge.connection_settings_host().unwrap().port, 502);

    config.apply(&mut bridge).unwrap();

    let host = bridge.connection_settings_host().unwrap();
    assert_eq!(host.port, 5020);
    assert_eq!(host.mode, Role::Host);
    assert_eq!(
        bridge.connection_settings_client().unwrap().address,
        "192.168.1.50"
    );
    assert_eq!(bridge.collection_interval(), Duration::from_secs(2));
    assert_eq!(bridge.synchronisation_interval(), Duration::from_secs(5));
    assert_eq!(bridge.stale_after(), Duration::from_secs(30));
}

#[test]
fn test_invalid_config_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("modbus-bridge.json5");
    std::fs::write(
        &config_path,
        r#"{ register_file: "registers.json5", collection_interval_secs: 0 }"#,
    )
    .unwrap();

    let err = ModbusBridgeConfig::load_from_file(&config_path).unwrap_err();
    assert!(err.to_string().contains("collection_interval_secs"));
}
