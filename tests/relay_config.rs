use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use detection_relay::config::BackendKind;
use detection_relay::RelayConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    std::env::remove_var("RELAY_CONFIG");
    for key in RelayConfig::env_keys() {
        std::env::remove_var(key);
    }
}

fn config_file(suffix: &str, contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_json_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let file = config_file(
        ".json",
        r#"{
            "socket_addr": "0.0.0.0:7000",
            "model": {"path": "/models/yolo.onnx", "name": "YOLOv5s", "backend": "stub"},
            "detector": {"conf_threshold": 0.4, "target_width": 640, "target_height": 480},
            "queue": {"capacity": 3, "poll_interval_ms": 250},
            "health": {"failure_threshold": 2}
        }"#,
    );
    std::env::set_var("RELAY_CONFIG", file.path());
    std::env::set_var("RELAY_QUEUE_CAPACITY", "7");
    std::env::set_var("RELAY_TARGET_SIZE", "160x120");

    let cfg = RelayConfig::load().expect("load config");

    assert_eq!(cfg.socket_addr, "0.0.0.0:7000");
    assert_eq!(cfg.http_addr, "127.0.0.1:5001");
    assert_eq!(cfg.model.path, "/models/yolo.onnx");
    assert_eq!(cfg.model.name, "YOLOv5s");
    assert_eq!(cfg.model.backend, BackendKind::Stub);
    assert_eq!(cfg.detector.conf_threshold, 0.4);
    assert_eq!(cfg.detector.iou_threshold, 0.45);
    assert_eq!(
        (cfg.detector.target_width, cfg.detector.target_height),
        (160, 120)
    );
    assert_eq!(cfg.queue.capacity, 7);
    assert_eq!(cfg.queue.poll_interval, Duration::from_millis(250));
    assert_eq!(cfg.failure_threshold, 2);

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let file = config_file(
        ".toml",
        r#"
http_addr = "127.0.0.1:9001"

[detector]
target_fps = 30

[queue]
capacity = 2
"#,
    );
    let cfg = RelayConfig::load_from(Some(file.path())).expect("load toml");
    assert_eq!(cfg.http_addr, "127.0.0.1:9001");
    assert_eq!(cfg.detector.target_fps, 30);
    assert_eq!(cfg.queue.capacity, 2);
    assert_eq!(cfg.queue.poll_interval, Duration::from_millis(1000));

    clear_env();
}

#[test]
fn defaults_apply_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    let cfg = RelayConfig::load().expect("defaults");
    assert_eq!(cfg.socket_addr, "127.0.0.1:5000");
    assert_eq!(cfg.detector.conf_threshold, 0.25);
    assert_eq!(cfg.detector.target_fps, 15);
    assert_eq!(cfg.queue.capacity, 10);
    assert_eq!(cfg.failure_threshold, 5);
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    clear_env();

    std::env::set_var("RELAY_QUEUE_CAPACITY", "0");
    assert!(RelayConfig::load().is_err());
    clear_env();

    std::env::set_var("RELAY_CONF_THRESHOLD", "high");
    assert!(RelayConfig::load().is_err());
    clear_env();

    std::env::set_var("RELAY_SOCKET_ADDR", "not-an-address");
    assert!(RelayConfig::load().is_err());
    clear_env();

    let file = config_file(".json", r#"{"model": {"backend": "cuda"}}"#);
    assert!(RelayConfig::load_from(Some(file.path())).is_err());

    let broken = config_file(".toml", "queue = [");
    assert!(RelayConfig::load_from(Some(broken.path())).is_err());
}
