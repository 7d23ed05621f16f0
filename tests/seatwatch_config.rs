use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use seatwatch::config::{SeatwatchConfig, TraversalMode};
use seatwatch::AlertPolicy;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SEATWATCH_CONFIG",
        "SEATWATCH_INPUT",
        "SEATWATCH_SEATS",
        "SEATWATCH_DB_PATH",
        "SEATWATCH_STATES_PATH",
        "SEATWATCH_MAX_FRAMES",
        "SEATWATCH_ANOMALY_SECS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let toml = r#"
        [source]
        input = "videos/hall_a.mp4"
        mode = "stream"
        target_fps = 4.0
        start = 100
        end = 5000

        [seats]
        path = "config/hall_a_seats.json"

        [classifier]
        iou_threshold = 0.2
        conf_thres_object = 0.35

        [foreground]
        enabled = false

        [state]
        anomaly_threshold_secs = 300
        alert_policy = "every_frame"

        [output]
        db_path = "hall_a.db"
        jpeg_quality = 80
    "#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");

    std::env::set_var("SEATWATCH_CONFIG", file.path());
    std::env::set_var("SEATWATCH_INPUT", "videos/hall_b.mp4");
    std::env::set_var("SEATWATCH_MAX_FRAMES", "250");
    std::env::set_var("SEATWATCH_ANOMALY_SECS", "90");

    let cfg = SeatwatchConfig::load().expect("load config");

    assert_eq!(cfg.source.input.as_deref(), Some("videos/hall_b.mp4"));
    assert_eq!(cfg.source.mode, TraversalMode::Stream);
    assert_eq!(cfg.source.target_fps, 4.0);
    assert_eq!(cfg.source.start, 100);
    assert_eq!(cfg.source.end, Some(5000));
    assert_eq!(cfg.source.max_frames, Some(250));
    assert_eq!(cfg.seats_path, PathBuf::from("config/hall_a_seats.json"));
    assert_eq!(cfg.classifier.iou_threshold, 0.2);
    assert_eq!(cfg.classifier.conf_thres_object, 0.35);
    assert_eq!(cfg.classifier.conf_thres_person, 0.5);
    assert!(!cfg.foreground.enabled);
    assert!(cfg.foreground.build().is_none());
    assert_eq!(cfg.state.anomaly_threshold_secs, 90.0);
    assert_eq!(cfg.state.alert_policy, AlertPolicy::EveryFrame);
    assert_eq!(cfg.output.db_path, "hall_a.db");
    assert_eq!(cfg.output.jpeg_quality, 80);

    clear_env();
}

#[test]
fn defaults_without_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = SeatwatchConfig::load().expect("load config");
    assert_eq!(cfg.source.input, None);
    assert_eq!(cfg.source.mode, TraversalMode::Auto);
    assert_eq!(cfg.state.anomaly_threshold_secs, 120.0);
    assert_eq!(cfg.state.alert_policy, AlertPolicy::OncePerEpisode);
    assert_eq!(cfg.output.latest_path, PathBuf::from("runtime/last_frame.json"));
    assert_eq!(cfg.output.frames_root, PathBuf::from("data/frames"));
    assert_eq!(cfg.detector.backend, "stub");
    assert!(cfg.foreground.build().is_some());
    assert!(cfg.detector.build_registry().is_ok());
}

#[test]
fn rejects_invalid_env_and_thresholds() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SEATWATCH_MAX_FRAMES", "lots");
    assert!(SeatwatchConfig::load().is_err());
    clear_env();

    std::env::set_var("SEATWATCH_ANOMALY_SECS", "-5");
    assert!(SeatwatchConfig::load().is_err());
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, b"[classifier]\nconf_thres_person = 1.4\n")
        .expect("write config");
    std::env::set_var("SEATWATCH_CONFIG", file.path());
    assert!(SeatwatchConfig::load().is_err());

    clear_env();
}

#[test]
fn missing_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SEATWATCH_CONFIG", "/nonexistent/seatwatch.toml");
    assert!(SeatwatchConfig::load().is_err());

    clear_env();
}
