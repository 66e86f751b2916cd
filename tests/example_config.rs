//! The shipped example configuration loads, validates and plans.

use labdrive::config::AppConfig;
use labdrive::run;
use std::path::Path;

fn example() -> AppConfig {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/tracker.example.toml");
    AppConfig::load_from(path).unwrap()
}

#[test]
fn example_config_is_valid() {
    let config = example();
    config.validate().unwrap();

    let enabled: Vec<&str> = config.enabled_drives().map(|d| d.name.as_str()).collect();
    assert_eq!(enabled, vec!["left", "right"]);
    assert!(config.drives[0].master);
    assert_eq!(config.drives[0].handle.pin_register, 13);
    assert_eq!(config.drives[2].address, "192.168.1.13:502");
}

#[test]
fn example_trajectory_plans() {
    let config = example();
    let trajectory = run::plan(&config).unwrap();
    assert!(!trajectory.is_empty());
    assert_eq!(trajectory.dt, 0.25);
    assert_eq!(trajectory.positions[0], 0.0);
    let lowest = trajectory
        .positions
        .iter()
        .cloned()
        .fold(f64::INFINITY, f64::min);
    assert!((lowest + 0.8).abs() < 1e-6, "lowest {}", lowest);
}
