//! Exercises the bootstrap-facing promise of `RouterConfig`: it is
//! `serde::{Serialize, Deserialize}` so an out-of-core bootstrap layer can
//! load it from a config file on disk, even though loading files is
//! itself out of scope for this crate (spec.md §1).

use std::io::Write;

use cellrouter::router::config::RouterConfig;

#[test_log::test]
fn router_config_round_trips_through_a_toml_file() {
    let original = RouterConfig::development();
    let serialized = toml::to_string_pretty(&original).expect("RouterConfig must serialize to TOML");

    let mut file = tempfile::NamedTempFile::new().expect("failed to create temp config file");
    file.write_all(serialized.as_bytes()).expect("failed to write temp config file");

    let contents = std::fs::read_to_string(file.path()).expect("failed to read temp config file back");
    let reloaded: RouterConfig = toml::from_str(&contents).expect("RouterConfig must deserialize from TOML");

    assert_eq!(reloaded.topic_base, original.topic_base);
    assert_eq!(reloaded.call_timeout, original.call_timeout);
    assert_eq!(reloaded.max_hop_count, original.max_hop_count);
    assert_eq!(reloaded.scheduler_retries, original.scheduler_retries);
    assert_eq!(reloaded.instance_update_interval, original.instance_update_interval);
    assert!(reloaded.heal_loop_enabled());
}

#[test_log::test]
fn a_disabled_heal_loop_round_trips_too() {
    use cellrouter::router::config::InstanceUpdateIntervalSecs;

    let mut original = RouterConfig::development();
    original.instance_update_interval = InstanceUpdateIntervalSecs::new(0);
    let serialized = toml::to_string(&original).expect("RouterConfig must serialize to TOML");
    let reloaded: RouterConfig = toml::from_str(&serialized).expect("RouterConfig must deserialize from TOML");

    assert!(!reloaded.heal_loop_enabled());
    assert!(reloaded.heal_loop_interval().is_none());
}
