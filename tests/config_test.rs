use std::path::PathBuf;

use stonelink::{AppConfig, NetworkConfig};

#[test]
fn shipped_config_matches_defaults() {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("conf.toml");
    let config = AppConfig::set_up_config(&path).unwrap();
    assert_eq!(config.network, NetworkConfig::default());
}
