//! Configuration loading tests
//!
//! Exercises the TOML surface operators actually edit: committee lists,
//! timing overrides and validation of malformed files.

use std::io::Write;
use vbft_config::{
    ChainConfig, ConfigError, NodeId, PeerConfig, VrfKey, DEFAULT_BLOCK_MSEC, VRF_KEY_SIZE,
};

const FOUR_PEERS: &str = r#"
epoch = 3
round_timeout_msec = 1500

[[peers]]
index = 0
id = "0101010101010101010101010101010101010101010101010101010101010101"
vrf_key = "a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1a1"

[[peers]]
index = 1
id = "0202020202020202020202020202020202020202020202020202020202020202"
vrf_key = "a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2a2"

[[peers]]
index = 2
id = "0303030303030303030303030303030303030303030303030303030303030303"
vrf_key = "a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3a3"

[[peers]]
index = 3
id = "0404040404040404040404040404040404040404040404040404040404040404"
vrf_key = "a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4a4"
"#;

#[test]
fn test_parse_committee_with_overrides() {
    let config = ChainConfig::from_toml_str(FOUR_PEERS).unwrap();

    assert_eq!(config.epoch, 3);
    assert_eq!(config.committee_size(), 4);
    assert_eq!(config.round_timeout_msec, 1500);
    // Unspecified fields fall back to defaults
    assert_eq!(config.block_msec, DEFAULT_BLOCK_MSEC);
    assert_eq!(config.quorum(), 3);

    let id: NodeId = "0303030303030303030303030303030303030303030303030303030303030303"
        .parse()
        .unwrap();
    assert_eq!(config.index_of(&id), Some(2));
}

#[test]
fn test_load_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(FOUR_PEERS.as_bytes()).unwrap();

    let config = ChainConfig::load(file.path()).unwrap();
    assert_eq!(config.peers.len(), 4);
}

#[test]
fn test_read_accepts_timings_only_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"block_msec = 250\nmax_append_retries = 2\n").unwrap();

    let config = ChainConfig::read(file.path()).unwrap();
    assert_eq!(config.block_msec, 250);
    assert_eq!(config.max_append_retries, 2);
    assert!(config.peers.is_empty());
    assert!(matches!(
        ChainConfig::load(file.path()),
        Err(ConfigError::EmptyCommittee)
    ));
}

#[test]
fn test_load_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = ChainConfig::load(&dir.path().join("absent.toml"));
    assert!(matches!(result, Err(ConfigError::Io(_))));
}

#[test]
fn test_rejects_malformed_node_id() {
    let doc = r#"
[[peers]]
index = 0
id = "not-hex"
vrf_key = "00"
"#;
    let result = ChainConfig::from_toml_str(doc);
    assert!(matches!(result, Err(ConfigError::InvalidNodeId { .. })));
}

#[test]
fn test_rejects_missing_vrf_key() {
    let doc = r#"
[[peers]]
index = 0
id = "0101010101010101010101010101010101010101010101010101010101010101"
"#;
    let result = ChainConfig::from_toml_str(doc);
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn test_rejects_invalid_toml() {
    let result = ChainConfig::from_toml_str("peers = [ this is not toml");
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn test_json_roundtrip_keeps_node_id_transparent() {
    let config = ChainConfig::with_peers(vec![PeerConfig {
        index: 0,
        id: NodeId::from_public_key(&[0xab; 32]),
        vrf_key: VrfKey::from_bytes(&[0xcd; VRF_KEY_SIZE]),
    }]);
    let json = serde_json::to_value(&config).unwrap();
    assert_eq!(json["peers"][0]["id"], "ab".repeat(32));
    assert_eq!(json["peers"][0]["vrf_key"], "cd".repeat(VRF_KEY_SIZE));
}
