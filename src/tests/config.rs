use crate::config::{ConfigFile, GlobalParams};
use sha2::{Digest, Sha256};
use std::str::FromStr;

#[test]
fn test_default_config_matches_shipping_values() {
    let config = ConfigFile::default();
    assert_eq!(config.chapps.payload_encoding, "utf-8");
    assert_eq!(config.chapps.user_key, "sasl_username");
    assert_eq!(config.chapps.listener_backlog, 100);
    assert_eq!(config.outbound_quota.channel.listen_port, 10225);
    assert_eq!(config.greylisting.channel.listen_port, 10226);
    assert_eq!(config.spf.channel.listen_port, 10227);
    assert_eq!(config.outbound_quota.channel.acceptance_message, "DUNNO");
    assert_eq!(
        config.outbound_quota.channel.rejection_message,
        "REJECT Rejected - outbound quota fulfilled"
    );
    assert_eq!(
        config.greylisting.channel.rejection_message,
        "DEFER_IF_PERMIT Service temporarily unavailable - greylisted"
    );
    assert_eq!(
        config.sender_domain_auth.channel.rejection_message,
        "REJECT Rejected - not allowed to send mail from this domain"
    );
    assert_eq!(config.outbound_quota.margin, 0.10);
    assert!(config.outbound_quota.counting_recipients);
    assert_eq!(config.greylisting.minimum_deferral, 60);
    assert_eq!(config.greylisting.cache_ttl, crate::SECONDS_PER_DAY);
    assert_eq!(config.greylisting.auto_allow_after, 10);
    assert_eq!(config.spf_actions.none_neutral, "greylist");
    assert_eq!(config.redis.port, 6379);
}

#[test]
fn test_parse_ini_overrides() {
    let ini = r#"
[CHAPPS]
user_key = ccert_subject
listener_backlog = 512

[OutboundQuotaPolicy]
listen_port = 12345
margin = 50
counting_recipients = false
min_delta = 0

[GreylistingPolicy]
minimum_deferral = 120
auto_allow_after = 5

[Redis]
server = cache.chapps.io
port = 6380
sentinel_servers = 10.0.0.1:26379 10.0.0.2:26379
sentinel_dataset = chapps
"#;
    let config = ConfigFile::from_str(ini).expect("Failed to parse ini");
    assert_eq!(config.chapps.user_key, "ccert_subject");
    assert_eq!(config.chapps.listener_backlog, 512);
    assert_eq!(config.outbound_quota.channel.listen_port, 12345);
    assert_eq!(config.outbound_quota.margin, 50.0);
    assert!(!config.outbound_quota.counting_recipients);
    assert_eq!(config.outbound_quota.min_delta, 0.0);
    assert_eq!(config.greylisting.minimum_deferral, 120);
    assert_eq!(config.greylisting.auto_allow_after, 5);
    assert_eq!(config.redis.server, "cache.chapps.io");
    assert_eq!(
        config.redis.sentinel_nodes(),
        vec![
            "redis://10.0.0.1:26379/".to_string(),
            "redis://10.0.0.2:26379/".to_string()
        ]
    );
    // untouched sections keep their defaults
    assert_eq!(config.spf.channel.listen_port, 10227);
    assert_eq!(config.chapps.payload_encoding, "utf-8");
}

#[test]
fn test_admin_password_digest_check() {
    let params = GlobalParams {
        password: hex::encode(Sha256::digest(b"screwy%password")),
        ..Default::default()
    };
    assert!(params.admin_password_ok("screwy%password"));
    assert!(!params.admin_password_ok("guessable"));
}

#[test]
fn test_empty_password_never_matches() {
    let params = GlobalParams::default();
    assert!(!params.admin_password_ok(""));
}

#[test]
fn test_listener_address_resolves_localhost() {
    let config = ConfigFile::default();
    let addr = config
        .outbound_quota
        .channel
        .listener_address()
        .expect("Failed to build listener address");
    assert_eq!(addr.port(), 10225);
    assert!(addr.ip().is_loopback());
}

#[test]
fn test_spf_helo_fail_set_and_whitelist() {
    let mut config = ConfigFile::default();
    assert_eq!(config.spf.helo_fail_set(), vec!["fail".to_string()]);
    assert!(config.spf.whitelisted_helos().is_empty());

    config.spf.helo_fail_results = "fail softfail PermError".to_string();
    config.spf.whitelist = "mail.friendly.tld relay.pal.example".to_string();
    assert_eq!(
        config.spf.helo_fail_set(),
        vec![
            "fail".to_string(),
            "softfail".to_string(),
            "permerror".to_string()
        ]
    );
    assert_eq!(config.spf.whitelisted_helos().len(), 2);
}

#[test]
fn test_config_file_from_disk() {
    let dir = tempfile::tempdir().expect("Failed to make tempdir");
    let path = dir.path().join("chapps.ini");
    std::fs::write(
        &path,
        "[OutboundQuotaPolicy]\nrejection_message = REJECT quota blown\n",
    )
    .expect("Failed to write config");
    let path_string = path.to_string_lossy().to_string();
    let config =
        ConfigFile::try_from_path(Some(&path_string)).expect("Failed to load config file");
    assert_eq!(
        config.outbound_quota.channel.rejection_message,
        "REJECT quota blown"
    );
}

#[test]
fn test_missing_config_file_yields_defaults() {
    let missing = "/nonexistent/chapps-test.ini".to_string();
    let config = ConfigFile::try_from_path(Some(&missing)).expect("Failed to fall back");
    assert_eq!(config, ConfigFile::default());
}
