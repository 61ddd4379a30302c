use clap::Parser;
use wsdd::config::ConfigError;
use wsdd::multicast::AddressFamily;
use wsdd::Config;

#[test]
fn test_default_configuration() {
    let config = Config::try_parse_from(["wsdd"]).expect("should create config from args");

    assert!(config.interface.is_empty());
    assert_eq!(config.hoplimit, 1);
    assert_eq!(config.workgroup, "WORKGROUP");
    assert!(config.uuid.is_none());
    assert!(config.domain.is_none());
    assert!(config.hostname.is_none());
    assert!(!config.no_autostart);
    assert!(!config.no_http);
    assert!(!config.no_host);
    assert!(!config.discovery);
    assert!(!config.preserve_case);
    assert!(config.listen.is_none());
}

#[test]
fn test_short_options() {
    let config = Config::try_parse_from([
        "wsdd", "-i", "eth0", "-i", "10.0.0.1", "-H", "2", "-n", "alpha", "-w", "WG", "-D", "-o",
        "-t", "-A", "-p", "-l", "5359",
    ])
    .expect("should create config from args");

    assert_eq!(config.interface, vec!["eth0", "10.0.0.1"]);
    assert_eq!(config.hoplimit, 2);
    assert_eq!(config.hostname.as_deref(), Some("alpha"));
    assert_eq!(config.workgroup, "WG");
    assert!(config.discovery);
    assert!(config.no_host);
    assert!(config.no_http);
    assert!(config.no_autostart);
    assert!(config.preserve_case);
    assert_eq!(config.listen.as_deref(), Some("5359"));
}

#[test]
fn test_verbosity_counts() {
    let config = Config::try_parse_from(["wsdd", "-v"]).expect("config");
    assert_eq!(config.verbose, 1);

    let config = Config::try_parse_from(["wsdd", "-vv"]).expect("config");
    assert_eq!(config.verbose, 2);
}

#[test]
fn test_invalid_uuid_rejected() {
    assert!(Config::try_parse_from(["wsdd", "-U", "not-a-uuid"]).is_err());
}

#[test]
fn test_family_flags() {
    let mut config = Config::try_parse_from(["wsdd", "-4", "-6"]).expect("config");
    assert!(matches!(
        config.finalize(),
        Err(ConfigError::AddressFamilyConflict)
    ));

    let mut config = Config::try_parse_from(["wsdd", "-4"]).expect("config");
    config.finalize().expect("finalize");
    assert!(config.handles_family(AddressFamily::V4));
    assert!(!config.handles_family(AddressFamily::V6));
}

#[test]
fn test_finalized_identity() {
    let mut config = Config::try_parse_from([
        "wsdd",
        "-U",
        "11111111-2222-3333-4444-555555555555",
        "-n",
        "alpha",
    ])
    .expect("config");
    config.finalize().expect("finalize");

    assert_eq!(config.hostname(), "alpha");
    assert_eq!(
        config.device_uuid().to_string(),
        "11111111-2222-3333-4444-555555555555"
    );
}

#[test]
fn test_uuid_accepts_uppercase() {
    let mut config = Config::try_parse_from([
        "wsdd",
        "-U",
        "11111111-2222-3333-4444-55555555ABCD",
    ])
    .expect("config");
    config.finalize().expect("finalize");

    // canonical form is lowercase
    assert_eq!(
        config.device_uuid().to_string(),
        "11111111-2222-3333-4444-55555555abcd"
    );
}
