//! Control API over a Unix stream socket.
//!
//! These tests open a real netlink socket through the address monitor;
//! they run serially to keep the kernel-facing setup predictable.

#![cfg(target_os = "linux")]

use std::sync::Arc;

use clap::Parser;
use serial_test::serial;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use wsdd::control::ControlServer;
use wsdd::{AddressMonitor, Config, DeviceRegistry, WsdContext};

fn discovery_config() -> Config {
    let mut config = Config::try_parse_from([
        "wsdd",
        "-U",
        "11111111-2222-3333-4444-555555555555",
        "-n",
        "alpha",
        "--discovery",
        "--no-autostart",
    ])
    .expect("should create config from args");
    config.finalize().expect("finalize");
    config
}

#[tokio::test]
#[serial]
async fn test_list_and_quit() {
    let config = Arc::new(discovery_config());
    let ctx = Arc::new(WsdContext::new(Arc::clone(&config)));
    let registry = Arc::new(DeviceRegistry::new());
    let monitor =
        AddressMonitor::new(Arc::clone(&ctx), Arc::clone(&registry)).expect("monitor");

    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("wsdd.sock");
    let server = ControlServer::bind(
        socket_path.to_str().expect("utf-8 path"),
        Arc::clone(&monitor),
        Arc::clone(&registry),
        Arc::clone(&config),
    )
    .await
    .expect("control server should bind");

    let stream = UnixStream::connect(&socket_path)
        .await
        .expect("client should connect");
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    // empty registry: list is just the terminator
    writer.write_all(b"list\n").await.expect("write");
    let line = lines.next_line().await.expect("read").expect("line");
    assert_eq!(line, ".");

    // unknown commands are ignored, the connection stays usable
    writer.write_all(b"bogus\nlist\n").await.expect("write");
    let line = lines.next_line().await.expect("read").expect("line");
    assert_eq!(line, ".");

    writer.write_all(b"quit\n").await.expect("write");
    assert!(lines.next_line().await.expect("read").is_none());

    server.shutdown();
    assert!(!socket_path.exists());
}

#[tokio::test]
#[serial]
async fn test_clear_command() {
    let config = Arc::new(discovery_config());
    let ctx = Arc::new(WsdContext::new(Arc::clone(&config)));
    let registry = Arc::new(DeviceRegistry::new());
    let monitor =
        AddressMonitor::new(Arc::clone(&ctx), Arc::clone(&registry)).expect("monitor");

    registry.update(
        "22222222-2222-3333-4444-555555555555",
        "<bogus/>",
        "http://10.0.0.2:5357/x",
        "eth0",
    );
    assert!(registry.contains("22222222-2222-3333-4444-555555555555"));

    let dir = tempfile::tempdir().expect("tempdir");
    let socket_path = dir.path().join("wsdd.sock");
    let server = ControlServer::bind(
        socket_path.to_str().expect("utf-8 path"),
        Arc::clone(&monitor),
        Arc::clone(&registry),
        Arc::clone(&config),
    )
    .await
    .expect("control server should bind");

    let stream = UnixStream::connect(&socket_path)
        .await
        .expect("client should connect");
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    // clear empties the registry; list confirms it
    writer.write_all(b"clear\nlist\n").await.expect("write");
    let line = lines.next_line().await.expect("read").expect("line");
    assert_eq!(line, ".");
    assert!(!registry.contains("22222222-2222-3333-4444-555555555555"));

    server.shutdown();
}
