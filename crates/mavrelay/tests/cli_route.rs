#![cfg(all(unix, feature = "cli"))]

use std::net::UdpSocket;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use mavrelay_frame::{
    serialize, Message, MessageRegistry, TlogReader, TrimPolicy, WireVersion,
};

fn unique_temp_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "mavrelay-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ))
}

fn heartbeat(seq: u8) -> Vec<u8> {
    let message = Message::new(WireVersion::V2, 1, 1, 0, vec![seq, 0, 0, 0, 2, 3, 81, 4, 3])
        .with_seq(seq);
    let mut buf = BytesMut::new();
    serialize(&message, &MessageRegistry::common(), TrimPolicy::Never, &mut buf)
        .expect("heartbeat should serialize");
    buf.to_vec()
}

fn free_udp_port() -> u16 {
    UdpSocket::bind("127.0.0.1:0")
        .and_then(|s| s.local_addr())
        .expect("ephemeral port should be available")
        .port()
}

#[test]
fn route_forwards_udp_and_reports_stats() {
    let listen_port = free_udp_port();
    let receiver = UdpSocket::bind("127.0.0.1:0").expect("receiver should bind");
    receiver
        .set_read_timeout(Some(Duration::from_millis(100)))
        .unwrap();
    let receiver_addr = receiver.local_addr().unwrap();
    let tlog = unique_temp_path("route-tlog");

    let child = Command::new(env!("CARGO_BIN_EXE_mavrelay"))
        .args(["--log-level", "error", "--format", "json", "route"])
        .args(["--udp-server", &format!("127.0.0.1:{listen_port}")])
        .args(["--udp-client", &receiver_addr.to_string()])
        .args(["--tlog", tlog.to_str().unwrap()])
        .args(["--exit-after", "2s"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("route should start");

    // Keep sending until the router is up and the frame comes back out.
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let frame = heartbeat(42);
    let deadline = Instant::now() + Duration::from_millis(1500);
    let mut buf = [0u8; 512];
    let received = loop {
        assert!(Instant::now() < deadline, "frame was never forwarded");
        sender
            .send_to(&frame, ("127.0.0.1", listen_port))
            .unwrap();
        if let Ok((n, _)) = receiver.recv_from(&mut buf) {
            break buf[..n].to_vec();
        }
    };
    assert_eq!(received, frame);

    let output = child.wait_with_output().expect("route should exit");
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    let reports: serde_json::Value =
        serde_json::from_str(stdout.trim()).expect("route should emit json stats");
    let reports = reports.as_array().expect("stats should be an array");
    assert_eq!(reports.len(), 2);

    let server = &reports[0];
    assert_eq!(server["name"], "udp-server-1");
    assert_eq!(server["kind"], "udp");
    let forwarded = server["read"]["messages"].as_u64().unwrap();
    assert!(forwarded >= 1);

    let client = &reports[1];
    assert_eq!(client["name"], "udp-client-1");
    assert_eq!(client["write"]["messages"].as_u64().unwrap(), forwarded);
    assert_eq!(client["write"]["dropped"], 0);

    let records: Vec<_> = TlogReader::open(&tlog)
        .expect("tlog should exist")
        .map(|r| r.expect("tlog record should decode"))
        .collect();
    std::fs::remove_file(&tlog).ok();
    assert_eq!(records.len() as u64, forwarded);
    assert_eq!(records[0].frame.raw.as_ref(), frame.as_slice());
}

#[test]
fn route_without_endpoints_is_a_usage_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_mavrelay"))
        .args(["--log-level", "error", "route"])
        .output()
        .expect("route should run");

    assert_eq!(output.status.code(), Some(64));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no endpoints configured"));
}

#[test]
fn route_with_unknown_crc_override_is_a_usage_error() {
    let output = Command::new(env!("CARGO_BIN_EXE_mavrelay"))
        .args(["--log-level", "error", "route"])
        .args(["--udp-server", "127.0.0.1:0", "--no-crc-check", "nope"])
        .output()
        .expect("route should run");

    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn route_reads_endpoints_from_config_file() {
    let config = unique_temp_path("route-config");
    std::fs::write(
        &config,
        r#"{"endpoints": [{"name": "gcs", "type": "udp_server", "address": "127.0.0.1:0"}]}"#,
    )
    .unwrap();

    let output = Command::new(env!("CARGO_BIN_EXE_mavrelay"))
        .args(["--log-level", "error", "--format", "json", "route"])
        .args(["--config", config.to_str().unwrap(), "--exit-after", "200ms"])
        .output()
        .expect("route should run");
    std::fs::remove_file(&config).ok();

    assert!(output.status.success());
    let reports: serde_json::Value =
        serde_json::from_str(String::from_utf8_lossy(&output.stdout).trim()).unwrap();
    assert_eq!(reports[0]["name"], "gcs");
    assert_eq!(reports[0]["peer"], serde_json::Value::Null);
}
