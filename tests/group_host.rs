//! Tests for the group worker: the bind-or-lose startup race and the host
//! request exchange on the group socket.

mod support;

use std::os::unix::net::UnixStream;
use std::time::Duration;

use plugbridge::host::group::{GroupBridge, GroupBridgeError};
use plugbridge_core::codec::{read_object, write_object};
use plugbridge_core::messages::{HostRequest, HostResponse};
use plugbridge_core::PluginType;

use support::lock_env;

#[test]
fn losing_the_bind_race_is_not_a_failure() {
    let _env = lock_env();
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("plugbridge-group-g1-0-x64.sock");

    let winner = GroupBridge::new(&socket_path).unwrap();
    let loser = GroupBridge::new(&socket_path);

    assert!(matches!(loser, Err(GroupBridgeError::AlreadyListening)));

    drop(winner);
}

#[test]
fn stale_socket_files_are_replaced() {
    let _env = lock_env();
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("plugbridge-group-g1-0-x64.sock");

    // A leftover from a dead worker: the file exists but nothing listens
    {
        let stale = std::os::unix::net::UnixListener::bind(&socket_path).unwrap();
        drop(stale);
    }
    assert!(socket_path.exists());

    let bridge = GroupBridge::new(&socket_path);
    assert!(bridge.is_ok());
}

#[test]
fn host_requests_are_answered_with_the_group_pid() {
    let _env = lock_env();
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("plugbridge-group-g1-0-x64.sock");

    let bridge = GroupBridge::new(&socket_path).unwrap();
    let group_thread = std::thread::spawn(move || {
        // Runs until the idle grace period expires
        bridge.handle_incoming_connections();
    });

    // Two bridges asking the same group worker for hosting must both get
    // this process's pid back, without a second worker appearing
    for _ in 0..2 {
        let socket = UnixStream::connect(&socket_path).unwrap();
        let mut scratch = Vec::new();

        let request = HostRequest {
            plugin_type: PluginType::Clap,
            // The load itself fails (there is no such library), which the
            // group worker logs and survives
            plugin_path: String::from("/nonexistent/plugin.clap"),
            endpoint_base_dir: String::from("/nonexistent"),
            parent_pid: std::process::id(),
        };
        write_object(&mut &socket, &request, &mut scratch).unwrap();

        let response: HostResponse = read_object(&mut &socket, &mut scratch).unwrap();
        assert_eq!(response.pid, std::process::id());
    }

    // The group process lingers for its grace period, then shuts down on
    // its own since it never ended up hosting anything
    std::thread::sleep(Duration::from_millis(100));
    drop(group_thread);
}
