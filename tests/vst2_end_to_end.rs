//! End-to-end tests for the simple C callback dialect: the native bridge and
//! the foreign bridge run on separate threads of this process, talking over
//! real sockets and shared memory in a scratch temp root.

mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use plugbridge::plugin::bridge::PluginBridgeOptions;
use plugbridge::plugin::vst2::{Vst2HostCallbackHandler, Vst2PluginBridge};
use plugbridge::plugin::{PluginInfo, PluginLoadError};
use plugbridge_core::messages::vst2::{
    Vst2Event, Vst2EventResult, Vst2Payload, Vst2ResultPayload, HOST_OPCODE_IO_CHANGED,
    OPCODE_OPEN, OPCODE_SET_BLOCK_SIZE,
};
use plugbridge_core::messages::ProcessLevel;
use plugbridge_core::{Configuration, PluginType};

use support::{fake_worker_binary, lock_env, run_foreign_vst2, wait_for_endpoint_dir, StubVst2Plugin};

/// Records which thread answered each host callback.
struct RecordingCallbackHandler {
    io_changed_thread: Mutex<Option<ThreadId>>,
    saw_io_changed: AtomicBool,
}

impl RecordingCallbackHandler {
    fn new() -> Self {
        Self { io_changed_thread: Mutex::new(None), saw_io_changed: AtomicBool::new(false) }
    }
}

impl Vst2HostCallbackHandler for RecordingCallbackHandler {
    fn host_callback(&self, event: &Vst2Event) -> Vst2EventResult {
        if event.opcode == HOST_OPCODE_IO_CHANGED {
            *self.io_changed_thread.lock().unwrap() = Some(std::thread::current().id());
            self.saw_io_changed.store(true, Ordering::SeqCst);
        }

        Vst2EventResult { return_value: 1, payload: Vst2ResultPayload::None, value_payload: None }
    }
}

fn start_bridge(
    temp_root: &std::path::Path,
    handler: Arc<RecordingCallbackHandler>,
) -> (Vst2PluginBridge, std::thread::JoinHandle<()>) {
    let worker = fake_worker_binary(temp_root);
    std::env::set_var("PLUGBRIDGE_HOST_BINARY", &worker);

    // The foreign half runs on a thread of this process, connecting to the
    // endpoint directory once the native side has created it
    let foreign_thread = {
        let temp_root = temp_root.to_path_buf();
        std::thread::spawn(move || {
            // The control socket is the last one the native side binds, so
            // its presence means the whole set is ready to accept
            let base_dir = wait_for_endpoint_dir(&temp_root, "host_plugin_control.sock");
            run_foreign_vst2(&base_dir, Box::new(StubVst2Plugin::default()));
        })
    };

    let bridge = Vst2PluginBridge::new(
        PluginBridgeOptions {
            config: Configuration::default(),
            info: PluginInfo::new(PluginType::Vst2, "/tmp/StubPlugin.so"),
        },
        handler,
    )
    .expect("could not start the bridge");

    (bridge, foreign_thread)
}

#[test]
fn parameter_reads_cross_the_bridge() {
    let _env = lock_env();
    let temp_root = tempfile::tempdir().unwrap();
    std::env::set_var("YABRIDGE_TEMP_DIR", temp_root.path());

    let handler = Arc::new(RecordingCallbackHandler::new());
    let (bridge, foreign_thread) = start_bridge(temp_root.path(), Arc::clone(&handler));

    // The handshake already mirrored the plugin's description
    assert_eq!(bridge.plugin_info().num_params, 2);
    assert_eq!(bridge.plugin_info().num_inputs, 2);

    // One request, one response, the stub's canned value
    assert_eq!(bridge.get_parameter(0).unwrap(), 0.5);
    assert_eq!(bridge.get_parameter(1).unwrap(), 0.25);

    bridge.set_parameter(1, 0.75).unwrap();
    assert_eq!(bridge.get_parameter(1).unwrap(), 0.75);

    drop(bridge);
    foreign_thread.join().unwrap();

    std::env::remove_var("YABRIDGE_TEMP_DIR");
    std::env::remove_var("PLUGBRIDGE_HOST_BINARY");
}

#[test]
fn mutually_recursive_callbacks_run_on_the_dispatching_thread() {
    let _env = lock_env();
    let temp_root = tempfile::tempdir().unwrap();
    std::env::set_var("YABRIDGE_TEMP_DIR", temp_root.path());

    let handler = Arc::new(RecordingCallbackHandler::new());
    let (bridge, foreign_thread) = start_bridge(temp_root.path(), Arc::clone(&handler));

    // The stub answers the open call by issuing an io-changed callback
    // before returning. Without the mutual-recursion fork this would
    // deadlock; with it, the callback must run on this very thread.
    let response = bridge
        .dispatch(Vst2Event {
            opcode: OPCODE_OPEN,
            index: 0,
            value: 0,
            option: 0.0,
            payload: Vst2Payload::None,
            value_payload: None,
        })
        .unwrap();
    assert_eq!(response.return_value, 1);

    assert!(handler.saw_io_changed.load(Ordering::SeqCst));
    assert_eq!(
        *handler.io_changed_thread.lock().unwrap(),
        Some(std::thread::current().id()),
    );

    drop(bridge);
    foreign_thread.join().unwrap();

    std::env::remove_var("YABRIDGE_TEMP_DIR");
    std::env::remove_var("PLUGBRIDGE_HOST_BINARY");
}

#[test]
fn audio_round_trips_through_shared_memory() {
    let _env = lock_env();
    let temp_root = tempfile::tempdir().unwrap();
    std::env::set_var("YABRIDGE_TEMP_DIR", temp_root.path());

    let handler = Arc::new(RecordingCallbackHandler::new());
    let (bridge, foreign_thread) = start_bridge(temp_root.path(), Arc::clone(&handler));

    const BLOCK_SIZE: usize = 512;

    bridge
        .dispatch(Vst2Event {
            opcode: OPCODE_SET_BLOCK_SIZE,
            index: 0,
            value: BLOCK_SIZE as i64,
            option: 0.0,
            payload: Vst2Payload::None,
            value_payload: None,
        })
        .unwrap();
    bridge.mains_changed(true).unwrap();

    // Alternating full-scale samples on channel 0, silence on channel 1
    let alternating: Vec<f32> =
        (0..BLOCK_SIZE).map(|i| if i % 2 == 0 { -1.0 } else { 1.0 }).collect();
    let silent = vec![0.0f32; BLOCK_SIZE];

    let mut out_left = vec![0.123f32; BLOCK_SIZE];
    let mut out_right = vec![0.123f32; BLOCK_SIZE];

    let events = bridge
        .process_f32(
            &[alternating.as_slice(), silent.as_slice()],
            &mut [out_left.as_mut_slice(), out_right.as_mut_slice()],
            BLOCK_SIZE as u32,
            None,
            ProcessLevel::Realtime,
        )
        .unwrap();

    assert!(events.is_empty());
    assert_eq!(out_left, alternating);
    assert!(out_right.iter().all(|sample| *sample == 0.0));

    bridge.mains_changed(false).unwrap();

    drop(bridge);
    foreign_thread.join().unwrap();

    std::env::remove_var("YABRIDGE_TEMP_DIR");
    std::env::remove_var("PLUGBRIDGE_HOST_BINARY");
}

#[test]
fn a_crashing_worker_fails_the_load_and_leaves_no_files() {
    let _env = lock_env();
    let temp_root = tempfile::tempdir().unwrap();
    std::env::set_var("YABRIDGE_TEMP_DIR", temp_root.path());
    std::env::set_var("PLUGBRIDGE_HOST_BINARY", "/bin/false");

    let handler = Arc::new(RecordingCallbackHandler::new());
    let result = Vst2PluginBridge::new(
        PluginBridgeOptions {
            config: Configuration::default(),
            info: PluginInfo::new(PluginType::Vst2, "/tmp/StubPlugin.so"),
        },
        handler,
    );

    assert!(matches!(result, Err(PluginLoadError::WorkerExited)));

    // The endpoint directory must have been cleaned up
    let leftovers: Vec<_> = std::fs::read_dir(temp_root.path())
        .unwrap()
        .flatten()
        .filter(|entry| entry.path().is_dir())
        .collect();
    assert!(leftovers.is_empty(), "socket files were left behind: {:?}", leftovers);

    std::env::remove_var("YABRIDGE_TEMP_DIR");
    std::env::remove_var("PLUGBRIDGE_HOST_BINARY");
}
