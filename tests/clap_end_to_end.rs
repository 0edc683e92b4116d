//! End-to-end tests for the C-vtable dialect: instance lifecycle, the
//! extension bitset, the batched parameter cache, and the shared-memory
//! audio path with constant-silence masks.

mod support;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use plugbridge::plugin::bridge::PluginBridgeOptions;
use plugbridge::plugin::clap::{ClapHostCallbackHandler, ClapPluginBridge};
use plugbridge::plugin::PluginInfo;
use plugbridge_core::messages::clap::{ClapEventList, SupportedExtensions};
use plugbridge_core::messages::ProcessLevel;
use plugbridge_core::{Configuration, PluginType};

use support::{fake_worker_binary, lock_env, run_foreign_clap, wait_for_endpoint_dir, StubClapFactory};

struct NullCallbackHandler;
impl ClapHostCallbackHandler for NullCallbackHandler {}

struct Setup {
    bridge: Arc<ClapPluginBridge>,
    param_info_queries: Arc<std::sync::atomic::AtomicU32>,
    foreign_thread: std::thread::JoinHandle<()>,
}

fn start_bridge(temp_root: &std::path::Path) -> Setup {
    let worker = fake_worker_binary(temp_root);
    std::env::set_var("PLUGBRIDGE_HOST_BINARY", &worker);

    let factory = StubClapFactory::default();
    let param_info_queries = Arc::clone(&factory.param_info_queries);

    let foreign_thread = {
        let temp_root = temp_root.to_path_buf();
        std::thread::spawn(move || {
            // The callback socket is the last one the native side binds, so
            // its presence means the whole set is ready to accept
            let base_dir = wait_for_endpoint_dir(&temp_root, "plugin_host_callback.sock");
            run_foreign_clap(&base_dir, Box::new(factory));
        })
    };

    let bridge = ClapPluginBridge::new(
        PluginBridgeOptions {
            config: Configuration::default(),
            info: PluginInfo::new(PluginType::Clap, "/tmp/StubPlugin.clap"),
        },
        Arc::new(NullCallbackHandler),
    )
    .expect("could not start the bridge");

    Setup { bridge, param_info_queries, foreign_thread }
}

fn teardown(setup: Setup) {
    drop(setup.bridge);
    setup.foreign_thread.join().unwrap();

    std::env::remove_var("YABRIDGE_TEMP_DIR");
    std::env::remove_var("PLUGBRIDGE_HOST_BINARY");
}

#[test]
fn instance_ids_are_monotonic_and_destruction_is_isolated() {
    let _env = lock_env();
    let temp_root = tempfile::tempdir().unwrap();
    std::env::set_var("YABRIDGE_TEMP_DIR", temp_root.path());

    let setup = start_bridge(temp_root.path());

    let first = setup.bridge.create_instance().unwrap();
    let second = setup.bridge.create_instance().unwrap();

    assert_eq!(first.instance_id(), 0);
    assert_eq!(second.instance_id(), 1);

    assert!(first.init().unwrap());
    assert!(second.init().unwrap());

    // Destroying the first instance must not affect the second
    drop(first);
    assert_eq!(second.param_value(0).unwrap(), Some(0.5));

    drop(second);
    teardown(setup);
}

#[test]
fn extension_queries_are_answered_from_the_bitset() {
    let _env = lock_env();
    let temp_root = tempfile::tempdir().unwrap();
    std::env::set_var("YABRIDGE_TEMP_DIR", temp_root.path());

    let setup = start_bridge(temp_root.path());

    let instance = setup.bridge.create_instance().unwrap();
    assert!(instance.init().unwrap());

    assert!(instance.supports_extension(SupportedExtensions::PARAMS));
    assert!(instance.supports_extension(SupportedExtensions::AUDIO_PORTS));
    assert!(!instance.supports_extension(SupportedExtensions::STATE));

    // The stub would return state data if asked; getting `None` back means
    // the unsupported query never crossed the boundary
    assert_eq!(instance.save_state().unwrap(), None);

    drop(instance);
    teardown(setup);
}

#[test]
fn parameter_infos_are_batched_and_cached_until_a_rescan() {
    let _env = lock_env();
    let temp_root = tempfile::tempdir().unwrap();
    std::env::set_var("YABRIDGE_TEMP_DIR", temp_root.path());

    let setup = start_bridge(temp_root.path());

    let instance = setup.bridge.create_instance().unwrap();
    assert!(instance.init().unwrap());

    // Two queries, one fetch
    let infos = instance.param_infos().unwrap();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].name, "Gain");
    let _ = instance.param_infos().unwrap();
    assert_eq!(setup.param_info_queries.load(Ordering::SeqCst), 1);

    // The stub requests a parameter rescan from inside the flush, which
    // drops the cache
    let _ = instance.params_flush(ClapEventList::new()).unwrap();
    let _ = instance.param_infos().unwrap();
    assert_eq!(setup.param_info_queries.load(Ordering::SeqCst), 2);

    drop(instance);
    teardown(setup);
}

#[test]
fn audio_round_trips_with_constant_silence_masks() {
    let _env = lock_env();
    let temp_root = tempfile::tempdir().unwrap();
    std::env::set_var("YABRIDGE_TEMP_DIR", temp_root.path());

    let setup = start_bridge(temp_root.path());

    let instance = setup.bridge.create_instance().unwrap();
    assert!(instance.init().unwrap());

    const BLOCK_SIZE: usize = 512;
    assert!(instance.activate(44_100.0, 32, BLOCK_SIZE as u32, false).unwrap());
    assert!(instance.start_processing().unwrap());

    let alternating: Vec<f32> =
        (0..BLOCK_SIZE).map(|i| if i % 2 == 0 { -1.0 } else { 1.0 }).collect();
    let silent = vec![0.0f32; BLOCK_SIZE];

    let mut out_left = vec![0.5f32; BLOCK_SIZE];
    let mut out_right = vec![0.5f32; BLOCK_SIZE];

    let response = instance
        .process_f32(
            &[alternating.as_slice(), silent.as_slice()],
            &mut [out_left.as_mut_slice(), out_right.as_mut_slice()],
            BLOCK_SIZE as u32,
            0,
            None,
            ProcessLevel::Realtime,
            ClapEventList::new(),
        )
        .unwrap();

    // Channel 0 mirrors the input, channel 1 stays silent, and only channel
    // 1 is flagged constant on output bus 0
    assert_eq!(out_left, alternating);
    assert!(out_right.iter().all(|sample| *sample == 0.0));
    assert_eq!(response.output_constant_masks.as_slice(), &[0b10]);

    instance.stop_processing().unwrap();
    instance.deactivate().unwrap();

    drop(instance);
    teardown(setup);
}
