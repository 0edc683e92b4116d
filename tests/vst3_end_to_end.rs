//! End-to-end tests for the COM-style dialect: the multiplexed control
//! channel, component-handler callbacks (including the mutually recursive
//! restart), the batched parameter cache, and the audio path.

mod support;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use plugbridge::host::main_context::MainContext;
use plugbridge::host::plugin_api::{
    ProcessAudio, Vst3Host, Vst3Plugin, Vst3PluginFactory,
};
use plugbridge::host::{HostBridge, Vst3Bridge};
use plugbridge::plugin::bridge::PluginBridgeOptions;
use plugbridge::plugin::vst3::{Vst3ComponentHandler, Vst3PluginBridge};
use plugbridge::plugin::PluginInfo;
use plugbridge_core::messages::vst3::{
    RestartFlags, Vst3BusInfo, Vst3EventList, Vst3ParamChanges, Vst3ParamInfo,
    Vst3ProcessRequest, Vst3ProcessResponse, Vst3ProcessSetup, Vst3Result,
};
use plugbridge_core::messages::{ConstantMasks, ProcessLevel};
use plugbridge_core::{Configuration, InstanceId, PluginType};

use support::{fake_worker_binary, lock_env, wait_for_endpoint_dir};

/// Copies inputs to outputs; announces a parameter-values restart when its
/// state is replaced, before the set-state call returns.
struct StubVst3Plugin {
    host: Option<Arc<dyn Vst3Host>>,
    param_info_queries: Arc<AtomicU32>,
    state: Vec<u8>,
}

impl Vst3Plugin for StubVst3Plugin {
    fn initialize(&mut self, host: Option<Arc<dyn Vst3Host>>) -> Vst3Result {
        self.host = host;
        Vst3Result::OK
    }

    fn terminate(&mut self) -> Vst3Result {
        Vst3Result::OK
    }

    fn set_component_handler(&mut self, handler: Option<Arc<dyn Vst3Host>>) -> Vst3Result {
        if handler.is_some() {
            self.host = handler;
        }
        Vst3Result::OK
    }

    fn bus_infos(&self) -> Vec<Vst3BusInfo> {
        vec![
            Vst3BusInfo { num_channels: 2, name: String::from("main in"), is_input: true },
            Vst3BusInfo { num_channels: 2, name: String::from("main out"), is_input: false },
        ]
    }

    fn set_active(&mut self, _active: bool, _setup: Option<&Vst3ProcessSetup>) -> Vst3Result {
        Vst3Result::OK
    }

    fn parameter_count(&self) -> i32 {
        1
    }

    fn parameter_infos(&self) -> Vec<Vst3ParamInfo> {
        self.param_info_queries.fetch_add(1, Ordering::SeqCst);

        vec![Vst3ParamInfo {
            param_id: 7,
            title: String::from("Cutoff"),
            units: String::from("Hz"),
            step_count: 0,
            default_normalized_value: 0.5,
            flags: 0,
        }]
    }

    fn get_param_normalized(&self, param_id: u32) -> f64 {
        if param_id == 7 {
            0.5
        } else {
            0.0
        }
    }

    fn set_param_normalized(&mut self, _param_id: u32, _value: f64) -> Vst3Result {
        Vst3Result::OK
    }

    fn get_state(&mut self) -> Option<Vec<u8>> {
        Some(self.state.clone())
    }

    fn set_state(&mut self, chunk: &[u8]) -> Vst3Result {
        self.state = chunk.to_vec();

        // Loading state changes the parameters, which the host learns about
        // through a restart issued before this call returns
        if let Some(host) = &self.host {
            host.restart_component(RestartFlags::PARAM_VALUES_CHANGED.bits());
        }

        Vst3Result::OK
    }

    fn set_processing(&mut self, _processing: bool) -> Vst3Result {
        Vst3Result::OK
    }

    fn process(
        &mut self,
        audio: &ProcessAudio<'_>,
        _request: &Vst3ProcessRequest,
    ) -> Vst3ProcessResponse {
        let mut output_constant_masks = ConstantMasks::new();

        for bus in 0..audio.num_output_buses() {
            let mut constant_mask = 0u64;
            for channel in 0..audio.num_output_channels(bus) {
                let input = audio.input_channel(bus, channel);
                audio.output_channel(bus, channel).copy_from_slice(input);

                if input.iter().all(|sample| *sample == 0.0) {
                    constant_mask |= 1 << channel;
                }
            }
            output_constant_masks.push(constant_mask);
        }

        Vst3ProcessResponse {
            result: Vst3Result::OK,
            output_constant_masks,
            ..Vst3ProcessResponse::default()
        }
    }
}

struct StubVst3Factory {
    param_info_queries: Arc<AtomicU32>,
}

impl Vst3PluginFactory for StubVst3Factory {
    fn create_instance(&mut self) -> Option<Box<dyn Vst3Plugin>> {
        Some(Box::new(StubVst3Plugin {
            host: None,
            param_info_queries: Arc::clone(&self.param_info_queries),
            state: Vec::new(),
        }))
    }
}

/// Records the edits and restarts arriving from the worker.
struct RecordingHandler {
    restart_thread: Mutex<Option<std::thread::ThreadId>>,
}

impl Vst3ComponentHandler for RecordingHandler {
    fn begin_edit(&self, _instance_id: InstanceId, _param_id: u32) -> Vst3Result {
        Vst3Result::OK
    }

    fn perform_edit(&self, _instance_id: InstanceId, _param_id: u32, _value: f64) -> Vst3Result {
        Vst3Result::OK
    }

    fn end_edit(&self, _instance_id: InstanceId, _param_id: u32) -> Vst3Result {
        Vst3Result::OK
    }

    fn restart_component(&self, _instance_id: InstanceId, _flags: u32) -> Vst3Result {
        *self.restart_thread.lock().unwrap() = Some(std::thread::current().id());
        Vst3Result::OK
    }
}

fn run_foreign_vst3(endpoint_base_dir: &std::path::Path, factory: Box<dyn Vst3PluginFactory>) {
    let main_context = MainContext::new();

    let bridge = Vst3Bridge::new(
        main_context.handle(),
        factory,
        None,
        endpoint_base_dir,
        std::process::id(),
    )
    .expect("could not connect the foreign bridge");

    let control_thread = {
        let bridge = Arc::clone(&bridge);
        let handle = main_context.handle();
        std::thread::spawn(move || {
            bridge.run();
            handle.stop();
        })
    };

    main_context.run();
    control_thread.join().unwrap();
}

#[test]
fn the_full_lifecycle_works_over_one_control_channel() {
    let _env = lock_env();
    let temp_root = tempfile::tempdir().unwrap();
    std::env::set_var("YABRIDGE_TEMP_DIR", temp_root.path());

    let worker = fake_worker_binary(temp_root.path());
    std::env::set_var("PLUGBRIDGE_HOST_BINARY", &worker);

    let param_info_queries = Arc::new(AtomicU32::new(0));

    let foreign_thread = {
        let temp_root = temp_root.path().to_path_buf();
        let param_info_queries = Arc::clone(&param_info_queries);
        std::thread::spawn(move || {
            let base_dir = wait_for_endpoint_dir(&temp_root, "plugin_host_callback.sock");
            run_foreign_vst3(&base_dir, Box::new(StubVst3Factory { param_info_queries }));
        })
    };

    let bridge = Vst3PluginBridge::new(PluginBridgeOptions {
        config: Configuration::default(),
        info: PluginInfo::new(PluginType::Vst3, "/tmp/StubPlugin.vst3"),
    })
    .expect("could not start the bridge");

    let proxy = bridge.create_instance().unwrap();
    assert_eq!(proxy.instance_id(), 0);

    let handler = Arc::new(RecordingHandler { restart_thread: Mutex::new(None) });
    let handler_object: Arc<dyn Vst3ComponentHandler> = handler.clone();
    assert!(proxy.set_component_handler(Some(handler_object)).unwrap().is_ok());
    assert!(proxy.initialize(true).unwrap().is_ok());

    // Parameters come from the batched cache
    assert_eq!(proxy.parameter_count().unwrap(), 1);
    let info = proxy.parameter_info(0).unwrap().unwrap();
    assert_eq!(info.title, "Cutoff");
    let _ = proxy.parameter_info(0).unwrap();
    assert_eq!(param_info_queries.load(Ordering::SeqCst), 1);
    assert_eq!(proxy.get_param_normalized(7).unwrap(), 0.5);

    // Restoring state makes the plugin announce a parameter restart before
    // the call returns; it must be serviced on this thread and it drops the
    // parameter cache
    assert!(proxy.set_state(vec![1, 2, 3]).unwrap().is_ok());
    assert_eq!(*handler.restart_thread.lock().unwrap(), Some(std::thread::current().id()));
    assert_eq!(proxy.get_state().unwrap(), Some(vec![1, 2, 3]));

    let _ = proxy.all_parameter_infos().unwrap();
    assert_eq!(param_info_queries.load(Ordering::SeqCst), 2);

    // Activate and push one block through the shared buffer
    const BLOCK_SIZE: usize = 256;
    let setup = Vst3ProcessSetup {
        sample_rate: 48_000.0,
        max_block_size: BLOCK_SIZE as u32,
        double_precision: false,
        realtime: true,
    };
    assert!(proxy.set_active(true, Some(setup)).unwrap().is_ok());
    assert!(proxy.set_processing(true).unwrap().is_ok());

    let ramp: Vec<f32> = (0..BLOCK_SIZE).map(|i| i as f32 / BLOCK_SIZE as f32).collect();
    let silent = vec![0.0f32; BLOCK_SIZE];
    let mut out_left = vec![1.0f32; BLOCK_SIZE];
    let mut out_right = vec![1.0f32; BLOCK_SIZE];

    let response = proxy
        .process_f32(
            &[ramp.as_slice(), silent.as_slice()],
            &mut [out_left.as_mut_slice(), out_right.as_mut_slice()],
            BLOCK_SIZE as u32,
            None,
            ProcessLevel::Realtime,
            Vst3ParamChanges::new(),
            Vst3EventList::new(),
        )
        .unwrap();

    assert!(response.result.is_ok());
    assert_eq!(out_left, ramp);
    assert!(out_right.iter().all(|sample| *sample == 0.0));
    assert_eq!(response.output_constant_masks.as_slice(), &[0b10]);

    assert!(proxy.set_processing(false).unwrap().is_ok());
    assert!(proxy.set_active(false, None).unwrap().is_ok());
    assert!(proxy.terminate().unwrap().is_ok());

    drop(proxy);
    drop(bridge);
    foreign_thread.join().unwrap();

    std::env::remove_var("YABRIDGE_TEMP_DIR");
    std::env::remove_var("PLUGBRIDGE_HOST_BINARY");
}
