//! Shared scaffolding for the end-to-end tests: stub plugins implementing
//! the dialect traits, and helpers for running the foreign half of a bridge
//! on a thread of the test process.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use plugbridge::host::main_context::MainContext;
use plugbridge::host::plugin_api::{
    ClapHost, ClapPlugin, ClapPluginFactory, ClapProcessResult, ProcessAudio, Vst2HostCallback,
    Vst2Plugin,
};
use plugbridge::host::{ClapBridge, HostBridge, Vst2Bridge};
use plugbridge_core::messages::clap::{
    ClapAudioPortInfo, ClapParamInfo, ClapProcessRequest, ClapProcessStatus, SupportedExtensions,
};
use plugbridge_core::messages::vst2::{
    Vst2Event, Vst2EventResult, Vst2Payload, Vst2PluginInfo, Vst2ResultPayload,
    HOST_OPCODE_IO_CHANGED, OPCODE_OPEN,
};
use plugbridge_core::messages::{ConstantMasks, MidiEventList};

/// Serializes tests that touch the environment (temp root and host binary
/// overrides are process wide).
pub fn lock_env() -> MutexGuard<'static, ()> {
    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    ENV_LOCK.get_or_init(|| Mutex::new(())).lock().unwrap_or_else(|e| e.into_inner())
}

/// Point the worker spawn at a script that just stays alive. The actual
/// foreign half runs in this process on a thread; the native side only needs
/// its "worker" to look alive while the sockets connect.
pub fn fake_worker_binary(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("fake-worker.sh");
    std::fs::write(&path, "#!/bin/sh\nsleep 60\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    path
}

/// Wait for the native side to create its endpoint directory under the temp
/// root, so the foreign thread knows where to connect.
pub fn wait_for_endpoint_dir(temp_root: &Path, probe_socket: &str) -> PathBuf {
    for _ in 0..1000 {
        if let Ok(entries) = std::fs::read_dir(temp_root) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() && path.join(probe_socket).exists() {
                    return path;
                }
            }
        }

        std::thread::sleep(Duration::from_millis(5));
    }

    panic!("the endpoint directory never appeared under {}", temp_root.display());
}

/// Run the foreign half of a simple-C-dialect bridge until the native side
/// closes the sockets. Mirrors what the worker binary's individual mode
/// does.
pub fn run_foreign_vst2(endpoint_base_dir: &Path, plugin: Box<dyn Vst2Plugin>) {
    let main_context = MainContext::new();

    let bridge = Vst2Bridge::new(
        main_context.handle(),
        plugin,
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

/// Same, for the C-vtable dialect.
pub fn run_foreign_clap(endpoint_base_dir: &Path, factory: Box<dyn ClapPluginFactory>) {
    let main_context = MainContext::new();

    let bridge = ClapBridge::new(
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

// ---------------------------------------------------------------------------
// Simple C dialect stub

/// A stub plugin: parameter 0 reads back 0.5, processing copies inputs to
/// outputs, and the open call issues a mutually recursive io-changed host
/// callback.
pub struct StubVst2Plugin {
    host: Option<Arc<dyn Vst2HostCallback>>,
    parameters: Vec<f32>,
}

impl Default for StubVst2Plugin {
    fn default() -> Self {
        Self { host: None, parameters: vec![0.5, 0.25] }
    }
}

impl Vst2Plugin for StubVst2Plugin {
    fn info(&self) -> Vst2PluginInfo {
        Vst2PluginInfo {
            num_params: self.parameters.len() as i32,
            num_inputs: 2,
            num_outputs: 2,
            flags: 0,
            initial_delay: 0,
            unique_id: 0x70627467,
            version: 1,
        }
    }

    fn set_host_callback(&mut self, host: Arc<dyn Vst2HostCallback>) {
        self.host = Some(host);
    }

    fn dispatch(&mut self, event: &Vst2Event) -> Vst2EventResult {
        // Re-enter the host while the open call is still in flight, the way
        // real plugins announce their IO configuration mid-initialization
        if event.opcode == OPCODE_OPEN {
            if let Some(host) = &self.host {
                let _ = host.host_callback(&Vst2Event {
                    opcode: HOST_OPCODE_IO_CHANGED,
                    index: 0,
                    value: 0,
                    option: 0.0,
                    payload: Vst2Payload::PluginInfo(self.info()),
                    value_payload: None,
                });
            }
        }

        Vst2EventResult {
            return_value: 1,
            payload: Vst2ResultPayload::None,
            value_payload: None,
        }
    }

    fn get_parameter(&mut self, index: i32) -> f32 {
        self.parameters.get(index as usize).copied().unwrap_or(0.0)
    }

    fn set_parameter(&mut self, index: i32, value: f32) {
        if let Some(parameter) = self.parameters.get_mut(index as usize) {
            *parameter = value;
        }
    }

    fn process_f32(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        _frames: usize,
    ) -> MidiEventList {
        for (input, output) in inputs.iter().zip(outputs.iter_mut()) {
            output.copy_from_slice(input);
        }

        MidiEventList::new()
    }
}

// ---------------------------------------------------------------------------
// C-vtable dialect stub

pub struct StubClapFactory {
    pub param_info_queries: Arc<AtomicU32>,
}

impl Default for StubClapFactory {
    fn default() -> Self {
        Self { param_info_queries: Arc::new(AtomicU32::new(0)) }
    }
}

impl ClapPluginFactory for StubClapFactory {
    fn create_instance(&mut self, host: Arc<dyn ClapHost>) -> Option<Box<dyn ClapPlugin>> {
        Some(Box::new(StubClapPlugin {
            host,
            param_info_queries: Arc::clone(&self.param_info_queries),
        }))
    }
}

/// Copies inputs to outputs and reports a constant mask bit for every output
/// channel whose input was entirely silent.
pub struct StubClapPlugin {
    host: Arc<dyn ClapHost>,
    param_info_queries: Arc<AtomicU32>,
}

impl ClapPlugin for StubClapPlugin {
    fn init(&mut self) -> bool {
        true
    }

    fn supported_extensions(&self) -> SupportedExtensions {
        SupportedExtensions::AUDIO_PORTS | SupportedExtensions::PARAMS
    }

    fn audio_ports(&self) -> Vec<ClapAudioPortInfo> {
        vec![
            ClapAudioPortInfo {
                id: 0,
                name: String::from("main in"),
                num_channels: 2,
                is_input: true,
            },
            ClapAudioPortInfo {
                id: 0,
                name: String::from("main out"),
                num_channels: 2,
                is_input: false,
            },
        ]
    }

    fn param_infos(&self) -> Vec<ClapParamInfo> {
        self.param_info_queries.fetch_add(1, Ordering::SeqCst);

        vec![ClapParamInfo {
            param_id: 0,
            name: String::from("Gain"),
            module: String::new(),
            min_value: 0.0,
            max_value: 1.0,
            default_value: 0.5,
            flags: 0,
        }]
    }

    fn param_value(&self, param_id: u32) -> Option<f64> {
        (param_id == 0).then_some(0.5)
    }

    fn params_flush(
        &mut self,
        _input_events: &[plugbridge_core::messages::clap::ClapEvent],
    ) -> plugbridge_core::messages::clap::ClapEventList {
        // The flush invalidates our parameter list, which a real plugin
        // announces through a rescan. The host may immediately re-query.
        self.host.params_rescan(1);

        plugbridge_core::messages::clap::ClapEventList::new()
    }

    fn save_state(&mut self) -> Option<Vec<u8>> {
        // Never reached: the state extension is not advertised, so the
        // native proxy rejects the query locally
        Some(b"should not cross the boundary".to_vec())
    }

    fn activate(
        &mut self,
        _sample_rate: f64,
        _min_block_size: u32,
        _max_block_size: u32,
    ) -> Result<u32, String> {
        Ok(0)
    }

    fn deactivate(&mut self) {}

    fn process(
        &mut self,
        audio: &ProcessAudio<'_>,
        _request: &ClapProcessRequest,
    ) -> ClapProcessResult {
        let mut output_constant_masks = ConstantMasks::new();

        for bus in 0..audio.num_output_buses() {
            let mut constant_mask = 0u64;

            for channel in 0..audio.num_output_channels(bus) {
                let input = audio.input_channel(bus, channel);
                let output = audio.output_channel(bus, channel);
                output.copy_from_slice(input);

                if input.iter().all(|sample| *sample == 0.0) {
                    constant_mask |= 1 << channel;
                }
            }

            output_constant_masks.push(constant_mask);
        }

        ClapProcessResult {
            status: ClapProcessStatus::Continue,
            output_events: plugbridge_core::messages::clap::ClapEventList::new(),
            output_constant_masks,
        }
    }
}
