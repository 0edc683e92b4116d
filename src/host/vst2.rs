//! The foreign-side bridge for the simple C callback dialect.
//!
//! Hosts exactly one loaded plugin. Dispatcher calls come in on the dispatch
//! channel and are executed on the main context (or, when they arrive while
//! one of our own host callbacks is in flight, on the thread that sent that
//! callback); parameters and processing each have a dedicated handler
//! thread.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use smallvec::SmallVec;

use plugbridge_core::messages::vst2::{
    Vst2Callback, Vst2ControlMessage, Vst2DispatchRequest, Vst2Event, Vst2EventResult,
    Vst2ParameterRequest, Vst2ParameterResponse, Vst2Payload, Vst2ProcessRequest,
    Vst2ProcessResponse, Vst2ResultPayload, HOST_OPCODE_GET_CURRENT_PROCESS_LEVEL,
    HOST_OPCODE_GET_TIME, HOST_OPCODE_IO_CHANGED, HOST_OPCODE_SIZE_WINDOW, OPCODE_CLOSE,
    OPCODE_EDIT_CLOSE, OPCODE_EDIT_IDLE, OPCODE_EDIT_OPEN, OPCODE_MAINS_CHANGED, OPCODE_OPEN,
    OPCODE_SET_BLOCK_SIZE, OPCODE_SET_PROCESS_PRECISION,
};
use plugbridge_core::messages::{ProcessLevel, TimeInfo, WantsConfiguration};
use plugbridge_core::transport::sets::Vst2Sockets;
use plugbridge_core::transport::shm::{AudioShmBuffer, AudioShmBufferConfig};
use plugbridge_core::utils::{set_realtime_priority, ScopedFlushToZero, ScopedValueCache};
use plugbridge_core::{Configuration, MutualRecursionHelper, ShmError, TransportError};

use super::main_context::MainContextHandle;
use super::plugin_api::{Vst2HostCallback, Vst2Plugin};
use super::{shm_buffer_name, spawn_parent_watchdog, HostBridge};

/// Host callbacks the plugin makes that the native side answers on the
/// thread whose dispatcher call they interrupt. These are sent through the
/// mutual-recursion helper so that a dispatcher call arriving before the
/// response can be serviced on this thread.
const MUTUALLY_RECURSIVE_CALLBACK_OPCODES: &[i32] =
    &[HOST_OPCODE_IO_CHANGED, HOST_OPCODE_SIZE_WINDOW];

/// Some hosts never call the block-size setup before activating; fall back
/// to something workable instead of a zero-sized buffer.
const DEFAULT_MAX_BLOCK_SIZE: u32 = 8192;

pub struct Vst2Bridge {
    /// Set during construction so `run()` can hand `Arc` clones to the main
    /// context.
    weak_self: Weak<Vst2Bridge>,

    #[allow(dead_code)]
    config: Configuration,
    sockets: Arc<Vst2Sockets>,

    plugin: Mutex<Box<dyn Vst2Plugin>>,
    /// Keeps the plugin's code mapped for as long as the plugin object
    /// lives. `None` for injected (in-process) plugins.
    _library: Option<libloading::Library>,

    main_context: MainContextHandle,
    mutual_recursion: Arc<MutualRecursionHelper>,

    process_buffers: Mutex<Option<AudioShmBuffer>>,
    max_block_size: AtomicU32,
    double_precision: AtomicBool,

    /// Transport info prefetched for the current processing call, so the
    /// plugin's mid-block time queries never cross the boundary.
    time_info_cache: ScopedValueCache<TimeInfo>,
    process_level_cache: ScopedValueCache<ProcessLevel>,

    /// False until the open call completed. The event loop stays inhibited
    /// until then; some plugins crash when the pump reaches them mid-init.
    is_initialized: AtomicBool,
    editor_open: AtomicBool,

    parameters_handler: Mutex<Option<JoinHandle<()>>>,
    process_handler: Mutex<Option<JoinHandle<()>>>,
}

impl Vst2Bridge {
    /// Connect back to the native shim's endpoint directory and run the
    /// startup handshake. The plugin object has already been produced by the
    /// loader (or injected by a test).
    pub fn new(
        main_context: MainContextHandle,
        mut plugin: Box<dyn Vst2Plugin>,
        library: Option<libloading::Library>,
        endpoint_base_dir: &std::path::Path,
        parent_pid: u32,
    ) -> Result<Arc<Self>, TransportError> {
        let sockets = Arc::new(Vst2Sockets::new(endpoint_base_dir, false)?);
        sockets.connect()?;

        // First thing on the control channel: ask for the configuration
        let mut scratch = Vec::new();
        sockets.host_plugin_control.send(
            &WantsConfiguration { host_version: plugbridge_core::build_version().to_owned() },
            &mut scratch,
        )?;
        let config: Configuration = sockets.host_plugin_control.receive_single(&mut scratch)?;

        main_context.update_timer_interval(config.event_loop_interval());

        let bridge = Arc::new_cyclic(|bridge: &Weak<Vst2Bridge>| {
            plugin.set_host_callback(Arc::new(Vst2BridgeHost { bridge: bridge.clone() }));

            Self {
                weak_self: bridge.clone(),
                config,
                sockets: Arc::clone(&sockets),
                plugin: Mutex::new(plugin),
                _library: library,
                main_context,
                mutual_recursion: Arc::new(MutualRecursionHelper::new()),
                process_buffers: Mutex::new(None),
                max_block_size: AtomicU32::new(DEFAULT_MAX_BLOCK_SIZE),
                double_precision: AtomicBool::new(false),
                time_info_cache: ScopedValueCache::new(),
                process_level_cache: ScopedValueCache::new(),
                is_initialized: AtomicBool::new(false),
                editor_open: AtomicBool::new(false),
                parameters_handler: Mutex::new(None),
                process_handler: Mutex::new(None),
            }
        });

        // Push the loaded plugin's description so the native shim can mirror
        // it to its host
        let plugin_info = bridge.plugin.lock().unwrap_or_else(|e| e.into_inner()).info();
        sockets
            .host_plugin_control
            .send(&Vst2ControlMessage::PluginLoaded(plugin_info), &mut scratch)?;

        bridge.spawn_parameters_handler();
        bridge.spawn_process_handler();

        {
            let sockets = Arc::clone(&sockets);
            spawn_parent_watchdog(parent_pid, move || sockets.close());
        }

        Ok(bridge)
    }

    fn spawn_parameters_handler(&self) {
        let bridge = match self.weak_self.upgrade() {
            Some(bridge) => bridge,
            None => return,
        };

        let handle = std::thread::Builder::new()
            .name(String::from("parameters"))
            .spawn(move || {
                bridge.sockets.host_plugin_parameters.receive_multi(
                    |request: Vst2ParameterRequest, scratch| {
                        let mut plugin =
                            bridge.plugin.lock().unwrap_or_else(|e| e.into_inner());

                        let response = match request {
                            Vst2ParameterRequest::Get { index } => Vst2ParameterResponse {
                                value: Some(plugin.get_parameter(index)),
                            },
                            Vst2ParameterRequest::Set { index, value } => {
                                plugin.set_parameter(index, value);
                                Vst2ParameterResponse { value: None }
                            }
                        };
                        drop(plugin);

                        bridge.sockets.host_plugin_parameters.send(&response, scratch)
                    },
                );
            })
            .expect("could not spawn the parameter handler thread");

        *self.parameters_handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn spawn_process_handler(&self) {
        let bridge = match self.weak_self.upgrade() {
            Some(bridge) => bridge,
            None => return,
        };

        let handle = std::thread::Builder::new()
            .name(String::from("audio-thread"))
            .spawn(move || {
                // The audio thread starts out boosted; the exact host
                // priority gets copied over periodically through the process
                // requests
                let _ = thread_priority::set_current_thread_priority(
                    thread_priority::ThreadPriority::Max,
                );

                bridge.sockets.host_plugin_process.receive_multi(
                    |request: Vst2ProcessRequest, scratch| {
                        let response = bridge.handle_process(&request);
                        bridge.sockets.host_plugin_process.send(&response, scratch)
                    },
                );
            })
            .expect("could not spawn the audio handler thread");

        *self.process_handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn handle_process(&self, request: &Vst2ProcessRequest) -> Vst2ProcessResponse {
        if let Some(priority) = request.new_realtime_priority {
            set_realtime_priority(true, priority);
        }

        // Prefetched context for the plugin's mid-block host callbacks
        let _time_info_guard = request.time_info.map(|info| self.time_info_cache.set(info));
        let _level_guard = self.process_level_cache.set(request.process_level);

        let process_buffers = self.process_buffers.lock().unwrap_or_else(|e| e.into_inner());
        let buffer = match process_buffers.as_ref() {
            Some(buffer) => buffer,
            None => {
                log::error!("Got a process request before the audio buffers were set up");
                return Vst2ProcessResponse::default();
            }
        };

        let frames = request.frames as usize;
        let num_inputs = buffer.config().input_offsets[0].len();
        let num_outputs = buffer.config().output_offsets[0].len();

        // Denormals become zeroes for the duration of the call, restoring
        // whatever mode was set before on every exit path
        let _ftz_guard = ScopedFlushToZero::new();

        let mut plugin = self.plugin.lock().unwrap_or_else(|e| e.into_inner());

        let output_events = {
            let inputs: SmallVec<[&[f32]; 8]> = (0..num_inputs)
                .map(|channel| unsafe { &buffer.input_channel::<f32>(0, channel)[..frames] })
                .collect();
            let mut outputs: SmallVec<[&mut [f32]; 8]> = (0..num_outputs)
                .map(|channel| unsafe { &mut buffer.output_channel::<f32>(0, channel)[..frames] })
                .collect();

            plugin.process_f32(&inputs, &mut outputs, frames)
        };

        Vst2ProcessResponse { output_events }
    }

    /// Lay out (or re-lay-out) the shared audio buffer for the plugin's
    /// current port configuration. The existing mapping is reused whenever
    /// the size comes out unchanged.
    fn setup_shared_audio_buffers(&self) -> Result<AudioShmBufferConfig, ShmError> {
        let info = self.plugin.lock().unwrap_or_else(|e| e.into_inner()).info();
        let max_block_size = self.max_block_size.load(Ordering::SeqCst);
        let double_precision = self.double_precision.load(Ordering::SeqCst);

        let mut process_buffers = self.process_buffers.lock().unwrap_or_else(|e| e.into_inner());

        let name = match process_buffers.as_ref() {
            Some(buffer) => buffer.config().name.clone(),
            None => shm_buffer_name(0),
        };
        let config = AudioShmBufferConfig::new(
            name,
            &[info.num_inputs as u32],
            &[info.num_outputs as u32],
            max_block_size,
            double_precision,
        );

        match process_buffers.as_mut() {
            Some(buffer) => buffer.resize(config.clone())?,
            None => *process_buffers = Some(AudioShmBuffer::create(config.clone())?),
        }

        Ok(config)
    }

    fn dispatch_to_plugin(&self, event: &Vst2Event) -> Vst2EventResult {
        match event.opcode {
            OPCODE_SET_BLOCK_SIZE => {
                self.max_block_size.store(event.value.max(1) as u32, Ordering::SeqCst);
            }
            OPCODE_SET_PROCESS_PRECISION => {
                self.double_precision.store(event.value != 0, Ordering::SeqCst);
            }
            OPCODE_EDIT_OPEN => {
                self.editor_open.store(true, Ordering::SeqCst);
            }
            OPCODE_EDIT_CLOSE => {
                self.editor_open.store(false, Ordering::SeqCst);
            }
            _ => (),
        }

        let mut result = {
            let mut plugin = self.plugin.lock().unwrap_or_else(|e| e.into_inner());
            plugin.dispatch(event)
        };

        match event.opcode {
            OPCODE_OPEN => {
                self.is_initialized.store(true, Ordering::SeqCst);
            }
            // Activation also sets up the audio buffers; the native side
            // asked for the layout through the payload marker
            OPCODE_MAINS_CHANGED
                if event.value != 0
                    && matches!(event.payload, Vst2Payload::WantsAudioShmBufferConfig) =>
            {
                match self.setup_shared_audio_buffers() {
                    Ok(shm_config) => {
                        result.payload = Vst2ResultPayload::AudioShmBufferConfig(shm_config);
                    }
                    Err(e) => {
                        log::error!("Could not set up the shared audio buffers: {}", e);
                    }
                }
            }
            _ => (),
        }

        result
    }

    /// Run a dispatcher call where it belongs: on the thread with our
    /// in-flight host callback when there is one (the mutually recursive
    /// case), on the main context otherwise.
    fn dispatch_on_proper_thread(&self, event: Vst2Event) -> Vst2EventResult {
        let no_result = Vst2EventResult {
            return_value: 0,
            payload: Vst2ResultPayload::None,
            value_payload: None,
        };

        match self.mutual_recursion.handle_if_active(|| self.dispatch_to_plugin(&event)) {
            Ok(result) => result,
            Err(deferred) => {
                drop(deferred);

                let bridge = match self.weak_self.upgrade() {
                    Some(bridge) => bridge,
                    None => return no_result.clone(),
                };

                self.main_context
                    .run_in_context(move || bridge.dispatch_to_plugin(&event))
                    .wait()
                    .unwrap_or(no_result)
            }
        }
    }
}

impl HostBridge for Vst2Bridge {
    /// Handle dispatcher calls until the native side closes the sockets
    /// (which happens when the plugin gets closed).
    fn run(&self) {
        let bridge = match self.weak_self.upgrade() {
            Some(bridge) => bridge,
            None => return,
        };

        self.sockets.host_plugin_dispatch.receive_messages(|request, reply| match request {
            Vst2DispatchRequest::Event(event) => {
                let opcode = event.opcode;

                let response = bridge.dispatch_on_proper_thread(event);
                reply.send(&response)?;

                // The close call tears the whole bridge down; replying
                // first lets the native side see the result before the
                // channels die
                if opcode == OPCODE_CLOSE {
                    bridge.sockets.close();
                }

                Ok(())
            }
        });
    }

    fn inhibits_event_loop(&self) -> bool {
        !self.is_initialized.load(Ordering::SeqCst)
    }

    /// Tick the editor while it's open.
    fn handle_events(&self) {
        if self.editor_open.load(Ordering::SeqCst) {
            let mut plugin = self.plugin.lock().unwrap_or_else(|e| e.into_inner());
            let _ = plugin.dispatch(&Vst2Event {
                opcode: OPCODE_EDIT_IDLE,
                index: 0,
                value: 0,
                option: 0.0,
                payload: Vst2Payload::None,
                value_payload: None,
            });
        }
    }
}

/// The host-callback object handed to the plugin: answers what it can from
/// the per-block caches and forwards the rest to the native side.
struct Vst2BridgeHost {
    bridge: Weak<Vst2Bridge>,
}

impl Vst2HostCallback for Vst2BridgeHost {
    fn host_callback(&self, event: &Vst2Event) -> Vst2EventResult {
        let no_result = Vst2EventResult {
            return_value: 0,
            payload: Vst2ResultPayload::None,
            value_payload: None,
        };

        let bridge = match self.bridge.upgrade() {
            Some(bridge) => bridge,
            None => return no_result,
        };

        // Mid-block queries are served from the prefetched caches; some
        // plugins ask for the time once per sample
        match event.opcode {
            HOST_OPCODE_GET_TIME => {
                if let Some(time_info) = bridge.time_info_cache.get() {
                    return Vst2EventResult {
                        return_value: 1,
                        payload: Vst2ResultPayload::TimeInfo(Some(time_info)),
                        value_payload: None,
                    };
                }
            }
            HOST_OPCODE_GET_CURRENT_PROCESS_LEVEL => {
                if let Some(level) = bridge.process_level_cache.get() {
                    return Vst2EventResult {
                        return_value: level as i64,
                        payload: Vst2ResultPayload::None,
                        value_payload: None,
                    };
                }
            }
            _ => (),
        }

        let send_callback =
            || bridge.sockets.plugin_host_callback.send_message(Vst2Callback(event.clone()));

        let result = if MUTUALLY_RECURSIVE_CALLBACK_OPCODES.contains(&event.opcode) {
            // The native side may re-enter with a dispatcher call that has
            // to run on this thread before the response arrives
            bridge.mutual_recursion.fork(send_callback)
        } else {
            send_callback()
        };

        match result {
            Ok(result) => result,
            Err(e) => {
                log::error!("Host callback failed: {}", e);
                no_result
            }
        }
    }
}
