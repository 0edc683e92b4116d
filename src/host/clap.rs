//! The foreign-side bridge for the C-vtable dialect.
//!
//! Hosts any number of plugin instances created through the loaded library's
//! factory. Main-thread calls arrive on the control channel and are executed
//! on the main context; every instance gets a dedicated audio thread that
//! blocks on its own audio channel and calls straight into the plugin.

use atomic_refcell::AtomicRefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use plugbridge_core::messages::clap::{
    ActivateResponse, ClapAudioRequest, ClapControlRequest, ClapProcessRequest,
    ClapProcessResponse, CreateInstanceResponse, InitInstanceResponse, LatencyChanged,
    LogMessage, ParamsRescan, RequestCallback, RequestProcess, RequestRestart,
    SupportedExtensions,
};
use plugbridge_core::messages::WantsConfiguration;
use plugbridge_core::transport::message::Reply;
use plugbridge_core::transport::sets::ClapSockets;
use plugbridge_core::transport::shm::{AudioShmBuffer, AudioShmBufferConfig};
use plugbridge_core::utils::{set_realtime_priority, ScopedFlushToZero};
use plugbridge_core::{
    Configuration, InstanceId, InstanceRegistry, MutualRecursionHelper, TransportError,
};

use super::main_context::MainContextHandle;
use super::plugin_api::{ClapHost, ClapPlugin, ClapPluginFactory, ProcessAudio};
use super::{shm_buffer_name, spawn_parent_watchdog, HostBridge};

/// One hosted plugin instance on the foreign side.
struct ClapInstance {
    instance_id: InstanceId,
    /// Main-thread API goes through here. The audio thread takes the same
    /// lock for its calls; the protocol never overlaps them with main-thread
    /// calls that would block it.
    plugin: Mutex<Box<dyn ClapPlugin>>,

    /// The shared audio buffer, owned by this side. Only the instance's
    /// audio thread touches it during processing; activation swaps it out
    /// while the audio thread is guaranteed idle.
    process_buffers: AtomicRefCell<Option<AudioShmBuffer>>,

    /// True from creation until init finished, and again while the instance
    /// is being destroyed. The event loop stays out of the plugin during
    /// those windows.
    initializing: AtomicBool,

    audio_thread: Mutex<Option<JoinHandle<()>>>,
}

pub struct ClapBridge {
    weak_self: Weak<ClapBridge>,

    #[allow(dead_code)]
    config: Configuration,
    sockets: Arc<ClapSockets>,

    factory: Mutex<Box<dyn ClapPluginFactory>>,
    _library: Option<libloading::Library>,

    instances: Arc<InstanceRegistry<Arc<ClapInstance>>>,

    main_context: MainContextHandle,
    mutual_recursion: Arc<MutualRecursionHelper>,
}

impl ClapBridge {
    pub fn new(
        main_context: MainContextHandle,
        factory: Box<dyn ClapPluginFactory>,
        library: Option<libloading::Library>,
        endpoint_base_dir: &std::path::Path,
        parent_pid: u32,
    ) -> Result<Arc<Self>, TransportError> {
        let sockets = Arc::new(ClapSockets::new(endpoint_base_dir, false)?);
        sockets.connect()?;

        // The handshake is the first message on the callback channel
        let config: Configuration =
            sockets.plugin_host_callback.send_message(WantsConfiguration {
                host_version: plugbridge_core::build_version().to_owned(),
            })?;

        main_context.update_timer_interval(config.event_loop_interval());

        let bridge = Arc::new_cyclic(|weak_self: &Weak<ClapBridge>| Self {
            weak_self: weak_self.clone(),
            config,
            sockets: Arc::clone(&sockets),
            factory: Mutex::new(factory),
            _library: library,
            instances: Arc::new(InstanceRegistry::new()),
            main_context,
            mutual_recursion: Arc::new(MutualRecursionHelper::new()),
        });

        {
            let sockets = Arc::clone(&sockets);
            spawn_parent_watchdog(parent_pid, move || sockets.close());
        }

        Ok(bridge)
    }

    /// Run `f` where main-thread work belongs: on the thread with one of our
    /// own in-flight callbacks when there is one, on the main context
    /// otherwise.
    fn on_main_thread<R, F>(&self, f: F) -> Option<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        match self.mutual_recursion.handle_if_active(f) {
            Ok(result) => Some(result),
            Err(f) => self.main_context.run_in_context(f).wait(),
        }
    }

    fn create_instance(&self) -> CreateInstanceResponse {
        let bridge = match self.weak_self.upgrade() {
            Some(bridge) => bridge,
            None => return CreateInstanceResponse { instance_id: None },
        };

        let created = self.on_main_thread(move || {
            let instance_id = bridge.instances.generate_instance_id();

            let host: Arc<dyn ClapHost> =
                Arc::new(ClapInstanceHost { bridge: bridge.weak_self.clone(), instance_id });

            let plugin = {
                let mut factory = bridge.factory.lock().unwrap_or_else(|e| e.into_inner());
                factory.create_instance(host)
            };
            let plugin = match plugin {
                Some(plugin) => plugin,
                None => return None,
            };

            let instance = Arc::new(ClapInstance {
                instance_id,
                plugin: Mutex::new(plugin),
                process_buffers: AtomicRefCell::new(None),
                initializing: AtomicBool::new(true),
                audio_thread: Mutex::new(None),
            });
            bridge.instances.register_with_id(instance_id, Arc::clone(&instance));

            // Every instance gets a dedicated audio thread listening on its
            // own channel. Wait until it is actually listening before
            // answering, or the native side could connect into nothing.
            let (listening_tx, listening_rx) = crossbeam_channel::bounded(1);
            let audio_thread = {
                let bridge = Arc::clone(&bridge);
                let instance = Arc::clone(&instance);

                std::thread::Builder::new()
                    .name(format!("audio-{}", instance_id))
                    .spawn(move || {
                        let _ = thread_priority::set_current_thread_priority(
                            thread_priority::ThreadPriority::Max,
                        );

                        let result = bridge.sockets.audio_threads.add_and_listen(
                            instance_id,
                            move || {
                                let _ = listening_tx.send(());
                            },
                            |request, reply| handle_audio_request(&instance, request, reply),
                        );

                        if let Err(e) = result {
                            log::error!(
                                "The audio thread for instance {} failed: {}",
                                instance_id,
                                e
                            );
                        }
                    })
                    .expect("could not spawn an instance audio thread")
            };

            let _ = listening_rx.recv();
            *instance.audio_thread.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(audio_thread);

            Some(instance_id)
        });

        CreateInstanceResponse { instance_id: created.flatten() }
    }

    fn destroy_instance(&self, instance_id: InstanceId) {
        let instance = match self.instances.get(instance_id) {
            Some(instance) => Arc::clone(&instance),
            None => return,
        };

        // Terminate window: hold the event loop off the plugin while it goes
        // away
        instance.initializing.store(true, Ordering::SeqCst);

        // Closing the audio channel makes the audio thread's receive loop
        // exit so it can be joined
        self.sockets.audio_threads.remove(instance_id);
        if let Some(audio_thread) =
            instance.audio_thread.lock().unwrap_or_else(|e| e.into_inner()).take()
        {
            let _ = audio_thread.join();
        }

        if let Some(bridge) = self.weak_self.upgrade() {
            self.on_main_thread(move || {
                bridge.instances.unregister(instance_id);
            });
        }
    }

    fn with_instance<R>(
        &self,
        instance_id: InstanceId,
        f: impl FnOnce(&ClapInstance) -> R,
    ) -> Option<R> {
        self.instances.get(instance_id).map(|instance| f(&instance))
    }
}

impl HostBridge for ClapBridge {
    fn run(&self) {
        let bridge = match self.weak_self.upgrade() {
            Some(bridge) => bridge,
            None => return,
        };

        self.sockets.host_plugin_control.receive_messages(|request, reply| {
            handle_control_request(&bridge, request, reply)
        });
    }

    fn inhibits_event_loop(&self) -> bool {
        let mut inhibited = false;
        self.instances.for_each(|_, instance| {
            inhibited |= instance.initializing.load(Ordering::SeqCst);
        });

        inhibited
    }

    fn handle_events(&self) {
        // GUI embedding is not bridged; the pump tick itself is what plugins
        // with editors would hang their timers off
    }
}

fn handle_control_request(
    bridge: &Arc<ClapBridge>,
    request: ClapControlRequest,
    reply: Reply<'_>,
) -> Result<(), TransportError> {
    match request {
        ClapControlRequest::CreateInstance(_) => {
            let response = bridge.create_instance();
            reply.send(&response)
        }

        ClapControlRequest::InitInstance(request) => {
            let bridge_clone = Arc::clone(bridge);
            let response = bridge
                .on_main_thread(move || {
                    bridge_clone
                        .with_instance(request.instance_id, |instance| {
                            let success = {
                                let mut plugin =
                                    instance.plugin.lock().unwrap_or_else(|e| e.into_inner());
                                plugin.init()
                            };

                            let supported_extensions = if success {
                                let plugin =
                                    instance.plugin.lock().unwrap_or_else(|e| e.into_inner());
                                plugin.supported_extensions()
                            } else {
                                SupportedExtensions::empty()
                            };

                            // Init window over; let the event pump back in
                            instance.initializing.store(false, Ordering::SeqCst);

                            InitInstanceResponse { success, supported_extensions }
                        })
                        .unwrap_or(InitInstanceResponse {
                            success: false,
                            supported_extensions: SupportedExtensions::empty(),
                        })
                })
                .unwrap_or(InitInstanceResponse {
                    success: false,
                    supported_extensions: SupportedExtensions::empty(),
                });

            reply.send(&response)
        }

        ClapControlRequest::DestroyInstance(request) => {
            bridge.destroy_instance(request.instance_id);
            reply.send(&())
        }

        ClapControlRequest::Activate(request) => {
            let bridge_clone = Arc::clone(bridge);
            let response = bridge
                .on_main_thread(move || activate_instance(&bridge_clone, &request))
                .unwrap_or(ActivateResponse {
                    success: false,
                    shm_config: None,
                    latency_samples: 0,
                });

            reply.send(&response)
        }

        ClapControlRequest::Deactivate(request) => {
            let bridge_clone = Arc::clone(bridge);
            bridge.on_main_thread(move || {
                bridge_clone.with_instance(request.instance_id, |instance| {
                    let mut plugin = instance.plugin.lock().unwrap_or_else(|e| e.into_inner());
                    plugin.deactivate();
                });
            });

            reply.send(&())
        }

        ClapControlRequest::GetAudioPorts(request) => {
            let bridge_clone = Arc::clone(bridge);
            let ports = bridge
                .on_main_thread(move || {
                    bridge_clone
                        .with_instance(request.instance_id, |instance| {
                            instance.plugin.lock().unwrap_or_else(|e| e.into_inner()).audio_ports()
                        })
                        .unwrap_or_default()
                })
                .unwrap_or_default();

            reply.send(&ports)
        }

        ClapControlRequest::GetParamInfos(request) => {
            let bridge_clone = Arc::clone(bridge);
            let infos = bridge
                .on_main_thread(move || {
                    bridge_clone
                        .with_instance(request.instance_id, |instance| {
                            instance.plugin.lock().unwrap_or_else(|e| e.into_inner()).param_infos()
                        })
                        .unwrap_or_default()
                })
                .unwrap_or_default();

            reply.send(&infos)
        }

        ClapControlRequest::GetParamValue(request) => {
            let bridge_clone = Arc::clone(bridge);
            let value = bridge
                .on_main_thread(move || {
                    bridge_clone
                        .with_instance(request.instance_id, |instance| {
                            instance
                                .plugin
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .param_value(request.param_id)
                        })
                        .flatten()
                })
                .flatten();

            reply.send(&value)
        }

        ClapControlRequest::ParamsFlush(request) => {
            let bridge_clone = Arc::clone(bridge);
            let output = bridge
                .on_main_thread(move || {
                    bridge_clone
                        .with_instance(request.instance_id, |instance| {
                            instance
                                .plugin
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .params_flush(&request.input_events)
                        })
                        .unwrap_or_default()
                })
                .unwrap_or_default();

            reply.send(&output)
        }

        ClapControlRequest::SaveState(request) => {
            let bridge_clone = Arc::clone(bridge);
            let chunk = bridge
                .on_main_thread(move || {
                    bridge_clone
                        .with_instance(request.instance_id, |instance| {
                            instance.plugin.lock().unwrap_or_else(|e| e.into_inner()).save_state()
                        })
                        .flatten()
                })
                .flatten();

            reply.send(&chunk)
        }

        ClapControlRequest::LoadState(request) => {
            let bridge_clone = Arc::clone(bridge);
            let success = bridge
                .on_main_thread(move || {
                    bridge_clone
                        .with_instance(request.instance_id, |instance| {
                            instance
                                .plugin
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .load_state(&request.chunk)
                        })
                        .unwrap_or(false)
                })
                .unwrap_or(false);

            reply.send(&success)
        }

        ClapControlRequest::OnMainThread(request) => {
            let bridge_clone = Arc::clone(bridge);
            bridge.on_main_thread(move || {
                bridge_clone.with_instance(request.instance_id, |instance| {
                    instance.plugin.lock().unwrap_or_else(|e| e.into_inner()).on_main_thread();
                });
            });

            reply.send(&())
        }
    }
}

fn activate_instance(
    bridge: &Arc<ClapBridge>,
    request: &plugbridge_core::messages::clap::Activate,
) -> ActivateResponse {
    let failed =
        ActivateResponse { success: false, shm_config: None, latency_samples: 0 };

    let instance = match bridge.instances.get(request.instance_id) {
        Some(instance) => Arc::clone(&instance),
        None => return failed,
    };

    let (latency_samples, ports) = {
        let mut plugin = instance.plugin.lock().unwrap_or_else(|e| e.into_inner());

        let latency = match plugin.activate(
            request.sample_rate,
            request.min_block_size,
            request.max_block_size,
        ) {
            Ok(latency) => latency,
            Err(e) => {
                log::error!("Instance {} failed to activate: {}", request.instance_id, e);
                return failed;
            }
        };

        (latency, plugin.audio_ports())
    };

    let input_channels: Vec<u32> =
        ports.iter().filter(|port| port.is_input).map(|port| port.num_channels).collect();
    let output_channels: Vec<u32> =
        ports.iter().filter(|port| !port.is_input).map(|port| port.num_channels).collect();

    // Recompute the layout for this configuration, reusing the existing
    // mapping when the size comes out unchanged
    let mut process_buffers = instance.process_buffers.borrow_mut();
    let name = match process_buffers.as_ref() {
        Some(buffer) => buffer.config().name.clone(),
        None => shm_buffer_name(request.instance_id),
    };
    let shm_config = AudioShmBufferConfig::new(
        name,
        &input_channels,
        &output_channels,
        request.max_block_size,
        request.double_precision,
    );

    let result = match process_buffers.as_mut() {
        Some(buffer) => buffer.resize(shm_config.clone()),
        None => AudioShmBuffer::create(shm_config.clone()).map(|buffer| {
            *process_buffers = Some(buffer);
        }),
    };

    if let Err(e) = result {
        log::error!(
            "Could not set up the shared audio buffers for instance {}: {}",
            request.instance_id,
            e
        );
        return failed;
    }

    ActivateResponse { success: true, shm_config: Some(shm_config), latency_samples }
}

fn handle_audio_request(
    instance: &Arc<ClapInstance>,
    request: ClapAudioRequest,
    reply: Reply<'_>,
) -> Result<(), TransportError> {
    match request {
        ClapAudioRequest::StartProcessing(_) => {
            let started = {
                let mut plugin = instance.plugin.lock().unwrap_or_else(|e| e.into_inner());
                plugin.start_processing()
            };
            reply.send(&started)
        }
        ClapAudioRequest::StopProcessing(_) => {
            instance.plugin.lock().unwrap_or_else(|e| e.into_inner()).stop_processing();
            reply.send(&())
        }
        ClapAudioRequest::ResetInstance(_) => {
            instance.plugin.lock().unwrap_or_else(|e| e.into_inner()).reset();
            reply.send(&())
        }
        ClapAudioRequest::Process(request) => {
            let response = process_block(instance, &request);
            reply.send(&response)
        }
    }
}

fn process_block(instance: &Arc<ClapInstance>, request: &ClapProcessRequest) -> ClapProcessResponse {
    if let Some(priority) = request.new_realtime_priority {
        set_realtime_priority(true, priority);
    }

    let process_buffers = instance.process_buffers.borrow();
    let buffer = match process_buffers.as_ref() {
        Some(buffer) => buffer,
        None => {
            log::error!(
                "Instance {} got a process request before activation",
                request.instance_id
            );
            return ClapProcessResponse::default();
        }
    };

    // Denormals flush to zero for the duration of the plugin call only
    let _ftz_guard = ScopedFlushToZero::new();

    let audio = ProcessAudio::new(buffer, request.frames as usize);
    let result = {
        let mut plugin = instance.plugin.lock().unwrap_or_else(|e| e.into_inner());
        plugin.process(&audio, request)
    };

    ClapProcessResponse {
        status: result.status,
        output_events: result.output_events,
        output_constant_masks: result.output_constant_masks,
    }
}

/// The host object handed to every plugin instance. Callbacks that the
/// native side may answer by immediately re-entering us (a parameter rescan
/// triggering a fresh info query) are forked so the re-entrant request can
/// be serviced on this thread.
struct ClapInstanceHost {
    bridge: Weak<ClapBridge>,
    instance_id: InstanceId,
}

impl ClapInstanceHost {
    fn send_callback<T>(&self, request: T, mutually_recursive: bool)
    where
        T: plugbridge_core::transport::Request<Response = ()>
            + Into<plugbridge_core::messages::clap::ClapCallbackRequest>
            + Send,
    {
        let bridge = match self.bridge.upgrade() {
            Some(bridge) => bridge,
            None => return,
        };

        let result = if mutually_recursive {
            bridge
                .mutual_recursion
                .fork(|| bridge.sockets.plugin_host_callback.send_message(request))
        } else {
            bridge.sockets.plugin_host_callback.send_message(request)
        };

        if let Err(e) = result {
            log::error!("Callback for instance {} failed: {}", self.instance_id, e);
        }
    }
}

impl ClapHost for ClapInstanceHost {
    fn request_restart(&self) {
        self.send_callback(RequestRestart { instance_id: self.instance_id }, false);
    }

    fn request_process(&self) {
        self.send_callback(RequestProcess { instance_id: self.instance_id }, false);
    }

    fn request_callback(&self) {
        self.send_callback(RequestCallback { instance_id: self.instance_id }, false);
    }

    fn params_rescan(&self, flags: u32) {
        self.send_callback(ParamsRescan { instance_id: self.instance_id, flags }, true);
    }

    fn latency_changed(&self) {
        self.send_callback(LatencyChanged { instance_id: self.instance_id }, true);
    }

    fn log(&self, severity: u32, message: &str) {
        self.send_callback(
            LogMessage {
                instance_id: self.instance_id,
                severity,
                message: message.to_owned(),
            },
            false,
        );
    }
}
