//! The foreign-side bridge for the COM-style multi-interface dialect.
//!
//! The combined control channel multiplexes every non-audio interface
//! method, keyed by instance id. Host callback objects (component handler,
//! plug frame, connection points) are mirrored here as proxies that forward
//! each call over the callback channel; the plugin never learns that its
//! host lives in another process.

use atomic_refcell::AtomicRefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use plugbridge_core::messages::vst3::{
    BeginEdit, CreateInstanceResponse, EndEdit, NotifyConnectionCallback, PerformEdit,
    RequestResize, RestartComponent, SetActiveResponse, Vst3AudioRequest, Vst3ControlRequest,
    Vst3ProcessRequest, Vst3ProcessResponse, Vst3Result,
};
use plugbridge_core::messages::WantsConfiguration;
use plugbridge_core::transport::message::Reply;
use plugbridge_core::transport::sets::Vst3Sockets;
use plugbridge_core::transport::shm::{AudioShmBuffer, AudioShmBufferConfig};
use plugbridge_core::utils::{set_realtime_priority, ScopedFlushToZero};
use plugbridge_core::{
    Configuration, InstanceId, InstanceRegistry, MutualRecursionHelper, TransportError,
};

use super::main_context::MainContextHandle;
use super::plugin_api::{ProcessAudio, Vst3Host, Vst3Plugin, Vst3PluginFactory};
use super::{shm_buffer_name, spawn_parent_watchdog, HostBridge};

struct Vst3Instance {
    instance_id: InstanceId,
    plugin: Mutex<Box<dyn Vst3Plugin>>,

    process_buffers: AtomicRefCell<Option<AudioShmBuffer>>,

    /// The instance this one's connection point is connected to, if any.
    connected_to: Mutex<Option<InstanceId>>,

    initializing: AtomicBool,
    audio_thread: Mutex<Option<JoinHandle<()>>>,
}

pub struct Vst3Bridge {
    weak_self: Weak<Vst3Bridge>,

    #[allow(dead_code)]
    config: Configuration,
    sockets: Arc<Vst3Sockets>,

    factory: Mutex<Box<dyn Vst3PluginFactory>>,
    _library: Option<libloading::Library>,

    instances: Arc<InstanceRegistry<Arc<Vst3Instance>>>,

    main_context: MainContextHandle,
    mutual_recursion: Arc<MutualRecursionHelper>,
}

impl Vst3Bridge {
    pub fn new(
        main_context: MainContextHandle,
        factory: Box<dyn Vst3PluginFactory>,
        library: Option<libloading::Library>,
        endpoint_base_dir: &std::path::Path,
        parent_pid: u32,
    ) -> Result<Arc<Self>, TransportError> {
        let sockets = Arc::new(Vst3Sockets::new(endpoint_base_dir, false)?);
        sockets.connect()?;

        let config: Configuration =
            sockets.plugin_host_callback.send_message(WantsConfiguration {
                host_version: plugbridge_core::build_version().to_owned(),
            })?;

        main_context.update_timer_interval(config.event_loop_interval());

        let bridge = Arc::new_cyclic(|weak_self: &Weak<Vst3Bridge>| Self {
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
            None => {
                return CreateInstanceResponse {
                    result: Vst3Result::INTERNAL_ERROR,
                    instance_id: 0,
                }
            }
        };

        let created = self.on_main_thread(move || {
            let instance_id = bridge.instances.generate_instance_id();

            let plugin = {
                let mut factory = bridge.factory.lock().unwrap_or_else(|e| e.into_inner());
                factory.create_instance()
            };
            let plugin = match plugin {
                Some(plugin) => plugin,
                None => return None,
            };

            let instance = Arc::new(Vst3Instance {
                instance_id,
                plugin: Mutex::new(plugin),
                process_buffers: AtomicRefCell::new(None),
                connected_to: Mutex::new(None),
                initializing: AtomicBool::new(true),
                audio_thread: Mutex::new(None),
            });
            bridge.instances.register_with_id(instance_id, Arc::clone(&instance));

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

        match created.flatten() {
            Some(instance_id) => CreateInstanceResponse { result: Vst3Result::OK, instance_id },
            None => CreateInstanceResponse { result: Vst3Result::INTERNAL_ERROR, instance_id: 0 },
        }
    }

    fn destroy_instance(&self, instance_id: InstanceId) {
        let instance = match self.instances.get(instance_id) {
            Some(instance) => Arc::clone(&instance),
            None => return,
        };

        instance.initializing.store(true, Ordering::SeqCst);

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

    /// Run a main-thread plugin method for one instance and hand back its
    /// result, with a fallback for ids that already went away (or a main
    /// context that shut down mid-request).
    fn with_plugin<R, F>(&self, instance_id: InstanceId, fallback: R, f: F) -> R
    where
        R: Send + Clone + 'static,
        F: FnOnce(&mut dyn Vst3Plugin) -> R + Send + 'static,
    {
        let bridge = match self.weak_self.upgrade() {
            Some(bridge) => bridge,
            None => return fallback,
        };
        let missing_fallback = fallback.clone();

        self.on_main_thread(move || match bridge.instances.get(instance_id) {
            Some(instance) => {
                let mut plugin = instance.plugin.lock().unwrap_or_else(|e| e.into_inner());
                f(plugin.as_mut())
            }
            None => {
                log::debug!("Request for unknown instance {}", instance_id);
                missing_fallback
            }
        })
        .unwrap_or(fallback)
    }
}

impl HostBridge for Vst3Bridge {
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
}

fn handle_control_request(
    bridge: &Arc<Vst3Bridge>,
    request: Vst3ControlRequest,
    reply: Reply<'_>,
) -> Result<(), TransportError> {
    use Vst3ControlRequest as Req;

    match request {
        Req::CreateInstance(_) => {
            let response = bridge.create_instance();
            reply.send(&response)
        }

        Req::Initialize(request) => {
            let host: Option<Arc<dyn Vst3Host>> = if request.has_host_context {
                Some(Arc::new(Vst3InstanceHost {
                    bridge: bridge.weak_self.clone(),
                    instance_id: request.instance_id,
                }))
            } else {
                None
            };

            let instance_id = request.instance_id;
            let bridge_clone = Arc::clone(bridge);
            let result =
                bridge.with_plugin(instance_id, Vst3Result::INTERNAL_ERROR, move |plugin| {
                    let result = plugin.initialize(host);

                    // The init window ends here regardless of the outcome
                    if let Some(instance) = bridge_clone.instances.get(instance_id) {
                        instance.initializing.store(false, Ordering::SeqCst);
                    }

                    result
                });

            reply.send(&result)
        }

        Req::Terminate(request) => {
            let instance_id = request.instance_id;
            let bridge_clone = Arc::clone(bridge);
            let result =
                bridge.with_plugin(instance_id, Vst3Result::INTERNAL_ERROR, move |plugin| {
                    if let Some(instance) = bridge_clone.instances.get(instance_id) {
                        instance.initializing.store(true, Ordering::SeqCst);
                    }
                    let result = plugin.terminate();
                    if let Some(instance) = bridge_clone.instances.get(instance_id) {
                        instance.initializing.store(false, Ordering::SeqCst);
                    }

                    result
                });

            reply.send(&result)
        }

        Req::Destroy(request) => {
            bridge.destroy_instance(request.instance_id);
            reply.send(&())
        }

        Req::SetComponentHandler(request) => {
            let handler: Option<Arc<dyn Vst3Host>> = if request.handler_present {
                Some(Arc::new(Vst3InstanceHost {
                    bridge: bridge.weak_self.clone(),
                    instance_id: request.instance_id,
                }))
            } else {
                None
            };

            let result = bridge.with_plugin(
                request.instance_id,
                Vst3Result::INTERNAL_ERROR,
                move |plugin| plugin.set_component_handler(handler),
            );

            reply.send(&result)
        }

        Req::ConnectInstances(request) => {
            let result = match bridge.instances.get(request.instance_id) {
                Some(instance) => {
                    *instance.connected_to.lock().unwrap_or_else(|e| e.into_inner()) =
                        Some(request.other_instance_id);
                    Vst3Result::OK
                }
                None => Vst3Result::INVALID_ARGUMENT,
            };

            reply.send(&result)
        }

        Req::NotifyConnection(request) => {
            // Forward to the connected peer instance, falling back to the
            // addressed instance itself
            let target = bridge
                .instances
                .get(request.instance_id)
                .and_then(|instance| {
                    *instance.connected_to.lock().unwrap_or_else(|e| e.into_inner())
                })
                .unwrap_or(request.instance_id);

            let result = bridge.with_plugin(
                target,
                Vst3Result::INVALID_ARGUMENT,
                move |plugin| plugin.notify(&request.message_id, &request.payload),
            );

            reply.send(&result)
        }

        Req::GetBusInfos(request) => {
            let bridge_clone = Arc::clone(bridge);
            let instance_id = request.instance_id;
            let infos = bridge
                .on_main_thread(move || {
                    bridge_clone
                        .instances
                        .get(instance_id)
                        .map(|instance| {
                            instance.plugin.lock().unwrap_or_else(|e| e.into_inner()).bus_infos()
                        })
                        .unwrap_or_default()
                })
                .unwrap_or_default();

            reply.send(&infos)
        }

        Req::SetActive(request) => {
            let bridge_clone = Arc::clone(bridge);
            let response = bridge
                .on_main_thread(move || set_active(&bridge_clone, &request))
                .unwrap_or(SetActiveResponse {
                    result: Vst3Result::INTERNAL_ERROR,
                    shm_config: None,
                });

            reply.send(&response)
        }

        Req::GetParameterCount(request) => {
            let bridge_clone = Arc::clone(bridge);
            let instance_id = request.instance_id;
            let count = bridge
                .on_main_thread(move || {
                    bridge_clone
                        .instances
                        .get(instance_id)
                        .map(|instance| {
                            instance
                                .plugin
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .parameter_count()
                        })
                        .unwrap_or(0)
                })
                .unwrap_or(0);

            reply.send(&count)
        }

        Req::GetParameterInfo(request) => {
            let bridge_clone = Arc::clone(bridge);
            let info = bridge
                .on_main_thread(move || {
                    bridge_clone.instances.get(request.instance_id).and_then(|instance| {
                        instance
                            .plugin
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .parameter_infos()
                            .into_iter()
                            .nth(request.index as usize)
                    })
                })
                .flatten();

            reply.send(&info)
        }

        Req::GetAllParameterInfos(request) => {
            let bridge_clone = Arc::clone(bridge);
            let instance_id = request.instance_id;
            let infos = bridge
                .on_main_thread(move || {
                    bridge_clone
                        .instances
                        .get(instance_id)
                        .map(|instance| {
                            instance
                                .plugin
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .parameter_infos()
                        })
                        .unwrap_or_default()
                })
                .unwrap_or_default();

            reply.send(&infos)
        }

        Req::GetParamNormalized(request) => {
            let bridge_clone = Arc::clone(bridge);
            let value = bridge
                .on_main_thread(move || {
                    bridge_clone
                        .instances
                        .get(request.instance_id)
                        .map(|instance| {
                            instance
                                .plugin
                                .lock()
                                .unwrap_or_else(|e| e.into_inner())
                                .get_param_normalized(request.param_id)
                        })
                        .unwrap_or(0.0)
                })
                .unwrap_or(0.0);

            reply.send(&value)
        }

        Req::SetParamNormalized(request) => {
            let result = bridge.with_plugin(
                request.instance_id,
                Vst3Result::INVALID_ARGUMENT,
                move |plugin| plugin.set_param_normalized(request.param_id, request.value),
            );

            reply.send(&result)
        }

        Req::GetState(request) => {
            let bridge_clone = Arc::clone(bridge);
            let chunk = bridge
                .on_main_thread(move || {
                    bridge_clone.instances.get(request.instance_id).and_then(|instance| {
                        instance.plugin.lock().unwrap_or_else(|e| e.into_inner()).get_state()
                    })
                })
                .flatten();

            reply.send(&chunk)
        }

        Req::SetState(request) => {
            let result = bridge.with_plugin(
                request.instance_id,
                Vst3Result::INVALID_ARGUMENT,
                move |plugin| plugin.set_state(&request.chunk),
            );

            reply.send(&result)
        }

        Req::CreateView(request) => {
            let result = bridge.with_plugin(
                request.instance_id,
                Vst3Result::INVALID_ARGUMENT,
                |plugin| plugin.create_view(),
            );
            reply.send(&result)
        }

        Req::AttachView(request) => {
            let result = bridge.with_plugin(
                request.instance_id,
                Vst3Result::INVALID_ARGUMENT,
                move |plugin| plugin.attach_view(request.parent_window),
            );
            reply.send(&result)
        }

        Req::RemoveView(request) => {
            let result = bridge.with_plugin(
                request.instance_id,
                Vst3Result::INVALID_ARGUMENT,
                |plugin| plugin.remove_view(),
            );
            reply.send(&result)
        }

        Req::ViewOnSize(request) => {
            let result = bridge.with_plugin(
                request.instance_id,
                Vst3Result::INVALID_ARGUMENT,
                move |plugin| plugin.view_on_size(request.width, request.height),
            );
            reply.send(&result)
        }

        Req::SetContentScaleFactor(request) => {
            let result = bridge.with_plugin(
                request.instance_id,
                Vst3Result::INVALID_ARGUMENT,
                move |plugin| plugin.set_content_scale_factor(request.factor),
            );
            reply.send(&result)
        }
    }
}

fn set_active(
    bridge: &Arc<Vst3Bridge>,
    request: &plugbridge_core::messages::vst3::SetActive,
) -> SetActiveResponse {
    let failed = SetActiveResponse { result: Vst3Result::INTERNAL_ERROR, shm_config: None };

    let instance = match bridge.instances.get(request.instance_id) {
        Some(instance) => Arc::clone(&instance),
        None => {
            return SetActiveResponse { result: Vst3Result::INVALID_ARGUMENT, shm_config: None }
        }
    };

    let (result, bus_infos) = {
        let mut plugin = instance.plugin.lock().unwrap_or_else(|e| e.into_inner());
        let result = plugin.set_active(request.active, request.setup.as_ref());
        let bus_infos = plugin.bus_infos();

        (result, bus_infos)
    };

    if !result.is_ok() || !request.active {
        return SetActiveResponse { result, shm_config: None };
    }

    let setup = match &request.setup {
        Some(setup) => setup,
        None => return SetActiveResponse { result, shm_config: None },
    };

    let input_channels: Vec<u32> =
        bus_infos.iter().filter(|bus| bus.is_input).map(|bus| bus.num_channels).collect();
    let output_channels: Vec<u32> =
        bus_infos.iter().filter(|bus| !bus.is_input).map(|bus| bus.num_channels).collect();

    let mut process_buffers = instance.process_buffers.borrow_mut();
    let name = match process_buffers.as_ref() {
        Some(buffer) => buffer.config().name.clone(),
        None => shm_buffer_name(request.instance_id),
    };
    let shm_config = AudioShmBufferConfig::new(
        name,
        &input_channels,
        &output_channels,
        setup.max_block_size,
        setup.double_precision,
    );

    let mapped = match process_buffers.as_mut() {
        Some(buffer) => buffer.resize(shm_config.clone()),
        None => AudioShmBuffer::create(shm_config.clone()).map(|buffer| {
            *process_buffers = Some(buffer);
        }),
    };

    if let Err(e) = mapped {
        log::error!(
            "Could not set up the shared audio buffers for instance {}: {}",
            request.instance_id,
            e
        );
        return failed;
    }

    SetActiveResponse { result, shm_config: Some(shm_config) }
}

fn handle_audio_request(
    instance: &Arc<Vst3Instance>,
    request: Vst3AudioRequest,
    reply: Reply<'_>,
) -> Result<(), TransportError> {
    match request {
        Vst3AudioRequest::SetProcessing(request) => {
            let result = {
                let mut plugin = instance.plugin.lock().unwrap_or_else(|e| e.into_inner());
                plugin.set_processing(request.processing)
            };
            reply.send(&result)
        }
        Vst3AudioRequest::Process(request) => {
            let response = process_block(instance, &request);
            reply.send(&response)
        }
    }
}

fn process_block(instance: &Arc<Vst3Instance>, request: &Vst3ProcessRequest) -> Vst3ProcessResponse {
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
            return Vst3ProcessResponse {
                result: Vst3Result::INVALID_STATE,
                ..Vst3ProcessResponse::default()
            };
        }
    };

    let _ftz_guard = ScopedFlushToZero::new();

    let audio = ProcessAudio::new(buffer, request.frames as usize);
    let mut plugin = instance.plugin.lock().unwrap_or_else(|e| e.into_inner());

    plugin.process(&audio, request)
}

/// The proxy for the native host's callback objects. Restart notifications
/// are forked because the native side commonly re-enters with parameter or
/// latency queries before answering.
struct Vst3InstanceHost {
    bridge: Weak<Vst3Bridge>,
    instance_id: InstanceId,
}

impl Vst3InstanceHost {
    fn send<T>(&self, request: T, mutually_recursive: bool) -> Vst3Result
    where
        T: plugbridge_core::transport::Request<Response = Vst3Result>
            + Into<plugbridge_core::messages::vst3::Vst3CallbackRequest>
            + Send,
    {
        let bridge = match self.bridge.upgrade() {
            Some(bridge) => bridge,
            None => return Vst3Result::INTERNAL_ERROR,
        };

        let result = if mutually_recursive {
            bridge.mutual_recursion.fork(|| bridge.sockets.plugin_host_callback.send_message(request))
        } else {
            bridge.sockets.plugin_host_callback.send_message(request)
        };

        match result {
            Ok(result) => result,
            Err(e) => {
                log::error!("Callback for instance {} failed: {}", self.instance_id, e);
                Vst3Result::INTERNAL_ERROR
            }
        }
    }
}

impl Vst3Host for Vst3InstanceHost {
    fn begin_edit(&self, param_id: u32) -> Vst3Result {
        self.send(BeginEdit { instance_id: self.instance_id, param_id }, false)
    }

    fn perform_edit(&self, param_id: u32, value_normalized: f64) -> Vst3Result {
        self.send(
            PerformEdit { instance_id: self.instance_id, param_id, value_normalized },
            false,
        )
    }

    fn end_edit(&self, param_id: u32) -> Vst3Result {
        self.send(EndEdit { instance_id: self.instance_id, param_id }, false)
    }

    fn restart_component(&self, flags: u32) -> Vst3Result {
        self.send(RestartComponent { instance_id: self.instance_id, flags }, true)
    }

    fn request_resize(&self, width: u32, height: u32) -> Vst3Result {
        self.send(RequestResize { instance_id: self.instance_id, width, height }, false)
    }

    fn notify(&self, message_id: &str, payload: &[u8]) -> Vst3Result {
        self.send(
            NotifyConnectionCallback {
                instance_id: self.instance_id,
                message_id: message_id.to_owned(),
                payload: payload.to_owned(),
            },
            false,
        )
    }
}
