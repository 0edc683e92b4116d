//! The native bridge for the COM-style multi-interface dialect.
//!
//! The host sees an object graph full of reference-counted interfaces; the
//! wire sees instance ids and one multiplexed control channel. A
//! [`Vst3PluginProxy`] stands in for one foreign instance, and the callback
//! objects the host hands us (component handler and friends) are kept as
//! `Arc`s on the proxy record, mirroring the dialect's refcounting: the
//! foreign side's proxy for them lives exactly as long as our clone does.

use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use plugbridge_core::messages::vst3::{
    AttachView, ConnectInstances, CreateInstance, CreateView, Destroy, GetAllParameterInfos,
    GetBusInfos, GetParamNormalized, GetParameterCount, GetState, Initialize, NotifyConnection,
    RemoveView, RestartFlags, SetActive, SetComponentHandler, SetContentScaleFactor,
    SetParamNormalized, SetProcessing, SetState, Terminate, ViewOnSize, Vst3BusInfo,
    Vst3CallbackRequest, Vst3EventList, Vst3ParamChanges, Vst3ParamInfo, Vst3ProcessRequest,
    Vst3ProcessResponse, Vst3ProcessSetup, Vst3Result,
};
use plugbridge_core::messages::{ConstantMasks, ProcessLevel, TimeInfo};
use plugbridge_core::transport::sets::Vst3Sockets;
use plugbridge_core::transport::shm::AudioShmBuffer;
use plugbridge_core::utils::generate_endpoint_base;
use plugbridge_core::{
    Configuration, InstanceId, InstanceRegistry, MutualRecursionHelper, TransportError,
};

use super::bridge::{
    connect_sockets_guarded, log_init_message, warn_on_version_mismatch, PluginBridgeOptions,
    RealtimePrioritySync,
};
use super::host_process::{spawn_host_process, HostProcess};
use super::{PluginInfo, PluginLoadError};

/// The host-side callback object for one instance: parameter edits, restart
/// requests and view resizing land here. The shim implements this around the
/// handler object its host registered.
pub trait Vst3ComponentHandler: Send + Sync {
    fn begin_edit(&self, instance_id: InstanceId, param_id: u32) -> Vst3Result;
    fn perform_edit(&self, instance_id: InstanceId, param_id: u32, value: f64) -> Vst3Result;
    fn end_edit(&self, instance_id: InstanceId, param_id: u32) -> Vst3Result;
    fn restart_component(&self, instance_id: InstanceId, flags: u32) -> Vst3Result;

    fn request_resize(&self, _instance_id: InstanceId, _width: u32, _height: u32) -> Vst3Result {
        Vst3Result::NOT_IMPLEMENTED
    }

    fn notify(
        &self,
        _instance_id: InstanceId,
        _message_id: &str,
        _payload: &[u8],
    ) -> Vst3Result {
        Vst3Result::NOT_IMPLEMENTED
    }
}

struct ProxyState {
    /// The host's component handler, if one was registered. Holding the
    /// `Arc` is what keeps the handler alive for the foreign side's mirror
    /// proxy.
    component_handler: Mutex<Option<Arc<dyn Vst3ComponentHandler>>>,
    /// All parameter descriptions, fetched in one batch on the first query.
    /// Dropped when the plugin restarts with a parameter-changed flag.
    param_info_cache: Mutex<Option<Arc<Vec<Vst3ParamInfo>>>>,
    process_buffers: Mutex<Option<AudioShmBuffer>>,
    priority_sync: RealtimePrioritySync,
}

pub struct Vst3PluginBridge {
    weak_self: Weak<Vst3PluginBridge>,

    config: Configuration,
    info: PluginInfo,

    sockets: Arc<Vst3Sockets>,
    _host_process: Mutex<Box<dyn HostProcess>>,

    proxies: Arc<InstanceRegistry<ProxyState>>,
    mutual_recursion: Arc<MutualRecursionHelper>,

    callback_handler: Mutex<Option<JoinHandle<()>>>,
}

impl Vst3PluginBridge {
    pub fn new(options: PluginBridgeOptions) -> Result<Arc<Self>, PluginLoadError> {
        let PluginBridgeOptions { config, info } = options;

        let base_dir =
            generate_endpoint_base(&info.plugin_name()).map_err(PluginLoadError::SpawnFailed)?;
        let sockets = Arc::new(Vst3Sockets::new(&base_dir, true)?);

        let host_process = spawn_host_process(&config, &info, &base_dir)?;

        log_init_message(&config, &info, &base_dir);

        {
            let connect_sockets = Arc::clone(&sockets);
            let close_sockets = Arc::clone(&sockets);
            connect_sockets_guarded(
                &info,
                &host_process,
                move || connect_sockets.connect(),
                move || close_sockets.close(),
            )?;
        }

        let bridge = Arc::new_cyclic(|weak_self: &Weak<Vst3PluginBridge>| Self {
            weak_self: weak_self.clone(),
            config,
            info,
            sockets,
            _host_process: host_process,
            proxies: Arc::new(InstanceRegistry::new()),
            mutual_recursion: Arc::new(MutualRecursionHelper::new()),
            callback_handler: Mutex::new(None),
        });

        bridge.spawn_callback_handler();

        Ok(bridge)
    }

    fn strong_self(&self) -> Option<Arc<Vst3PluginBridge>> {
        self.weak_self.upgrade()
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    fn spawn_callback_handler(&self) {
        let bridge = match self.strong_self() {
            Some(bridge) => bridge,
            None => return,
        };

        let join_handle = std::thread::Builder::new()
            .name(String::from("callback-handler"))
            .spawn(move || {
                let sockets = Arc::clone(&bridge.sockets);
                sockets.plugin_host_callback.receive_messages(|request, reply| match request {
                    Vst3CallbackRequest::WantsConfiguration(handshake) => {
                        warn_on_version_mismatch(&handshake.host_version, &bridge.info);
                        reply.send(&bridge.config)
                    }
                    Vst3CallbackRequest::BeginEdit(request) => {
                        let result = bridge.with_component_handler(request.instance_id, |h| {
                            h.begin_edit(request.instance_id, request.param_id)
                        });
                        reply.send(&result)
                    }
                    Vst3CallbackRequest::PerformEdit(request) => {
                        let result = bridge.with_component_handler(request.instance_id, |h| {
                            h.perform_edit(
                                request.instance_id,
                                request.param_id,
                                request.value_normalized,
                            )
                        });
                        reply.send(&result)
                    }
                    Vst3CallbackRequest::EndEdit(request) => {
                        let result = bridge.with_component_handler(request.instance_id, |h| {
                            h.end_edit(request.instance_id, request.param_id)
                        });
                        reply.send(&result)
                    }
                    Vst3CallbackRequest::RestartComponent(request) => {
                        // This can arrive mid-call (a set-state triggering a
                        // latency change) and touches main-thread state
                        let result = bridge.mutual_recursion.handle(|| {
                            let flags = RestartFlags::from_bits_truncate(request.flags);
                            if flags.intersects(
                                RestartFlags::PARAM_VALUES_CHANGED
                                    | RestartFlags::PARAM_TITLES_CHANGED,
                            ) {
                                if let Some(proxy) = bridge.proxies.get(request.instance_id) {
                                    *proxy
                                        .param_info_cache
                                        .lock()
                                        .unwrap_or_else(|e| e.into_inner()) = None;
                                }
                            }

                            bridge.with_component_handler(request.instance_id, |h| {
                                h.restart_component(request.instance_id, request.flags)
                            })
                        });
                        reply.send(&result)
                    }
                    Vst3CallbackRequest::RequestResize(request) => {
                        let result = bridge.with_component_handler(request.instance_id, |h| {
                            h.request_resize(request.instance_id, request.width, request.height)
                        });
                        reply.send(&result)
                    }
                    Vst3CallbackRequest::NotifyConnectionCallback(request) => {
                        let result = bridge.with_component_handler(request.instance_id, |h| {
                            h.notify(request.instance_id, &request.message_id, &request.payload)
                        });
                        reply.send(&result)
                    }
                });
            })
            .expect("could not spawn the callback handler thread");

        *self.callback_handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(join_handle);
    }

    fn with_component_handler(
        &self,
        instance_id: InstanceId,
        f: impl FnOnce(&dyn Vst3ComponentHandler) -> Vst3Result,
    ) -> Vst3Result {
        let handler = match self.proxies.get(instance_id) {
            Some(proxy) => {
                proxy.component_handler.lock().unwrap_or_else(|e| e.into_inner()).clone()
            }
            None => None,
        };

        match handler {
            Some(handler) => f(handler.as_ref()),
            None => {
                log::debug!(
                    "Dropped a callback for instance {}, no component handler is registered",
                    instance_id
                );
                Vst3Result::NOT_IMPLEMENTED
            }
        }
    }

    pub fn create_instance(&self) -> Result<Vst3PluginProxy, TransportError> {
        let response = self.sockets.host_plugin_control.send_message(CreateInstance)?;
        if !response.result.is_ok() {
            return Err(TransportError::Codec(String::from(
                "the worker could not instantiate the plugin",
            )));
        }
        let instance_id = response.instance_id;

        self.sockets.audio_threads.add_and_connect(instance_id)?;

        self.proxies.register_with_id(
            instance_id,
            ProxyState {
                component_handler: Mutex::new(None),
                param_info_cache: Mutex::new(None),
                process_buffers: Mutex::new(None),
                priority_sync: RealtimePrioritySync::new(),
            },
        );

        let bridge = self.strong_self().ok_or(TransportError::ConnectionClosed)?;
        Ok(Vst3PluginProxy { bridge, instance_id })
    }
}

impl Drop for Vst3PluginBridge {
    fn drop(&mut self) {
        self.sockets.close();

        if let Some(handler) =
            self.callback_handler.lock().unwrap_or_else(|e| e.into_inner()).take()
        {
            let _ = handler.join();
        }
    }
}

/// The native stand-in for one foreign instance. Dropping it destroys the
/// foreign instance and releases the callback objects registered for it.
pub struct Vst3PluginProxy {
    bridge: Arc<Vst3PluginBridge>,
    instance_id: InstanceId,
}

impl Vst3PluginProxy {
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn initialize(&self, has_host_context: bool) -> Result<Vst3Result, TransportError> {
        // Initialization is a known re-entry point: plugins query their host
        // context before returning from it
        self.bridge.mutual_recursion.fork(|| {
            self.bridge.sockets.host_plugin_control.send_message(Initialize {
                instance_id: self.instance_id,
                has_host_context,
            })
        })
    }

    pub fn terminate(&self) -> Result<Vst3Result, TransportError> {
        self.bridge
            .sockets
            .host_plugin_control
            .send_message(Terminate { instance_id: self.instance_id })
    }

    /// Register the host's component handler. The `Arc` is held until the
    /// proxy is dropped or the handler is replaced, which is this side of
    /// the dialect's refcounting contract.
    pub fn set_component_handler(
        &self,
        handler: Option<Arc<dyn Vst3ComponentHandler>>,
    ) -> Result<Vst3Result, TransportError> {
        let handler_present = handler.is_some();

        if let Some(proxy) = self.bridge.proxies.get(self.instance_id) {
            *proxy.component_handler.lock().unwrap_or_else(|e| e.into_inner()) = handler;
        }

        self.bridge.sockets.host_plugin_control.send_message(SetComponentHandler {
            instance_id: self.instance_id,
            handler_present,
        })
    }

    /// Connect this instance's connection point to another instance's.
    pub fn connect(&self, other: &Vst3PluginProxy) -> Result<Vst3Result, TransportError> {
        self.bridge.sockets.host_plugin_control.send_message(ConnectInstances {
            instance_id: self.instance_id,
            other_instance_id: other.instance_id,
        })
    }

    pub fn notify(
        &self,
        message_id: String,
        payload: Vec<u8>,
    ) -> Result<Vst3Result, TransportError> {
        self.bridge.sockets.host_plugin_control.send_message(NotifyConnection {
            instance_id: self.instance_id,
            message_id,
            payload,
        })
    }

    pub fn bus_infos(&self) -> Result<Vec<Vst3BusInfo>, TransportError> {
        self.bridge
            .sockets
            .host_plugin_control
            .send_message(GetBusInfos { instance_id: self.instance_id })
    }

    /// Activate or deactivate the instance. Activation maps the shared
    /// audio buffer the worker laid out for this setup.
    pub fn set_active(
        &self,
        active: bool,
        setup: Option<Vst3ProcessSetup>,
    ) -> Result<Vst3Result, TransportError> {
        let response = self.bridge.sockets.host_plugin_control.send_message(SetActive {
            instance_id: self.instance_id,
            active,
            setup,
        })?;

        if let Some(proxy) = self.bridge.proxies.get(self.instance_id) {
            let mut process_buffers =
                proxy.process_buffers.lock().unwrap_or_else(|e| e.into_inner());

            match response.shm_config {
                Some(shm_config) if response.result.is_ok() => {
                    let buffer = AudioShmBuffer::open(shm_config)
                        .map_err(|e| TransportError::Codec(e.to_string()))?;
                    *process_buffers = Some(buffer);
                }
                _ if !active => *process_buffers = None,
                _ => (),
            }
        }

        Ok(response.result)
    }

    pub fn parameter_count(&self) -> Result<i32, TransportError> {
        self.bridge
            .sockets
            .host_plugin_control
            .send_message(GetParameterCount { instance_id: self.instance_id })
    }

    /// One parameter's description, served from the batched cache.
    pub fn parameter_info(&self, index: usize) -> Result<Option<Vst3ParamInfo>, TransportError> {
        let infos = self.all_parameter_infos()?;
        Ok(infos.get(index).cloned())
    }

    /// All parameter descriptions. Fetched in one batch on the first call
    /// and cached until the plugin restarts with a parameter-changed flag.
    pub fn all_parameter_infos(&self) -> Result<Arc<Vec<Vst3ParamInfo>>, TransportError> {
        if let Some(proxy) = self.bridge.proxies.get(self.instance_id) {
            let cached =
                proxy.param_info_cache.lock().unwrap_or_else(|e| e.into_inner()).clone();
            if let Some(infos) = cached {
                return Ok(infos);
            }
        }

        let infos = Arc::new(
            self.bridge
                .sockets
                .host_plugin_control
                .send_message(GetAllParameterInfos { instance_id: self.instance_id })?,
        );

        if let Some(proxy) = self.bridge.proxies.get(self.instance_id) {
            *proxy.param_info_cache.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(Arc::clone(&infos));
        }

        Ok(infos)
    }

    pub fn get_param_normalized(&self, param_id: u32) -> Result<f64, TransportError> {
        self.bridge
            .sockets
            .host_plugin_control
            .send_message(GetParamNormalized { instance_id: self.instance_id, param_id })
    }

    pub fn set_param_normalized(
        &self,
        param_id: u32,
        value: f64,
    ) -> Result<Vst3Result, TransportError> {
        self.bridge.sockets.host_plugin_control.send_message(SetParamNormalized {
            instance_id: self.instance_id,
            param_id,
            value,
        })
    }

    pub fn get_state(&self) -> Result<Option<Vec<u8>>, TransportError> {
        self.bridge
            .sockets
            .host_plugin_control
            .send_message(GetState { instance_id: self.instance_id })
    }

    pub fn set_state(&self, chunk: Vec<u8>) -> Result<Vst3Result, TransportError> {
        // Restoring state is another re-entry point (restart-component
        // callbacks fire before the call returns)
        self.bridge.mutual_recursion.fork(|| {
            self.bridge
                .sockets
                .host_plugin_control
                .send_message(SetState { instance_id: self.instance_id, chunk })
        })
    }

    pub fn create_view(&self) -> Result<Vst3Result, TransportError> {
        self.bridge
            .sockets
            .host_plugin_control
            .send_message(CreateView { instance_id: self.instance_id })
    }

    pub fn attach_view(&self, parent_window: u64) -> Result<Vst3Result, TransportError> {
        self.bridge.sockets.host_plugin_control.send_message(AttachView {
            instance_id: self.instance_id,
            parent_window,
        })
    }

    pub fn remove_view(&self) -> Result<Vst3Result, TransportError> {
        self.bridge
            .sockets
            .host_plugin_control
            .send_message(RemoveView { instance_id: self.instance_id })
    }

    pub fn view_on_size(&self, width: u32, height: u32) -> Result<Vst3Result, TransportError> {
        self.bridge.sockets.host_plugin_control.send_message(ViewOnSize {
            instance_id: self.instance_id,
            width,
            height,
        })
    }

    /// Forward a host-driven scale change, unless the configuration refuses
    /// them.
    pub fn set_content_scale_factor(&self, factor: f32) -> Result<Vst3Result, TransportError> {
        if self.bridge.config.editor_disable_host_scaling {
            log::debug!("Ignoring a host-driven scale factor change, disabled in the config");
            return Ok(Vst3Result::NOT_IMPLEMENTED);
        }

        self.bridge.sockets.host_plugin_control.send_message(SetContentScaleFactor {
            instance_id: self.instance_id,
            factor,
        })
    }

    // Audio thread API

    pub fn set_processing(&self, processing: bool) -> Result<Vst3Result, TransportError> {
        self.bridge.sockets.audio_threads.send_message(
            self.instance_id,
            SetProcessing { instance_id: self.instance_id, processing },
        )
    }

    /// Process one block through the shared audio buffer, carrying the
    /// parameter change queues and events in the envelope.
    #[allow(clippy::too_many_arguments)]
    pub fn process_f32(
        &self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        frames: u32,
        time_info: Option<TimeInfo>,
        process_level: ProcessLevel,
        input_param_changes: Vst3ParamChanges,
        input_events: Vst3EventList,
    ) -> Result<Vst3ProcessResponse, TransportError> {
        let proxy = self
            .bridge
            .proxies
            .get(self.instance_id)
            .ok_or(TransportError::ConnectionClosed)?;
        let process_buffers = proxy.process_buffers.lock().unwrap_or_else(|e| e.into_inner());
        let buffer = process_buffers.as_ref().ok_or(TransportError::ConnectionClosed)?;

        let frames_usize = frames as usize;
        let mut input_constant_masks = ConstantMasks::new();

        let mut channel = 0;
        for (bus, bus_offsets) in buffer.config().input_offsets.iter().enumerate() {
            let mut constant_mask = 0u64;
            for bus_channel in 0..bus_offsets.len() {
                let input = inputs[channel];
                let plane = unsafe { buffer.input_channel::<f32>(bus, bus_channel) };
                plane[..frames_usize].copy_from_slice(&input[..frames_usize]);

                if input[..frames_usize].iter().all(|sample| *sample == 0.0) {
                    constant_mask |= 1 << bus_channel;
                }
                channel += 1;
            }
            input_constant_masks.push(constant_mask);
        }

        let request = Vst3ProcessRequest {
            instance_id: self.instance_id,
            frames,
            process_level,
            time_info,
            input_param_changes,
            input_events,
            input_constant_masks,
            new_realtime_priority: proxy.priority_sync.priority_to_send(),
        };

        let response =
            self.bridge.sockets.audio_threads.send_message(self.instance_id, request)?;

        let mut channel = 0;
        for (bus, bus_offsets) in buffer.config().output_offsets.iter().enumerate() {
            for bus_channel in 0..bus_offsets.len() {
                let plane = unsafe { buffer.output_channel::<f32>(bus, bus_channel) };
                outputs[channel][..frames_usize].copy_from_slice(&plane[..frames_usize]);
                channel += 1;
            }
        }

        Ok(response)
    }
}

impl Drop for Vst3PluginProxy {
    fn drop(&mut self) {
        let _ = self
            .bridge
            .sockets
            .host_plugin_control
            .send_message(Destroy { instance_id: self.instance_id });
        self.bridge.sockets.audio_threads.remove(self.instance_id);
        self.bridge.proxies.unregister(self.instance_id);
    }
}
