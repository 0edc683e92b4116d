//! The native bridge for the C-vtable dialect with extension queries.
//!
//! One bridge per loaded plugin library; the host can instantiate any number
//! of plugin instances through it. Every instance is represented by a
//! [`ClapPluginProxy`] which forwards the main-thread API over the control
//! channel and the audio-thread API over the instance's dedicated audio
//! channel. Extension queries are answered locally from the bitset the
//! worker reported after init.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use plugbridge_core::messages::clap::{
    Activate, ClapAudioPortInfo, ClapCallbackRequest, ClapControlRequest, ClapEventList,
    ClapParamInfo, ClapProcessRequest, ClapProcessResponse, CreateInstance, Deactivate,
    DestroyInstance, GetAudioPorts, GetParamInfos, GetParamValue, InitInstance, LoadState,
    OnMainThread, ParamsFlush, ResetInstance, SaveState, StartProcessing, StopProcessing,
    SupportedExtensions,
};
use plugbridge_core::messages::{ConstantMasks, ProcessLevel, TimeInfo};
use plugbridge_core::transport::sets::ClapSockets;
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

/// The native host's side of the plugin's callbacks. The shim implements
/// this around the host context object it got from its host; everything is
/// optional since a host may not care.
pub trait ClapHostCallbackHandler: Send + Sync {
    fn request_restart(&self, _instance_id: InstanceId) {}
    fn request_process(&self, _instance_id: InstanceId) {}
    /// The plugin asked for its main-thread callback. The host should get
    /// around to calling [`ClapPluginProxy::run_pending_callbacks`] on its
    /// main thread.
    fn request_callback(&self, _instance_id: InstanceId) {}
    fn latency_changed(&self, _instance_id: InstanceId) {}
    fn params_rescanned(&self, _instance_id: InstanceId, _flags: u32) {}
    fn log_message(&self, _instance_id: InstanceId, _severity: u32, _message: &str) {}
}

/// Native-side per-instance state.
struct ProxyState {
    /// Which extensions the plugin advertises, known after init. Queries for
    /// anything else are rejected without a round trip.
    supported_extensions: Mutex<SupportedExtensions>,
    /// All parameter descriptions, fetched in one batch on the first query.
    /// Cleared when the plugin requests a rescan.
    param_info_cache: Mutex<Option<Arc<Vec<ClapParamInfo>>>>,
    /// How many main-thread callbacks the plugin has requested and we have
    /// not run yet.
    pending_callbacks: AtomicU32,
    /// The mapped shared audio buffer while the instance is active.
    process_buffers: Mutex<Option<AudioShmBuffer>>,
    priority_sync: RealtimePrioritySync,
}

pub struct ClapPluginBridge {
    weak_self: Weak<ClapPluginBridge>,

    config: Configuration,
    info: PluginInfo,

    sockets: Arc<ClapSockets>,
    _host_process: Mutex<Box<dyn HostProcess>>,

    proxies: Arc<InstanceRegistry<ProxyState>>,
    mutual_recursion: Arc<MutualRecursionHelper>,

    callback_handler: Mutex<Option<JoinHandle<()>>>,
}

impl ClapPluginBridge {
    pub fn new(
        options: PluginBridgeOptions,
        callback_handler: Arc<dyn ClapHostCallbackHandler>,
    ) -> Result<Arc<Self>, PluginLoadError> {
        let PluginBridgeOptions { config, info } = options;

        let base_dir =
            generate_endpoint_base(&info.plugin_name()).map_err(PluginLoadError::SpawnFailed)?;
        let sockets = Arc::new(ClapSockets::new(&base_dir, true)?);

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

        let bridge = Arc::new_cyclic(|weak_self: &Weak<ClapPluginBridge>| Self {
            weak_self: weak_self.clone(),
            config,
            info,
            sockets,
            _host_process: host_process,
            proxies: Arc::new(InstanceRegistry::new()),
            mutual_recursion: Arc::new(MutualRecursionHelper::new()),
            callback_handler: Mutex::new(None),
        });

        bridge.spawn_callback_handler(callback_handler);

        Ok(bridge)
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    fn spawn_callback_handler(&self, handler: Arc<dyn ClapHostCallbackHandler>) {
        let bridge = match self.weak_self.upgrade() {
            Some(bridge) => bridge,
            None => return,
        };

        let join_handle = std::thread::Builder::new()
            .name(String::from("callback-handler"))
            .spawn(move || {
                let sockets = Arc::clone(&bridge.sockets);
                sockets.plugin_host_callback.receive_messages(|request, reply| match request {
                    ClapCallbackRequest::WantsConfiguration(handshake) => {
                        warn_on_version_mismatch(&handshake.host_version, &bridge.info);
                        reply.send(&bridge.config)
                    }
                    ClapCallbackRequest::RequestRestart(request) => {
                        handler.request_restart(request.instance_id);
                        reply.send(&())
                    }
                    ClapCallbackRequest::RequestProcess(request) => {
                        handler.request_process(request.instance_id);
                        reply.send(&())
                    }
                    ClapCallbackRequest::RequestCallback(request) => {
                        if let Some(proxy) = bridge.proxies.get(request.instance_id) {
                            proxy.pending_callbacks.fetch_add(1, Ordering::SeqCst);
                        }
                        handler.request_callback(request.instance_id);
                        reply.send(&())
                    }
                    ClapCallbackRequest::ParamsRescan(request) => {
                        // Affects main-thread state, so run it on the thread
                        // with the in-flight control call if there is one
                        bridge.mutual_recursion.handle(|| {
                            if let Some(proxy) = bridge.proxies.get(request.instance_id) {
                                *proxy
                                    .param_info_cache
                                    .lock()
                                    .unwrap_or_else(|e| e.into_inner()) = None;
                            }
                            handler.params_rescanned(request.instance_id, request.flags);
                        });
                        reply.send(&())
                    }
                    ClapCallbackRequest::LatencyChanged(request) => {
                        bridge
                            .mutual_recursion
                            .handle(|| handler.latency_changed(request.instance_id));
                        reply.send(&())
                    }
                    ClapCallbackRequest::LogMessage(request) => {
                        handler.log_message(
                            request.instance_id,
                            request.severity,
                            &request.message,
                        );
                        reply.send(&())
                    }
                });
            })
            .expect("could not spawn the callback handler thread");

        *self.callback_handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(join_handle);
    }

    /// Instantiate a plugin in the worker and wrap it in a proxy. The worker
    /// is already listening on the instance's audio channel when the
    /// response arrives.
    pub fn create_instance(&self) -> Result<ClapPluginProxy, TransportError> {
        let response = self.sockets.host_plugin_control.send_message(CreateInstance)?;
        let instance_id = match response.instance_id {
            Some(instance_id) => instance_id,
            None => {
                return Err(TransportError::Codec(String::from(
                    "the worker could not instantiate the plugin",
                )))
            }
        };

        self.sockets.audio_threads.add_and_connect(instance_id)?;

        self.proxies.register_with_id(
            instance_id,
            ProxyState {
                supported_extensions: Mutex::new(SupportedExtensions::empty()),
                param_info_cache: Mutex::new(None),
                pending_callbacks: AtomicU32::new(0),
                process_buffers: Mutex::new(None),
                priority_sync: RealtimePrioritySync::new(),
            },
        );

        let bridge = self.weak_self.upgrade().ok_or(TransportError::ConnectionClosed)?;
        Ok(ClapPluginProxy { bridge, instance_id })
    }
}

impl Drop for ClapPluginBridge {
    fn drop(&mut self) {
        self.sockets.close();

        if let Some(handler) =
            self.callback_handler.lock().unwrap_or_else(|e| e.into_inner()).take()
        {
            let _ = handler.join();
        }
    }
}

/// The native stand-in for one foreign plugin instance. Dropping the proxy
/// destroys the foreign instance.
pub struct ClapPluginProxy {
    bridge: Arc<ClapPluginBridge>,
    instance_id: InstanceId,
}

impl ClapPluginProxy {
    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    /// Initialize the foreign instance. The worker reports the extension set
    /// the plugin advertises; everything the host queries afterwards is
    /// answered from that set locally.
    pub fn init(&self) -> Result<bool, TransportError> {
        let response = self.bridge.mutual_recursion.fork(|| {
            self.bridge
                .sockets
                .host_plugin_control
                .send_message(InitInstance { instance_id: self.instance_id })
        })?;

        if response.success {
            if let Some(proxy) = self.bridge.proxies.get(self.instance_id) {
                *proxy.supported_extensions.lock().unwrap_or_else(|e| e.into_inner()) =
                    response.supported_extensions;
            }
        }

        Ok(response.success)
    }

    /// Whether the plugin advertises an extension. Answered locally; a miss
    /// is the dialect's "not supported" and never crosses the boundary.
    pub fn supports_extension(&self, extension: SupportedExtensions) -> bool {
        match self.bridge.proxies.get(self.instance_id) {
            Some(proxy) => proxy
                .supported_extensions
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .contains(extension),
            None => false,
        }
    }

    pub fn audio_ports(&self) -> Result<Vec<ClapAudioPortInfo>, TransportError> {
        if !self.supports_extension(SupportedExtensions::AUDIO_PORTS) {
            log::debug!(
                "Rejected an audio-ports query for instance {}, the plugin does not implement \
                 the extension",
                self.instance_id
            );
            return Ok(Vec::new());
        }

        self.bridge
            .sockets
            .host_plugin_control
            .send_message(GetAudioPorts { instance_id: self.instance_id })
    }

    /// All parameter descriptions. The first call fetches the whole list in
    /// one batch and caches it; the cache is dropped when the plugin
    /// requests a rescan.
    pub fn param_infos(&self) -> Result<Arc<Vec<ClapParamInfo>>, TransportError> {
        if !self.supports_extension(SupportedExtensions::PARAMS) {
            log::debug!(
                "Rejected a parameter query for instance {}, the plugin does not implement the \
                 extension",
                self.instance_id
            );
            return Ok(Arc::new(Vec::new()));
        }

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
                .send_message(GetParamInfos { instance_id: self.instance_id })?,
        );

        if let Some(proxy) = self.bridge.proxies.get(self.instance_id) {
            *proxy.param_info_cache.lock().unwrap_or_else(|e| e.into_inner()) =
                Some(Arc::clone(&infos));
        }

        Ok(infos)
    }

    pub fn param_value(&self, param_id: u32) -> Result<Option<f64>, TransportError> {
        if !self.supports_extension(SupportedExtensions::PARAMS) {
            return Ok(None);
        }

        self.bridge
            .sockets
            .host_plugin_control
            .send_message(GetParamValue { instance_id: self.instance_id, param_id })
    }

    pub fn params_flush(&self, input_events: ClapEventList) -> Result<ClapEventList, TransportError> {
        self.bridge
            .sockets
            .host_plugin_control
            .send_message(ParamsFlush { instance_id: self.instance_id, input_events })
    }

    /// Activate the instance. The worker creates the shared audio buffer
    /// sized for this configuration and sends back the layout for us to map.
    pub fn activate(
        &self,
        sample_rate: f64,
        min_block_size: u32,
        max_block_size: u32,
        double_precision: bool,
    ) -> Result<bool, TransportError> {
        let response = self.bridge.sockets.host_plugin_control.send_message(Activate {
            instance_id: self.instance_id,
            sample_rate,
            min_block_size,
            max_block_size,
            double_precision,
        })?;

        if !response.success {
            return Ok(false);
        }

        if let Some(shm_config) = response.shm_config {
            let buffer = AudioShmBuffer::open(shm_config)
                .map_err(|e| TransportError::Codec(e.to_string()))?;

            if let Some(proxy) = self.bridge.proxies.get(self.instance_id) {
                *proxy.process_buffers.lock().unwrap_or_else(|e| e.into_inner()) = Some(buffer);
            }
        }

        Ok(true)
    }

    pub fn deactivate(&self) -> Result<(), TransportError> {
        self.bridge
            .sockets
            .host_plugin_control
            .send_message(Deactivate { instance_id: self.instance_id })?;

        if let Some(proxy) = self.bridge.proxies.get(self.instance_id) {
            *proxy.process_buffers.lock().unwrap_or_else(|e| e.into_inner()) = None;
        }

        Ok(())
    }

    pub fn save_state(&self) -> Result<Option<Vec<u8>>, TransportError> {
        if !self.supports_extension(SupportedExtensions::STATE) {
            return Ok(None);
        }

        self.bridge.sockets.host_plugin_control.send_message(SaveState { instance_id: self.instance_id })
    }

    pub fn load_state(&self, chunk: Vec<u8>) -> Result<bool, TransportError> {
        if !self.supports_extension(SupportedExtensions::STATE) {
            return Ok(false);
        }

        self.bridge.mutual_recursion.fork(|| {
            self.bridge
                .sockets
                .host_plugin_control
                .send_message(LoadState { instance_id: self.instance_id, chunk })
        })
    }

    /// Run the main-thread callbacks the plugin has asked for. The host
    /// calls this from its main thread after a
    /// [`ClapHostCallbackHandler::request_callback`].
    pub fn run_pending_callbacks(&self) -> Result<(), TransportError> {
        let pending = match self.bridge.proxies.get(self.instance_id) {
            Some(proxy) => proxy.pending_callbacks.swap(0, Ordering::SeqCst),
            None => 0,
        };

        for _ in 0..pending {
            self.bridge
                .sockets
                .host_plugin_control
                .send_message(OnMainThread { instance_id: self.instance_id })?;
        }

        Ok(())
    }

    // Audio thread API, on the instance's dedicated channel

    pub fn start_processing(&self) -> Result<bool, TransportError> {
        self.bridge
            .sockets
            .audio_threads
            .send_message(self.instance_id, StartProcessing { instance_id: self.instance_id })
    }

    pub fn stop_processing(&self) -> Result<(), TransportError> {
        self.bridge
            .sockets
            .audio_threads
            .send_message(self.instance_id, StopProcessing { instance_id: self.instance_id })
    }

    pub fn reset(&self) -> Result<(), TransportError> {
        self.bridge
            .sockets
            .audio_threads
            .send_message(self.instance_id, ResetInstance { instance_id: self.instance_id })
    }

    /// Process one block. Inputs are written into the shared buffer's input
    /// planes, the envelope makes the round trip on the instance's audio
    /// channel, and the outputs are copied back out of the output planes.
    ///
    /// The host guarantees process is not called concurrently for one
    /// instance, and nothing here allocates once the channel's buffers have
    /// reached their steady-state size.
    pub fn process_f32(
        &self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        frames: u32,
        steady_time: i64,
        time_info: Option<TimeInfo>,
        process_level: ProcessLevel,
        input_events: ClapEventList,
    ) -> Result<ClapProcessResponse, TransportError> {
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

        let request = ClapProcessRequest {
            instance_id: self.instance_id,
            frames,
            steady_time,
            process_level,
            time_info,
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

impl Drop for ClapPluginProxy {
    fn drop(&mut self) {
        // Dropping the proxy owns the foreign instance by contract: tear it
        // down, close its audio channel, and retire the id
        let _ = self
            .bridge
            .sockets
            .host_plugin_control
            .send_message(DestroyInstance { instance_id: self.instance_id });
        self.bridge.sockets.audio_threads.remove(self.instance_id);
        self.bridge.proxies.unregister(self.instance_id);
    }
}
