//! The native bridge for the simple C callback dialect.
//!
//! The shim exposes this format's two-function ABI to the host and forwards
//! everything here: dispatcher calls go out over the dispatch channel,
//! parameter accesses over their own channel, processing over the process
//! channel plus the shared audio buffer, and the plugin's host callbacks
//! come back in on the callback channel.

use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use plugbridge_core::messages::vst2::{
    Vst2Callback, Vst2CallbackRequest, Vst2Event, Vst2EventResult, Vst2ParameterRequest,
    Vst2ParameterResponse, Vst2Payload, Vst2PluginInfo, Vst2ProcessRequest, Vst2ProcessResponse,
    Vst2ResultPayload, HOST_OPCODE_GET_PRODUCT_STRING, HOST_OPCODE_GET_VENDOR_STRING,
    HOST_OPCODE_IO_CHANGED, HOST_OPCODE_SIZE_WINDOW, OPCODE_CLOSE, OPCODE_EDIT_OPEN,
    OPCODE_MAINS_CHANGED, OPCODE_OPEN, OPCODE_SET_CHUNK,
};
use plugbridge_core::messages::{MidiEventList, ProcessLevel, TimeInfo, WantsConfiguration};
use plugbridge_core::transport::sets::Vst2Sockets;
use plugbridge_core::transport::shm::AudioShmBuffer;
use plugbridge_core::utils::{
    generate_endpoint_base, PRODUCT_NAME_OVERRIDE, VENDOR_NAME_OVERRIDE,
};
use plugbridge_core::{Configuration, MutualRecursionHelper, TransportError};

use super::bridge::{
    connect_sockets_guarded, log_init_message, warn_on_version_mismatch, PluginBridgeOptions,
    RealtimePrioritySync,
};
use super::host_process::{spawn_host_process, HostProcess};
use super::{PluginInfo, PluginLoadError};

/// Dispatcher opcodes that the plugin is known to re-enter with a host
/// callback before returning. These are sent through the mutual-recursion
/// helper so the callback can be serviced on the dispatching thread.
const MUTUALLY_RECURSIVE_DISPATCH_OPCODES: &[i32] =
    &[OPCODE_OPEN, OPCODE_CLOSE, OPCODE_MAINS_CHANGED, OPCODE_SET_CHUNK, OPCODE_EDIT_OPEN];

/// Host callbacks that have to run on the thread that issued the dispatcher
/// call they interrupt.
const MUTUALLY_RECURSIVE_CALLBACK_OPCODES: &[i32] =
    &[HOST_OPCODE_IO_CHANGED, HOST_OPCODE_SIZE_WINDOW];

/// The native host's side of the plugin's host callbacks. Implemented by the
/// shim around whatever callback function the host registered.
pub trait Vst2HostCallbackHandler: Send + Sync {
    fn host_callback(&self, event: &Vst2Event) -> Vst2EventResult;
}

pub struct Vst2PluginBridge {
    config: Configuration,
    info: PluginInfo,

    sockets: Arc<Vst2Sockets>,
    /// Kept alive for the lifetime of the bridge; the worker exits when the
    /// sockets close.
    _host_process: Mutex<Box<dyn HostProcess>>,

    /// The plugin description mirrored to the host, updated when the plugin
    /// pushes changes through the io-changed callback. Shared with the
    /// callback handler thread.
    plugin_info: Arc<Mutex<Vst2PluginInfo>>,

    /// The shared audio buffer, mapped after activation.
    process_buffers: Mutex<Option<AudioShmBuffer>>,
    /// Serializes the parameter channel and owns its scratch buffer.
    parameter_scratch: Mutex<Vec<u8>>,
    /// Serializes the process channel and owns its scratch buffer. The host
    /// must not call process concurrently anyway; this keeps the channel
    /// safe if it does.
    process_scratch: Mutex<Vec<u8>>,

    mutual_recursion: Arc<MutualRecursionHelper>,
    priority_sync: RealtimePrioritySync,

    callback_handler: Mutex<Option<JoinHandle<()>>>,
}

impl Vst2PluginBridge {
    /// Spawn (or join) a worker for this plugin, connect the channels, and
    /// run the startup handshake. `callback_handler` receives the plugin's
    /// host callbacks for the embedding host to answer.
    pub fn new(
        options: PluginBridgeOptions,
        callback_handler: Arc<dyn Vst2HostCallbackHandler>,
    ) -> Result<Self, PluginLoadError> {
        let PluginBridgeOptions { config, info } = options;

        let base_dir =
            generate_endpoint_base(&info.plugin_name()).map_err(PluginLoadError::SpawnFailed)?;
        let sockets = Arc::new(Vst2Sockets::new(&base_dir, true)?);

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

        // The worker asks for the configuration first thing, then pushes the
        // loaded plugin's description
        let plugin_info = {
            let mut scratch = Vec::new();
            let handshake: WantsConfiguration =
                sockets.host_plugin_control.receive_single(&mut scratch)?;
            warn_on_version_mismatch(&handshake.host_version, &info);
            sockets.host_plugin_control.send(&config, &mut scratch)?;

            use plugbridge_core::messages::vst2::Vst2ControlMessage;
            match sockets.host_plugin_control.receive_single(&mut scratch)? {
                Vst2ControlMessage::PluginLoaded(plugin_info) => plugin_info,
            }
        };

        let bridge = Self {
            config,
            info,
            sockets,
            _host_process: host_process,
            plugin_info: Arc::new(Mutex::new(plugin_info)),
            process_buffers: Mutex::new(None),
            parameter_scratch: Mutex::new(Vec::new()),
            process_scratch: Mutex::new(Vec::new()),
            mutual_recursion: Arc::new(MutualRecursionHelper::new()),
            priority_sync: RealtimePrioritySync::new(),
            callback_handler: Mutex::new(None),
        };

        bridge.spawn_callback_handler(callback_handler);

        Ok(bridge)
    }

    /// The description the shim mirrors to its host.
    pub fn plugin_info(&self) -> Vst2PluginInfo {
        *self.plugin_info.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn info(&self) -> &PluginInfo {
        &self.info
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// Handle plugin-to-host callbacks until the sockets close.
    fn spawn_callback_handler(&self, handler: Arc<dyn Vst2HostCallbackHandler>) {
        let sockets = Arc::clone(&self.sockets);
        let mutual_recursion = Arc::clone(&self.mutual_recursion);
        let plugin_info = Arc::clone(&self.plugin_info);
        let hide_daw = self.config.hide_daw;

        let join_handle = std::thread::Builder::new()
            .name(String::from("callback-handler"))
            .spawn(move || {
                sockets.plugin_host_callback.receive_messages(|request, reply| {
                    match request {
                        // The handshake runs over the control channel in
                        // this dialect; answering here too costs nothing
                        Vst2CallbackRequest::WantsConfiguration(_) => {
                            reply.send(&Configuration::default())
                        }
                        Vst2CallbackRequest::Callback(Vst2Callback(event)) => {
                            let response = handle_host_callback(
                                &event,
                                handler.as_ref(),
                                &mutual_recursion,
                                &plugin_info,
                                hide_daw,
                            );
                            reply.send(&response)
                        }
                    }
                });
            })
            .expect("could not spawn the callback handler thread");

        *self.callback_handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(join_handle);
    }

    /// Forward a dispatcher call to the plugin. Opcodes known to provoke
    /// re-entrant host callbacks go through the mutual-recursion helper so
    /// those callbacks run on this thread while the call is in flight.
    pub fn dispatch(&self, event: Vst2Event) -> Result<Vst2EventResult, TransportError> {
        let opcode = event.opcode;

        if MUTUALLY_RECURSIVE_DISPATCH_OPCODES.contains(&opcode) {
            self.mutual_recursion.fork(|| self.sockets.host_plugin_dispatch.send_message(event))
        } else {
            self.sockets.host_plugin_dispatch.send_message(event)
        }
    }

    /// Activate or deactivate processing. On activation the worker sets up
    /// the shared audio buffer and sends back its layout for us to map.
    pub fn mains_changed(&self, enabled: bool) -> Result<(), TransportError> {
        let payload =
            if enabled { Vst2Payload::WantsAudioShmBufferConfig } else { Vst2Payload::None };

        let response = self.dispatch(Vst2Event {
            opcode: OPCODE_MAINS_CHANGED,
            index: 0,
            value: i64::from(enabled),
            option: 0.0,
            payload,
            value_payload: None,
        })?;

        let mut process_buffers = self.process_buffers.lock().unwrap_or_else(|e| e.into_inner());
        match response.payload {
            Vst2ResultPayload::AudioShmBufferConfig(shm_config) => {
                let buffer = AudioShmBuffer::open(shm_config)
                    .map_err(|e| TransportError::Codec(e.to_string()))?;
                *process_buffers = Some(buffer);
            }
            _ if !enabled => *process_buffers = None,
            _ => (),
        }

        Ok(())
    }

    pub fn get_parameter(&self, index: i32) -> Result<f32, TransportError> {
        let mut scratch = self.parameter_scratch.lock().unwrap_or_else(|e| e.into_inner());

        self.sockets
            .host_plugin_parameters
            .send(&Vst2ParameterRequest::Get { index }, &mut scratch)?;
        let response: Vst2ParameterResponse =
            self.sockets.host_plugin_parameters.receive_single(&mut scratch)?;

        Ok(response.value.unwrap_or(0.0))
    }

    pub fn set_parameter(&self, index: i32, value: f32) -> Result<(), TransportError> {
        let mut scratch = self.parameter_scratch.lock().unwrap_or_else(|e| e.into_inner());

        self.sockets
            .host_plugin_parameters
            .send(&Vst2ParameterRequest::Set { index, value }, &mut scratch)?;
        let _: Vst2ParameterResponse =
            self.sockets.host_plugin_parameters.receive_single(&mut scratch)?;

        Ok(())
    }

    /// Process one block of single-precision audio. Inputs are copied into
    /// the shared buffer, the envelope makes the round trip, and the
    /// worker's outputs are copied back out. Returns the MIDI events the
    /// plugin produced.
    pub fn process_f32(
        &self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        frames: u32,
        time_info: Option<TimeInfo>,
        process_level: ProcessLevel,
    ) -> Result<MidiEventList, TransportError> {
        let mut scratch = self.process_scratch.lock().unwrap_or_else(|e| e.into_inner());
        let process_buffers = self.process_buffers.lock().unwrap_or_else(|e| e.into_inner());
        let buffer = process_buffers.as_ref().ok_or(TransportError::ConnectionClosed)?;

        let frames_usize = frames as usize;
        for (channel, input) in inputs.iter().enumerate() {
            // This dialect has a single implicit bus per direction
            let plane = unsafe { buffer.input_channel::<f32>(0, channel) };
            plane[..frames_usize].copy_from_slice(&input[..frames_usize]);
        }

        let request = Vst2ProcessRequest {
            frames,
            double_precision: false,
            time_info,
            process_level,
            new_realtime_priority: self.priority_sync.priority_to_send(),
        };
        self.sockets.host_plugin_process.send(&request, &mut scratch)?;
        let response: Vst2ProcessResponse =
            self.sockets.host_plugin_process.receive_single(&mut scratch)?;

        for (channel, output) in outputs.iter_mut().enumerate() {
            let plane = unsafe { buffer.output_channel::<f32>(0, channel) };
            output[..frames_usize].copy_from_slice(&plane[..frames_usize]);
        }

        Ok(response.output_events)
    }
}

impl Drop for Vst2PluginBridge {
    fn drop(&mut self) {
        // Closing every channel tells the worker to tear the plugin down and
        // unblocks the callback handler's receive loop
        self.sockets.close();

        if let Some(handler) =
            self.callback_handler.lock().unwrap_or_else(|e| e.into_inner()).take()
        {
            let _ = handler.join();
        }
    }
}

fn handle_host_callback(
    event: &Vst2Event,
    handler: &dyn Vst2HostCallbackHandler,
    mutual_recursion: &MutualRecursionHelper,
    plugin_info: &Mutex<Vst2PluginInfo>,
    hide_daw: bool,
) -> Vst2EventResult {
    // Some plugins behave differently (and badly, under the bridge) for
    // specific hosts, so this option lies about the host's identity
    if hide_daw {
        let overridden = match event.opcode {
            HOST_OPCODE_GET_PRODUCT_STRING => Some(PRODUCT_NAME_OVERRIDE),
            HOST_OPCODE_GET_VENDOR_STRING => Some(VENDOR_NAME_OVERRIDE),
            _ => None,
        };

        if let Some(name) = overridden {
            return Vst2EventResult {
                return_value: 1,
                payload: Vst2ResultPayload::String(name.to_owned()),
                value_payload: None,
            };
        }
    }

    // The io-changed callback also carries the plugin's updated description
    if event.opcode == HOST_OPCODE_IO_CHANGED {
        if let Vst2Payload::PluginInfo(updated_info) = &event.payload {
            *plugin_info.lock().unwrap_or_else(|e| e.into_inner()) = *updated_info;
        }
    }

    if MUTUALLY_RECURSIVE_CALLBACK_OPCODES.contains(&event.opcode) {
        mutual_recursion.handle(|| handler.host_callback(event))
    } else {
        handler.host_callback(event)
    }
}
