//! Messages for the C-vtable dialect with extension queries.
//!
//! This format's plugin object is one vtable plus a set of optionally
//! implemented extension vtables queried by id. After initialization the
//! worker reports which extensions the loaded plugin advertises as a bitset;
//! the native proxy answers extension queries for everything else locally
//! without a round trip.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::{request_enum, ConstantMasks, InstanceId, ProcessLevel, TimeInfo, WantsConfiguration};
use crate::transport::shm::AudioShmBufferConfig;

bitflags::bitflags! {
    /// The extensions a loaded plugin advertises. Queries for anything not in
    /// the set are rejected on the native side.
    #[derive(Default, Serialize, Deserialize)]
    pub struct SupportedExtensions: u32 {
        const AUDIO_PORTS = 1 << 0;
        const NOTE_PORTS = 1 << 1;
        const PARAMS = 1 << 2;
        const STATE = 1 << 3;
        const LATENCY = 1 << 4;
        const GUI = 1 << 5;
        const RENDER = 1 << 6;
        const TAIL = 1 << 7;
    }
}

/// A parameter's static description. The full list is fetched in one batch on
/// the first query and cached on the native proxy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClapParamInfo {
    pub param_id: u32,
    pub name: String,
    pub module: String,
    pub min_value: f64,
    pub max_value: f64,
    pub default_value: f64,
    pub flags: u32,
}

/// An audio port (bus) description.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClapAudioPortInfo {
    pub id: u32,
    pub name: String,
    pub num_channels: u32,
    pub is_input: bool,
}

/// An event on the processing path. Fixed-size variants only so the event
/// lists stay inline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ClapEvent {
    NoteOn { frame_offset: u32, channel: i16, key: i16, velocity: f64 },
    NoteOff { frame_offset: u32, channel: i16, key: i16, velocity: f64 },
    ParamValue { frame_offset: u32, param_id: u32, value: f64 },
    Midi { frame_offset: u32, data: [u8; 3] },
}

pub type ClapEventList = SmallVec<[ClapEvent; 16]>;

/// The plugin's processing verdict for a block.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClapProcessStatus {
    Error,
    #[default]
    Continue,
    ContinueIfNotQuiet,
    Tail,
    Sleep,
}

// ---------------------------------------------------------------------------
// Main-thread control channel (native -> worker)

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstance;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstanceResponse {
    /// `None` when the worker could not instantiate the plugin.
    pub instance_id: Option<InstanceId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitInstance {
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitInstanceResponse {
    pub success: bool,
    /// Which extensions the plugin turned out to implement. Determined once
    /// the plugin finished its init.
    pub supported_extensions: SupportedExtensions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestroyInstance {
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activate {
    pub instance_id: InstanceId,
    pub sample_rate: f64,
    pub min_block_size: u32,
    pub max_block_size: u32,
    pub double_precision: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivateResponse {
    pub success: bool,
    /// The shared buffer layout the native side should map. Reused when a
    /// reactivation doesn't change the size.
    pub shm_config: Option<AudioShmBufferConfig>,
    pub latency_samples: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deactivate {
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetAudioPorts {
    pub instance_id: InstanceId,
}

/// Fetch all parameter descriptions in one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetParamInfos {
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetParamValue {
    pub instance_id: InstanceId,
    pub param_id: u32,
}

/// Flush parameter changes outside of processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamsFlush {
    pub instance_id: InstanceId,
    pub input_events: ClapEventList,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveState {
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadState {
    pub instance_id: InstanceId,
    pub chunk: Vec<u8>,
}

/// Run the plugin's queued main-thread callback (the worker side requested it
/// earlier through [`RequestCallback`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnMainThread {
    pub instance_id: InstanceId,
}

request_enum! {
    /// The main-thread control channel.
    pub enum ClapControlRequest {
        CreateInstance(CreateInstance) => CreateInstanceResponse,
        InitInstance(InitInstance) => InitInstanceResponse,
        DestroyInstance(DestroyInstance) => (),
        Activate(Activate) => ActivateResponse,
        Deactivate(Deactivate) => (),
        GetAudioPorts(GetAudioPorts) => Vec<ClapAudioPortInfo>,
        GetParamInfos(GetParamInfos) => Vec<ClapParamInfo>,
        GetParamValue(GetParamValue) => Option<f64>,
        ParamsFlush(ParamsFlush) => ClapEventList,
        SaveState(SaveState) => Option<Vec<u8>>,
        LoadState(LoadState) => bool,
        OnMainThread(OnMainThread) => (),
    }
}

// ---------------------------------------------------------------------------
// Main-thread callback channel (worker -> native)

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRestart {
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestProcess {
    pub instance_id: InstanceId,
}

/// The plugin wants its main-thread callback to run. Queued on the native
/// proxy and answered later with [`OnMainThread`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestCallback {
    pub instance_id: InstanceId,
}

/// The plugin changed its parameter list or values; the native proxy drops
/// its cached parameter infos.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamsRescan {
    pub instance_id: InstanceId,
    pub flags: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyChanged {
    pub instance_id: InstanceId,
}

/// A log line emitted through the host's log extension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub instance_id: InstanceId,
    pub severity: u32,
    pub message: String,
}

request_enum! {
    /// The main-thread callback channel. The configuration handshake is the
    /// first message after connecting.
    pub enum ClapCallbackRequest {
        WantsConfiguration(WantsConfiguration),
        RequestRestart(RequestRestart) => (),
        RequestProcess(RequestProcess) => (),
        RequestCallback(RequestCallback) => (),
        ParamsRescan(ParamsRescan) => (),
        LatencyChanged(LatencyChanged) => (),
        LogMessage(LogMessage) => (),
    }
}

// ---------------------------------------------------------------------------
// Audio channel (one per instance)

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartProcessing {
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopProcessing {
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetInstance {
    pub instance_id: InstanceId,
}

/// The per-block envelope. Samples live in the shared audio buffer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClapProcessRequest {
    pub instance_id: InstanceId,
    pub frames: u32,
    pub steady_time: i64,
    pub process_level: ProcessLevel,
    pub time_info: Option<TimeInfo>,
    pub input_events: ClapEventList,
    /// Channel silence bitmasks per input port.
    pub input_constant_masks: ConstantMasks,
    pub new_realtime_priority: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClapProcessResponse {
    pub status: ClapProcessStatus,
    pub output_events: ClapEventList,
    /// Channel silence bitmasks per output port.
    pub output_constant_masks: ConstantMasks,
}

request_enum! {
    /// The dedicated per-instance audio-thread channel.
    pub enum ClapAudioRequest {
        StartProcessing(StartProcessing) => bool,
        StopProcessing(StopProcessing) => (),
        ResetInstance(ResetInstance) => (),
        Process(ClapProcessRequest) => ClapProcessResponse,
    }
}
