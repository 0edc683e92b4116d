//! Messages for the COM-style multi-interface dialect.
//!
//! This format spreads its API over many reference-counted interfaces on a
//! shared object graph. On the wire none of that survives: every non-audio
//! method call becomes a variant on one combined control channel, keyed by
//! the instance id of the object it targets. The proxy records on either side
//! are transport, not objects; the message stream is the truth.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use super::{request_enum, ConstantMasks, InstanceId, ProcessLevel, TimeInfo, WantsConfiguration};
use crate::transport::shm::AudioShmBufferConfig;

/// The result codes the dialect's interfaces return. Kept as a wrapped `i32`
/// so unknown plugin-defined codes pass through unharmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vst3Result(pub i32);

impl Vst3Result {
    pub const OK: Vst3Result = Vst3Result(0);
    pub const FALSE: Vst3Result = Vst3Result(1);
    pub const INVALID_ARGUMENT: Vst3Result = Vst3Result(2);
    pub const NOT_IMPLEMENTED: Vst3Result = Vst3Result(3);
    /// The dialect's "operation issued in the wrong state" code.
    pub const INVALID_STATE: Vst3Result = Vst3Result(4);
    pub const INTERNAL_ERROR: Vst3Result = Vst3Result(5);

    pub fn is_ok(&self) -> bool {
        *self == Vst3Result::OK
    }
}

bitflags::bitflags! {
    /// Flags for the restart-component callback.
    #[derive(Serialize, Deserialize)]
    pub struct RestartFlags: u32 {
        const RELOAD_COMPONENT = 1 << 0;
        const IO_CHANGED = 1 << 1;
        const PARAM_VALUES_CHANGED = 1 << 2;
        const LATENCY_CHANGED = 1 << 3;
        const PARAM_TITLES_CHANGED = 1 << 4;
    }
}

/// A parameter's static description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vst3ParamInfo {
    pub param_id: u32,
    pub title: String,
    pub units: String,
    pub step_count: i32,
    pub default_normalized_value: f64,
    pub flags: i32,
}

/// A bus description, queried during setup so the native side can size the
/// shared audio buffers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vst3BusInfo {
    pub num_channels: u32,
    pub name: String,
    pub is_input: bool,
}

/// The processing setup agreed during activation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vst3ProcessSetup {
    pub sample_rate: f64,
    pub max_block_size: u32,
    pub double_precision: bool,
    pub realtime: bool,
}

/// A queue of sample-accurate changes for one parameter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vst3ParamQueue {
    pub param_id: u32,
    /// `(sample_offset, normalized_value)` pairs, sorted by offset.
    pub points: SmallVec<[(i32, f64); 4]>,
}

/// An event on the processing path. Fixed-size variants only, so event lists
/// stay inline in their vectors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Vst3Event {
    NoteOn { frame_offset: i32, channel: i16, pitch: i16, velocity: f32 },
    NoteOff { frame_offset: i32, channel: i16, pitch: i16, velocity: f32 },
    Midi { frame_offset: i32, data: [u8; 3] },
}

pub type Vst3ParamChanges = SmallVec<[Vst3ParamQueue; 4]>;
pub type Vst3EventList = SmallVec<[Vst3Event; 16]>;

// ---------------------------------------------------------------------------
// Control channel (native -> worker), multiplexing every non-audio method

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstance;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstanceResponse {
    pub result: Vst3Result,
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Initialize {
    pub instance_id: InstanceId,
    /// Whether the host passed a context object whose calls should be
    /// forwarded back. The worker mirrors it with a proxy either way; this
    /// only records its presence.
    pub has_host_context: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Terminate {
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Destroy {
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetComponentHandler {
    pub instance_id: InstanceId,
    pub handler_present: bool,
}

/// Connect two instances' connection points, by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectInstances {
    pub instance_id: InstanceId,
    pub other_instance_id: InstanceId,
}

/// A notification forwarded between connection points. The payload is the
/// format's opaque attribute blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConnection {
    pub instance_id: InstanceId,
    pub message_id: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetBusInfos {
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetActive {
    pub instance_id: InstanceId,
    pub active: bool,
    /// Present when activating; the worker sizes the shared audio buffer
    /// from it.
    pub setup: Option<Vst3ProcessSetup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetActiveResponse {
    pub result: Vst3Result,
    /// The shared buffer layout to map, when activating.
    pub shm_config: Option<AudioShmBufferConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetParameterCount {
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetParameterInfo {
    pub instance_id: InstanceId,
    pub index: i32,
}

/// Fetch every parameter description in one batch. The native proxy caches
/// the result and serves per-index queries from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetAllParameterInfos {
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetParamNormalized {
    pub instance_id: InstanceId,
    pub param_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetParamNormalized {
    pub instance_id: InstanceId,
    pub param_id: u32,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetState {
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetState {
    pub instance_id: InstanceId,
    pub chunk: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateView {
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachView {
    pub instance_id: InstanceId,
    /// The host's X11 window id.
    pub parent_window: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveView {
    pub instance_id: InstanceId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViewOnSize {
    pub instance_id: InstanceId,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetContentScaleFactor {
    pub instance_id: InstanceId,
    pub factor: f32,
}

request_enum! {
    /// The combined control channel: all non-audio interface methods,
    /// multiplexed.
    pub enum Vst3ControlRequest {
        CreateInstance(CreateInstance) => CreateInstanceResponse,
        Initialize(Initialize) => Vst3Result,
        Terminate(Terminate) => Vst3Result,
        Destroy(Destroy) => (),
        SetComponentHandler(SetComponentHandler) => Vst3Result,
        ConnectInstances(ConnectInstances) => Vst3Result,
        NotifyConnection(NotifyConnection) => Vst3Result,
        GetBusInfos(GetBusInfos) => Vec<Vst3BusInfo>,
        SetActive(SetActive) => SetActiveResponse,
        GetParameterCount(GetParameterCount) => i32,
        GetParameterInfo(GetParameterInfo) => Option<Vst3ParamInfo>,
        GetAllParameterInfos(GetAllParameterInfos) => Vec<Vst3ParamInfo>,
        GetParamNormalized(GetParamNormalized) => f64,
        SetParamNormalized(SetParamNormalized) => Vst3Result,
        GetState(GetState) => Option<Vec<u8>>,
        SetState(SetState) => Vst3Result,
        CreateView(CreateView) => Vst3Result,
        AttachView(AttachView) => Vst3Result,
        RemoveView(RemoveView) => Vst3Result,
        ViewOnSize(ViewOnSize) => Vst3Result,
        SetContentScaleFactor(SetContentScaleFactor) => Vst3Result,
    }
}

// ---------------------------------------------------------------------------
// Callback channel (worker -> native)

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BeginEdit {
    pub instance_id: InstanceId,
    pub param_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformEdit {
    pub instance_id: InstanceId,
    pub param_id: u32,
    pub value_normalized: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndEdit {
    pub instance_id: InstanceId,
    pub param_id: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartComponent {
    pub instance_id: InstanceId,
    pub flags: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestResize {
    pub instance_id: InstanceId,
    pub width: u32,
    pub height: u32,
}

/// A notification going plugin-to-host over a connection established with
/// [`ConnectInstances`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConnectionCallback {
    pub instance_id: InstanceId,
    pub message_id: String,
    pub payload: Vec<u8>,
}

request_enum! {
    /// The callback channel: calls on the host's objects, mirrored back.
    pub enum Vst3CallbackRequest {
        WantsConfiguration(WantsConfiguration),
        BeginEdit(BeginEdit) => Vst3Result,
        PerformEdit(PerformEdit) => Vst3Result,
        EndEdit(EndEdit) => Vst3Result,
        RestartComponent(RestartComponent) => Vst3Result,
        RequestResize(RequestResize) => Vst3Result,
        NotifyConnectionCallback(NotifyConnectionCallback) => Vst3Result,
    }
}

// ---------------------------------------------------------------------------
// Audio channel (one per instance)

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetProcessing {
    pub instance_id: InstanceId,
    pub processing: bool,
}

/// The per-block envelope. Samples live in the shared audio buffer; this
/// carries the prefetched context and the sample-accurate event queues.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Vst3ProcessRequest {
    pub instance_id: InstanceId,
    pub frames: u32,
    pub process_level: ProcessLevel,
    pub time_info: Option<TimeInfo>,
    pub input_param_changes: Vst3ParamChanges,
    pub input_events: Vst3EventList,
    /// Channel silence bitmasks per input bus.
    pub input_constant_masks: ConstantMasks,
    pub new_realtime_priority: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Vst3ProcessResponse {
    pub result: Vst3Result,
    pub output_param_changes: Vst3ParamChanges,
    pub output_events: Vst3EventList,
    /// Channel silence bitmasks per output bus.
    pub output_constant_masks: ConstantMasks,
}

impl Default for Vst3Result {
    fn default() -> Self {
        Vst3Result::OK
    }
}

request_enum! {
    /// The dedicated per-instance audio-thread channel.
    pub enum Vst3AudioRequest {
        SetProcessing(SetProcessing) => Vst3Result,
        Process(Vst3ProcessRequest) => Vst3ProcessResponse,
    }
}
