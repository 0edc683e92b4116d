//! Messages for the simple C callback dialect.
//!
//! The whole control surface of this format is two functions: a host-driven
//! dispatcher taking an opcode plus an untyped data pointer, and a
//! plugin-driven host callback with the same shape. On the wire the data
//! pointer becomes a typed payload variant; the receiving side reconstructs
//! whatever the opcode expects, calls the real function, and serializes the
//! result back the same way.

use serde::{Deserialize, Serialize};

use super::{request_enum, MidiEventList, TimeInfo, WantsConfiguration};
use crate::transport::message::Request;
use crate::transport::shm::AudioShmBufferConfig;

// The dispatcher opcodes the bridge has to understand itself (to hook
// lifecycle, editor and buffer management). Every other opcode passes through
// untouched.
pub const OPCODE_OPEN: i32 = 0;
pub const OPCODE_CLOSE: i32 = 1;
pub const OPCODE_SET_SAMPLE_RATE: i32 = 10;
pub const OPCODE_SET_BLOCK_SIZE: i32 = 11;
pub const OPCODE_MAINS_CHANGED: i32 = 12;
pub const OPCODE_EDIT_GET_RECT: i32 = 13;
pub const OPCODE_EDIT_OPEN: i32 = 14;
pub const OPCODE_EDIT_CLOSE: i32 = 15;
pub const OPCODE_EDIT_IDLE: i32 = 19;
pub const OPCODE_GET_CHUNK: i32 = 23;
pub const OPCODE_SET_CHUNK: i32 = 24;
pub const OPCODE_PROCESS_EVENTS: i32 = 25;
pub const OPCODE_GET_EFFECT_NAME: i32 = 45;
pub const OPCODE_GET_VENDOR_STRING: i32 = 47;
pub const OPCODE_GET_PRODUCT_STRING: i32 = 48;
pub const OPCODE_SET_PROCESS_PRECISION: i32 = 77;

// The host callback opcodes with bridge-side handling.
pub const HOST_OPCODE_AUTOMATE: i32 = 0;
pub const HOST_OPCODE_VERSION: i32 = 1;
pub const HOST_OPCODE_IO_CHANGED: i32 = 13;
pub const HOST_OPCODE_GET_TIME: i32 = 7;
pub const HOST_OPCODE_GET_CURRENT_PROCESS_LEVEL: i32 = 23;
pub const HOST_OPCODE_GET_PRODUCT_STRING: i32 = 33;
pub const HOST_OPCODE_GET_VENDOR_STRING: i32 = 32;
pub const HOST_OPCODE_SIZE_WINDOW: i32 = 15;

/// The static description of a loaded plugin: parameter, port and flag
/// counts the native shim mirrors to the host. Sent once after loading, and
/// again when the plugin updates itself mid-session through the io-changed
/// callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vst2PluginInfo {
    pub num_params: i32,
    pub num_inputs: i32,
    pub num_outputs: i32,
    pub flags: i32,
    pub initial_delay: i32,
    pub unique_id: i32,
    pub version: i32,
}

/// An editor rectangle, for the get-rect dispatcher call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vst2Rect {
    pub top: i16,
    pub left: i16,
    pub bottom: i16,
    pub right: i16,
}

/// The serializable stand-in for the dispatcher's untyped data argument.
///
/// The `Wants*` markers don't carry data; they tell the receiving side what
/// the caller expects to be written back so the matching
/// [`Vst2ResultPayload`] can be produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Vst2Payload {
    None,
    /// A null-terminated string argument.
    String(String),
    /// Opaque state data for the set-chunk call.
    Chunk(Vec<u8>),
    /// A batch of MIDI events for the process-events call.
    Events(MidiEventList),
    /// The X11 window id the editor should embed itself into.
    WindowHandle(u64),
    /// An updated plugin description pushed through the io-changed callback.
    PluginInfo(Vst2PluginInfo),
    /// The caller expects state data back (get-chunk).
    WantsChunkBuffer,
    /// The caller expects an editor rectangle back (edit-get-rect).
    WantsRect,
    /// The caller expects a transport snapshot back (get-time).
    WantsTimeInfo,
    /// The caller expects a string back (name and vendor queries).
    WantsString,
    /// The caller expects a fresh plugin description back.
    WantsPluginInfo,
    /// The caller expects the shared audio buffer configuration back. Issued
    /// by the native side after activation (mains-changed).
    WantsAudioShmBufferConfig,
}

/// What the dispatcher or host callback wrote back through its data pointer,
/// plus its plain return value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Vst2ResultPayload {
    None,
    String(String),
    Chunk(Vec<u8>),
    Rect(Vst2Rect),
    TimeInfo(Option<TimeInfo>),
    PluginInfo(Vst2PluginInfo),
    AudioShmBufferConfig(AudioShmBufferConfig),
}

/// One dispatcher or host-callback invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vst2Event {
    pub opcode: i32,
    pub index: i32,
    pub value: i64,
    pub option: f32,
    pub payload: Vst2Payload,
    /// Two speaker-arrangement opcodes also pass a payload through the value
    /// argument.
    pub value_payload: Option<Vst2Payload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vst2EventResult {
    pub return_value: i64,
    pub payload: Vst2ResultPayload,
    pub value_payload: Option<Vst2ResultPayload>,
}

impl Request for Vst2Event {
    type Response = Vst2EventResult;
}

/// Parameter reads and writes share one plain channel; they're simple enough
/// to not need the ad-hoc machinery.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Vst2ParameterRequest {
    Get { index: i32 },
    Set { index: i32, value: f32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Vst2ParameterResponse {
    /// The parameter's value for a get, `None` for a set.
    pub value: Option<f32>,
}

impl Request for Vst2ParameterRequest {
    type Response = Vst2ParameterResponse;
}

/// The per-block processing envelope. Samples travel through the shared
/// audio buffer; this only carries the prefetched context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vst2ProcessRequest {
    pub frames: u32,
    pub double_precision: bool,
    pub time_info: Option<TimeInfo>,
    pub process_level: super::ProcessLevel,
    /// Set when the host's audio thread priority should be copied onto the
    /// worker's audio thread this block.
    pub new_realtime_priority: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vst2ProcessResponse {
    /// MIDI events the plugin emitted during the block.
    pub output_events: MidiEventList,
}

impl Request for Vst2ProcessRequest {
    type Response = Vst2ProcessResponse;
}

request_enum! {
    /// Everything the native side sends over the dispatch channel.
    pub enum Vst2DispatchRequest {
        Event(Vst2Event),
    }
}

request_enum! {
    /// Everything the worker sends over the host-callback channel. The
    /// configuration handshake is the first message after connecting.
    pub enum Vst2CallbackRequest {
        WantsConfiguration(WantsConfiguration),
        Callback(Vst2Callback) => Vst2EventResult,
    }
}

/// A host callback forwarded from the plugin. Same shape as [`Vst2Event`],
/// wrapped so the two directions stay distinct types on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vst2Callback(pub Vst2Event);

/// Pushed by the worker over the control channel once the plugin has loaded,
/// so the native shim can mirror the plugin's description to its host. The
/// control channel's configuration handshake precedes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Vst2ControlMessage {
    PluginLoaded(Vst2PluginInfo),
}
