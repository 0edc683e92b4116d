//! The tagged message sets that travel over the channels.
//!
//! Every channel carries one request enum; each request type declares its
//! response type through the [`Request`](crate::transport::message::Request)
//! trait so the two sides cannot disagree about a reply's shape. The dialect
//! modules define the per-format sets; this module holds what every dialect
//! shares.
//!
//! All wire integers are fixed width. Workers may be 32-bit while the native
//! host is 64-bit, so nothing pointer-sized may appear in these types.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::config::Configuration;
use crate::plugins::PluginType;
use crate::transport::message::Request;

pub mod clap;
pub mod vst2;
pub mod vst3;

pub use crate::registry::InstanceId;

/// Define a channel's request enum: the variants, a `From` impl per payload
/// type, and (unless omitted for types shared between channels) the
/// `Request` impl tying the payload to its response type.
macro_rules! request_enum {
    ($(#[$meta:meta])* pub enum $name:ident {
        $($variant:ident($ty:ty) $(=> $response:ty)?,)*
    }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, ::serde::Serialize, ::serde::Deserialize)]
        pub enum $name {
            $($variant($ty),)*
        }

        $(
            impl From<$ty> for $name {
                fn from(request: $ty) -> Self {
                    $name::$variant(request)
                }
            }

            $(
                impl $crate::transport::message::Request for $ty {
                    type Response = $response;
                }
            )?
        )*
    };
}
pub(crate) use request_enum;

/// Sent by the worker right after it connects its callback (or control)
/// channel. The native side answers with the configuration, and warns the
/// user when the two build versions disagree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WantsConfiguration {
    /// The worker's build version, to detect a half-updated install.
    pub host_version: String,
}

impl Request for WantsConfiguration {
    type Response = Configuration;
}

/// Sent to a group worker's socket to ask it to host one more plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRequest {
    pub plugin_type: PluginType,
    pub plugin_path: String,
    pub endpoint_base_dir: String,
    pub parent_pid: u32,
}

/// A group worker's answer to [`HostRequest`]. The pid lets the native side
/// watch the worker while the sockets connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostResponse {
    pub pid: u32,
}

impl Request for HostRequest {
    type Response = HostResponse;
}

/// A snapshot of the host's transport, prefetched into the process request so
/// the plugin's mid-block queries are served without a callback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TimeInfo {
    pub sample_pos: f64,
    pub sample_rate: f64,
    pub tempo: f64,
    /// Musical position in quarter notes.
    pub ppq_pos: f64,
    /// Last bar start, in quarter notes.
    pub bar_start_pos: f64,
    pub cycle_start_pos: f64,
    pub cycle_end_pos: f64,
    pub time_sig_numerator: i32,
    pub time_sig_denominator: i32,
    pub playing: bool,
    pub recording: bool,
    pub cycle_active: bool,
}

/// What kind of thread and context a processing call happens in. Some plugins
/// ask for this mid-process, so it is prefetched alongside the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessLevel {
    #[default]
    Unknown,
    /// A user (GUI) thread.
    User,
    /// The realtime audio thread.
    Realtime,
    /// Offline rendering.
    Offline,
}

/// A plain three-byte MIDI event with a frame offset into the current block.
/// Sized so event lists stay inline in their `SmallVec` under normal load,
/// keeping the audio path allocation free.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiEvent {
    pub frame_offset: i32,
    pub data: [u8; 3],
}

/// The inline capacity covers every host that batches a realistic number of
/// events per block; only pathological bursts spill to the heap.
pub type MidiEventList = SmallVec<[MidiEvent; 32]>;

/// Per-bus channel bitmasks marking constant (silent) channels, mirrored on
/// both sides of a process call.
pub type ConstantMasks = SmallVec<[u64; 8]>;
