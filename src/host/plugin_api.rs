//! The contract between the worker and the foreign plugin binaries it loads.
//!
//! The actual plugin-format C vtables are not this crate's business; the
//! worker drives loaded plugins through these traits. A bridgeable plugin
//! library exports a single entry-point symbol per dialect that hands back a
//! boxed trait object; the tests skip the loading step entirely and inject
//! implementations directly.

use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use plugbridge_core::messages::clap::{
    ClapAudioPortInfo, ClapEvent, ClapEventList, ClapParamInfo, ClapProcessStatus,
    SupportedExtensions,
};
use plugbridge_core::messages::vst2::{Vst2Event, Vst2EventResult, Vst2PluginInfo};
use plugbridge_core::messages::vst3::{
    Vst3BusInfo, Vst3ParamInfo, Vst3ProcessSetup, Vst3Result,
};
use plugbridge_core::messages::ConstantMasks;
use plugbridge_core::transport::shm::AudioShmBuffer;

pub const VST2_ENTRY_SYMBOL: &[u8] = b"plugbridge_vst2_entry";
pub const VST3_ENTRY_SYMBOL: &[u8] = b"plugbridge_vst3_entry";
pub const CLAP_ENTRY_SYMBOL: &[u8] = b"plugbridge_clap_entry";

#[derive(Debug)]
pub enum PluginApiError {
    LibraryLoad(String),
    MissingEntryPoint(String),
    EntryPointFailed,
}

impl Error for PluginApiError {}

impl std::fmt::Display for PluginApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginApiError::LibraryLoad(e) => write!(f, "could not load the plugin library: {}", e),
            PluginApiError::MissingEntryPoint(symbol) => {
                write!(f, "the plugin library does not export '{}'", symbol)
            }
            PluginApiError::EntryPointFailed => {
                write!(f, "the plugin library's entry point returned a null plugin")
            }
        }
    }
}

/// Read-only/write-only views into a shared audio buffer's channel planes
/// for one block. Handed to the plugin's process function so no per-block
/// channel pointer tables need to be built.
pub struct ProcessAudio<'a> {
    buffer: &'a AudioShmBuffer,
    frames: usize,
}

impl<'a> ProcessAudio<'a> {
    pub fn new(buffer: &'a AudioShmBuffer, frames: usize) -> Self {
        Self { buffer, frames }
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn num_input_buses(&self) -> usize {
        self.buffer.config().input_offsets.len()
    }

    pub fn num_input_channels(&self, bus: usize) -> usize {
        self.buffer.config().input_offsets[bus].len()
    }

    pub fn num_output_buses(&self) -> usize {
        self.buffer.config().output_offsets.len()
    }

    pub fn num_output_channels(&self, bus: usize) -> usize {
        self.buffer.config().output_offsets[bus].len()
    }

    pub fn input_channel(&self, bus: usize, channel: usize) -> &[f32] {
        // Within a block the peer only reads the output planes, so handing
        // out disjoint input/output slices is sound
        unsafe { &self.buffer.input_channel::<f32>(bus, channel)[..self.frames] }
    }

    pub fn output_channel(&self, bus: usize, channel: usize) -> &mut [f32] {
        unsafe { &mut self.buffer.output_channel::<f32>(bus, channel)[..self.frames] }
    }

    pub fn input_channel_f64(&self, bus: usize, channel: usize) -> &[f64] {
        unsafe { &self.buffer.input_channel::<f64>(bus, channel)[..self.frames] }
    }

    pub fn output_channel_f64(&self, bus: usize, channel: usize) -> &mut [f64] {
        unsafe { &mut self.buffer.output_channel::<f64>(bus, channel)[..self.frames] }
    }
}

// ---------------------------------------------------------------------------
// Simple C callback dialect

/// The host-callback half of the simple C dialect, implemented by the bridge
/// and handed to the plugin at load time.
pub trait Vst2HostCallback: Send + Sync {
    fn host_callback(&self, event: &Vst2Event) -> Vst2EventResult;
}

/// A loaded plugin speaking the simple C callback dialect. One instance per
/// loaded library.
pub trait Vst2Plugin: Send {
    /// The static description mirrored to the native host.
    fn info(&self) -> Vst2PluginInfo;

    /// Called once right after loading, before anything else.
    fn set_host_callback(&mut self, _host: Arc<dyn Vst2HostCallback>) {}

    /// The single dispatcher entry point.
    fn dispatch(&mut self, event: &Vst2Event) -> Vst2EventResult;

    fn get_parameter(&mut self, index: i32) -> f32;
    fn set_parameter(&mut self, index: i32, value: f32);

    /// Process one block, returning any MIDI events produced.
    fn process_f32(
        &mut self,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        frames: usize,
    ) -> plugbridge_core::messages::MidiEventList;

    fn process_f64(
        &mut self,
        _inputs: &[&[f64]],
        _outputs: &mut [&mut [f64]],
        _frames: usize,
    ) -> plugbridge_core::messages::MidiEventList {
        plugbridge_core::messages::MidiEventList::new()
    }
}

// ---------------------------------------------------------------------------
// COM-style dialect

/// The host-object half of the COM-style dialect: the bridge's proxy for the
/// native host's component handler and friends.
pub trait Vst3Host: Send + Sync {
    fn begin_edit(&self, param_id: u32) -> Vst3Result;
    fn perform_edit(&self, param_id: u32, value_normalized: f64) -> Vst3Result;
    fn end_edit(&self, param_id: u32) -> Vst3Result;
    fn restart_component(&self, flags: u32) -> Vst3Result;
    fn request_resize(&self, width: u32, height: u32) -> Vst3Result;
    fn notify(&self, message_id: &str, payload: &[u8]) -> Vst3Result;
}

/// One loaded plugin instance of the COM-style dialect.
pub trait Vst3Plugin: Send {
    fn initialize(&mut self, host: Option<Arc<dyn Vst3Host>>) -> Vst3Result;
    fn terminate(&mut self) -> Vst3Result;

    fn set_component_handler(&mut self, _handler: Option<Arc<dyn Vst3Host>>) -> Vst3Result {
        Vst3Result::OK
    }

    /// A notification from a connected instance.
    fn notify(&mut self, _message_id: &str, _payload: &[u8]) -> Vst3Result {
        Vst3Result::NOT_IMPLEMENTED
    }

    fn bus_infos(&self) -> Vec<Vst3BusInfo>;

    fn set_active(&mut self, active: bool, setup: Option<&Vst3ProcessSetup>) -> Vst3Result;

    fn parameter_count(&self) -> i32;
    fn parameter_infos(&self) -> Vec<Vst3ParamInfo>;
    fn get_param_normalized(&self, param_id: u32) -> f64;
    fn set_param_normalized(&mut self, param_id: u32, value: f64) -> Vst3Result;

    fn get_state(&mut self) -> Option<Vec<u8>>;
    fn set_state(&mut self, chunk: &[u8]) -> Vst3Result;

    fn create_view(&mut self) -> Vst3Result {
        Vst3Result::NOT_IMPLEMENTED
    }
    fn attach_view(&mut self, _parent_window: u64) -> Vst3Result {
        Vst3Result::NOT_IMPLEMENTED
    }
    fn remove_view(&mut self) -> Vst3Result {
        Vst3Result::NOT_IMPLEMENTED
    }
    fn view_on_size(&mut self, _width: u32, _height: u32) -> Vst3Result {
        Vst3Result::NOT_IMPLEMENTED
    }
    fn set_content_scale_factor(&mut self, _factor: f32) -> Vst3Result {
        Vst3Result::NOT_IMPLEMENTED
    }

    fn set_processing(&mut self, processing: bool) -> Vst3Result;

    /// Process one block. Inputs and outputs live in `audio`; events and
    /// parameter changes in `request`.
    fn process(
        &mut self,
        audio: &ProcessAudio<'_>,
        request: &plugbridge_core::messages::vst3::Vst3ProcessRequest,
    ) -> plugbridge_core::messages::vst3::Vst3ProcessResponse;
}

/// Creates instances of a COM-style plugin. One factory per loaded library.
pub trait Vst3PluginFactory: Send {
    fn create_instance(&mut self) -> Option<Box<dyn Vst3Plugin>>;
}

// ---------------------------------------------------------------------------
// C-vtable dialect

/// The host half of the C-vtable dialect, implemented by the bridge and
/// handed to each instance.
pub trait ClapHost: Send + Sync {
    fn request_restart(&self);
    fn request_process(&self);
    fn request_callback(&self);
    fn params_rescan(&self, flags: u32);
    fn latency_changed(&self);
    fn log(&self, severity: u32, message: &str);
}

/// What a C-vtable plugin's process call produced.
#[derive(Debug, Clone, Default)]
pub struct ClapProcessResult {
    pub status: ClapProcessStatus,
    pub output_events: ClapEventList,
    pub output_constant_masks: ConstantMasks,
}

/// One loaded plugin instance of the C-vtable dialect.
pub trait ClapPlugin: Send {
    fn init(&mut self) -> bool;

    /// Which extensions this plugin implements. Queried once after a
    /// successful init and reported to the native side as a bitset.
    fn supported_extensions(&self) -> SupportedExtensions;

    fn audio_ports(&self) -> Vec<ClapAudioPortInfo>;

    fn param_infos(&self) -> Vec<ClapParamInfo>;
    fn param_value(&self, param_id: u32) -> Option<f64>;
    fn params_flush(&mut self, _input_events: &[ClapEvent]) -> ClapEventList {
        ClapEventList::new()
    }

    fn save_state(&mut self) -> Option<Vec<u8>> {
        None
    }
    fn load_state(&mut self, _chunk: &[u8]) -> bool {
        false
    }

    /// Returns the plugin's latency in samples on success.
    fn activate(&mut self, sample_rate: f64, min_block_size: u32, max_block_size: u32)
        -> Result<u32, String>;
    fn deactivate(&mut self);

    fn start_processing(&mut self) -> bool {
        true
    }
    fn stop_processing(&mut self) {}
    fn reset(&mut self) {}

    fn process(
        &mut self,
        audio: &ProcessAudio<'_>,
        request: &plugbridge_core::messages::clap::ClapProcessRequest,
    ) -> ClapProcessResult;

    /// The main-thread callback the plugin asked for earlier through
    /// [`ClapHost::request_callback`].
    fn on_main_thread(&mut self) {}
}

/// Creates instances of a C-vtable plugin. One factory per loaded library.
pub trait ClapPluginFactory: Send {
    fn create_instance(&mut self, host: Arc<dyn ClapHost>) -> Option<Box<dyn ClapPlugin>>;
}

// ---------------------------------------------------------------------------
// Loading

/// A plugin library together with the entry object it produced. The library
/// handle is kept alive for as long as anything from it is.
pub struct LoadedLibrary<T: ?Sized> {
    pub entry: Box<T>,
    _library: libloading::Library,
}

impl<T: ?Sized> LoadedLibrary<T> {
    /// Split into the entry object and the library handle. The caller is
    /// responsible for keeping the library alive for as long as the entry
    /// object is.
    pub fn into_parts(self) -> (Box<T>, libloading::Library) {
        (self.entry, self._library)
    }
}

macro_rules! entry_loader {
    ($fn_name:ident, $symbol:expr, $entry:ty) => {
        /// Load a plugin library and call its entry point.
        pub fn $fn_name(path: &Path) -> Result<LoadedLibrary<$entry>, PluginApiError> {
            unsafe {
                let library = libloading::Library::new(path)
                    .map_err(|e| PluginApiError::LibraryLoad(e.to_string()))?;

                let entry_fn: libloading::Symbol<unsafe extern "C" fn() -> *mut $entry> = library
                    .get($symbol)
                    .map_err(|_| {
                        PluginApiError::MissingEntryPoint(
                            String::from_utf8_lossy($symbol).into_owned(),
                        )
                    })?;

                let raw = entry_fn();
                if raw.is_null() {
                    return Err(PluginApiError::EntryPointFailed);
                }

                Ok(LoadedLibrary { entry: Box::from_raw(raw), _library: library })
            }
        }
    };
}

entry_loader!(load_vst2_plugin, VST2_ENTRY_SYMBOL, Box<dyn Vst2Plugin>);
entry_loader!(load_vst3_factory, VST3_ENTRY_SYMBOL, Box<dyn Vst3PluginFactory>);
entry_loader!(load_clap_factory, CLAP_ENTRY_SYMBOL, Box<dyn ClapPluginFactory>);
