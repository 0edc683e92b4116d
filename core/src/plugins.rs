//! Tags for plugin formats and binary architectures.

use serde::{Deserialize, Serialize};

/// The plugin-format dialect a bridge speaks. The string form is used as the
/// worker's command line argument; the enum form travels inside
/// [`HostRequest`](crate::messages::HostRequest) for group workers.
///
/// `Unknown` is never used directly, but parsing an invalid worker argument
/// should produce an error message instead of a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginType {
    Vst2,
    Vst3,
    Clap,
    Unknown,
}

impl PluginType {
    pub fn from_string(plugin_type: &str) -> PluginType {
        match plugin_type {
            "vst2" => PluginType::Vst2,
            "vst3" => PluginType::Vst3,
            "clap" => PluginType::Clap,
            _ => PluginType::Unknown,
        }
    }

    pub fn as_string(&self) -> &'static str {
        match self {
            PluginType::Vst2 => "vst2",
            PluginType::Vst3 => "vst3",
            PluginType::Clap => "clap",
            PluginType::Unknown => "<unknown>",
        }
    }
}

impl std::fmt::Display for PluginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_string())
    }
}

/// Whether a plugin binary is 32-bit or 64-bit. Decides which worker binary
/// gets spawned, and is part of the group socket name so 32-bit and 64-bit
/// group workers with the same group name don't collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LibArchitecture {
    Lib32,
    Lib64,
}

impl LibArchitecture {
    pub fn as_string(&self) -> &'static str {
        match self {
            LibArchitecture::Lib32 => "x32",
            LibArchitecture::Lib64 => "x64",
        }
    }
}

impl std::fmt::Display for LibArchitecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_string())
    }
}
