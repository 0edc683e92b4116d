//! The native side of the bridge: everything the plugin shim loaded by the
//! host instantiates. One bridge per plugin load; the bridge owns the socket
//! set and (by contract) the foreign instance living in the worker process.

use std::error::Error;
use std::path::{Path, PathBuf};

use plugbridge_core::{LibArchitecture, PluginType, TransportError};

pub mod bridge;
pub mod clap;
pub mod host_process;
pub mod vst2;
pub mod vst3;

pub use bridge::PluginBridgeOptions;
pub use clap::{ClapPluginBridge, ClapPluginProxy};
pub use vst2::Vst2PluginBridge;
pub use vst3::{Vst3PluginBridge, Vst3PluginProxy};

/// Information about the plugin a bridge is hosting.
#[derive(Debug, Clone)]
pub struct PluginInfo {
    pub plugin_type: PluginType,
    /// The native shim library the host actually loaded. Only used for log
    /// and notification context.
    pub native_library_path: PathBuf,
    /// The foreign plugin binary the worker should load.
    pub plugin_path: PathBuf,
    /// Decides which worker binary gets spawned. Sniffing this out of the
    /// plugin binary is the shim's job.
    pub plugin_arch: LibArchitecture,
    /// The foreign-side prefix directory the plugin runs under. Group socket
    /// names hash this so plugins from different prefixes never share a
    /// worker.
    pub prefix_path: PathBuf,
}

impl PluginInfo {
    pub fn new(plugin_type: PluginType, plugin_path: impl Into<PathBuf>) -> Self {
        let plugin_path = plugin_path.into();

        let prefix_path = std::env::var("WINEPREFIX").map(PathBuf::from).unwrap_or_else(|_| {
            dirs::home_dir().unwrap_or_else(|| PathBuf::from("/")).join(".wine")
        });

        Self {
            plugin_type,
            native_library_path: plugin_path.clone(),
            plugin_path,
            plugin_arch: LibArchitecture::Lib64,
            prefix_path,
        }
    }

    pub fn with_arch(mut self, arch: LibArchitecture) -> Self {
        self.plugin_arch = arch;
        self
    }

    pub fn with_native_library_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.native_library_path = path.into();
        self
    }

    /// The plugin's file name, used in the endpoint directory name.
    pub fn plugin_name(&self) -> String {
        self.plugin_path
            .file_stem()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| String::from("plugin"))
    }
}

/// Why a plugin failed to load on the native side.
#[derive(Debug)]
pub enum PluginLoadError {
    /// The worker binary could not be spawned.
    SpawnFailed(std::io::Error),
    /// The worker exited before the sockets connected, usually because it
    /// could not locate or load the foreign plugin.
    WorkerExited,
    /// No group worker could be reached or started.
    GroupUnavailable(String),
    /// A socket operation failed during startup.
    Transport(TransportError),
    /// The worker connected but reported a load failure.
    LoadFailed(String),
}

impl Error for PluginLoadError {}

impl std::fmt::Display for PluginLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PluginLoadError::SpawnFailed(e) => {
                write!(f, "could not spawn the plugin host process: {}", e)
            }
            PluginLoadError::WorkerExited => {
                write!(
                    f,
                    "the plugin host process has exited unexpectedly, check the log for more \
                     information"
                )
            }
            PluginLoadError::GroupUnavailable(e) => {
                write!(f, "could not connect to or start a group host process: {}", e)
            }
            PluginLoadError::Transport(e) => {
                write!(f, "socket failure while starting the plugin: {}", e)
            }
            PluginLoadError::LoadFailed(e) => {
                write!(f, "the host process could not load the plugin: {}", e)
            }
        }
    }
}

impl From<TransportError> for PluginLoadError {
    fn from(e: TransportError) -> Self {
        PluginLoadError::Transport(e)
    }
}

/// Resolve the worker binary for a plugin architecture. Looks next to the
/// shim library itself first, then falls back to `$PATH`. The
/// `PLUGBRIDGE_HOST_BINARY` environment variable overrides the search, which
/// the tests also rely on.
pub fn find_host_binary(arch: LibArchitecture) -> PathBuf {
    if let Ok(overridden) = std::env::var("PLUGBRIDGE_HOST_BINARY") {
        if !overridden.is_empty() {
            return PathBuf::from(overridden);
        }
    }

    let binary_name = match arch {
        LibArchitecture::Lib64 => "plugbridge-host",
        LibArchitecture::Lib32 => "plugbridge-host-32",
    };

    if let Ok(current_exe) = std::env::current_exe() {
        if let Some(dir) = current_exe.parent() {
            let candidate = dir.join(binary_name);
            if candidate.exists() {
                return candidate;
            }
        }
    }

    PathBuf::from(binary_name)
}

/// The deterministic group socket path for `(group name, prefix, arch)`,
/// `<temp_root>/plugbridge-group-<name>-<prefix_hash>-<arch>.sock`. The
/// prefix path is hashed so plugins from different prefixes get different
/// group workers without encoding the whole path into the file name.
pub fn group_socket_path(group_name: &str, prefix_path: &Path, arch: LibArchitecture) -> PathBuf {
    use std::hash::{Hash, Hasher};

    // Fnv is stable across builds and processes, unlike the std hasher
    let mut hasher = fnv::FnvHasher::default();
    prefix_path.hash(&mut hasher);
    let prefix_hash = hasher.finish();

    plugbridge_core::utils::get_temporary_directory().join(format!(
        "{}-group-{}-{:x}-{}.sock",
        plugbridge_core::utils::ENDPOINT_PREFIX,
        group_name,
        prefix_hash,
        arch
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_socket_paths_are_deterministic() {
        let a = group_socket_path("g1", Path::new("/home/user/.wine"), LibArchitecture::Lib64);
        let b = group_socket_path("g1", Path::new("/home/user/.wine"), LibArchitecture::Lib64);
        assert_eq!(a, b);

        let other_prefix =
            group_socket_path("g1", Path::new("/home/user/.wine-other"), LibArchitecture::Lib64);
        assert_ne!(a, other_prefix);

        let other_arch =
            group_socket_path("g1", Path::new("/home/user/.wine"), LibArchitecture::Lib32);
        assert_ne!(a, other_arch);

        let name = a.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("plugbridge-group-g1-"));
        assert!(name.ends_with("-x64.sock"));
    }
}
