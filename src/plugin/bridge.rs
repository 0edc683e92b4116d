//! Startup plumbing shared by the native dialect bridges: spawning the
//! worker, connecting the sockets under a watchdog, and the startup
//! diagnostics.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use plugbridge_core::utils::{
    get_memlock_limit, get_rttime_limit, send_notification, TimedValueCache,
};
use plugbridge_core::{Configuration, TransportError};

use super::host_process::HostProcess;
use super::{PluginInfo, PluginLoadError};

/// How often the startup watchdog polls the worker while waiting for the
/// sockets to connect.
const WATCHDOG_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Plugins with lots of channels need to lock a fair amount of shared memory
/// for their audio buffers. Warn below this limit instead of failing later
/// with a confusing mapping error.
const MEMLOCK_MIN_SAFE_THRESHOLD: u64 = 256 << 20;

/// A low realtime CPU time limit can get the worker killed while a slow
/// plugin initializes. Warn below this (in microseconds).
const RTTIME_MIN_SAFE_THRESHOLD: u64 = 30_000_000;

/// Everything a dialect bridge needs to get going. The shim that loads the
/// configuration file and sniffs the plugin binary fills this in; the tests
/// construct it directly.
pub struct PluginBridgeOptions {
    pub config: Configuration,
    pub info: PluginInfo,
}

/// Synchronizes the host's audio thread priority onto the worker roughly
/// every ten seconds. The native audio thread samples its own priority and
/// piggybacks it onto a process request when the cache has expired.
pub struct RealtimePrioritySync {
    synced: TimedValueCache<()>,
}

impl Default for RealtimePrioritySync {
    fn default() -> Self {
        Self::new()
    }
}

impl RealtimePrioritySync {
    pub fn new() -> Self {
        Self { synced: TimedValueCache::new() }
    }

    /// The priority to piggyback onto this block's process request, if it is
    /// time to synchronize again.
    pub fn priority_to_send(&self) -> Option<i32> {
        if self.synced.get().is_some() {
            return None;
        }

        self.synced
            .set((), plugbridge_core::utils::AUDIO_THREAD_PRIORITY_SYNC_INTERVAL);
        plugbridge_core::utils::get_realtime_priority()
    }
}

/// Connect the socket set while a watchdog polls the worker process. When
/// the worker dies before the sockets come up (it could not load the plugin,
/// or the runtime is broken), the watchdog closes the sockets, which makes
/// the pending accept fail, and the whole load errors out instead of hanging
/// forever.
pub fn connect_sockets_guarded(
    info: &PluginInfo,
    host_process: &Mutex<Box<dyn HostProcess>>,
    connect: impl FnOnce() -> Result<(), TransportError>,
    close: impl Fn() + Send + Sync,
) -> Result<(), PluginLoadError> {
    let connected = Arc::new(AtomicBool::new(false));
    let worker_died = Arc::new(AtomicBool::new(false));

    let result = std::thread::scope(|scope| {
        let watchdog = {
            let connected = Arc::clone(&connected);
            let worker_died = Arc::clone(&worker_died);
            let close = &close;

            scope.spawn(move || {
                while !connected.load(Ordering::SeqCst) {
                    let running = {
                        let mut host_process =
                            host_process.lock().unwrap_or_else(|e| e.into_inner());
                        host_process.running()
                    };

                    if !running {
                        worker_died.store(true, Ordering::SeqCst);
                        close();
                        return;
                    }

                    std::thread::sleep(WATCHDOG_POLL_INTERVAL);
                }
            })
        };

        let result = connect();
        connected.store(true, Ordering::SeqCst);
        let _ = watchdog.join();

        result
    });

    if worker_died.load(Ordering::SeqCst) {
        log::error!(
            "The plugin host process has exited unexpectedly. Check the output above for more \
             information."
        );
        send_notification(
            "Failed to start the plugin host process",
            "Check the log output for more information on what went wrong. You may need to rerun \
             your host from a terminal to see the error.",
            Some(&info.native_library_path),
        );

        return Err(PluginLoadError::WorkerExited);
    }

    result.map_err(PluginLoadError::from)
}

/// Log the startup diagnostics and fire the resource-limit warnings. None of
/// these fail the load; they exist so the inevitable support request comes
/// with answers attached.
pub fn log_init_message(config: &Configuration, info: &PluginInfo, endpoint_base_dir: &std::path::Path) {
    log::info!("Initializing plugbridge version {}", plugbridge_core::build_version());
    log::info!("plugin:       '{}'", info.plugin_path.display());
    log::info!("plugin type:  '{}'", info.plugin_type);
    log::info!("sockets:      '{}'", endpoint_base_dir.display());
    log::info!("prefix:       '{}'", info.prefix_path.display());

    match &config.group {
        Some(group) => {
            log::info!("hosting mode: 'plugin group \"{}\"', {}", group, info.plugin_arch)
        }
        None => log::info!("hosting mode: 'individually', {}", info.plugin_arch),
    }

    if let Some(rttime_limit) = get_rttime_limit() {
        if rttime_limit != u64::MAX && rttime_limit < RTTIME_MIN_SAFE_THRESHOLD {
            log::warn!(
                "RLIMIT_RTTIME is set to {} us. Some plugins may get killed during \
                 initialization because of this until realtime privileges are set up properly.",
                rttime_limit
            );
            send_notification(
                "Low realtime time limit detected",
                &format!(
                    "RLIMIT_RTTIME is set to {} us. Some plugins may crash during \
                     initialization because of this.",
                    rttime_limit
                ),
                Some(&info.native_library_path),
            );
        }
    }

    if let Some(memlock_limit) = get_memlock_limit() {
        if memlock_limit != u64::MAX && memlock_limit < MEMLOCK_MIN_SAFE_THRESHOLD {
            log::warn!(
                "The memory locking limit is set to {} bytes. Mapping the shared audio buffers \
                 for plugins with many channels may fail because of this.",
                memlock_limit
            );
            send_notification(
                "Low memory locking limit detected",
                &format!(
                    "The current memlock limit is {} bytes. Plugins with many input or output \
                     channels may fail to activate because of this.",
                    memlock_limit
                ),
                Some(&info.native_library_path),
            );
        }
    }

    if !config.invalid_options.is_empty() {
        log::warn!("invalid config arguments: {}", config.invalid_options.join(", "));
    }
    if !config.unknown_options.is_empty() {
        log::warn!("unrecognized config options: {}", config.unknown_options.join(", "));
    }
}

/// Warn when the worker was built from a different version than this
/// library. Things may still work, but at some point a request will fail in
/// confusing ways.
pub fn warn_on_version_mismatch(host_version: &str, info: &PluginInfo) {
    if host_version != plugbridge_core::build_version() {
        log::warn!(
            "The host process was built from version '{}' but this library is version '{}'. \
             You may need to resync your plugins after an update.",
            host_version,
            plugbridge_core::build_version()
        );
        send_notification(
            "Version mismatch",
            "The plugin host process and the plugin library were built from different versions. \
             You may need to resync your plugins.",
            Some(&info.native_library_path),
        );
    }
}
