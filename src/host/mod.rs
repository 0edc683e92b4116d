//! The foreign side of the bridge: the code running inside the
//! `plugbridge-host` worker process. It connects back to the native shim's
//! endpoint directory, loads the foreign plugin, and services the protocol.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use plugbridge_core::utils::{pid_running, watchdog_disabled};

pub mod clap;
pub mod group;
pub mod main_context;
pub mod plugin_api;
pub mod vst2;
pub mod vst3;

pub use clap::ClapBridge;
pub use group::GroupBridge;
pub use main_context::{MainContext, MainContextHandle};
pub use vst2::Vst2Bridge;
pub use vst3::Vst3Bridge;

/// How often the worker checks that its parent is still around.
const PARENT_WATCHDOG_INTERVAL: Duration = Duration::from_secs(1);

/// One hosted plugin bridge, as seen by the worker's main loop and by the
/// group host.
pub trait HostBridge: Send + Sync {
    /// Service the bridge's control surface until the native side closes the
    /// sockets. Blocks for the plugin's lifetime.
    fn run(&self);

    /// Whether the UI event loop should hold off: true while this bridge's
    /// plugin is inside its init or terminate window, where pumping messages
    /// into the half-constructed plugin would misfire.
    fn inhibits_event_loop(&self) -> bool {
        false
    }

    /// One tick of per-bridge event handling, run from the main context's
    /// timer.
    fn handle_events(&self) {}
}

/// Load a foreign plugin library and construct the bridge for it. Used by
/// the individual worker entry point and by the group worker; must be called
/// on the main thread.
pub fn create_bridge(
    main_context: MainContextHandle,
    plugin_type: plugbridge_core::PluginType,
    plugin_path: &std::path::Path,
    endpoint_base_dir: &std::path::Path,
    parent_pid: u32,
) -> Result<std::sync::Arc<dyn HostBridge>, String> {
    use plugbridge_core::PluginType;
    use std::sync::Arc;

    match plugin_type {
        PluginType::Vst2 => {
            let loaded =
                plugin_api::load_vst2_plugin(plugin_path).map_err(|e| e.to_string())?;
            let (entry, library) = loaded.into_parts();

            Vst2Bridge::new(main_context, *entry, Some(library), endpoint_base_dir, parent_pid)
                .map(|bridge| bridge as Arc<dyn HostBridge>)
                .map_err(|e| e.to_string())
        }
        PluginType::Vst3 => {
            let loaded =
                plugin_api::load_vst3_factory(plugin_path).map_err(|e| e.to_string())?;
            let (entry, library) = loaded.into_parts();

            Vst3Bridge::new(main_context, *entry, Some(library), endpoint_base_dir, parent_pid)
                .map(|bridge| bridge as Arc<dyn HostBridge>)
                .map_err(|e| e.to_string())
        }
        PluginType::Clap => {
            let loaded =
                plugin_api::load_clap_factory(plugin_path).map_err(|e| e.to_string())?;
            let (entry, library) = loaded.into_parts();

            ClapBridge::new(main_context, *entry, Some(library), endpoint_base_dir, parent_pid)
                .map(|bridge| bridge as Arc<dyn HostBridge>)
                .map_err(|e| e.to_string())
        }
        PluginType::Unknown => Err(String::from("unknown plugin type")),
    }
}

/// Watch the native host process and run `on_death` when it disappears, so a
/// worker whose parent crashed doesn't linger. Disabled through
/// `YABRIDGE_NO_WATCHDOG=1` for namespaced setups where the parent pid is
/// not visible.
pub fn spawn_parent_watchdog(parent_pid: u32, on_death: impl FnOnce() + Send + 'static) {
    if watchdog_disabled() {
        log::info!("The parent process watchdog has been disabled");
        return;
    }

    std::thread::Builder::new()
        .name(String::from("watchdog"))
        .spawn(move || loop {
            if !pid_running(parent_pid) {
                log::warn!(
                    "The native host process (pid {}) has disappeared, shutting down",
                    parent_pid
                );
                on_death();
                return;
            }

            std::thread::sleep(PARENT_WATCHDOG_INTERVAL);
        })
        .expect("could not spawn the parent watchdog thread");
}

/// A process-unique name for an instance's shared audio buffer.
pub(crate) fn shm_buffer_name(instance_id: plugbridge_core::InstanceId) -> String {
    static NEXT_GENERATION: AtomicU64 = AtomicU64::new(0);

    // The generation counter keeps names fresh across reactivations of the
    // same instance with a different size
    format!(
        "/plugbridge-{}-{}-{}",
        std::process::id(),
        instance_id,
        NEXT_GENERATION.fetch_add(1, Ordering::Relaxed)
    )
}
