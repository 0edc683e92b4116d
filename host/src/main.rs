//! The worker process that loads and drives foreign plugins.
//!
//! Individually hosted plugins are spawned as
//! `plugbridge-host <plugin_type> <plugin_path> <endpoint_base_dir>
//! <parent_pid>`; the process loads the one plugin, connects back to the
//! native shim's endpoint directory, and exits when the plugin does.
//!
//! `plugbridge-host group <group_socket_path>` starts (or loses the race to
//! start) a group worker instead: a process other bridges can ask to host
//! their plugins, so plugins sharing a group share one process.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use plugbridge::host::group::GroupBridgeError;
use plugbridge::host::{create_bridge, GroupBridge, HostBridge, MainContext};
use plugbridge_core::logging::install_logger;
use plugbridge_core::PluginType;

fn print_usage() {
    eprintln!("plugbridge host version {}", plugbridge_core::build_version());
    eprintln!();
    eprintln!("Usage: plugbridge-host <plugin_type> <plugin_path> <endpoint_base_dir> <parent_pid>");
    eprintln!("       plugbridge-host group <group_socket_path>");
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    let is_group_host = args.len() >= 3 && args[1] == "group";
    if !is_group_host && args.len() < 5 {
        print_usage();
        return ExitCode::FAILURE;
    }

    if is_group_host {
        run_group_host(&args[2])
    } else {
        run_individual_host(&args[1], &args[2], &args[3], &args[4])
    }
}

fn run_group_host(group_socket_path: &str) -> ExitCode {
    install_logger(String::from("[group] "));

    match GroupBridge::new(group_socket_path) {
        Ok(bridge) => {
            // Blocks until all plugins have exited and the grace period ran
            // out
            bridge.handle_incoming_connections();
            ExitCode::SUCCESS
        }
        // Some other bridge's worker won the bind race; the native side
        // will connect to that one instead. Not a failure.
        Err(GroupBridgeError::AlreadyListening) => {
            log::info!(
                "Another process is already listening on this group's socket, exiting"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("Could not start the group host: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run_individual_host(
    plugin_type: &str,
    plugin_path: &str,
    endpoint_base_dir: &str,
    parent_pid: &str,
) -> ExitCode {
    install_logger(String::from("[host] "));

    let plugin_type = PluginType::from_string(plugin_type);
    if plugin_type == PluginType::Unknown {
        log::error!("Unknown plugin type");
        print_usage();
        return ExitCode::FAILURE;
    }

    let parent_pid: u32 = match parent_pid.parse() {
        Ok(pid) => pid,
        Err(_) => {
            log::error!("Invalid parent pid");
            print_usage();
            return ExitCode::FAILURE;
        }
    };

    log::info!("Preparing to load a {} plugin from '{}'", plugin_type, plugin_path);

    // The plugin has to be initialized on the same thread that runs the main
    // context, so everything happens here before the control loop moves to
    // its own thread
    let main_context = MainContext::new();

    let bridge = match create_bridge(
        main_context.handle(),
        plugin_type,
        Path::new(plugin_path),
        Path::new(endpoint_base_dir),
        parent_pid,
    ) {
        Ok(bridge) => bridge,
        Err(e) => {
            // The native side's watchdog picks the exit up and surfaces it
            log::error!("Error while initializing the plugin host: {}", e);
            return ExitCode::FAILURE;
        }
    };

    log::info!("Finished initializing '{}'", plugin_path);

    // Service the control surface on a worker thread while this thread
    // handles main-thread tasks and the event pump
    let control_thread = {
        let bridge = Arc::clone(&bridge);
        let main_handle = main_context.handle();

        std::thread::Builder::new()
            .name(String::from("worker"))
            .spawn(move || {
                bridge.run();
                // The sockets are gone; wind the main context down so the
                // process can exit
                main_handle.stop();
            })
            .expect("could not spawn the control thread")
    };

    {
        let pump_bridge = Arc::clone(&bridge);
        let gate_bridge = Arc::clone(&bridge);
        main_context.async_handle_events(
            move || pump_bridge.handle_events(),
            move || !gate_bridge.inhibits_event_loop(),
        );
    }

    main_context.run();
    let _ = control_thread.join();

    ExitCode::SUCCESS
}
