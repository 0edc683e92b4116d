//! The group worker: one foreign-side process hosting plugins for any
//! number of native bridges.
//!
//! The first worker to bind the group's socket wins and becomes the group
//! host; workers losing that race exit quietly so their bridge can connect
//! to the winner. Each incoming host request spins up a per-plugin bridge
//! exactly as in individual mode, with all of them sharing this process's
//! main context. The process lingers for a grace period after its last
//! plugin exits so rapid scan-and-discard patterns can reuse it.

use fnv::FnvHashMap;
use std::error::Error;
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use plugbridge_core::codec::{read_object, write_object};
use plugbridge_core::messages::{HostRequest, HostResponse};

use super::main_context::MainContext;
use super::{create_bridge, HostBridge};

/// How long the group process stays around while it has nothing to host.
/// Covers both the window between startup and the first host request and the
/// window after the last plugin exited.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(5);

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum GroupBridgeError {
    /// Another process is already listening on the group socket. Not a
    /// failure: the caller should exit cleanly and let its native bridge
    /// connect to the winner.
    AlreadyListening,
    Io(io::Error),
}

impl Error for GroupBridgeError {}

impl std::fmt::Display for GroupBridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupBridgeError::AlreadyListening => {
                write!(f, "another process is already listening on the group socket")
            }
            GroupBridgeError::Io(e) => write!(f, "could not set up the group socket: {}", e),
        }
    }
}

/// Listen on the endpoint if no process already does. Handles the three
/// startup situations: no socket file, a stale file left by a dead worker,
/// and a live worker that won the race.
fn create_acceptor_if_inactive(socket_path: &Path) -> Result<UnixListener, GroupBridgeError> {
    match UnixListener::bind(socket_path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
            // `/proc/net/unix` lists every live unix socket; if the path
            // shows up there someone is really listening
            let endpoint = socket_path.to_string_lossy();
            let live = std::fs::read_to_string("/proc/net/unix")
                .map(|sockets| sockets.lines().any(|line| line.ends_with(endpoint.as_ref())))
                .unwrap_or(true);

            if live {
                return Err(GroupBridgeError::AlreadyListening);
            }

            // Stale leftover; remove it and try again
            std::fs::remove_file(socket_path).map_err(GroupBridgeError::Io)?;
            UnixListener::bind(socket_path).map_err(GroupBridgeError::Io)
        }
        Err(e) => Err(GroupBridgeError::Io(e)),
    }
}

pub struct GroupBridge {
    socket_path: PathBuf,
    acceptor: UnixListener,
    main_context: MainContext,

    active_plugins: Arc<Mutex<FnvHashMap<u64, Arc<dyn HostBridge>>>>,
    next_plugin_id: AtomicU64,
    /// Updated on startup, on every host request and on every plugin exit;
    /// the shutdown monitor measures the idle period from here.
    last_activity: Arc<Mutex<Instant>>,
}

impl GroupBridge {
    pub fn new(socket_path: impl Into<PathBuf>) -> Result<Self, GroupBridgeError> {
        let socket_path = socket_path.into();
        let acceptor = create_acceptor_if_inactive(&socket_path)?;
        acceptor.set_nonblocking(true).map_err(GroupBridgeError::Io)?;

        Ok(Self {
            socket_path,
            acceptor,
            main_context: MainContext::new(),
            active_plugins: Arc::new(Mutex::new(FnvHashMap::default())),
            next_plugin_id: AtomicU64::new(0),
            last_activity: Arc::new(Mutex::new(Instant::now())),
        })
    }

    /// Accept and host plugins until the process has been idle for the
    /// grace period. Blocks the calling thread, which becomes the group's
    /// main thread.
    pub fn handle_incoming_connections(&self) {
        let stopping = AtomicBool::new(false);

        // Tick every hosted bridge's event handling, but only while no
        // plugin is inside its init or terminate window
        {
            let active_plugins = Arc::clone(&self.active_plugins);
            let pump_plugins = Arc::clone(&self.active_plugins);
            self.main_context.async_handle_events(
                move || {
                    let active_plugins =
                        pump_plugins.lock().unwrap_or_else(|e| e.into_inner());
                    for bridge in active_plugins.values() {
                        bridge.handle_events();
                    }
                },
                move || {
                    let active_plugins =
                        active_plugins.lock().unwrap_or_else(|e| e.into_inner());
                    !active_plugins.values().any(|bridge| bridge.inhibits_event_loop())
                },
            );
        }

        log::info!("Group host is up and running, now accepting incoming connections");

        std::thread::scope(|scope| {
            scope.spawn(|| self.accept_loop(&stopping));
            scope.spawn(|| self.shutdown_monitor(&stopping));

            self.main_context.run();
            stopping.store(true, Ordering::SeqCst);
        });
    }

    fn accept_loop(&self, stopping: &AtomicBool) {
        loop {
            if stopping.load(Ordering::SeqCst) {
                break;
            }

            match self.acceptor.accept() {
                Ok((socket, _)) => {
                    if let Err(e) = self.handle_host_request(socket) {
                        log::error!("Error while handling a host request: {}", e);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(ACCEPT_POLL_INTERVAL);
                }
                Err(e) => {
                    log::error!("Error while listening for incoming connections: {}", e);
                    self.main_context.handle().stop();
                    break;
                }
            }
        }
    }

    fn handle_host_request(&self, socket: UnixStream) -> Result<(), Box<dyn Error>> {
        socket.set_nonblocking(false)?;

        let mut scratch = Vec::new();
        let request: HostRequest = read_object(&mut &socket, &mut scratch)?;
        // The pid lets the native bridge watch this process while its
        // sockets connect
        write_object(&mut &socket, &HostResponse { pid: std::process::id() }, &mut scratch)?;

        *self.last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();

        log::info!(
            "Received request to host a {} plugin at '{}' using socket endpoint base directory \
             '{}'",
            request.plugin_type,
            request.plugin_path,
            request.endpoint_base_dir
        );

        // The plugin has to be initialized on the main thread; all
        // window-message handling has to come from the same thread
        let plugin_path = request.plugin_path.clone();
        let handle = self.main_context.handle();
        let constructed = {
            let handle_for_bridge = handle.clone();
            handle
                .run_in_context(move || {
                    create_bridge(
                        handle_for_bridge,
                        request.plugin_type,
                        Path::new(&request.plugin_path),
                        Path::new(&request.endpoint_base_dir),
                        request.parent_pid,
                    )
                })
                .wait()
        };

        let bridge = match constructed {
            Some(Ok(bridge)) => bridge,
            Some(Err(e)) => {
                log::error!("Error while initializing '{}': {}", plugin_path, e);
                return Ok(());
            }
            None => return Ok(()),
        };

        log::info!("Finished initializing '{}'", plugin_path);

        let plugin_id = self.next_plugin_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut active_plugins =
                self.active_plugins.lock().unwrap_or_else(|e| e.into_inner());
            active_plugins.insert(plugin_id, Arc::clone(&bridge));
        }

        let active_plugins = Arc::clone(&self.active_plugins);
        let last_activity = Arc::clone(&self.last_activity);
        std::thread::Builder::new().name(format!("worker-{}", plugin_id)).spawn(move || {
            // Blocks until the plugin shuts down
            bridge.run();
            log::info!("'{}' has exited", plugin_path);

            let mut active_plugins = active_plugins.lock().unwrap_or_else(|e| e.into_inner());
            active_plugins.remove(&plugin_id);
            // Deferring the actual process shutdown lets rapid plugin
            // scanning reuse this process
            *last_activity.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        })?;

        Ok(())
    }

    fn shutdown_monitor(&self, stopping: &AtomicBool) {
        loop {
            if stopping.load(Ordering::SeqCst) {
                break;
            }

            let idle_for =
                self.last_activity.lock().unwrap_or_else(|e| e.into_inner()).elapsed();
            let no_plugins =
                self.active_plugins.lock().unwrap_or_else(|e| e.into_inner()).is_empty();

            if no_plugins && idle_for > SHUTDOWN_GRACE_PERIOD {
                log::info!("All plugins have exited, shutting down the group process");
                self.main_context.handle().stop();
                break;
            }

            std::thread::sleep(SHUTDOWN_POLL_INTERVAL);
        }
    }
}

impl Drop for GroupBridge {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}
