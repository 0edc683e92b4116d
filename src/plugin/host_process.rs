//! Spawning and supervising the worker process that hosts the foreign
//! plugin.
//!
//! Two hosting modes share one abstraction. In individual mode every plugin
//! load spawns its own worker. In group mode plugins that share a group name
//! (and prefix and architecture) are hosted by a single worker process that
//! the first bridge to come along starts, and that later bridges connect to.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use plugbridge_core::codec::{read_object, write_object};
use plugbridge_core::messages::{HostRequest, HostResponse};
use plugbridge_core::utils::pid_running;
use plugbridge_core::Configuration;

use super::{find_host_binary, group_socket_path, PluginInfo, PluginLoadError};

/// How long a bridge keeps trying to reach a group worker it spawned before
/// giving up.
const GROUP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const GROUP_CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// A running (or adopted) worker process hosting our plugin.
pub trait HostProcess: Send {
    /// The worker binary in use, for the startup log.
    fn path(&self) -> &Path;

    /// Whether the worker is still alive. Polled by the native watchdog
    /// until the sockets connect.
    fn running(&mut self) -> bool;

    /// Ask the worker to go away. Closing the sockets already makes the
    /// hosted plugin exit; this is the fallback for a worker that's stuck
    /// before the sockets exist.
    fn terminate(&mut self);
}

/// Build the worker command with the environment contract applied:
/// `WINEPREFIX` and `WINELOADER` pass through, stdio goes to pipes or to the
/// `disable_pipes` file.
fn worker_command(
    host_binary: &Path,
    config: &Configuration,
    use_pipes: bool,
) -> Result<Command, PluginLoadError> {
    let mut command = Command::new(host_binary);

    for passthrough in ["WINEPREFIX", "WINELOADER", "YABRIDGE_TEMP_DIR", "YABRIDGE_NO_WATCHDOG"] {
        if let Ok(value) = std::env::var(passthrough) {
            command.env(passthrough, value);
        }
    }

    if use_pipes {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
    } else {
        // Some plugins misbehave when their standard streams are pipes, so
        // the config can redirect them to a file instead
        let output_file = config
            .disable_pipes
            .clone()
            .unwrap_or_else(|| plugbridge_core::utils::get_temporary_directory().join("plugbridge-output.log"));
        let file = File::create(&output_file).map_err(PluginLoadError::SpawnFailed)?;
        let file_clone = file.try_clone().map_err(PluginLoadError::SpawnFailed)?;

        command.stdout(Stdio::from(file)).stderr(Stdio::from(file_clone));
    }
    command.stdin(Stdio::null());

    Ok(command)
}

/// Relay a worker's piped output stream to the log, line by line, with a
/// prefix telling the streams apart.
fn relay_output(stream: impl std::io::Read + Send + 'static, prefix: &'static str) {
    std::thread::Builder::new()
        .name(String::from("worker-stdio"))
        .spawn(move || {
            let reader = BufReader::new(stream);
            for line in reader.lines() {
                match line {
                    Ok(line) => log::info!("{}{}", prefix, line),
                    Err(_) => break,
                }
            }
        })
        .expect("could not spawn the stdio relay thread");
}

/// One worker per plugin load.
pub struct IndividualHost {
    host_path: PathBuf,
    child: Child,
}

impl IndividualHost {
    pub fn new(
        config: &Configuration,
        info: &PluginInfo,
        endpoint_base_dir: &Path,
    ) -> Result<Self, PluginLoadError> {
        let host_path = find_host_binary(info.plugin_arch);
        let use_pipes = config.disable_pipes.is_none();

        let mut command = worker_command(&host_path, config, use_pipes)?;
        command
            .arg(info.plugin_type.as_string())
            .arg(&info.plugin_path)
            .arg(endpoint_base_dir)
            .arg(std::process::id().to_string());

        let mut child = command.spawn().map_err(PluginLoadError::SpawnFailed)?;

        if use_pipes {
            if let Some(stdout) = child.stdout.take() {
                relay_output(stdout, "[host] ");
            }
            if let Some(stderr) = child.stderr.take() {
                relay_output(stderr, "[host] ");
            }
        }

        Ok(Self { host_path, child })
    }
}

impl HostProcess for IndividualHost {
    fn path(&self) -> &Path {
        &self.host_path
    }

    fn running(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) | Err(_) => false,
        }
    }

    fn terminate(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for IndividualHost {
    fn drop(&mut self) {
        // Closing the sockets is the normal shutdown path; by the time the
        // bridge is dropped the worker should already be on its way out.
        // Reap it so it doesn't linger as a zombie.
        let _ = self.child.try_wait();
    }
}

/// Connect to a group worker, or start one. Startup goes through three
/// steps:
///
/// 1. Try to connect to an existing group worker's socket.
/// 2. Spawn a new detached group worker and retry the connection in a loop.
///    When multiple bridges start at once the first to bind the socket wins
///    and the other spawned workers exit gracefully.
/// 3. If our spawned worker exits before we connected (it lost the race),
///    try connecting one last time before giving up.
///
/// The actual host request is deferred to a thread since a freshly spawned
/// group worker can take a moment to come up, and the rest of the bridge
/// initialization (binding sockets) doesn't depend on it.
pub struct GroupHost {
    host_path: PathBuf,
    /// The pid the group worker reported back, once connected. Zero until
    /// then.
    group_pid: Arc<AtomicU32>,
    startup_failed: Arc<AtomicBool>,
    connect_handler: Option<std::thread::JoinHandle<()>>,
}

impl GroupHost {
    pub fn new(
        group_name: &str,
        config: &Configuration,
        info: &PluginInfo,
        endpoint_base_dir: &Path,
    ) -> Result<Self, PluginLoadError> {
        let host_path = find_host_binary(info.plugin_arch);
        let socket_path = group_socket_path(group_name, &info.prefix_path, info.plugin_arch);

        let request = HostRequest {
            plugin_type: info.plugin_type,
            plugin_path: info.plugin_path.to_string_lossy().into_owned(),
            endpoint_base_dir: endpoint_base_dir.to_string_lossy().into_owned(),
            parent_pid: std::process::id(),
        };

        let group_pid = Arc::new(AtomicU32::new(0));
        let startup_failed = Arc::new(AtomicBool::new(false));

        let connect_handler = {
            let host_path = host_path.clone();
            let config = config.clone();
            let group_pid = Arc::clone(&group_pid);
            let startup_failed = Arc::clone(&startup_failed);

            std::thread::Builder::new()
                .name(String::from("group-connect"))
                .spawn(move || {
                    match Self::connect_or_spawn(&host_path, &socket_path, &config, &request) {
                        Ok(pid) => group_pid.store(pid, Ordering::SeqCst),
                        Err(e) => {
                            log::error!("Could not reach a group host process: {}", e);
                            startup_failed.store(true, Ordering::SeqCst);
                        }
                    }
                })
                .map_err(PluginLoadError::SpawnFailed)?
        };

        Ok(Self {
            host_path,
            group_pid,
            startup_failed,
            connect_handler: Some(connect_handler),
        })
    }

    /// Send the host request to an already listening group worker.
    fn request_hosting(
        socket_path: &Path,
        request: &HostRequest,
    ) -> Result<u32, PluginLoadError> {
        let socket = UnixStream::connect(socket_path)
            .map_err(|e| PluginLoadError::GroupUnavailable(e.to_string()))?;

        let mut scratch = Vec::new();
        write_object(&mut &socket, request, &mut scratch)?;
        let response: HostResponse = read_object(&mut &socket, &mut scratch)?;

        Ok(response.pid)
    }

    fn connect_or_spawn(
        host_path: &Path,
        socket_path: &Path,
        config: &Configuration,
        request: &HostRequest,
    ) -> Result<u32, PluginLoadError> {
        // (a) an existing group worker may already be listening
        if let Ok(pid) = Self::request_hosting(socket_path, request) {
            return Ok(pid);
        }

        // (b) spawn a detached group worker and keep retrying the connection
        let use_pipes = config.disable_pipes.is_none();
        let mut command = worker_command(host_path, config, use_pipes)?;
        command.arg("group").arg(socket_path);

        let mut child = command.spawn().map_err(PluginLoadError::SpawnFailed)?;
        if use_pipes {
            if let Some(stdout) = child.stdout.take() {
                relay_output(stdout, "[group] ");
            }
            if let Some(stderr) = child.stderr.take() {
                relay_output(stderr, "[group] ");
            }
        }

        let deadline = Instant::now() + GROUP_CONNECT_TIMEOUT;
        while Instant::now() < deadline {
            if let Ok(pid) = Self::request_hosting(socket_path, request) {
                return Ok(pid);
            }

            // (c) our worker lost the bind race to another bridge's worker
            // and exited; whoever won should be listening by now
            if let Ok(Some(_status)) = child.try_wait() {
                return Self::request_hosting(socket_path, request);
            }

            std::thread::sleep(GROUP_CONNECT_RETRY_INTERVAL);
        }

        Err(PluginLoadError::GroupUnavailable(format!(
            "timed out waiting for '{}'",
            socket_path.display()
        )))
    }
}

impl HostProcess for GroupHost {
    fn path(&self) -> &Path {
        &self.host_path
    }

    fn running(&mut self) -> bool {
        if self.startup_failed.load(Ordering::SeqCst) {
            return false;
        }

        match self.group_pid.load(Ordering::SeqCst) {
            // Still connecting; give it the benefit of the doubt
            0 => true,
            pid => pid_running(pid),
        }
    }

    fn terminate(&mut self) {
        // The group worker hosts other bridges' plugins too; closing our
        // sockets makes it drop just our plugin. Nothing to kill here.
        if let Some(handler) = self.connect_handler.take() {
            let _ = handler.join();
        }
    }
}

impl Drop for GroupHost {
    fn drop(&mut self) {
        if let Some(handler) = self.connect_handler.take() {
            let _ = handler.join();
        }
    }
}

/// Start the right kind of host process for a configuration.
pub fn spawn_host_process(
    config: &Configuration,
    info: &PluginInfo,
    endpoint_base_dir: &Path,
) -> Result<Mutex<Box<dyn HostProcess>>, PluginLoadError> {
    let process: Box<dyn HostProcess> = match &config.group {
        Some(group_name) => Box::new(GroupHost::new(group_name, config, info, endpoint_base_dir)?),
        None => Box::new(IndividualHost::new(config, info, endpoint_base_dir)?),
    };

    Ok(Mutex::new(process))
}
