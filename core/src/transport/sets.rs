//! The per-dialect channel bundles.
//!
//! Every plugin load gets its own endpoint base directory with one socket
//! file per channel. The native side constructs its set with `listen = true`
//! before spawning the worker; the worker constructs the mirror image with
//! `listen = false` and connects. The set that listens also owns the base
//! directory and removes it on drop, guarded by the temp-root containment
//! check in [`remove_endpoint_base`](crate::utils::remove_endpoint_base).

use fnv::FnvHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::TransportError;
use crate::messages::clap::{ClapAudioRequest, ClapCallbackRequest, ClapControlRequest};
use crate::messages::vst2::{Vst2CallbackRequest, Vst2DispatchRequest};
use crate::messages::vst3::{Vst3AudioRequest, Vst3CallbackRequest, Vst3ControlRequest};
use crate::registry::InstanceId;
use crate::transport::message::{MessageHandler, Reply, Request};
use crate::transport::socket::SocketHandler;
use crate::transport::audio_thread_endpoint;
use crate::utils::remove_endpoint_base;

/// The dynamic map of per-instance audio-thread channels shared by the
/// dialects that have one.
///
/// The foreign side listens on these (it creates the channel when an
/// instance registers for audio processing, before telling the native side
/// about it), the native side connects.
pub struct AudioThreadSockets<R> {
    base_dir: PathBuf,
    handlers: Mutex<FnvHashMap<InstanceId, Arc<MessageHandler<R>>>>,
}

impl<R: Serialize + DeserializeOwned + std::fmt::Debug> AudioThreadSockets<R> {
    fn new(base_dir: PathBuf) -> Self {
        Self { base_dir, handlers: Mutex::new(FnvHashMap::default()) }
    }

    /// Create and connect the audio channel for an instance. Called on the
    /// native side once the worker reported the instance as registered for
    /// audio processing (at which point the worker is guaranteed to be
    /// listening).
    pub fn add_and_connect(&self, instance_id: InstanceId) -> Result<(), TransportError> {
        let handler = Arc::new(MessageHandler::<R>::new_persistent(
            audio_thread_endpoint(&self.base_dir, instance_id),
            false,
        )?);
        handler.connect()?;

        let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        handlers.insert(instance_id, handler);

        Ok(())
    }

    /// Create the audio channel for an instance, signal `on_listening`, then
    /// accept and serve requests until the channel closes. Called on the
    /// foreign side from the instance's dedicated audio thread; blocks for
    /// the channel's lifetime.
    pub fn add_and_listen<F>(
        &self,
        instance_id: InstanceId,
        on_listening: impl FnOnce(),
        callback: F,
    ) -> Result<(), TransportError>
    where
        F: Fn(R, Reply<'_>) -> Result<(), TransportError> + Sync,
    {
        let handler = Arc::new(MessageHandler::<R>::new_persistent(
            audio_thread_endpoint(&self.base_dir, instance_id),
            true,
        )?);

        {
            let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            handlers.insert(instance_id, Arc::clone(&handler));
        }

        // The native side may only try to connect once we are actually
        // listening; the endpoint is bound at this point
        on_listening();

        handler.connect()?;
        handler.receive_messages(callback);

        Ok(())
    }

    /// Close and remove an instance's audio channel. Returns whether there
    /// was one. Called while handling `destroy` on both sides.
    pub fn remove(&self, instance_id: InstanceId) -> bool {
        let handler = {
            let mut handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            handlers.remove(&instance_id)
        };

        match handler {
            Some(handler) => {
                handler.close();
                true
            }
            None => false,
        }
    }

    /// Send a request over an instance's audio channel.
    pub fn send_message<T>(
        &self,
        instance_id: InstanceId,
        request: T,
    ) -> Result<T::Response, TransportError>
    where
        T: Request + Into<R>,
    {
        let handler = {
            let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
            handlers.get(&instance_id).cloned()
        };

        match handler {
            Some(handler) => handler.send_message(request),
            None => Err(TransportError::ConnectionClosed),
        }
    }

    fn close_all(&self) {
        // This map should be empty at this point, but who knows
        let handlers = self.handlers.lock().unwrap_or_else(|e| e.into_inner());
        for handler in handlers.values() {
            handler.close();
        }
    }
}

macro_rules! connect_all {
    ($($channel:expr),+ $(,)?) => {
        $($channel.connect()?;)+
    };
}

macro_rules! close_all {
    ($($channel:expr),+ $(,)?) => {
        $($channel.close();)+
    };
}

/// The channels for the simple C callback dialect. This dialect hosts one
/// plugin per bridge, so there is no dynamic audio channel map; processing
/// has its own fixed channel.
///
/// The naming convention is `<from>_<to>_<role>`: `host_plugin_dispatch`
/// carries dispatcher calls from the native host to the plugin,
/// `plugin_host_callback` carries host callbacks the other way.
pub struct Vst2Sockets {
    pub base_dir: PathBuf,
    owns_base_dir: bool,

    /// Dispatcher calls, host to plugin. Ad hoc: hosts may dispatch from
    /// multiple threads at once.
    pub host_plugin_dispatch: MessageHandler<Vst2DispatchRequest>,
    /// Host callbacks, plugin to host. Ad hoc for the same reason.
    pub plugin_host_callback: MessageHandler<Vst2CallbackRequest>,
    /// Parameter reads and writes, which mostly overlap.
    pub host_plugin_parameters: SocketHandler,
    /// The audio processing envelope.
    pub host_plugin_process: SocketHandler,
    /// Startup-only traffic: the plugin description push after loading.
    pub host_plugin_control: SocketHandler,
}

impl Vst2Sockets {
    pub fn new(base_dir: impl Into<PathBuf>, listen: bool) -> Result<Self, TransportError> {
        let base_dir = base_dir.into();

        Ok(Self {
            host_plugin_dispatch: MessageHandler::new(
                base_dir.join("host_plugin_dispatch.sock"),
                listen,
            )?,
            plugin_host_callback: MessageHandler::new(
                base_dir.join("plugin_host_callback.sock"),
                listen,
            )?,
            host_plugin_parameters: SocketHandler::new(
                base_dir.join("host_plugin_parameters.sock"),
                listen,
            )?,
            host_plugin_process: SocketHandler::new(
                base_dir.join("host_plugin_process.sock"),
                listen,
            )?,
            host_plugin_control: SocketHandler::new(
                base_dir.join("host_plugin_control.sock"),
                listen,
            )?,
            owns_base_dir: listen,
            base_dir,
        })
    }

    pub fn connect(&self) -> Result<(), TransportError> {
        connect_all!(
            self.host_plugin_dispatch,
            self.plugin_host_callback,
            self.host_plugin_parameters,
            self.host_plugin_process,
            self.host_plugin_control,
        );

        Ok(())
    }

    /// Close every channel unconditionally so any blocking receive returns.
    /// Idempotent.
    pub fn close(&self) {
        close_all!(
            self.host_plugin_dispatch,
            self.plugin_host_callback,
            self.host_plugin_parameters,
            self.host_plugin_process,
            self.host_plugin_control,
        );
    }
}

impl Drop for Vst2Sockets {
    fn drop(&mut self) {
        self.close();

        if self.owns_base_dir {
            remove_endpoint_base(&self.base_dir);
        }
    }
}

/// The channels for the COM-style dialect: one combined control channel for
/// all non-audio interface methods, one callback channel, and one audio
/// channel per instance.
pub struct Vst3Sockets {
    pub base_dir: PathBuf,
    owns_base_dir: bool,

    pub host_plugin_control: MessageHandler<Vst3ControlRequest>,
    pub plugin_host_callback: MessageHandler<Vst3CallbackRequest>,
    pub audio_threads: AudioThreadSockets<Vst3AudioRequest>,
}

impl Vst3Sockets {
    pub fn new(base_dir: impl Into<PathBuf>, listen: bool) -> Result<Self, TransportError> {
        let base_dir = base_dir.into();

        Ok(Self {
            host_plugin_control: MessageHandler::new(
                base_dir.join("host_plugin_control.sock"),
                listen,
            )?,
            plugin_host_callback: MessageHandler::new(
                base_dir.join("plugin_host_callback.sock"),
                listen,
            )?,
            audio_threads: AudioThreadSockets::new(base_dir.clone()),
            owns_base_dir: listen,
            base_dir,
        })
    }

    pub fn connect(&self) -> Result<(), TransportError> {
        connect_all!(self.host_plugin_control, self.plugin_host_callback);
        Ok(())
    }

    pub fn close(&self) {
        close_all!(self.host_plugin_control, self.plugin_host_callback);
        self.audio_threads.close_all();
    }
}

impl Drop for Vst3Sockets {
    fn drop(&mut self) {
        self.close();

        if self.owns_base_dir {
            remove_endpoint_base(&self.base_dir);
        }
    }
}

/// The channels for the C-vtable dialect: a main-thread control channel, a
/// main-thread callback channel, and one audio channel per instance.
pub struct ClapSockets {
    pub base_dir: PathBuf,
    owns_base_dir: bool,

    pub host_plugin_control: MessageHandler<ClapControlRequest>,
    pub plugin_host_callback: MessageHandler<ClapCallbackRequest>,
    pub audio_threads: AudioThreadSockets<ClapAudioRequest>,
}

impl ClapSockets {
    pub fn new(base_dir: impl Into<PathBuf>, listen: bool) -> Result<Self, TransportError> {
        let base_dir = base_dir.into();

        Ok(Self {
            host_plugin_control: MessageHandler::new(
                base_dir.join("host_plugin_control.sock"),
                listen,
            )?,
            plugin_host_callback: MessageHandler::new(
                base_dir.join("plugin_host_callback.sock"),
                listen,
            )?,
            audio_threads: AudioThreadSockets::new(base_dir.clone()),
            owns_base_dir: listen,
            base_dir,
        })
    }

    pub fn connect(&self) -> Result<(), TransportError> {
        connect_all!(self.host_plugin_control, self.plugin_host_callback);
        Ok(())
    }

    pub fn close(&self) {
        close_all!(self.host_plugin_control, self.plugin_host_callback);
        self.audio_threads.close_all();
    }
}

impl Drop for ClapSockets {
    fn drop(&mut self) {
        self.close();

        if self.owns_base_dir {
            remove_endpoint_base(&self.base_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::generate_endpoint_base;

    #[test]
    fn endpoint_directory_is_removed_by_the_owning_side() {
        let _env = crate::utils::lock_test_env();
        let scratch = tempfile::tempdir().unwrap();
        std::env::set_var("YABRIDGE_TEMP_DIR", scratch.path());

        let base_dir = generate_endpoint_base("TestPlugin").unwrap();

        {
            let _native = ClapSockets::new(&base_dir, true).unwrap();
            let _foreign = ClapSockets::new(&base_dir, false).unwrap();
            assert!(base_dir.join("host_plugin_control.sock").exists());
        }

        // Opening and closing a bridge leaves no socket files behind
        assert!(!base_dir.exists());

        std::env::remove_var("YABRIDGE_TEMP_DIR");
    }

    #[test]
    fn close_is_idempotent() {
        let _env = crate::utils::lock_test_env();
        let scratch = tempfile::tempdir().unwrap();
        std::env::set_var("YABRIDGE_TEMP_DIR", scratch.path());

        let base_dir = generate_endpoint_base("TestPlugin").unwrap();
        let sockets = Vst2Sockets::new(&base_dir, true).unwrap();

        sockets.close();
        sockets.close();

        std::env::remove_var("YABRIDGE_TEMP_DIR");
    }
}
