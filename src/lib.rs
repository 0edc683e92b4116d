//! plugbridge lets audio plugins built against a foreign OS ABI be loaded and
//! driven by native hosts. A small native-side shim exposes the entry points
//! the host expects and proxies every call over local sockets to a worker
//! process that loads and drives the actual plugin binary; audio samples take
//! a shared-memory fast path.
//!
//! The [`plugin`] module is the native side: the per-dialect bridges the shim
//! instantiates, and the worker-process manager. The [`host`] module is the
//! foreign side: the code the `plugbridge-host` worker binary runs.

pub mod host;
pub mod plugin;

pub use plugbridge_core::{
    ConfigValue, Configuration, InstanceId, LibArchitecture, PluginType, TransportError,
};
