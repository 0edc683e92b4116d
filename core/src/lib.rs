//! The protocol runtime shared by both sides of the bridge: the wire codec,
//! the socket fabric, the shared-memory audio buffers, the mutual-recursion
//! helper, the instance registry, and the per-dialect message sets.
//!
//! The native-side shim and the foreign-side worker both build on this crate;
//! everything in here has to stay wire compatible between a 64-bit native
//! host and a 32-bit worker.

pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
pub mod messages;
pub mod mutual_recursion;
pub mod plugins;
pub mod registry;
pub mod transport;
pub mod utils;

pub use config::{ConfigValue, Configuration};
pub use error::{ShmError, TransportError};
pub use mutual_recursion::MutualRecursionHelper;
pub use plugins::{LibArchitecture, PluginType};
pub use registry::{InstanceId, InstanceRef, InstanceRegistry};

/// The build version sent in the startup handshake. The native side warns the
/// user when the worker was built from a different version.
pub fn build_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
