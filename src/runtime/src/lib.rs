//! Kiln Runtime - the collaborators the CRI daemon drives.
//!
//! - [`invoker`]: OCI runtime invocation through the `kiln-shim` supervisor
//! - [`oci`]: image pull, storage and unpacking
//! - [`network`]: network namespaces and CNI

pub mod invoker;
pub mod network;
pub mod oci;

// Re-export common types
pub use invoker::{
    pid_alive, ContainerSpec, ExecOutput, MountSpec, RuntimeInvoker, ShimInvoker,
    SupervisorHandle, OOM_MARKER,
};
pub use network::{CniNetworkManager, NetnsHandle, NetworkManager, NetworkStatus, PodNetwork};
pub use oci::{
    copy_tree, FsUsage, ImageManager, ImageReference, ImageStorage, OciImageConfig, RegistryAuth,
    StoredImage,
};

/// Kiln runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
