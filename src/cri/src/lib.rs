//! Kiln CRI - Kubernetes Container Runtime Interface daemon.
//!
//! Serves CRI v1 RuntimeService and ImageService over one Unix socket that
//! also carries an HTTP/1 info server. Containers run under an OCI runtime
//! through one `kiln-shim` supervisor each; their exits are picked up from
//! exit files by the [`exit_watcher`].

pub mod error;
pub mod exit_watcher;
pub mod image_service;
pub mod info;
pub mod lifecycle;
pub mod metrics;
pub mod mux;
pub mod registry;
pub mod runtime_service;
pub mod server;
pub mod streaming;

#[cfg(test)]
mod fakes;

/// Generated CRI v1 protobuf types.
pub mod cri_api {
    tonic::include_proto!("runtime.v1");
}

/// Daemon version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
