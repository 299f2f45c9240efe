//! Drive Kubernetes resources through a create / stream / delete lifecycle
//! using the `kubectl` client.
//!
//! A manifest is rendered with `${name}` variables, written to disk and
//! created. The controller then follows one created resource (by tailing its
//! logs, polling its status, or both) and deletes everything the manifest
//! describes when the run ends, however it ends.

pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod kubernetes;
pub mod manifest;
pub mod process;
pub mod registry;
pub mod render;
pub mod streamer;
pub mod types;
pub mod utils;
pub mod waiter;

#[cfg(test)]
mod testkit;

pub use config::{ClientConfig, ExecutionOptions};
pub use controller::{ExecutionReport, ExecutionRequest, LifecycleController};
pub use error::{Error, Result};
pub use process::{ProcessInvoker, SystemInvoker};
pub use types::{ClusterResource, ExecutionMode, LifecycleState, LogMessage, OutputStream};
