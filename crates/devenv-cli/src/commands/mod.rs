//! CLI commands

use std::fmt::Display;
use std::sync::Arc;

use devenv_snapshot::runtime::{KindRuntime, RuntimeRegistry};

use crate::{config, Error, Result};

pub mod environment;
pub mod port_forward;
pub mod provision;
pub mod snapshot;

/// Extension trait to convert errors with Display to CLI Error::CommandFailed.
///
/// This reduces boilerplate for the common pattern of `.map_err(|e| Error::command_failed(e.to_string()))`.
pub trait CommandErrorExt<T> {
    /// Convert an error to `Error::CommandFailed` using its Display implementation.
    fn cmd_err(self) -> Result<T>;
}

impl<T, E: Display> CommandErrorExt<T> for std::result::Result<T, E> {
    fn cmd_err(self) -> Result<T> {
        self.map_err(|e| Error::command_failed(e.to_string()))
    }
}

/// Every runtime this machine can create clusters on
pub fn runtime_registry() -> Result<RuntimeRegistry> {
    let mut registry = RuntimeRegistry::new();
    registry.register(Arc::new(KindRuntime::new(config::kubeconfig_path()?)));
    Ok(registry)
}
