//! Built-in driver implementations plus a `DriverKind` enum that
//! dispatches to whichever one is selected by name, the same
//! enum-over-trait-object-alternatives shape used for runtime selection
//! elsewhere in this corpus.

pub mod command;
pub mod debug;
pub mod docker;
pub mod kubernetes;

use crate::driver::{Driver, OperationResult};
use crate::errors::{CnabError, Result};
use crate::operation::Operation;
use std::collections::HashMap;

pub use command::CommandDriver;
pub use debug::DebugDriver;
pub use docker::DockerDriver;
pub use kubernetes::KubernetesDriver;

/// One of the built-in drivers, or an external `cnab-<name>` executable.
#[derive(Debug, Clone)]
pub enum DriverKind {
    Docker(DockerDriver),
    Kubernetes(KubernetesDriver),
    Command(CommandDriver),
    Debug(DebugDriver),
}

impl DriverKind {
    /// Resolve a driver by its canonical name: `docker`, `kubernetes`
    /// (or the `k8s` alias), `debug`, or anything else — treated as an
    /// external `cnab-<name>` executable on PATH.
    pub fn named(name: &str) -> Self {
        match name {
            "docker" => Self::Docker(DockerDriver::new()),
            "kubernetes" | "k8s" => Self::Kubernetes(KubernetesDriver::new()),
            "debug" => Self::Debug(DebugDriver::new()),
            other => Self::Command(CommandDriver::named(other)),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Docker(_) => "docker",
            Self::Kubernetes(_) => "kubernetes",
            Self::Command(_) => "command",
            Self::Debug(_) => "debug",
        }
    }
}

impl Driver for DriverKind {
    fn handles(&self, image_type: &str) -> bool {
        match self {
            Self::Docker(d) => d.handles(image_type),
            Self::Kubernetes(d) => d.handles(image_type),
            Self::Command(d) => d.handles(image_type),
            Self::Debug(d) => d.handles(image_type),
        }
    }

    async fn run(&mut self, operation: &Operation) -> Result<OperationResult> {
        match self {
            Self::Docker(d) => d.run(operation).await,
            Self::Kubernetes(d) => d.run(operation).await,
            Self::Command(d) => d.run(operation).await,
            Self::Debug(d) => d.run(operation).await,
        }
    }

    fn config(&self) -> HashMap<String, String> {
        match self {
            Self::Docker(d) => d.config(),
            Self::Kubernetes(d) => d.config(),
            Self::Command(d) => d.config(),
            Self::Debug(d) => d.config(),
        }
    }

    fn set_config(&mut self, settings: HashMap<String, String>) -> Result<()> {
        match self {
            Self::Docker(d) => d.set_config(settings),
            Self::Kubernetes(d) => d.set_config(settings),
            Self::Command(d) => d.set_config(settings),
            Self::Debug(d) => d.set_config(settings),
        }
    }
}

/// Pick the first driver in `candidates` that handles `image_type`.
pub fn select(candidates: &[DriverKind], image_type: &str) -> Result<usize> {
    candidates
        .iter()
        .position(|d| d.handles(image_type))
        .ok_or_else(|| CnabError::driver(format!("no driver available for image type {image_type}")))
}
