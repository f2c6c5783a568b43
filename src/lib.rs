//! Installs the Calico CNI plugin onto a Kubernetes node: stages the plugin binaries
//! into the host's CNI bin dir and renders the CNI network config into net.d.

pub mod config;
pub mod error;
pub mod installer;
pub mod kubeconfig;
pub mod stager;
pub mod template;
pub mod utils;
pub mod writer;

pub use config::{resolve, Defaults, Environment, InstallParameters};
pub use error::{InstallError, StepOutcome};
pub use installer::{Installer, PassReport, ProcessEnvironment};
