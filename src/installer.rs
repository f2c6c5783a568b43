// System
use std::path::Path;

// Third Party
use tracing::{debug, info};

// Local
use crate::config::{self, Defaults, Environment, InstallParameters, TemplateSource, TokenSource};
use crate::error::{InstallError, StepOutcome};
use crate::kubeconfig;
use crate::stager::{self, StageOptions};
use crate::template::{self, RenderedConfig};
use crate::utils::sha256_hex;
use crate::writer::AtomicWriter;

/// Where each pass gets its environment from. Re-read on every pass so rotated
/// credentials are picked up in watch mode.
pub trait EnvironmentSource {
    fn snapshot(&self) -> Environment;
}

/// The real process environment.
pub struct ProcessEnvironment;

impl EnvironmentSource for ProcessEnvironment {
    fn snapshot(&self) -> Environment {
        Environment::from_process()
    }
}

impl EnvironmentSource for Environment {
    fn snapshot(&self) -> Environment {
        self.clone()
    }
}

/// What one pass did to each install target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub binaries: StepOutcome,
    /// `None` when the token was given inline and no kubeconfig is managed.
    pub kubeconfig: Option<StepOutcome>,
    pub config: StepOutcome,
}

struct RenderedFiles {
    config: RenderedConfig,
    kubeconfig: Option<RenderedConfig>,
}

enum InstallState {
    Init,
    Resolving,
    Staging(InstallParameters),
    Rendering {
        params: InstallParameters,
        binaries: StepOutcome,
    },
    Writing {
        params: InstallParameters,
        binaries: StepOutcome,
        rendered: RenderedFiles,
    },
    Done {
        params: InstallParameters,
        report: PassReport,
    },
}

/// Drives resolve → stage → render → write, and in watch mode repeats it forever.
pub struct Installer<E: EnvironmentSource> {
    env: E,
    defaults: Defaults,
}

impl<E: EnvironmentSource> Installer<E> {
    pub fn new(env: E, defaults: Defaults) -> Self {
        Self { env, defaults }
    }

    fn load_template(source: &TemplateSource) -> Result<Vec<u8>, InstallError> {
        match source {
            TemplateSource::Inline(content) => Ok(content.clone().into_bytes()),
            TemplateSource::File(path) => {
                std::fs::read(path).map_err(|e| InstallError::io(path, e))
            }
        }
    }

    /// Write `rendered` unless the file on disk already holds exactly these bytes.
    fn write_if_changed(
        &self,
        writer: AtomicWriter,
        rendered: &RenderedConfig,
        dir: &Path,
        filename: &str,
    ) -> Result<StepOutcome, InstallError> {
        let path = dir.join(filename);
        if let Ok(installed) = std::fs::read(&path) {
            if sha256_hex(&installed) == rendered.digest() {
                debug!("{} is up to date", path.display());
                return Ok(StepOutcome::Unchanged);
            }
        }
        writer.write(rendered, dir, filename)
    }

    fn advance(&mut self, state: InstallState) -> Result<InstallState, InstallError> {
        match state {
            InstallState::Init => {
                debug!("State: Init");
                Ok(InstallState::Resolving)
            }
            InstallState::Resolving => {
                debug!("State: Resolving");
                let params = config::resolve(&self.env.snapshot(), &self.defaults)?;
                debug!("Resolved parameters: {:?}", params);
                Ok(InstallState::Staging(params))
            }
            InstallState::Staging(params) => {
                debug!("State: Staging");
                let binaries = stager::stage(
                    &params.bin_source_dir,
                    &params.bin_target_dir,
                    &StageOptions::from(&params),
                )?;
                Ok(InstallState::Rendering { params, binaries })
            }
            InstallState::Rendering { params, binaries } => {
                debug!("State: Rendering");
                let template_bytes = Self::load_template(&params.template)?;
                let config = template::render(&template_bytes, &params)?;
                let kubeconfig = match params.token_source {
                    TokenSource::File(_) => Some(kubeconfig::generate(&params)?),
                    TokenSource::Inline => None,
                };
                Ok(InstallState::Writing {
                    params,
                    binaries,
                    rendered: RenderedFiles { config, kubeconfig },
                })
            }
            InstallState::Writing {
                params,
                binaries,
                rendered,
            } => {
                debug!("State: Writing");
                // The CNI config points at the kubeconfig, so the kubeconfig goes first.
                let kubeconfig = match &rendered.kubeconfig {
                    Some(document) => Some(self.write_if_changed(
                        AtomicWriter::kubeconfig(),
                        document,
                        &params.net_dir,
                        &params.kubeconfig_name,
                    )?),
                    None => None,
                };
                let config = self.write_if_changed(
                    AtomicWriter::cni_config(),
                    &rendered.config,
                    &params.net_dir,
                    &params.conf_name,
                )?;
                Ok(InstallState::Done {
                    params,
                    report: PassReport {
                        binaries,
                        kubeconfig,
                        config,
                    },
                })
            }
            InstallState::Done { .. } => Ok(InstallState::Resolving),
        }
    }

    /// Run one full pass and report what happened.
    pub fn run_pass(&mut self) -> Result<PassReport, InstallError> {
        let mut state = InstallState::Init;
        loop {
            state = match state {
                InstallState::Done { report, .. } => return Ok(report),
                other => self.advance(other)?,
            };
        }
    }

    /// Run passes until one fails, or until the first success when watch mode is off.
    /// In watch mode this only returns on error; the process is stopped by a signal.
    pub async fn run(&mut self) -> Result<(), InstallError> {
        let mut state = InstallState::Init;
        loop {
            state = match state {
                InstallState::Done { params, report } => {
                    info!(
                        "Install pass complete: binaries {:?}, config {:?}",
                        report.binaries, report.config
                    );
                    if !params.watch {
                        info!("Done installing CNI plugin");
                        return Ok(());
                    }
                    debug!("Sleeping for {:?}", params.sleep_interval);
                    tokio::time::sleep(params.sleep_interval).await;
                    self.advance(InstallState::Done { params, report })?
                }
                other => self.advance(other)?,
            };
        }
    }
}
