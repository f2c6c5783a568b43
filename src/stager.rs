// System
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::Path;

// Third Party
use tracing::{debug, info, warn};

// Local
use crate::config::InstallParameters;
use crate::error::{InstallError, StepOutcome};
use crate::utils::is_writable;

#[derive(Debug, Clone, Default)]
pub struct StageOptions {
    /// Overwrite binaries already present on the host.
    pub update_existing: bool,
    /// Binary names never staged.
    pub skip: BTreeSet<String>,
}

impl From<&InstallParameters> for StageOptions {
    fn from(params: &InstallParameters) -> Self {
        Self {
            update_existing: params.update_binaries,
            skip: params.skip_binaries.clone(),
        }
    }
}

/// Copy one binary through a temp file next to its destination. A failed copy drops
/// (and so deletes) the temp file, and a binary that is currently executing can
/// still be replaced because the rename swaps the directory entry.
fn copy_binary(source: &Path, target_dir: &Path, name: &str) -> Result<(), InstallError> {
    let mut input = File::open(source).map_err(|e| InstallError::io(source, e))?;
    let permissions = input
        .metadata()
        .map_err(|e| InstallError::io(source, e))?
        .permissions();
    let mut tmp = tempfile::Builder::new()
        .prefix(&format!(".{}.", name))
        .suffix(".tmp")
        .tempfile_in(target_dir)
        .map_err(|e| InstallError::io(target_dir, e))?;
    std::io::copy(&mut input, &mut tmp).map_err(|e| InstallError::io(tmp.path(), e))?;
    tmp.as_file()
        .set_permissions(permissions)
        .map_err(|e| InstallError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| InstallError::io(tmp.path(), e))?;
    let destination = target_dir.join(name);
    tmp.persist(&destination)
        .map_err(|e| InstallError::io(&destination, e.error))?;
    Ok(())
}

/// Copy every regular file in `source_dir` into `target_dir`.
///
/// A missing or read-only `target_dir` is not an error: the host may already carry the
/// binaries from an earlier install, so the step reports `SkippedWritable` and the
/// pipeline moves on to the config.
pub fn stage(
    source_dir: &Path,
    target_dir: &Path,
    options: &StageOptions,
) -> Result<StepOutcome, InstallError> {
    if !is_writable(target_dir) {
        let reason = format!("{} is non-writeable, skipping", target_dir.display());
        warn!("{}", reason);
        return Ok(StepOutcome::SkippedWritable(reason));
    }

    let mut sources = Vec::new();
    for entry in fs::read_dir(source_dir).map_err(|e| InstallError::io(source_dir, e))? {
        let entry = entry.map_err(|e| InstallError::io(source_dir, e))?;
        let path = entry.path();
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                warn!("{} is a dangling symlink, skipping", path.display());
                continue;
            }
            Err(error) => return Err(InstallError::io(&path, error)),
        };
        if !metadata.is_file() {
            continue;
        }
        sources.push((entry.file_name().to_string_lossy().into_owned(), path));
    }
    sources.sort();

    let mut staged = 0;
    for (name, path) in sources {
        if options.skip.contains(&name) {
            debug!("Skipping {} as requested", name);
            continue;
        }
        if !options.update_existing && target_dir.join(&name).exists() {
            debug!("{} already installed, not updating", name);
            continue;
        }
        copy_binary(&path, target_dir, &name)?;
        debug!("Installed {} into {}", name, target_dir.display());
        staged += 1;
    }

    info!(
        "Installed {} CNI binaries into {}",
        staged,
        target_dir.display()
    );
    Ok(StepOutcome::Success)
}
