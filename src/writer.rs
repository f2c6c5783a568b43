// System
use std::fs::Permissions;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

// Third Party
use tracing::{debug, info};

// Local
use crate::error::{InstallError, StepOutcome};
use crate::template::RenderedConfig;
use crate::utils::is_writable;

/// Writes rendered files into a node-mounted directory via temp file + rename, so the
/// final path only ever holds a complete file.
#[derive(Debug, Clone, Copy)]
pub struct AtomicWriter {
    mode: u32,
    label: &'static str,
}

impl AtomicWriter {
    pub const fn cni_config() -> Self {
        Self {
            mode: 0o644,
            label: "CNI config",
        }
    }

    /// Carries a bearer token, so owner-only.
    pub const fn kubeconfig() -> Self {
        Self {
            mode: 0o600,
            label: "kubeconfig",
        }
    }

    pub fn write(
        &self,
        rendered: &RenderedConfig,
        target_dir: &Path,
        filename: &str,
    ) -> Result<StepOutcome, InstallError> {
        if !is_writable(target_dir) {
            return Err(InstallError::fatal(format!(
                "cannot write {}: {} is missing or not writeable",
                self.label,
                target_dir.display()
            )));
        }
        let final_path = target_dir.join(filename);

        // The temp file lives in the target dir so the rename never crosses filesystems.
        let mut tmp = tempfile::Builder::new()
            .prefix(&format!(".{}.", filename))
            .suffix(".tmp")
            .tempfile_in(target_dir)
            .map_err(|e| InstallError::io(target_dir, e))?;
        debug!(
            "Writing {} bytes of {} to {}",
            rendered.as_bytes().len(),
            self.label,
            tmp.path().display()
        );
        tmp.write_all(rendered.as_bytes())
            .map_err(|e| InstallError::io(tmp.path(), e))?;
        tmp.as_file()
            .set_permissions(Permissions::from_mode(self.mode))
            .map_err(|e| InstallError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| InstallError::io(tmp.path(), e))?;
        tmp.persist(&final_path)
            .map_err(|e| InstallError::io(&final_path, e.error))?;

        info!("Wrote {} to {}", self.label, final_path.display());
        Ok(StepOutcome::Success)
    }
}
