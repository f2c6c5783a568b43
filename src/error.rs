use std::path::{Path, PathBuf};

use thiserror::Error;

/// Everything that can abort an install pass.
#[derive(Debug, Error)]
pub enum InstallError {
    /// Bad or missing required input. Needs an operator fix.
    #[error("config error: {0}")]
    Config(String),

    /// Malformed template or unresolved variable.
    #[error("template error: {0}")]
    Template(String),

    /// A required install target is unusable.
    #[error("fatal error: {0}")]
    Fatal(String),

    /// Unexpected filesystem failure while working on `path`.
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl InstallError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    pub fn fatal(msg: impl Into<String>) -> Self {
        Self::Fatal(msg.into())
    }

    pub fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result of a single pipeline step that did not abort the pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Success,
    /// The optional target directory was missing or read-only.
    SkippedWritable(String),
    /// Rendered bytes matched what is already installed.
    Unchanged,
}
