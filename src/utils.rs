// System
use std::path::Path;

// Third Party
use sha2::{Digest, Sha256};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// `<crate>=<level>` for every crate, comma separated.
fn default_directives(crate_names: &[&str], level: tracing::Level) -> String {
    let level = level.to_string().to_lowercase();
    crate_names
        .iter()
        .map(|name| format!("{}={}", name, level))
        .collect::<Vec<_>>()
        .join(",")
}

/// Install a stdout fmt subscriber. `RUST_LOG` wins over the per-crate defaults.
/// Pass the binary's own crate name too, or its events are filtered out.
pub fn init_tracing(crate_names: &[&str], level: tracing::Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(crate_names, level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Exit cleanly on SIGINT/SIGTERM. This is the only way out of watch mode.
pub fn setup_exit_hooks() -> std::io::Result<()> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            info!("Received signal {}, exiting", signal);
            std::process::exit(0);
        }
    });
    Ok(())
}

/// Capability check: `dir` exists, is a directory, and a file can be created in it.
/// Tries a real temp file rather than reading permission bits.
pub fn is_writable(dir: &Path) -> bool {
    if !dir.is_dir() {
        return false;
    }
    tempfile::Builder::new()
        .prefix(".install-cni-check")
        .tempfile_in(dir)
        .is_ok()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
