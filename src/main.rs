// Third Party
use tracing::error;

// Local
use calico_install_cni::{
    utils::{init_tracing, setup_exit_hooks},
    Defaults, Installer, ProcessEnvironment,
};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    init_tracing(&["calico_install_cni", "install_cni"], tracing::Level::INFO);
    setup_exit_hooks()?;
    let mut installer = Installer::new(ProcessEnvironment, Defaults::default());

    // A failed pass exits non-zero and the kubelet restarts the container with backoff
    if let Err(e) = installer.run().await {
        error!("Failed to install CNI plugin: {}", e);
        return Err(e.into());
    }

    Ok(())
}
