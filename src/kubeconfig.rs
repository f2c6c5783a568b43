//! Kubeconfig for the CNI plugin, so it can reach the API server with the node's
//! service-account token after the install container has exited.

// Third Party
use base64::{engine::general_purpose::STANDARD, Engine};
use kube::config::Kubeconfig;
use serde_json::json;
use tracing::debug;

// Local
use crate::config::InstallParameters;
use crate::error::InstallError;
use crate::template::RenderedConfig;

const CLUSTER_NAME: &str = "local";
const USER_NAME: &str = "calico";
const CONTEXT_NAME: &str = "calico-context";

/// Build the kubeconfig document. The CA file is embedded when present, otherwise
/// TLS verification is turned off. JSON is emitted, which every kubeconfig reader
/// accepts as YAML.
pub fn generate(params: &InstallParameters) -> Result<RenderedConfig, InstallError> {
    let cluster = match std::fs::read(&params.ca_file) {
        Ok(ca) => json!({
            "server": params.api_server_url(),
            "certificate-authority-data": STANDARD.encode(ca),
        }),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            debug!(
                "No CA file at {}, kubeconfig will skip TLS verification",
                params.ca_file.display()
            );
            json!({
                "server": params.api_server_url(),
                "insecure-skip-tls-verify": true,
            })
        }
        Err(error) => return Err(InstallError::io(&params.ca_file, error)),
    };

    let document = json!({
        "apiVersion": "v1",
        "kind": "Config",
        "clusters": [{ "name": CLUSTER_NAME, "cluster": cluster }],
        "users": [{ "name": USER_NAME, "user": { "token": params.service_account_token } }],
        "contexts": [{
            "name": CONTEXT_NAME,
            "context": { "cluster": CLUSTER_NAME, "user": USER_NAME },
        }],
        "current-context": CONTEXT_NAME,
    });
    let text = serde_json::to_string_pretty(&document)
        .map_err(|e| InstallError::fatal(format!("cannot serialize kubeconfig: {}", e)))?;

    Kubeconfig::from_yaml(&text)
        .map_err(|e| InstallError::fatal(format!("generated kubeconfig is invalid: {}", e)))?;
    Ok(RenderedConfig::from(text + "\n"))
}
