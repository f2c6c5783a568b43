// System
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

// Third Party
use tracing::debug;

// Local
use crate::error::InstallError;

pub const DEFAULT_CNI_CONF_NAME: &str = "10-calico.conf";
pub const DEFAULT_KUBECONFIG_NAME: &str = "calico-kubeconfig";
pub const DEFAULT_SLEEP_INTERVAL: Duration = Duration::from_secs(10);

/// Env vars prefixed with this bind the template variable named by the rest of the key.
pub const TEMPLATE_VAR_PREFIX: &str = "CNI_TEMPLATE_VAR_";

/// Template variables that may legitimately render as an empty string.
const ALLOWED_EMPTY_VARIABLES: &[&str] = &["ETCD_ENDPOINTS"];

/// A snapshot of environment variables. Components never call `std::env` themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment(BTreeMap<String, String>);

impl Environment {
    /// Variables whose name or value is not UTF-8 are dropped, since none of them
    /// can be one the installer recognises.
    pub fn from_process() -> Self {
        std::env::vars_os()
            .filter_map(|(key, value)| {
                Some((key.into_string().ok()?, value.into_string().ok()?))
            })
            .collect()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn without(mut self, key: &str) -> Self {
        self.0.remove(key);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Like `get`, but an empty value counts as unset.
    pub fn non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).filter(|v| !v.is_empty())
    }

    /// `1` or `true` (any case) is true. Unset or empty falls back to `default`.
    pub fn flag(&self, key: &str, default: bool) -> bool {
        self.non_empty(key)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(default)
    }

    fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Environment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Fallbacks for every optional setting. `Default` is the in-container layout of a
/// calico-node install container with the host mounted at `/host`.
#[derive(Debug, Clone)]
pub struct Defaults {
    pub conf_name: String,
    pub kubeconfig_name: String,
    pub template_path: PathBuf,
    pub bin_source_dir: PathBuf,
    pub bin_target_dir: PathBuf,
    pub net_dir: PathBuf,
    pub host_net_dir: PathBuf,
    pub token_file: PathBuf,
    pub ca_file: PathBuf,
    pub watch: bool,
    pub sleep_interval: Duration,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            conf_name: DEFAULT_CNI_CONF_NAME.to_string(),
            kubeconfig_name: DEFAULT_KUBECONFIG_NAME.to_string(),
            template_path: PathBuf::from("/calico.conf.tmp"),
            bin_source_dir: PathBuf::from("/opt/cni/bin"),
            bin_target_dir: PathBuf::from("/host/opt/cni/bin"),
            net_dir: PathBuf::from("/host/etc/cni/net.d"),
            host_net_dir: PathBuf::from("/etc/cni/net.d"),
            token_file: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token"),
            ca_file: PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/ca.crt"),
            watch: true,
            sleep_interval: DEFAULT_SLEEP_INTERVAL,
        }
    }
}

/// Where the service-account token came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    Inline,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateSource {
    /// Template content given directly through `CNI_NETWORK_CONFIG`.
    Inline(String),
    File(PathBuf),
}

/// Everything one install pass needs, resolved once at the start of the pass.
#[derive(Clone)]
pub struct InstallParameters {
    pub service_account_token: String,
    pub token_source: TokenSource,
    pub api_protocol: String,
    pub api_host: String,
    pub api_port: u16,
    pub node_name: String,
    pub conf_name: String,
    pub kubeconfig_name: String,
    pub template: TemplateSource,
    pub bin_source_dir: PathBuf,
    pub bin_target_dir: PathBuf,
    pub net_dir: PathBuf,
    pub ca_file: PathBuf,
    pub template_variables: BTreeMap<String, String>,
    pub allow_empty: BTreeSet<String>,
    pub update_binaries: bool,
    pub skip_binaries: BTreeSet<String>,
    pub watch: bool,
    pub sleep_interval: Duration,
}

impl InstallParameters {
    pub fn api_server_url(&self) -> String {
        format!("{}://{}:{}", self.api_protocol, self.api_host, self.api_port)
    }

    pub fn conf_path(&self) -> PathBuf {
        self.net_dir.join(&self.conf_name)
    }
}

impl fmt::Debug for InstallParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let variables: BTreeMap<&str, &str> = self
            .template_variables
            .iter()
            .map(|(k, v)| {
                if k == "SERVICEACCOUNT_TOKEN" {
                    (k.as_str(), "<redacted>")
                } else {
                    (k.as_str(), v.as_str())
                }
            })
            .collect();
        f.debug_struct("InstallParameters")
            .field("service_account_token", &"<redacted>")
            .field("token_source", &self.token_source)
            .field("api_server", &self.api_server_url())
            .field("node_name", &self.node_name)
            .field("conf_name", &self.conf_name)
            .field("template", &self.template)
            .field("bin_source_dir", &self.bin_source_dir)
            .field("bin_target_dir", &self.bin_target_dir)
            .field("net_dir", &self.net_dir)
            .field("template_variables", &variables)
            .field("watch", &self.watch)
            .finish()
    }
}

fn required<'a>(env: &'a Environment, key: &str) -> Result<&'a str, InstallError> {
    env.non_empty(key)
        .ok_or_else(|| InstallError::config(format!("missing required variable {}", key)))
}

fn path_or(env: &Environment, key: &str, default: &Path) -> PathBuf {
    env.non_empty(key)
        .map(PathBuf::from)
        .unwrap_or_else(|| default.to_path_buf())
}

/// Filenames land inside the CNI config dir, so they must not carry a path.
fn file_name_or(env: &Environment, key: &str, default: &str) -> Result<String, InstallError> {
    match env.non_empty(key) {
        Some(name) if name.contains('/') || name == "." || name == ".." => Err(
            InstallError::config(format!("{} must be a plain file name, got {:?}", key, name)),
        ),
        Some(name) => Ok(name.to_string()),
        None => Ok(default.to_string()),
    }
}

/// Inline token first, then the mounted token file.
fn resolve_token(
    env: &Environment,
    defaults: &Defaults,
) -> Result<(String, TokenSource), InstallError> {
    if let Some(token) = env.non_empty("SERVICEACCOUNT_TOKEN") {
        return Ok((token.to_string(), TokenSource::Inline));
    }
    let token_file = path_or(env, "SERVICEACCOUNT_TOKEN_FILE", &defaults.token_file);
    match std::fs::read_to_string(&token_file) {
        Ok(contents) if !contents.trim().is_empty() => {
            debug!("Read service account token from {}", token_file.display());
            Ok((contents.trim().to_string(), TokenSource::File(token_file)))
        }
        Ok(_) => Err(InstallError::config(
            "missing required variable SERVICEACCOUNT_TOKEN",
        )),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Err(InstallError::config(
            "missing required variable SERVICEACCOUNT_TOKEN",
        )),
        Err(error) => Err(InstallError::io(&token_file, error)),
    }
}

/// Build the parameter set for one pass from an environment snapshot.
pub fn resolve(env: &Environment, defaults: &Defaults) -> Result<InstallParameters, InstallError> {
    let api_host = required(env, "KUBERNETES_SERVICE_HOST")?.to_string();
    let api_port_raw = required(env, "KUBERNETES_SERVICE_PORT")?;
    let api_port: u16 = api_port_raw.parse().map_err(|_| {
        InstallError::config(format!(
            "invalid KUBERNETES_SERVICE_PORT {:?}: not a port number",
            api_port_raw
        ))
    })?;
    let (service_account_token, token_source) = resolve_token(env, defaults)?;

    let api_protocol = env
        .non_empty("KUBERNETES_SERVICE_PROTOCOL")
        .unwrap_or("https")
        .to_string();
    let node_name = env
        .non_empty("KUBERNETES_NODE_NAME")
        .or_else(|| env.non_empty("HOSTNAME"))
        .unwrap_or_default()
        .to_string();
    let conf_name = file_name_or(env, "CNI_CONF_NAME", &defaults.conf_name)?;
    let kubeconfig_name = file_name_or(env, "CNI_KUBECONFIG_NAME", &defaults.kubeconfig_name)?;

    let template = match env.non_empty("CNI_NETWORK_CONFIG") {
        Some(content) => TemplateSource::Inline(content.to_string()),
        None => TemplateSource::File(path_or(env, "CNI_CONF_TEMPLATE", &defaults.template_path)),
    };

    let host_net_dir = path_or(env, "CNI_HOST_NET_DIR", &defaults.host_net_dir);
    let kubeconfig_filepath = host_net_dir.join(&kubeconfig_name);

    let mut template_variables = BTreeMap::new();
    for (key, value) in [
        ("KUBERNETES_SERVICE_PROTOCOL", api_protocol.clone()),
        ("KUBERNETES_SERVICE_HOST", api_host.clone()),
        ("KUBERNETES_SERVICE_PORT", api_port.to_string()),
        ("KUBERNETES_NODE_NAME", node_name.clone()),
        ("SERVICEACCOUNT_TOKEN", service_account_token.clone()),
        (
            "ETCD_ENDPOINTS",
            env.get("ETCD_ENDPOINTS").unwrap_or_default().to_string(),
        ),
        (
            "CNI_MTU",
            env.non_empty("CNI_MTU").unwrap_or("1500").to_string(),
        ),
        (
            "LOG_LEVEL",
            env.non_empty("LOG_LEVEL").unwrap_or("info").to_string(),
        ),
        (
            "KUBECONFIG_FILEPATH",
            kubeconfig_filepath.display().to_string(),
        ),
    ] {
        template_variables.insert(key.to_string(), value);
    }

    let mut allow_empty: BTreeSet<String> = ALLOWED_EMPTY_VARIABLES
        .iter()
        .map(|name| name.to_string())
        .collect();
    for (key, value) in env.iter() {
        let Some(name) = key.strip_prefix(TEMPLATE_VAR_PREFIX) else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        if value.is_empty() {
            allow_empty.insert(name.to_string());
        }
        template_variables.insert(name.to_string(), value.clone());
    }

    let sleep_interval = match env.non_empty("SLEEP_INTERVAL_SECONDS") {
        Some(raw) => Duration::from_secs(raw.parse().map_err(|_| {
            InstallError::config(format!("invalid SLEEP_INTERVAL_SECONDS {:?}", raw))
        })?),
        None => defaults.sleep_interval,
    };

    let skip_binaries = env
        .get("SKIP_CNI_BINARIES")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect();

    Ok(InstallParameters {
        service_account_token,
        token_source,
        api_protocol,
        api_host,
        api_port,
        node_name,
        conf_name,
        kubeconfig_name,
        template,
        bin_source_dir: path_or(env, "CNI_BIN_SRC_DIR", &defaults.bin_source_dir),
        bin_target_dir: path_or(env, "CNI_BIN_DIR", &defaults.bin_target_dir),
        net_dir: path_or(env, "CNI_NET_DIR", &defaults.net_dir),
        ca_file: path_or(env, "SERVICEACCOUNT_CA_FILE", &defaults.ca_file),
        template_variables,
        allow_empty,
        update_binaries: env.flag("UPDATE_CNI_BINARIES", true),
        skip_binaries,
        watch: env.flag("SLEEP", defaults.watch),
        sleep_interval,
    })
}
