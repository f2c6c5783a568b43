// System
use std::ffi::OsStr;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

// Third Party
use serial_test::serial;
use tempfile::TempDir;

// Local
use calico_install_cni::{installer::EnvironmentSource, ProcessEnvironment};

const DEFAULT_ENV_VARS: &[(&str, &str)] = &[
    ("KUBERNETES_SERVICE_HOST", "127.0.0.1"),
    ("KUBERNETES_SERVICE_PORT", "8080"),
    ("KUBERNETES_NODE_NAME", "k8s-node-01"),
    ("SERVICEACCOUNT_TOKEN", "my_service_token"),
];

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
}

/// A sandboxed node filesystem laid out like the install container sees it.
struct Host {
    root: TempDir,
}

impl Host {
    fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("opt/cni/bin");
        fs::create_dir_all(&src).unwrap();
        for name in ["calico", "calico-ipam"] {
            let path = src.join(name);
            fs::write(&path, format!("#!/bin/sh\necho {}\n", name)).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
        fs::create_dir_all(root.path().join("host/opt/cni/bin")).unwrap();
        fs::create_dir_all(root.path().join("host/etc/cni/net.d")).unwrap();
        fs::copy(
            fixture("calico.conf.default"),
            root.path().join("calico.conf.tmp"),
        )
        .unwrap();
        Self { root }
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.path().join(rel)
    }

    fn bin_dir(&self) -> PathBuf {
        self.path("host/opt/cni/bin")
    }

    fn net_dir(&self) -> PathBuf {
        self.path("host/etc/cni/net.d")
    }

    /// Run install-cni once (`SLEEP=false`) with the default env plus `extra`.
    fn run_install_cni(&self, extra: &[(&str, &str)]) -> (Output, String) {
        let output = Command::new(env!("CARGO_BIN_EXE_install-cni"))
            .env_clear()
            .envs(DEFAULT_ENV_VARS.iter().copied())
            .env("SLEEP", "false")
            .env("CNI_BIN_SRC_DIR", self.path("opt/cni/bin"))
            .env("CNI_BIN_DIR", self.bin_dir())
            .env("CNI_NET_DIR", self.net_dir())
            .env("CNI_CONF_TEMPLATE", self.path("calico.conf.tmp"))
            .env("SERVICEACCOUNT_TOKEN_FILE", self.path("missing-token"))
            .env("SERVICEACCOUNT_CA_FILE", self.path("missing-ca.crt"))
            .envs(extra.iter().copied())
            .output()
            .unwrap();
        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        (output, combined)
    }
}

fn names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[test]
fn test_default_values_install_bins_and_config() {
    let host = Host::new();
    let (output, log) = host.run_install_cni(&[]);
    assert!(output.status.success(), "install-cni failed: {}", log);

    assert_eq!(names(&host.bin_dir()), vec!["calico", "calico-ipam"]);
    assert_eq!(names(&host.net_dir()), vec!["10-calico.conf"]);
}

#[test]
fn test_default_values_render_expected_config() {
    let host = Host::new();
    let (output, log) = host.run_install_cni(&[]);
    assert!(output.status.success(), "install-cni failed: {}", log);

    let expected = fs::read(fixture("expected_10-calico.conf")).unwrap();
    let received = fs::read(host.net_dir().join("10-calico.conf")).unwrap();
    assert_eq!(
        String::from_utf8(expected).unwrap(),
        String::from_utf8(received).unwrap()
    );
}

#[test]
fn test_conf_name_override() {
    let host = Host::new();
    let (output, log) = host.run_install_cni(&[("CNI_CONF_NAME", "10-test.conf")]);
    assert!(output.status.success(), "install-cni failed: {}", log);

    assert!(host.net_dir().join("10-test.conf").is_file());
    assert!(!host.net_dir().join("10-calico.conf").exists());
}

#[test]
fn test_skips_non_existent_bin_dir() {
    let host = Host::new();
    fs::remove_dir_all(host.bin_dir()).unwrap();
    let (output, log) = host.run_install_cni(&[]);

    assert!(output.status.success(), "install-cni failed: {}", log);
    assert!(log.contains(&format!(
        "{} is non-writeable, skipping",
        host.bin_dir().display()
    )));
    assert!(!host.bin_dir().exists());
    assert!(host.net_dir().join("10-calico.conf").is_file());
}

#[test]
fn test_fails_when_config_dir_is_missing() {
    let host = Host::new();
    fs::remove_dir_all(host.net_dir()).unwrap();
    let (output, log) = host.run_install_cni(&[]);

    assert!(!output.status.success());
    assert!(log.contains("cannot write CNI config"), "unexpected output: {}", log);
    assert!(!host.net_dir().exists());
    assert!(!host.path("host/etc/cni/10-calico.conf").exists());
}

#[test]
fn test_fails_without_required_variables() {
    let host = Host::new();
    let output = Command::new(env!("CARGO_BIN_EXE_install-cni"))
        .env_clear()
        .env("SLEEP", "false")
        .env("CNI_BIN_SRC_DIR", host.path("opt/cni/bin"))
        .env("CNI_BIN_DIR", host.bin_dir())
        .env("CNI_NET_DIR", host.net_dir())
        .env("CNI_CONF_TEMPLATE", host.path("calico.conf.tmp"))
        .output()
        .unwrap();
    let log = String::from_utf8_lossy(&output.stdout).into_owned();

    assert!(!output.status.success());
    assert!(log.contains("missing required variable KUBERNETES_SERVICE_HOST"));
    assert!(names(&host.net_dir()).is_empty());
}

#[test]
fn test_token_file_writes_kubeconfig() {
    let host = Host::new();
    fs::write(host.path("token"), "mounted_token\n").unwrap();
    let token_file = host.path("token").display().to_string();
    let (output, log) = host.run_install_cni(&[
        ("SERVICEACCOUNT_TOKEN", ""),
        ("SERVICEACCOUNT_TOKEN_FILE", token_file.as_str()),
    ]);
    assert!(output.status.success(), "install-cni failed: {}", log);

    assert_eq!(
        names(&host.net_dir()),
        vec!["10-calico.conf", "calico-kubeconfig"]
    );
    let kubeconfig =
        kube::config::Kubeconfig::read_from(host.net_dir().join("calico-kubeconfig")).unwrap();
    assert_eq!(kubeconfig.current_context.as_deref(), Some("calico-context"));
    let conf = fs::read_to_string(host.net_dir().join("10-calico.conf")).unwrap();
    assert!(conf.contains(r#""k8s_auth_token": "mounted_token""#));
}

#[test]
#[serial]
fn test_process_environment_snapshot() {
    std::env::set_var("CNI_CONF_NAME", "10-snapshot.conf");
    let snapshot = ProcessEnvironment.snapshot();
    std::env::remove_var("CNI_CONF_NAME");

    assert_eq!(snapshot.get("CNI_CONF_NAME"), Some("10-snapshot.conf"));
    assert_eq!(ProcessEnvironment.snapshot().get("CNI_CONF_NAME"), None);
}

#[test]
#[serial]
fn test_process_environment_drops_non_utf8_values() {
    std::env::set_var("CNI_BAD_BYTES", OsStr::from_bytes(b"\xff\xfe"));
    std::env::set_var("CNI_CONF_NAME", "10-utf8.conf");
    let snapshot = ProcessEnvironment.snapshot();
    std::env::remove_var("CNI_BAD_BYTES");
    std::env::remove_var("CNI_CONF_NAME");

    assert_eq!(snapshot.get("CNI_BAD_BYTES"), None);
    assert_eq!(snapshot.get("CNI_CONF_NAME"), Some("10-utf8.conf"));
}
