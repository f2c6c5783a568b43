// System
use std::collections::{BTreeMap, BTreeSet};

// Third Party
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::debug;

// Local
use crate::config::InstallParameters;
use crate::error::InstallError;
use crate::utils::sha256_hex;

/// `__NAME__` where NAME is upper case, digits and single underscores.
static MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"__([A-Z][A-Z0-9_]*?)__").expect("marker pattern is valid"));

/// Bytes of a fully substituted config, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedConfig(Vec<u8>);

impl RenderedConfig {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn digest(&self) -> String {
        sha256_hex(&self.0)
    }
}

impl From<String> for RenderedConfig {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

/// Distinct marker names referenced by `template`, sorted.
pub fn markers(template: &str) -> BTreeSet<String> {
    MARKER
        .captures_iter(template)
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Substitute `params.template_variables` into `template`.
pub fn render(template: &[u8], params: &InstallParameters) -> Result<RenderedConfig, InstallError> {
    render_with(template, &params.template_variables, &params.allow_empty)
}

/// Every marker must have a binding, and the binding must be non-empty unless the
/// name is in `allow_empty`. Nothing is substituted unless everything resolves.
pub fn render_with(
    template: &[u8],
    variables: &BTreeMap<String, String>,
    allow_empty: &BTreeSet<String>,
) -> Result<RenderedConfig, InstallError> {
    let template = std::str::from_utf8(template)
        .map_err(|e| InstallError::template(format!("template is not valid UTF-8: {}", e)))?;

    let referenced = markers(template);
    let unresolved: Vec<&str> = referenced
        .iter()
        .filter(|name| !variables.contains_key(name.as_str()))
        .map(String::as_str)
        .collect();
    match unresolved.as_slice() {
        [] => {}
        [name] => {
            return Err(InstallError::template(format!(
                "unresolved variable {}",
                name
            )))
        }
        names => {
            return Err(InstallError::template(format!(
                "unresolved variables {}",
                names.join(", ")
            )))
        }
    }
    if let Some(name) = referenced
        .iter()
        .find(|name| variables[name.as_str()].is_empty() && !allow_empty.contains(name.as_str()))
    {
        return Err(InstallError::template(format!(
            "variable {} is bound to an empty value",
            name
        )));
    }

    let rendered = MARKER.replace_all(template, |caps: &Captures| variables[&caps[1]].clone());
    debug!(
        "Rendered {} variables into {} bytes",
        referenced.len(),
        rendered.len()
    );
    Ok(RenderedConfig::from(rendered.into_owned()))
}
