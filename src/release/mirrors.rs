//! Registry mirror rules, rendered as an ImageContentSourcePolicy for `oc`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use tempfile::NamedTempFile;

/// Redirects pulls from `source` to the listed mirrors, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MirrorRule {
    pub source: String,
    pub mirrors: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageContentSourcePolicy<'a> {
    api_version: &'static str,
    kind: &'static str,
    metadata: PolicyMetadata,
    spec: PolicySpec<'a>,
}

#[derive(Serialize)]
struct PolicyMetadata {
    name: &'static str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PolicySpec<'a> {
    repository_digest_mirrors: &'a [MirrorRule],
}

/// Render `rules` as an ImageContentSourcePolicy document.
pub fn render_icsp(rules: &[MirrorRule]) -> Result<String> {
    let policy = ImageContentSourcePolicy {
        api_version: "operator.openshift.io/v1alpha1",
        kind: "ImageContentSourcePolicy",
        metadata: PolicyMetadata {
            name: "image-policy",
        },
        spec: PolicySpec {
            repository_digest_mirrors: rules,
        },
    };
    serde_yaml::to_string(&policy).context("serializing mirror rules")
}

/// Write the policy to a temp file that is deleted when dropped.
pub fn write_icsp_file(rules: &[MirrorRule]) -> Result<NamedTempFile> {
    let yaml = render_icsp(rules)?;
    let mut file = tempfile::Builder::new()
        .prefix("icsp-")
        .suffix(".yaml")
        .tempfile()
        .context("creating mirror policy file")?;
    file.write_all(yaml.as_bytes())
        .context("writing mirror policy file")?;
    file.flush().context("writing mirror policy file")?;
    Ok(file)
}
