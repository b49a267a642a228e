//! `oc`-backed release inspection.

use anyhow::{Context, Result};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;

use super::mirrors::write_icsp_file;
use super::{ReleaseInspector, ReleaseQuery};
use crate::arch::Architecture;
use crate::error::AssemblyError;
use crate::process::Cmd;

pub const OC_BINARY: &str = "oc";

/// Bound on resolving a component pull spec from the release image.
pub const RESOLVE_TIMEOUT: Duration = Duration::from_secs(30);

/// Shells out to `oc adm release info` and `oc image extract`.
#[derive(Debug, Clone)]
pub struct OcInspector {
    binary: String,
    resolve_timeout: Duration,
}

impl Default for OcInspector {
    fn default() -> Self {
        Self {
            binary: OC_BINARY.to_string(),
            resolve_timeout: RESOLVE_TIMEOUT,
        }
    }
}

impl OcInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }
}

/// Temp files handed to `oc`; removed when dropped.
struct Credentials {
    icsp: Option<NamedTempFile>,
    pull_secret: Option<NamedTempFile>,
}

impl Credentials {
    fn materialize(query: &ReleaseQuery) -> Result<Self> {
        let icsp = if query.mirrors.is_empty() {
            None
        } else {
            Some(write_icsp_file(&query.mirrors)?)
        };
        let pull_secret = match &query.pull_secret {
            Some(secret) => {
                let mut file = tempfile::Builder::new()
                    .prefix("pull-secret-")
                    .suffix(".json")
                    .tempfile()
                    .context("creating pull secret file")?;
                file.write_all(secret.as_bytes())
                    .context("writing pull secret file")?;
                file.flush().context("writing pull secret file")?;
                Some(file)
            }
            None => None,
        };
        Ok(Self { icsp, pull_secret })
    }

    fn apply(&self, mut cmd: Cmd, query: &ReleaseQuery, arch: Architecture) -> Cmd {
        cmd = cmd.args(["--filter-by-os", &arch.os_filter()]);
        if query.insecure {
            cmd = cmd.arg("--insecure=true");
        }
        if let Some(icsp) = &self.icsp {
            cmd = cmd.arg("--icsp-file").arg_path(icsp.path());
        }
        if let Some(secret) = &self.pull_secret {
            cmd = cmd.arg("-a").arg_path(secret.path());
        }
        cmd
    }
}

impl ReleaseInspector for OcInspector {
    fn resolve_image(
        &self,
        query: &ReleaseQuery,
        component: &str,
        arch: Architecture,
    ) -> Result<String> {
        let creds = Credentials::materialize(query)?;
        let cmd = Cmd::new(&self.binary)
            .args(["adm", "release", "info"])
            .arg(format!("--image-for={component}"));
        let result = creds
            .apply(cmd, query, arch)
            .arg(&query.release_image)
            .timeout(self.resolve_timeout)
            .allow_fail()
            .run()?;

        let pull_spec = result.stdout.trim();
        if !result.success() || pull_spec.is_empty() {
            return Err(AssemblyError::Extraction {
                image: query.release_image.clone(),
                file: component.to_string(),
                reason: format!("release info failed ({}): {}", result.status, result.stderr.trim()),
            }
            .into());
        }
        Ok(pull_spec.to_string())
    }

    fn extract(
        &self,
        query: &ReleaseQuery,
        image: &str,
        path_in_image: &str,
        dest_dir: &Path,
        arch: Architecture,
    ) -> Result<()> {
        let creds = Credentials::materialize(query)?;
        let cmd = Cmd::new(&self.binary)
            .args(["image", "extract", "--path"])
            .arg(format!("{}:{}", path_in_image, dest_dir.display()))
            .arg("--confirm");
        let result = creds
            .apply(cmd, query, arch)
            .arg(image)
            .allow_fail()
            .run()?;

        if !result.success() {
            return Err(AssemblyError::Extraction {
                image: image.to_string(),
                file: path_in_image.to_string(),
                reason: format!("image extract failed ({}): {}", result.status, result.stderr.trim()),
            }
            .into());
        }
        Ok(())
    }
}
