//! Assembly configuration loaded from TOML.
//!
//! Raw `*Toml` structs mirror the file; [`AssemblyConfig`] is the validated
//! form the pipeline consumes. Relative paths in the file are resolved
//! against the file's directory.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::arch::Architecture;
use crate::assembly::Platform;
use crate::cache::{ContentCache, DownloadDescriptor};
use crate::error::AssemblyError;
use crate::release::{MirrorRule, ReleaseQuery, RetryPolicy, StreamMetadata};

/// Replaces `[image].os_image_url` when set.
pub const OS_IMAGE_OVERRIDE_ENV: &str = "AGENT_OS_IMAGE_OVERRIDE";

#[derive(Debug, Clone)]
pub struct AssemblyConfig {
    pub release: ReleaseQuery,
    pub retry: RetryPolicy,
    pub os_image: Option<DownloadDescriptor>,
    pub coreos_stream: Option<PathBuf>,
    pub boot_artifacts_base_url: Option<String>,
    pub platform: Platform,
    pub cache_root: Option<PathBuf>,
    pub architecture: Architecture,
    pub rendezvous_ip: IpAddr,
    pub kernel_args: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AssemblyToml {
    release: ReleaseToml,
    #[serde(default)]
    extraction: ExtractionToml,
    image: ImageToml,
    agent: AgentToml,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReleaseToml {
    image: String,
    pull_secret_file: Option<String>,
    #[serde(default)]
    insecure: bool,
    #[serde(default)]
    mirrors: Vec<MirrorRule>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ExtractionToml {
    max_tries: Option<u32>,
    retry_delay_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageToml {
    os_image_url: Option<String>,
    os_image_sha256: Option<String>,
    coreos_stream: Option<String>,
    boot_artifacts_base_url: Option<String>,
    platform: String,
    cache_root: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AgentToml {
    architecture: String,
    rendezvous_ip: String,
    kernel_args: Option<String>,
}

impl AssemblyConfig {
    /// Load `path`, honoring [`OS_IMAGE_OVERRIDE_ENV`].
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let override_url = std::env::var(OS_IMAGE_OVERRIDE_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty());
        Self::from_toml_str(&text, base_dir, override_url)
            .with_context(|| format!("invalid config '{}'", path.display()))
    }

    pub fn from_toml_str(text: &str, base_dir: &Path, os_image_override: Option<String>) -> Result<Self> {
        let parsed: AssemblyToml = toml::from_str(text).context("parsing TOML")?;

        let release_image = parsed.release.image.trim().to_string();
        if release_image.is_empty() {
            return Err(invalid("release.image must not be empty"));
        }
        for rule in &parsed.release.mirrors {
            if rule.source.trim().is_empty() || rule.mirrors.is_empty() {
                return Err(invalid(format!(
                    "mirror rule for '{}' needs a source and at least one mirror",
                    rule.source
                )));
            }
        }
        let pull_secret = match &parsed.release.pull_secret_file {
            Some(file) => {
                let path = resolve_path(base_dir, file);
                let secret = fs::read_to_string(&path)
                    .with_context(|| format!("reading pull secret '{}'", path.display()))?;
                Some(secret.trim().to_string())
            }
            None => None,
        };

        let max_tries = parsed
            .extraction
            .max_tries
            .unwrap_or(RetryPolicy::default().max_tries);
        if max_tries == 0 {
            return Err(invalid("extraction.max_tries must be at least 1"));
        }
        let delay = parsed
            .extraction
            .retry_delay_secs
            .map(Duration::from_secs)
            .unwrap_or(RetryPolicy::default().delay);

        let image = parsed.image;
        let os_image = os_image_override
            .or(image.os_image_url)
            .map(|url| {
                let descriptor = DownloadDescriptor::new(url.trim());
                match &image.os_image_sha256 {
                    Some(sha) => descriptor.with_sha256(sha.trim()),
                    None => descriptor,
                }
            });
        let boot_artifacts_base_url = image
            .boot_artifacts_base_url
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty());

        let agent = parsed.agent;
        let rendezvous_ip: IpAddr = agent.rendezvous_ip.trim().parse().map_err(|_| {
            invalid(format!(
                "agent.rendezvous_ip '{}' is not an IP address",
                agent.rendezvous_ip
            ))
        })?;

        Ok(Self {
            release: ReleaseQuery {
                release_image,
                pull_secret,
                mirrors: parsed.release.mirrors,
                insecure: parsed.release.insecure,
            },
            retry: RetryPolicy { max_tries, delay },
            os_image,
            coreos_stream: image.coreos_stream.map(|p| resolve_path(base_dir, &p)),
            boot_artifacts_base_url,
            platform: image.platform.parse()?,
            cache_root: image.cache_root.map(|p| resolve_path(base_dir, &p)),
            architecture: agent.architecture.parse()?,
            rendezvous_ip,
            kernel_args: normalize_kernel_args(agent.kernel_args.as_deref().unwrap_or_default()),
        })
    }

    pub fn content_cache(&self) -> Result<ContentCache> {
        match &self.cache_root {
            Some(root) => Ok(ContentCache::new(root)),
            None => ContentCache::user_default(),
        }
    }

    /// Stream metadata bundled with the installer, when configured.
    pub fn local_stream(&self) -> Result<Option<StreamMetadata>> {
        self.coreos_stream
            .as_deref()
            .map(StreamMetadata::load)
            .transpose()
    }
}

fn invalid(msg: impl Into<String>) -> anyhow::Error {
    AssemblyError::Configuration(msg.into()).into()
}

fn resolve_path(base_dir: &Path, value: &str) -> PathBuf {
    let path = Path::new(value.trim());
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Kernel arguments are appended to an existing command line, so they
/// start with a separator.
fn normalize_kernel_args(raw: &str) -> String {
    let trimmed = raw.trim_end();
    if trimmed.trim_start().is_empty() {
        String::new()
    } else if trimmed.starts_with(char::is_whitespace) {
        trimmed.to_string()
    } else {
        format!(" {trimmed}")
    }
}
