//! CoreOS stream metadata (`coreos-stream.json`).
//!
//! Only the fields the pipeline reads are modelled; everything else in the
//! document is ignored.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::arch::Architecture;
use crate::error::AssemblyError;

const METAL: &str = "metal";

#[derive(Debug, Clone, Deserialize)]
pub struct StreamMetadata {
    #[serde(default)]
    pub stream: Option<String>,
    pub architectures: BTreeMap<String, StreamArchitecture>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamArchitecture {
    #[serde(default)]
    pub artifacts: BTreeMap<String, PlatformArtifacts>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlatformArtifacts {
    pub release: String,
    #[serde(default)]
    pub formats: BTreeMap<String, BTreeMap<String, Artifact>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Artifact {
    pub location: String,
    #[serde(default)]
    pub sha256: Option<String>,
}

impl StreamMetadata {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("reading stream metadata {}", path.display()))?;
        Self::from_slice(&bytes)
            .with_context(|| format!("parsing stream metadata {}", path.display()))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn metal(&self, arch: Architecture) -> Result<&PlatformArtifacts> {
        self.architectures
            .get(arch.rpm_name())
            .and_then(|a| a.artifacts.get(METAL))
            .ok_or_else(|| {
                AssemblyError::Configuration(format!(
                    "stream metadata has no metal artifacts for {arch}"
                ))
                .into()
            })
    }

    fn metal_artifact(&self, arch: Architecture, format: &str, kind: &str) -> Option<&Artifact> {
        self.metal(arch).ok()?.formats.get(format)?.get(kind)
    }

    /// Release version of the metal artifacts, e.g. `416.94.202405291527-0`.
    pub fn release(&self, arch: Architecture) -> Result<&str> {
        Ok(&self.metal(arch)?.release)
    }

    /// Published sha256 of the live ISO.
    pub fn iso_sha256(&self, arch: Architecture) -> Option<&str> {
        self.metal_artifact(arch, "iso", "disk")?.sha256.as_deref()
    }

    /// Download location of the PXE rootfs image.
    pub fn rootfs_location(&self, arch: Architecture) -> Option<&str> {
        self.metal_artifact(arch, "pxe", "rootfs")
            .map(|a| a.location.as_str())
    }
}
