//! Agent boot artifact assembly.
//!
//! Two phases:
//!
//! 1. [`AgentArtifacts::build`] acquires the base live ISO, pulls the helper
//!    binaries out of the release payload, unpacks the ISO into a scratch
//!    tree and appends the helpers to its initrd.
//! 2. [`AgentArtifacts::persist`] embeds the ignition config and kernel
//!    arguments into the scratch tree and writes the final image to the
//!    output directory.
//!
//! The scratch tree belongs to the [`BootArtifactSet`] and is removed when
//! the set is dropped, whichever way `persist` exits.

mod platform;

pub use platform::Platform;

use anyhow::{Context, Result};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::arch::Architecture;
use crate::artifact::cpio::CpioArchive;
use crate::artifact::embed::{self, DEFAULT_EXTENSION_SKIP_LIST};
use crate::artifact::iso::{self, IsoEditor, XorrisoEditor, ROOTFS_IMAGE};
use crate::cache::IMAGE_DATA_TYPE;
use crate::config::AssemblyConfig;
use crate::error::{kind_of, AssemblyError, ErrorKind};
use crate::release::{OcInspector, ReleaseExtractor, AGENT_INSTALLER_UTILS};

/// Helper binaries shipped in the `agent-installer-utils` component.
pub const AGENT_HELPER_FILES: &[&str] = &["/usr/bin/agent-tui", "/usr/lib64/libnmstate.so.*"];

pub const AGENT_FILES_DIR: &str = "agent-files";
pub const COPY_FILES_HOOK_PATH: &str = "usr/lib/dracut/hooks/pre-pivot/99-agent-copy-files.sh";
pub const RENDEZVOUS_IP_FILE: &str = "rendezvousIP";
pub const BOOT_ARTIFACTS_DIR: &str = "boot-artifacts";

const INITRD_IMAGE: &str = "images/pxeboot/initrd.img";
const IGNITION_IMAGE: &str = "images/ignition.img";

const COPY_FILES_HOOK: &str = r#"#!/bin/sh
# Copy agent helper files into the real root before switching to it.
[ -d /agent-files ] || exit 0
mkdir -p /sysroot/usr/local/bin
for f in /agent-files/*; do
    [ -e "$f" ] || continue
    cp -a "$f" /sysroot/usr/local/bin/
    chcon -t bin_t "/sysroot/usr/local/bin/$(basename "$f")" 2>/dev/null || true
done
"#;

pub fn iso_file_name(arch: Architecture) -> String {
    format!("agent.{}.iso", arch.rpm_name())
}

pub fn rootfs_file_name(arch: Architecture) -> String {
    format!("agent.{}-rootfs.img", arch.rpm_name())
}

/// Serialized ignition config plus the metadata that travels with it.
#[derive(Debug, Clone)]
pub struct IgnitionArtifact {
    pub config: Vec<u8>,
    pub architecture: Architecture,
    pub rendezvous_ip: IpAddr,
}

impl IgnitionArtifact {
    pub fn load(path: &Path, architecture: Architecture, rendezvous_ip: IpAddr) -> Result<Self> {
        let config =
            fs::read(path).with_context(|| format!("reading ignition '{}'", path.display()))?;
        Ok(Self {
            config,
            architecture,
            rendezvous_ip,
        })
    }
}

/// Everything `persist` needs, including the patched-in-place scratch tree.
#[derive(Debug)]
pub struct BootArtifactSet {
    scratch: TempDir,
    pub base_iso: PathBuf,
    pub volume_id: String,
    pub rootfs_url: Option<String>,
    pub architecture: Architecture,
    pub ignition: Vec<u8>,
    pub kargs: Vec<u8>,
    pub boot_artifacts_base_url: Option<String>,
    pub rendezvous_ip: IpAddr,
    pub platform: Platform,
}

impl BootArtifactSet {
    /// Root of the unpacked ISO.
    pub fn tmp_path(&self) -> &Path {
        self.scratch.path()
    }
}

pub struct AgentArtifacts {
    config: AssemblyConfig,
    extractor: ReleaseExtractor,
    editor: Box<dyn IsoEditor>,
}

impl AgentArtifacts {
    pub fn new(config: AssemblyConfig, extractor: ReleaseExtractor, editor: Box<dyn IsoEditor>) -> Self {
        Self {
            config,
            extractor,
            editor,
        }
    }

    /// Production wiring: `oc` for the release payload, `xorriso` for ISOs.
    pub fn from_config(config: AssemblyConfig) -> Result<Self> {
        let mut extractor = ReleaseExtractor::new(
            config.release.clone(),
            Box::new(OcInspector::new()),
            config.content_cache()?,
        )
        .with_retry(config.retry);
        if let Some(stream) = config.local_stream()? {
            extractor = extractor.with_local_stream(stream);
        }
        Ok(Self::new(config, extractor, Box::new(XorrisoEditor::new())))
    }

    pub fn config(&self) -> &AssemblyConfig {
        &self.config
    }

    pub fn extractor(&self) -> &ReleaseExtractor {
        &self.extractor
    }

    pub fn build(&self, ignition: &IgnitionArtifact) -> Result<BootArtifactSet> {
        let arch = ignition.architecture;
        let platform = self.config.platform;
        info!(%arch, %platform, "building agent boot artifacts");

        let base_iso = self.base_iso(arch)?;
        let volume_id = self.editor.volume_id(&base_iso)?;
        let rootfs_url = self.rootfs_url(arch)?;

        let helpers = if platform.is_external() {
            debug!("external platform, skipping helper binaries");
            Vec::new()
        } else {
            self.helper_binaries(arch)?
        };

        let scratch = tempfile::Builder::new()
            .prefix("agent-iso-")
            .tempdir()
            .context("creating scratch directory")?;
        self.editor
            .extract(&base_iso, scratch.path())
            .with_context(|| format!("unpacking {}", base_iso.display()))?;

        let archive = agent_files_archive(&helpers)?;
        embed::append_to_initrd(&scratch.path().join(INITRD_IMAGE), &archive)?;
        info!(helpers = helpers.len(), "appended agent files to initrd");

        Ok(BootArtifactSet {
            scratch,
            base_iso,
            volume_id,
            rootfs_url,
            architecture: arch,
            ignition: ignition.config.clone(),
            kargs: self.config.kernel_args.clone().into_bytes(),
            boot_artifacts_base_url: self.config.boot_artifacts_base_url.clone(),
            rendezvous_ip: ignition.rendezvous_ip,
            platform,
        })
    }

    /// Write the final image into `output_dir` and return its path.
    pub fn persist(&self, set: BootArtifactSet, output_dir: &Path) -> Result<PathBuf> {
        let arch = set.architecture;
        let root = set.tmp_path();
        fs::create_dir_all(output_dir)
            .with_context(|| format!("creating {}", output_dir.display()))?;

        let iso_path = output_dir.join(iso_file_name(arch));
        if fs::symlink_metadata(&iso_path).is_ok_and(|m| m.file_type().is_symlink()) {
            fs::remove_file(&iso_path)
                .with_context(|| format!("removing symlink {}", iso_path.display()))?;
        }

        let remote_rootfs = if set.platform.is_external() {
            Some(set.rootfs_url.as_deref().ok_or_else(|| {
                AssemblyError::Configuration(
                    "a minimal ISO needs boot_artifacts_base_url or stream metadata with a rootfs location"
                        .into(),
                )
            })?)
        } else {
            None
        };

        embed::normalize_extensions(root, DEFAULT_EXTENSION_SKIP_LIST)?;
        // Changes the boot config length, so it must precede the kargs patch.
        if let Some(url) = remote_rootfs {
            for (file, splices) in iso::point_at_remote_rootfs(root, url)? {
                embed::shift_kargs_offsets(root, &file, &splices)?;
            }
        }
        embed::overwrite_ignition_region(&root.join(IGNITION_IMAGE), &set.ignition)
            .context("embedding ignition")?;
        if !set.kargs.is_empty() {
            let marker = embed::kargs_marker()?;
            let files = embed::kargs_files(root, &marker)?;
            if files.is_empty() {
                return Err(AssemblyError::Configuration(
                    "kernel arguments given but the image has no embed area".into(),
                )
                .into());
            }
            for file in &files {
                embed::patch_kargs_file(file, &marker, &set.kargs)
                    .context("embedding kernel arguments")?;
            }
        }

        // The image is written last.
        if let Some(url) = remote_rootfs {
            let boot_dir = output_dir.join(BOOT_ARTIFACTS_DIR);
            fs::create_dir_all(&boot_dir)
                .with_context(|| format!("creating {}", boot_dir.display()))?;
            let rootfs = boot_dir.join(rootfs_file_name(arch));
            fs::copy(root.join(ROOTFS_IMAGE), &rootfs)
                .with_context(|| format!("copying rootfs to {}", rootfs.display()))?;
            info!(rootfs = %rootfs.display(), url, "wrote rootfs for minimal ISO");
        }
        let rendezvous = output_dir.join(RENDEZVOUS_IP_FILE);
        fs::write(&rendezvous, set.rendezvous_ip.to_string())
            .with_context(|| format!("writing {}", rendezvous.display()))?;

        match remote_rootfs {
            Some(url) => self
                .editor
                .create_minimal(root, &iso_path, &set.volume_id, url)?,
            None => self.editor.create(root, &iso_path, &set.volume_id)?,
        }

        info!(iso = %iso_path.display(), "agent ISO ready");
        Ok(iso_path)
    }

    fn base_iso(&self, arch: Architecture) -> Result<PathBuf> {
        match &self.config.os_image {
            Some(descriptor) => {
                info!(url = %descriptor.url, "fetching base ISO");
                self.extractor
                    .cache()
                    .download(descriptor, IMAGE_DATA_TYPE)
                    .context("downloading base ISO")
            }
            None => self.extractor.get_base_iso(arch),
        }
    }

    /// Where a minimal ISO fetches its rootfs from.
    fn rootfs_url(&self, arch: Architecture) -> Result<Option<String>> {
        if let Some(base) = &self.config.boot_artifacts_base_url {
            return Ok(Some(format!("{base}/{}", rootfs_file_name(arch))));
        }
        if let Some(location) = self
            .extractor
            .local_stream()
            .and_then(|s| s.rootfs_location(arch))
        {
            return Ok(Some(location.to_string()));
        }
        if !self.config.platform.is_external() {
            return Ok(None);
        }
        let stream = self.extractor.release_stream(arch)?;
        Ok(stream.rootfs_location(arch).map(str::to_string))
    }

    fn helper_binaries(&self, arch: Architecture) -> Result<Vec<PathBuf>> {
        match self.extract_helpers(arch) {
            Ok(paths) => Ok(paths),
            Err(err)
                if kind_of(&err) == Some(ErrorKind::ToolUnavailable)
                    && self.config.release.mirrors.is_empty() =>
            {
                warn!("skipping agent helper binaries: {err:#}");
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    fn extract_helpers(&self, arch: Architecture) -> Result<Vec<PathBuf>> {
        let image = self
            .extractor
            .resolve_component_image(AGENT_INSTALLER_UTILS, arch)?;
        let mut paths = Vec::new();
        for file in AGENT_HELPER_FILES {
            paths.extend(
                self.extractor
                    .extract_file(&image, file, arch)
                    .with_context(|| format!("extracting {file}"))?,
            );
        }
        Ok(paths)
    }
}

fn agent_files_archive(helpers: &[PathBuf]) -> Result<Vec<u8>> {
    let mut archive = CpioArchive::new();
    archive.store_path(AGENT_FILES_DIR)?;
    for helper in helpers {
        archive.store_file(helper, AGENT_FILES_DIR)?;
    }
    archive.store_bytes(COPY_FILES_HOOK_PATH, COPY_FILES_HOOK.as_bytes(), 0o755)?;
    archive.finalize()
}
