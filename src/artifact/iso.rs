//! ISO image editing.
//!
//! [`IsoEditor`] is the boundary the assembly pipeline drives: unpack the
//! base live ISO into a scratch tree, read its volume id, and pack the
//! patched tree back into a bootable image. [`XorrisoEditor`] implements
//! it with `xorriso`.
//!
//! # Example
//!
//! ```rust,ignore
//! use agent_image_builder::artifact::iso::{IsoEditor, XorrisoEditor};
//! use std::path::{Path, PathBuf};
//!
//! let editor = XorrisoEditor::new();
//! let volume_id = editor.volume_id(Path::new("coreos-x86_64.iso"))?;
//! editor.extract(Path::new("coreos-x86_64.iso"), Path::new("/tmp/iso"))?;
//! editor.create(Path::new("/tmp/iso"), Path::new("out/agent.x86_64.iso"), &volume_id)?;
//! ```

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use super::embed::Splice;
use crate::process::Cmd;

pub const XORRISO_BINARY: &str = "xorriso";

/// Live rootfs inside the media; left out of minimal images.
pub const ROOTFS_IMAGE: &str = "images/pxeboot/rootfs.img";

const BIOS_BOOT_IMAGE: &str = "isolinux/isolinux.bin";
const BIOS_BOOT_CATALOG: &str = "isolinux/boot.cat";
const EFI_BOOT_IMAGE: &str = "images/efiboot.img";

// Primary volume descriptor lives in sector 16.
const PVD_OFFSET: u64 = 16 * 2048;
const PVD_IDENTIFIER: &[u8] = b"CD001";
const VOLUME_ID_OFFSET: usize = 40;
const VOLUME_ID_LEN: usize = 32;

const LIVEISO_KARG: &str = r"coreos\.liveiso=\S+";

pub trait IsoEditor {
    /// Unpack `iso` into `dest`, leaving every entry writable.
    fn extract(&self, iso: &Path, dest: &Path) -> Result<()>;

    fn volume_id(&self, iso: &Path) -> Result<String>;

    /// Pack `src_dir` into a bootable image.
    fn create(&self, src_dir: &Path, output: &Path, volume_id: &str) -> Result<()>;

    /// Pack `src_dir` without the live rootfs; the image boots by fetching
    /// it from `rootfs_url`. Boot configs must already name that location
    /// (see [`point_at_remote_rootfs`]).
    fn create_minimal(
        &self,
        src_dir: &Path,
        output: &Path,
        volume_id: &str,
        rootfs_url: &str,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct XorrisoEditor {
    binary: String,
}

impl Default for XorrisoEditor {
    fn default() -> Self {
        Self {
            binary: XORRISO_BINARY.to_string(),
        }
    }
}

impl XorrisoEditor {
    pub fn new() -> Self {
        Self::default()
    }

    fn pack(&self, src_dir: &Path, output: &Path, volume_id: &str, exclude: &[&str]) -> Result<()> {
        if output.exists() {
            fs::remove_file(output)
                .with_context(|| format!("removing previous {}", output.display()))?;
        }
        let args = mkisofs_args(src_dir, output, volume_id, exclude);
        Cmd::new(&self.binary)
            .args(args)
            .error_msg(format!("xorriso failed to create {}", output.display()))
            .run()?;
        info!(iso = %output.display(), volume_id, "created ISO");
        Ok(())
    }
}

impl IsoEditor for XorrisoEditor {
    fn extract(&self, iso: &Path, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest).with_context(|| format!("creating {}", dest.display()))?;
        Cmd::new(&self.binary)
            .args(["-osirrox", "on", "-indev"])
            .arg_path(iso)
            .args(["-extract", "/"])
            .arg_path(dest)
            .error_msg(format!("xorriso failed to extract {}", iso.display()))
            .run()?;
        make_writable(dest)?;
        debug!(iso = %iso.display(), dest = %dest.display(), "extracted ISO");
        Ok(())
    }

    fn volume_id(&self, iso: &Path) -> Result<String> {
        read_volume_id(iso)
    }

    fn create(&self, src_dir: &Path, output: &Path, volume_id: &str) -> Result<()> {
        self.pack(src_dir, output, volume_id, &[])
    }

    fn create_minimal(
        &self,
        src_dir: &Path,
        output: &Path,
        volume_id: &str,
        rootfs_url: &str,
    ) -> Result<()> {
        debug!(rootfs_url, "packing minimal ISO");
        self.pack(src_dir, output, volume_id, &[ROOTFS_IMAGE])
    }
}

/// Volume id from the primary volume descriptor, trailing padding removed.
pub fn read_volume_id(iso: &Path) -> Result<String> {
    let mut f = File::open(iso).with_context(|| format!("opening {}", iso.display()))?;
    let mut descriptor = [0u8; VOLUME_ID_OFFSET + VOLUME_ID_LEN];
    f.seek(SeekFrom::Start(PVD_OFFSET))?;
    f.read_exact(&mut descriptor)
        .with_context(|| format!("{} is too small to be an ISO", iso.display()))?;
    if descriptor[0] != 1 || &descriptor[1..6] != PVD_IDENTIFIER {
        bail!("{} has no primary volume descriptor", iso.display());
    }
    let raw = &descriptor[VOLUME_ID_OFFSET..];
    Ok(String::from_utf8_lossy(raw)
        .trim_end_matches([' ', '\0'])
        .to_string())
}

/// `xorriso -as mkisofs` arguments, with boot records for whichever
/// loaders the tree carries.
fn mkisofs_args(src_dir: &Path, output: &Path, volume_id: &str, exclude: &[&str]) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["-as", "mkisofs", "-o"].map(OsString::from).to_vec();
    args.push(output.as_os_str().to_owned());
    args.extend(["-J", "-R", "-V", volume_id].map(OsString::from));

    if src_dir.join(BIOS_BOOT_IMAGE).is_file() {
        args.extend(
            [
                "-b",
                BIOS_BOOT_IMAGE,
                "-c",
                BIOS_BOOT_CATALOG,
                "-no-emul-boot",
                "-boot-load-size",
                "4",
                "-boot-info-table",
            ]
            .map(OsString::from),
        );
    }
    if src_dir.join(EFI_BOOT_IMAGE).is_file() {
        args.extend(
            [
                "-eltorito-alt-boot",
                "-e",
                EFI_BOOT_IMAGE,
                "-no-emul-boot",
                "-isohybrid-gpt-basdat",
            ]
            .map(OsString::from),
        );
    }
    for path in exclude {
        args.push("-m".into());
        args.push(src_dir.join(path).into_os_string());
    }
    args.push(src_dir.as_os_str().to_owned());
    args
}

/// Swap the `coreos.liveiso=` karg for `coreos.live.rootfs_url=` in every
/// boot config.
///
/// Returns each rewritten file with its splices, in the file's original
/// coordinates. Run it before kernel arguments are embedded.
pub fn point_at_remote_rootfs(
    src_dir: &Path,
    rootfs_url: &str,
) -> Result<Vec<(PathBuf, Vec<Splice>)>> {
    let liveiso = Regex::new(LIVEISO_KARG).context("compiling liveiso pattern")?;
    let replacement = format!("coreos.live.rootfs_url={rootfs_url}");
    let mut rewritten = Vec::new();
    for entry in WalkDir::new(src_dir).into_iter().filter_map(Result::ok) {
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("cfg") {
            continue;
        }
        let content =
            fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let splices: Vec<Splice> = liveiso
            .find_iter(&content)
            .map(|m| Splice {
                at: m.start(),
                delta: replacement.len() as i64 - m.len() as i64,
            })
            .collect();
        if splices.is_empty() {
            continue;
        }
        let updated = liveiso.replace_all(&content, regex::NoExpand(&replacement));
        fs::write(path, updated.as_bytes())
            .with_context(|| format!("writing {}", path.display()))?;
        debug!(file = %path.display(), "boot config points at remote rootfs");
        rewritten.push((path.to_path_buf(), splices));
    }
    rewritten.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(rewritten)
}

#[cfg(unix)]
fn make_writable(root: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
        if entry.file_type().is_symlink() {
            continue;
        }
        let meta = entry.metadata()?;
        let mode = meta.permissions().mode();
        if mode & 0o200 == 0 {
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode | 0o200))
                .with_context(|| format!("making {} writable", entry.path().display()))?;
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_writable(_root: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn synthetic_iso(path: &Path, volume_id: &str) {
        let mut bytes = vec![0u8; PVD_OFFSET as usize + 2048];
        let pvd = PVD_OFFSET as usize;
        bytes[pvd] = 1;
        bytes[pvd + 1..pvd + 6].copy_from_slice(PVD_IDENTIFIER);
        let field = &mut bytes[pvd + VOLUME_ID_OFFSET..pvd + VOLUME_ID_OFFSET + VOLUME_ID_LEN];
        field.fill(b' ');
        field[..volume_id.len()].copy_from_slice(volume_id.as_bytes());
        fs::write(path, bytes).unwrap();
    }

    #[test]
    fn reads_padded_volume_id() {
        let tmp = TempDir::new().unwrap();
        let iso = tmp.path().join("base.iso");
        synthetic_iso(&iso, "rhcos-416.94.202405291527-0");

        assert_eq!(
            XorrisoEditor::new().volume_id(&iso).unwrap(),
            "rhcos-416.94.202405291527-0"
        );
    }

    #[test]
    fn rejects_non_iso() {
        let tmp = TempDir::new().unwrap();
        let short = tmp.path().join("short.iso");
        fs::write(&short, b"tiny").unwrap();
        assert!(read_volume_id(&short).is_err());

        let blank = tmp.path().join("blank.iso");
        fs::write(&blank, vec![0u8; 40_000]).unwrap();
        assert!(read_volume_id(&blank).is_err());
    }

    #[test]
    fn boot_records_follow_tree_contents() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        let out = Path::new("/out/agent.x86_64.iso");

        let plain = mkisofs_args(root, out, "vol", &[]);
        assert!(!plain.contains(&OsString::from("-b")));
        assert!(!plain.contains(&OsString::from("-e")));

        fs::create_dir_all(root.join("isolinux")).unwrap();
        fs::create_dir_all(root.join("images")).unwrap();
        fs::write(root.join(BIOS_BOOT_IMAGE), b"").unwrap();
        fs::write(root.join(EFI_BOOT_IMAGE), b"").unwrap();

        let args = mkisofs_args(root, out, "vol", &[ROOTFS_IMAGE]);
        assert!(args.contains(&OsString::from(BIOS_BOOT_IMAGE)));
        assert!(args.contains(&OsString::from(EFI_BOOT_IMAGE)));
        let m = args.iter().position(|a| a == "-m").unwrap();
        assert_eq!(args[m + 1], root.join(ROOTFS_IMAGE).into_os_string());
        assert_eq!(args.last().unwrap(), root.as_os_str());
    }

    #[test]
    fn minimal_configs_fetch_rootfs_remotely() {
        let tmp = TempDir::new().unwrap();
        let grub = tmp.path().join("EFI/redhat/grub.cfg");
        fs::create_dir_all(grub.parent().unwrap()).unwrap();
        fs::write(
            &grub,
            "linux /images/pxeboot/vmlinuz coreos.liveiso=rhcos-416 ignition.firstboot\n",
        )
        .unwrap();

        let url = "https://boot.example/agent.x86_64-rootfs.img";

        let rewritten = point_at_remote_rootfs(tmp.path(), url).unwrap();

        let karg_len = "coreos.liveiso=rhcos-416".len() as i64;
        let delta = format!("coreos.live.rootfs_url={url}").len() as i64 - karg_len;
        assert_eq!(rewritten, [(grub.clone(), vec![Splice { at: 30, delta }])]);
        let cfg = fs::read_to_string(&grub).unwrap();
        assert!(!cfg.contains("coreos.liveiso"));
        assert!(cfg.contains(
            "coreos.live.rootfs_url=https://boot.example/agent.x86_64-rootfs.img ignition.firstboot"
        ));
    }
}
