//! Patching of pre-allocated regions inside extracted boot media.
//!
//! The base image reserves space for later customization:
//! - `images/ignition.img`: a zero-filled file whose size is the capacity
//!   available for the ignition archive.
//! - kernel-argument placeholders: a run of `#` after the kernel command
//!   line in each boot config, terminated by `# COREOS_KARG_EMBED_AREA`.
//!
//! Writes never grow a region. An oversized payload fails before anything
//! is written.

use anyhow::{Context, Result};
use regex::bytes::Regex;
use serde::Deserialize;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

use super::cpio::CpioArchive;
use crate::error::AssemblyError;

/// Name of the ignition config inside the embedded archive.
pub const IGNITION_ENTRY_NAME: &str = "config.ign";

/// Placeholder span is the first capture group.
pub const KARGS_MARKER: &str = r"(\n#*)# COREOS_KARG_EMBED_AREA";

/// Lists the kargs-bearing files of the media.
pub const KARGS_MANIFEST: &str = "coreos/kargs.json";

/// Paths (relative to the media root) whose extensions must survive.
pub const DEFAULT_EXTENSION_SKIP_LIST: &[&str] = &[
    "coreos/kargs.json",
    "coreos/igninfo.json",
    "coreos/features.json",
];

const MAX_EXTENSION_LEN: usize = 3;

/// Append a finished archive after the existing initrd content.
pub fn append_to_initrd(initrd: &Path, archive: &[u8]) -> Result<()> {
    let mut f = OpenOptions::new()
        .append(true)
        .open(initrd)
        .with_context(|| format!("opening initrd {}", initrd.display()))?;
    f.write_all(archive)
        .with_context(|| format!("appending to {}", initrd.display()))?;
    f.sync_all()
        .with_context(|| format!("syncing {}", initrd.display()))?;
    debug!(initrd = %initrd.display(), bytes = archive.len(), "appended archive");
    Ok(())
}

/// Overwrite the leading bytes of `path` with `bytes`; the file's current
/// size is the capacity.
pub fn write_fixed_region(path: &Path, bytes: &[u8], what: &str) -> Result<()> {
    let capacity = fs::metadata(path)
        .with_context(|| format!("reading {}", path.display()))?
        .len();
    if bytes.len() as u64 > capacity {
        return Err(AssemblyError::Capacity {
            what: format!("{what} ({})", path.display()),
            required: bytes.len() as u64,
            capacity,
        }
        .into());
    }

    let mut f = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    f.write_all(bytes)
        .with_context(|| format!("writing {}", path.display()))?;
    f.sync_all()
        .with_context(|| format!("syncing {}", path.display()))?;
    Ok(())
}

/// Embed `payload` as the ignition config of the media.
pub fn overwrite_ignition_region(ignition_img: &Path, payload: &[u8]) -> Result<()> {
    let mut archive = CpioArchive::new();
    archive.store_bytes(IGNITION_ENTRY_NAME, payload, 0o644)?;
    let bytes = archive.finalize()?;
    write_fixed_region(ignition_img, &bytes, "ignition archive")
}

/// Compiled [`KARGS_MARKER`].
pub fn kargs_marker() -> Result<Regex> {
    Regex::new(KARGS_MARKER).context("compiling kargs marker")
}

/// Write `kargs` followed by a newline at the start of the placeholder.
///
/// Whatever is left of the placeholder stays in place, so the boot config
/// keeps its size.
pub fn patch_kargs_file(path: &Path, marker: &Regex, kargs: &[u8]) -> Result<()> {
    let content = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let captures = marker
        .captures(&content)
        .with_context(|| format!("kernel arguments embed area not found in {}", path.display()))?;
    let span = captures
        .get(1)
        .or_else(|| captures.get(0))
        .with_context(|| format!("empty kargs marker match in {}", path.display()))?;

    let mut patch = Vec::with_capacity(kargs.len() + 1);
    patch.extend_from_slice(kargs);
    patch.push(b'\n');
    if patch.len() > span.len() {
        return Err(AssemblyError::Capacity {
            what: format!("kernel arguments ({})", path.display()),
            required: patch.len() as u64,
            capacity: span.len() as u64,
        }
        .into());
    }

    let mut f = OpenOptions::new()
        .write(true)
        .open(path)
        .with_context(|| format!("opening {}", path.display()))?;
    f.seek(SeekFrom::Start(span.start() as u64))?;
    f.write_all(&patch)
        .with_context(|| format!("writing {}", path.display()))?;
    f.sync_all()
        .with_context(|| format!("syncing {}", path.display()))?;
    debug!(file = %path.display(), offset = span.start(), "embedded kernel arguments");
    Ok(())
}

#[derive(Debug, Deserialize)]
struct KargsManifest {
    files: Vec<KargsFile>,
}

#[derive(Debug, Deserialize)]
struct KargsFile {
    path: String,
}

/// Boot config files carrying a kargs placeholder.
///
/// Uses `coreos/kargs.json` when the media ships it, otherwise scans every
/// `*.cfg` for the marker.
pub fn kargs_files(root: &Path, marker: &Regex) -> Result<Vec<PathBuf>> {
    let manifest_path = root.join(KARGS_MANIFEST);
    if manifest_path.is_file() {
        let bytes = fs::read(&manifest_path)
            .with_context(|| format!("reading {}", manifest_path.display()))?;
        let manifest: KargsManifest = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing {}", manifest_path.display()))?;
        return Ok(manifest
            .files
            .into_iter()
            .map(|f| root.join(f.path.trim_start_matches('/')))
            .collect());
    }

    let mut found = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
        let path = entry.path();
        if !entry.file_type().is_file() || path.extension().and_then(|e| e.to_str()) != Some("cfg") {
            continue;
        }
        let content = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        if marker.is_match(&content) {
            found.push(path.to_path_buf());
        }
    }
    found.sort();
    Ok(found)
}

/// A replacement inside a boot config: bytes originally at or after `at`
/// moved by `delta`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Splice {
    pub at: usize,
    pub delta: i64,
}

/// Move the offsets `coreos/kargs.json` records for `file` past `splices`.
///
/// Offsets are in the file's coordinates before the splices were applied.
/// Media without a manifest, or a manifest not listing `file`, is left alone.
pub fn shift_kargs_offsets(root: &Path, file: &Path, splices: &[Splice]) -> Result<()> {
    let manifest_path = root.join(KARGS_MANIFEST);
    if splices.is_empty() || !manifest_path.is_file() {
        return Ok(());
    }
    let bytes =
        fs::read(&manifest_path).with_context(|| format!("reading {}", manifest_path.display()))?;
    let mut manifest: serde_json::Value = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing {}", manifest_path.display()))?;

    let mut changed = false;
    let entries = manifest
        .get_mut("files")
        .and_then(serde_json::Value::as_array_mut)
        .into_iter()
        .flatten();
    for entry in entries {
        let listed = entry
            .get("path")
            .and_then(serde_json::Value::as_str)
            .map(|p| root.join(p.trim_start_matches('/')));
        if listed.as_deref() != Some(file) {
            continue;
        }
        let Some(offset) = entry.get("offset").and_then(serde_json::Value::as_u64) else {
            continue;
        };
        let shift: i64 = splices
            .iter()
            .filter(|s| (s.at as u64) < offset)
            .map(|s| s.delta)
            .sum();
        let moved = offset.checked_add_signed(shift).with_context(|| {
            format!("kargs offset of {} moved before the file start", file.display())
        })?;
        entry["offset"] = moved.into();
        changed = true;
    }

    if changed {
        let updated = serde_json::to_vec(&manifest)
            .with_context(|| format!("serializing {}", manifest_path.display()))?;
        fs::write(&manifest_path, updated)
            .with_context(|| format!("writing {}", manifest_path.display()))?;
        debug!(file = %file.display(), "shifted kargs offsets");
    }
    Ok(())
}

/// Truncate file extensions longer than three characters (ISO 9660 level 1).
///
/// `skip` holds paths relative to `root`. Returns the renamed paths.
pub fn normalize_extensions(root: &Path, skip: &[&str]) -> Result<Vec<PathBuf>> {
    let mut renames = Vec::new();
    for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let rel = path
            .strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/");
        if skip.contains(&rel.as_str()) {
            continue;
        }
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        if ext.chars().count() <= MAX_EXTENSION_LEN {
            continue;
        }
        let short: String = ext.chars().take(MAX_EXTENSION_LEN).collect();
        renames.push((path.to_path_buf(), path.with_extension(short)));
    }

    let mut renamed = Vec::with_capacity(renames.len());
    for (from, to) in renames {
        if to.exists() {
            anyhow::bail!(
                "cannot shorten {}: {} already exists",
                from.display(),
                to.display()
            );
        }
        fs::rename(&from, &to)
            .with_context(|| format!("renaming {} to {}", from.display(), to.display()))?;
        renamed.push(to);
    }
    Ok(renamed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::cpio::tests::read_entries;
    use crate::error::{kind_of, ErrorKind};
    use proptest::prelude::*;
    use tempfile::TempDir;

    const CMDLINE: &[u8] = b"linux /images/pxeboot/vmlinuz coreos.liveiso=rhcos ignition.firstboot";

    /// Boot config whose placeholder (newline + hashes) is `span` bytes.
    fn boot_cfg(span: usize) -> Vec<u8> {
        let mut cfg = CMDLINE.to_vec();
        cfg.push(b'\n');
        cfg.extend(std::iter::repeat(b'#').take(span - 1));
        cfg.extend_from_slice(b"# COREOS_KARG_EMBED_AREA\ninitrd /images/pxeboot/initrd.img\n");
        cfg
    }

    #[test]
    fn kargs_fit_within_placeholder() {
        let tmp = TempDir::new().unwrap();
        let cfg = tmp.path().join("grub.cfg");
        fs::write(&cfg, boot_cfg(16)).unwrap();
        let kargs = b" console=ttyS0";
        assert_eq!(kargs.len(), 14);

        patch_kargs_file(&cfg, &kargs_marker().unwrap(), kargs).unwrap();

        let patched = fs::read(&cfg).unwrap();
        assert_eq!(patched.len(), boot_cfg(16).len());
        let start = CMDLINE.len();
        assert_eq!(&patched[start..start + 15], b" console=ttyS0\n");
        assert_eq!(&patched[start + 15..start + 16], b"#");
        assert!(String::from_utf8_lossy(&patched).contains("# COREOS_KARG_EMBED_AREA"));
    }

    #[test]
    fn oversized_kargs_leave_file_untouched() {
        let tmp = TempDir::new().unwrap();
        let cfg = tmp.path().join("isolinux.cfg");
        let original = boot_cfg(8);
        fs::write(&cfg, &original).unwrap();

        let err = patch_kargs_file(&cfg, &kargs_marker().unwrap(), b" toolong=1").unwrap_err();

        assert_eq!(kind_of(&err), Some(ErrorKind::Capacity));
        assert_eq!(fs::read(&cfg).unwrap(), original);
    }

    #[test]
    fn kargs_may_consume_whole_placeholder() {
        let tmp = TempDir::new().unwrap();
        let cfg = tmp.path().join("grub.cfg");
        let original = boot_cfg(16);
        fs::write(&cfg, &original).unwrap();
        let kargs = b" console=ttyS01";
        assert_eq!(kargs.len(), 15);

        patch_kargs_file(&cfg, &kargs_marker().unwrap(), kargs).unwrap();

        let patched = fs::read(&cfg).unwrap();
        assert_eq!(patched.len(), original.len());
        let start = CMDLINE.len();
        assert_eq!(&patched[start..start + 16], b" console=ttyS01\n");
        assert!(patched[start + 16..].starts_with(b"# COREOS_KARG_EMBED_AREA\n"));
    }

    #[test]
    fn kargs_one_byte_over_placeholder_are_rejected() {
        let tmp = TempDir::new().unwrap();
        let cfg = tmp.path().join("grub.cfg");
        let original = boot_cfg(16);
        fs::write(&cfg, &original).unwrap();
        let kargs = b" console=ttyS100";
        assert_eq!(kargs.len(), 16);

        let err = patch_kargs_file(&cfg, &kargs_marker().unwrap(), kargs).unwrap_err();

        assert_eq!(kind_of(&err), Some(ErrorKind::Capacity));
        assert_eq!(fs::read(&cfg).unwrap(), original);
    }

    #[test]
    fn missing_marker_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let cfg = tmp.path().join("grub.cfg");
        fs::write(&cfg, CMDLINE).unwrap();

        assert!(patch_kargs_file(&cfg, &kargs_marker().unwrap(), b" a=b").is_err());
    }

    #[test]
    fn ignition_archive_fits_preallocated_image() {
        let tmp = TempDir::new().unwrap();
        let img = tmp.path().join("ignition.img");
        fs::write(&img, vec![0u8; 4096]).unwrap();

        overwrite_ignition_region(&img, br#"{"ignition":{"version":"3.2.0"}}"#).unwrap();

        let bytes = fs::read(&img).unwrap();
        assert_eq!(bytes.len(), 4096);
        let entries = read_entries(&bytes);
        assert_eq!(entries[0].name, IGNITION_ENTRY_NAME);
        assert_eq!(entries[0].data, br#"{"ignition":{"version":"3.2.0"}}"#);
    }

    #[test]
    fn oversized_ignition_is_rejected_without_writing() {
        let tmp = TempDir::new().unwrap();
        let img = tmp.path().join("ignition.img");
        fs::write(&img, vec![0u8; 256]).unwrap();
        // xorshift64 output, so gzip cannot shrink it below the capacity
        let mut x: u64 = 0x9E37_79B9_7F4A_7C15;
        let payload: Vec<u8> = (0..4096)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                (x >> 24) as u8
            })
            .collect();

        let err = overwrite_ignition_region(&img, &payload).unwrap_err();

        assert_eq!(kind_of(&err), Some(ErrorKind::Capacity));
        assert_eq!(fs::read(&img).unwrap(), vec![0u8; 256]);
    }

    #[test]
    fn initrd_grows_by_archive() {
        let tmp = TempDir::new().unwrap();
        let initrd = tmp.path().join("initrd.img");
        fs::write(&initrd, b"base").unwrap();

        append_to_initrd(&initrd, b"extra").unwrap();

        assert_eq!(fs::read(&initrd).unwrap(), b"baseextra");
    }

    #[test]
    fn kargs_files_from_manifest_or_scan() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("EFI/redhat")).unwrap();
        fs::create_dir_all(root.join("isolinux")).unwrap();
        fs::write(root.join("EFI/redhat/grub.cfg"), boot_cfg(32)).unwrap();
        fs::write(root.join("isolinux/isolinux.cfg"), boot_cfg(32)).unwrap();
        fs::write(root.join("isolinux/other.cfg"), b"no marker").unwrap();
        let marker = kargs_marker().unwrap();

        let scanned = kargs_files(root, &marker).unwrap();
        assert_eq!(
            scanned,
            [root.join("EFI/redhat/grub.cfg"), root.join("isolinux/isolinux.cfg")]
        );

        fs::create_dir_all(root.join("coreos")).unwrap();
        fs::write(
            root.join(KARGS_MANIFEST),
            br#"{"default":"","files":[{"path":"EFI/redhat/grub.cfg","offset":72}],"size":1138}"#,
        )
        .unwrap();
        assert_eq!(
            kargs_files(root, &marker).unwrap(),
            [root.join("EFI/redhat/grub.cfg")]
        );
    }

    #[test]
    fn manifest_offsets_follow_earlier_splices() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("coreos")).unwrap();
        fs::write(
            root.join(KARGS_MANIFEST),
            br#"{"default":"","files":[{"path":"EFI/redhat/grub.cfg","offset":72},{"path":"isolinux/isolinux.cfg","offset":90}],"size":1138}"#,
        )
        .unwrap();
        let splices = [Splice { at: 40, delta: 25 }, Splice { at: 80, delta: 7 }];

        shift_kargs_offsets(root, &root.join("EFI/redhat/grub.cfg"), &splices).unwrap();

        let manifest: serde_json::Value =
            serde_json::from_slice(&fs::read(root.join(KARGS_MANIFEST)).unwrap()).unwrap();
        assert_eq!(manifest["files"][0]["offset"], 97);
        assert_eq!(manifest["files"][1]["offset"], 90);
        assert_eq!(manifest["size"], 1138);
    }

    #[test]
    fn long_extensions_are_truncated() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("coreos")).unwrap();
        fs::create_dir_all(root.join("images/pxeboot")).unwrap();
        fs::write(root.join("coreos/kargs.json"), b"{}").unwrap();
        fs::write(root.join("coreos/miniso.data"), b"x").unwrap();
        fs::write(root.join("images/pxeboot/rootfs.img"), b"x").unwrap();

        let renamed = normalize_extensions(root, DEFAULT_EXTENSION_SKIP_LIST).unwrap();

        assert_eq!(renamed, [root.join("coreos/miniso.dat")]);
        assert!(root.join("coreos/kargs.json").exists());
        assert!(root.join("images/pxeboot/rootfs.img").exists());
        assert!(!root.join("coreos/miniso.data").exists());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn region_write_succeeds_iff_payload_fits(capacity in 0usize..512, len in 0usize..512) {
            let tmp = TempDir::new().unwrap();
            let region = tmp.path().join("region.img");
            fs::write(&region, vec![0xAAu8; capacity]).unwrap();
            let payload = vec![0x55u8; len];

            let result = write_fixed_region(&region, &payload, "payload");
            let after = fs::read(&region).unwrap();

            prop_assert_eq!(after.len(), capacity);
            if len <= capacity {
                prop_assert!(result.is_ok());
                prop_assert_eq!(&after[..len], &payload[..]);
            } else {
                prop_assert_eq!(kind_of(&result.unwrap_err()), Some(ErrorKind::Capacity));
                prop_assert_eq!(after, vec![0xAAu8; capacity]);
            }
        }
    }
}
