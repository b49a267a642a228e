//! In-memory gzip-compressed cpio archives.
//!
//! Produces the "newc" format the Linux kernel unpacks from an initrd.
//! Several compressed archives may be concatenated; the kernel unpacks
//! them in order, which is how extra files are appended to an existing
//! initrd.
//!
//! # Example
//!
//! ```rust,ignore
//! use agent_image_builder::artifact::cpio::CpioArchive;
//!
//! let mut archive = CpioArchive::new();
//! archive.store_path("agent-files")?;
//! archive.store_bytes("agent-files/hello.txt", b"hello", 0o644)?;
//! let bytes = archive.finalize()?;
//! ```

use anyhow::{bail, Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;

const NEWC_MAGIC: &str = "070701";
const TRAILER: &str = "TRAILER!!!";
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;
const PERMISSION_BITS: u32 = 0o7777;
const DIR_MODE: u32 = 0o755;

/// Single-use archive writer. [`CpioArchive::finalize`] consumes it.
pub struct CpioArchive {
    encoder: GzEncoder<Vec<u8>>,
    next_ino: u32,
}

impl Default for CpioArchive {
    fn default() -> Self {
        Self::new()
    }
}

impl CpioArchive {
    pub fn new() -> Self {
        Self {
            encoder: GzEncoder::new(Vec::new(), Compression::default()),
            next_ino: 1,
        }
    }

    /// Add a regular file with the given content and permission bits.
    pub fn store_bytes(&mut self, name: &str, content: &[u8], mode: u32) -> Result<()> {
        let size = checked_size(content.len() as u64, name)?;
        self.write_header(name, S_IFREG | (mode & PERMISSION_BITS), size, 1)?;
        self.encoder.write_all(content)?;
        self.pad(size as usize)?;
        Ok(())
    }

    /// Add an empty directory entry.
    pub fn store_path(&mut self, dir_name: &str) -> Result<()> {
        self.write_header(dir_name, S_IFDIR | DIR_MODE, 0, 2)
    }

    /// Add `src` as `<dst_dir>/<file name>`, keeping its permission bits.
    pub fn store_file(&mut self, src: &Path, dst_dir: &str) -> Result<()> {
        let file_name = src
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("no file name in {}", src.display()))?;
        let meta = fs::metadata(src).with_context(|| format!("reading {}", src.display()))?;
        if !meta.is_file() {
            bail!("not a regular file: {}", src.display());
        }
        let name = format!("{}/{}", dst_dir.trim_end_matches('/'), file_name);
        let size = checked_size(meta.len(), &name)?;

        self.write_header(&name, S_IFREG | file_mode(&meta), size, 1)?;
        let mut f = File::open(src).with_context(|| format!("opening {}", src.display()))?;
        let copied = io::copy(&mut (&mut f).take(size as u64), &mut self.encoder)
            .with_context(|| format!("archiving {}", src.display()))?;
        if copied != size as u64 {
            bail!("{} changed size while being archived", src.display());
        }
        self.pad(size as usize)?;
        Ok(())
    }

    /// Write the trailer and return the compressed archive.
    pub fn finalize(mut self) -> Result<Vec<u8>> {
        self.write_header(TRAILER, 0, 0, 1)?;
        self.encoder.finish().context("finishing gzip stream")
    }

    fn write_header(&mut self, name: &str, mode: u32, size: u32, nlink: u32) -> Result<()> {
        let name = name.trim_start_matches('/');
        if name.is_empty() {
            bail!("cpio entry name must not be empty");
        }
        let ino = if name == TRAILER { 0 } else { self.next_ino };
        self.next_ino += 1;
        let namesize = name.len() as u32 + 1;

        let header = format!(
            "{NEWC_MAGIC}{ino:08x}{mode:08x}{uid:08x}{gid:08x}{nlink:08x}{mtime:08x}{size:08x}\
             {devmajor:08x}{devminor:08x}{rdevmajor:08x}{rdevminor:08x}{namesize:08x}{check:08x}",
            uid = 0,
            gid = 0,
            mtime = 0,
            devmajor = 0,
            devminor = 0,
            rdevmajor = 0,
            rdevminor = 0,
            check = 0,
        );
        self.encoder.write_all(header.as_bytes())?;
        self.encoder.write_all(name.as_bytes())?;
        self.encoder.write_all(&[0])?;
        // header (110 bytes) + name + NUL is padded to a multiple of 4
        self.pad(header.len() + namesize as usize)?;
        Ok(())
    }

    fn pad(&mut self, written: usize) -> io::Result<()> {
        let padding = (4 - written % 4) % 4;
        self.encoder.write_all(&[0u8; 3][..padding])
    }
}

fn checked_size(len: u64, name: &str) -> Result<u32> {
    u32::try_from(len).with_context(|| format!("{name} is too large for a cpio entry"))
}

#[cfg(unix)]
fn file_mode(meta: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & PERMISSION_BITS
}

#[cfg(not(unix))]
fn file_mode(_meta: &fs::Metadata) -> u32 {
    0o644
}
