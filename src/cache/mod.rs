//! Download cache shared by every installer run of the current user.
//!
//! Layout:
//!
//! ```text
//! <user-cache-root>/agent/<data_type>_cache/<name>        final, verified file
//! <user-cache-root>/agent/<data_type>_cache/<name>.lock   held while populating
//! <user-cache-root>/agent/<data_type>_cache/<name>.tmp    partial download
//! ```
//!
//! A file only appears under its final name after it was fully written and,
//! when a checksum was declared, verified. Concurrent processes populating
//! the same name serialize on the `.lock` sibling; the loser finds the
//! winner's file and returns it without reading its own stream.

pub mod lock;

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufWriter, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};
use xz2::read::XzDecoder;

use crate::error::AssemblyError;
pub use lock::{sibling_path, ScopedLock};

/// Application directory under the user cache root.
pub const APP_NAME: &str = "agent";

/// Data type for base OS images.
pub const IMAGE_DATA_TYPE: &str = "image";

/// Data type for files extracted from the release payload.
pub const FILES_DATA_TYPE: &str = "files";

const COMPRESSION_SUFFIXES: &[&str] = &[".gz", ".xz"];
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const XZ_MAGIC: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];
const COPY_BUF_SIZE: usize = 1024 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Cache rooted at an explicit directory (normally the user cache root).
#[derive(Debug, Clone)]
pub struct ContentCache {
    root: PathBuf,
}

impl ContentCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache under `dirs::cache_dir()` (`$XDG_CACHE_HOME` or `~/.cache` on Linux).
    pub fn user_default() -> Result<Self> {
        let root = dirs::cache_dir().ok_or_else(|| {
            AssemblyError::Configuration("cannot determine the user cache directory".into())
        })?;
        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scoped directory for `data_type`, created if needed.
    pub fn dir(&self, data_type: &str) -> Result<PathBuf> {
        cache_dir_in(&self.root, data_type)
    }

    /// Download into the `data_type` directory, or return the cached copy.
    pub fn download(&self, descriptor: &DownloadDescriptor, data_type: &str) -> Result<PathBuf> {
        let dir = self.dir(data_type)?;
        download(descriptor, &dir)
    }
}

/// Scoped cache directory under the user cache root.
pub fn cache_dir(data_type: &str) -> Result<PathBuf> {
    ContentCache::user_default()?.dir(data_type)
}

/// Scoped cache directory under `root`.
pub fn cache_dir_in(root: &Path, data_type: &str) -> Result<PathBuf> {
    validate_data_type(data_type)?;
    let dir = root.join(APP_NAME).join(format!("{data_type}_cache"));
    fs::create_dir_all(&dir)
        .with_context(|| format!("creating cache directory {}", dir.display()))?;
    Ok(dir)
}

/// Return the cached file `name` in `dir` if it exists.
pub fn lookup(name: &str, dir: &Path) -> Option<PathBuf> {
    let path = dir.join(name);
    path.is_file().then_some(path)
}

/// A file to fetch over HTTP, optionally pinned to the sha256 of its
/// decompressed content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadDescriptor {
    pub url: String,
    pub sha256: Option<String>,
}

impl DownloadDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            sha256: None,
        }
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }

    /// Cache filename: the URL basename without a compression suffix.
    pub fn file_name(&self) -> Result<String> {
        let path = self
            .url
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .trim_end_matches('/');
        let base = path.rsplit('/').next().unwrap_or_default();
        let name = COMPRESSION_SUFFIXES
            .iter()
            .find_map(|suffix| base.strip_suffix(suffix))
            .unwrap_or(base);
        if name.is_empty() || name.contains(':') {
            return Err(AssemblyError::Configuration(format!(
                "cannot derive a cache filename from URL '{}'",
                self.url
            ))
            .into());
        }
        Ok(name.to_string())
    }
}

/// Fetch `descriptor` into `dir` unless it is already cached there.
pub fn download(descriptor: &DownloadDescriptor, dir: &Path) -> Result<PathBuf> {
    let name = descriptor.file_name()?;
    if let Some(hit) = lookup(&name, dir) {
        debug!(path = %hit.display(), "cache hit");
        return Ok(hit);
    }

    info!(url = %descriptor.url, "downloading");
    let http_err = |reason: String| AssemblyError::Http {
        url: descriptor.url.clone(),
        reason,
    };
    // Images are large; only the connect phase is bounded.
    let client = reqwest::blocking::Client::builder()
        .timeout(None)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| http_err(e.to_string()))?;
    let response = client
        .get(&descriptor.url)
        .send()
        .map_err(|e| http_err(e.to_string()))?;
    let status = response.status();
    if !status.is_success() {
        return Err(http_err(format!("unexpected status {status}")).into());
    }

    populate(response, &dir.join(&name), descriptor.sha256.as_deref())
        .with_context(|| format!("caching {}", descriptor.url))
}

/// Stream `reader` into `dest`, decompressing gzip/xz input on the fly.
///
/// When `expected_sha256` is given the decompressed bytes must hash to it;
/// otherwise the partial file is discarded and nothing appears at `dest`.
pub fn populate<R: Read>(reader: R, dest: &Path, expected_sha256: Option<&str>) -> Result<PathBuf> {
    let _lock = ScopedLock::for_destination(dest)?;

    if dest.exists() {
        debug!(path = %dest.display(), "populated by another process");
        return Ok(dest.to_path_buf());
    }

    let tmp = sibling_path(dest, "tmp");
    let mut guard = PartialFile::new(tmp.clone());

    let mut source = decompressing_reader(reader)
        .with_context(|| format!("reading stream for {}", dest.display()))?;
    let out = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
    let mut writer = BufWriter::new(out);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    loop {
        let n = source
            .read(&mut buf)
            .with_context(|| format!("reading stream for {}", dest.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer
            .write_all(&buf[..n])
            .with_context(|| format!("writing {}", tmp.display()))?;
    }
    let out = writer
        .into_inner()
        .map_err(|e| e.into_error())
        .with_context(|| format!("flushing {}", tmp.display()))?;
    out.sync_all()
        .with_context(|| format!("syncing {}", tmp.display()))?;
    drop(out);

    let actual = format!("{:x}", hasher.finalize());
    if let Some(expected) = expected_sha256 {
        if !expected.trim().eq_ignore_ascii_case(&actual) {
            return Err(AssemblyError::Integrity {
                path: dest.to_path_buf(),
                expected: expected.trim().to_string(),
                actual,
            }
            .into());
        }
    }

    fs::rename(&tmp, dest)
        .with_context(|| format!("renaming {} to {}", tmp.display(), dest.display()))?;
    guard.keep();
    debug!(path = %dest.display(), sha256 = %actual, "cached");
    Ok(dest.to_path_buf())
}

/// sha256 of a file, hex encoded.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut f = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut f, &mut hasher).with_context(|| format!("hashing {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

fn decompressing_reader<'a, R: Read + 'a>(mut reader: R) -> io::Result<Box<dyn Read + 'a>> {
    let mut head = Vec::with_capacity(XZ_MAGIC.len());
    (&mut reader)
        .take(XZ_MAGIC.len() as u64)
        .read_to_end(&mut head)?;

    let is_gzip = head.starts_with(GZIP_MAGIC);
    let is_xz = head.starts_with(XZ_MAGIC);
    let stream = Cursor::new(head).chain(reader);

    Ok(if is_gzip {
        Box::new(MultiGzDecoder::new(stream))
    } else if is_xz {
        Box::new(XzDecoder::new_multi_decoder(stream))
    } else {
        Box::new(stream)
    })
}

fn validate_data_type(data_type: &str) -> Result<()> {
    if data_type.is_empty() {
        return Err(AssemblyError::Configuration("cache data type must not be empty".into()).into());
    }
    if data_type.contains(['/', '\\']) || data_type.contains("..") {
        return Err(AssemblyError::Configuration(format!(
            "cache data type must be a single path segment: {data_type}"
        ))
        .into());
    }
    Ok(())
}

/// Deletes the temp file unless [`PartialFile::keep`] was called.
struct PartialFile {
    path: PathBuf,
    keep: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.keep {
            let _ = fs::remove_file(&self.path);
        }
    }
}
