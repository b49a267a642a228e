//! Release payload content extraction.
//!
//! Component images (e.g. `machine-os-images`) are resolved from the release
//! image and individual files are pulled out of them by a
//! [`ReleaseInspector`]. The extractor adds what the tool does not: stale
//! output removal, bounded retries, verification that files actually landed,
//! and cache-aware acquisition of the base ISO.

pub mod mirrors;
pub mod oc;
pub mod stream;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::arch::Architecture;
use crate::cache::{self, ContentCache, ScopedLock, FILES_DATA_TYPE, IMAGE_DATA_TYPE};
use crate::error::{kind_of, AssemblyError, ErrorKind};
pub use mirrors::MirrorRule;
pub use oc::OcInspector;
pub use stream::StreamMetadata;

/// Component carrying the CoreOS live ISO and its metadata.
pub const MACHINE_OS_IMAGES: &str = "machine-os-images";

/// Component carrying the agent helper binaries.
pub const AGENT_INSTALLER_UTILS: &str = "agent-installer-utils";

pub const DEFAULT_MAX_TRIES: u32 = 5;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

const COREOS_STREAM_PATH: &str = "/coreos/coreos-stream.json";

/// What to inspect and how to authenticate.
#[derive(Debug, Clone, Default)]
pub struct ReleaseQuery {
    pub release_image: String,
    pub pull_secret: Option<String>,
    pub mirrors: Vec<MirrorRule>,
    pub insecure: bool,
}

/// Fixed attempt count with a fixed pause between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_tries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_tries: DEFAULT_MAX_TRIES,
            delay: DEFAULT_RETRY_DELAY,
        }
    }
}

/// Tool boundary for reading a release payload.
pub trait ReleaseInspector {
    /// Pull spec of `component` inside the release image.
    fn resolve_image(&self, query: &ReleaseQuery, component: &str, arch: Architecture)
        -> Result<String>;

    /// Copy `path_in_image` (may be a glob) from `image` into `dest_dir`.
    fn extract(
        &self,
        query: &ReleaseQuery,
        image: &str,
        path_in_image: &str,
        dest_dir: &Path,
        arch: Architecture,
    ) -> Result<()>;
}

pub struct ReleaseExtractor {
    query: ReleaseQuery,
    inspector: Box<dyn ReleaseInspector>,
    cache: ContentCache,
    retry: RetryPolicy,
    local_stream: Option<StreamMetadata>,
}

impl ReleaseExtractor {
    pub fn new(query: ReleaseQuery, inspector: Box<dyn ReleaseInspector>, cache: ContentCache) -> Self {
        Self {
            query,
            inspector,
            cache,
            retry: RetryPolicy::default(),
            local_stream: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Stream metadata known without touching the network, used to validate
    /// a cached base ISO.
    pub fn with_local_stream(mut self, stream: StreamMetadata) -> Self {
        self.local_stream = Some(stream);
        self
    }

    pub fn query(&self) -> &ReleaseQuery {
        &self.query
    }

    pub fn cache(&self) -> &ContentCache {
        &self.cache
    }

    pub fn local_stream(&self) -> Option<&StreamMetadata> {
        self.local_stream.as_ref()
    }

    pub fn resolve_component_image(&self, component: &str, arch: Architecture) -> Result<String> {
        let image = self
            .inspector
            .resolve_image(&self.query, component, arch)
            .with_context(|| {
                format!(
                    "resolving {component} in release {}",
                    self.query.release_image
                )
            })?;
        debug!(component, image = %image, "resolved component image");
        Ok(image)
    }

    /// Extract `filename` into the shared files cache directory.
    pub fn extract_file(
        &self,
        image: &str,
        filename: &str,
        arch: Architecture,
    ) -> Result<Vec<PathBuf>> {
        let dir = self.cache.dir(FILES_DATA_TYPE)?;
        self.extract_file_to(image, filename, &dir, arch)
    }

    /// Extract `filename` into `dest_dir`, retrying per the retry policy.
    ///
    /// Returns every file matching the basename of `filename` in `dest_dir`.
    pub fn extract_file_to(
        &self,
        image: &str,
        filename: &str,
        dest_dir: &Path,
        arch: Architecture,
    ) -> Result<Vec<PathBuf>> {
        let base = Path::new(filename)
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                AssemblyError::Configuration(format!("no file name in '{filename}'"))
            })?;
        fs::create_dir_all(dest_dir)
            .with_context(|| format!("creating {}", dest_dir.display()))?;
        let pattern = format!(
            "{}/{}",
            glob::Pattern::escape(&dest_dir.to_string_lossy()),
            base
        );

        // Leftovers from an earlier run would pass the post-extraction check.
        for stale in matching_files(&pattern)? {
            fs::remove_file(&stale)
                .with_context(|| format!("removing stale {}", stale.display()))?;
        }

        let max_tries = self.retry.max_tries.max(1);
        let mut last_failure = String::new();
        for attempt in 1..=max_tries {
            match self
                .inspector
                .extract(&self.query, image, filename, dest_dir, arch)
            {
                Ok(()) => {
                    let found = matching_files(&pattern)?;
                    if !found.is_empty() {
                        debug!(file = filename, count = found.len(), "extracted");
                        return Ok(found);
                    }
                    last_failure = format!("no files matching {base} after extraction");
                }
                Err(err) if kind_of(&err) == Some(ErrorKind::ToolUnavailable) => return Err(err),
                Err(err) => last_failure = format!("{err:#}"),
            }

            if attempt < max_tries {
                warn!(
                    file = filename,
                    attempt,
                    max_tries,
                    reason = %last_failure,
                    "extraction failed, retrying in {}s",
                    self.retry.delay.as_secs_f32()
                );
                thread::sleep(self.retry.delay);
            }
        }

        Err(AssemblyError::Extraction {
            image: image.to_string(),
            file: filename.to_string(),
            reason: format!("gave up after {max_tries} attempts: {last_failure}"),
        }
        .into())
    }

    /// Base live ISO for `arch`, extracted once and reused while current.
    pub fn get_base_iso(&self, arch: Architecture) -> Result<PathBuf> {
        let image = self.resolve_component_image(MACHINE_OS_IMAGES, arch)?;
        let dir = self.cache.dir(IMAGE_DATA_TYPE)?;
        let name = format!("coreos-{}.iso", arch.rpm_name());
        let _lock = ScopedLock::for_destination(&dir.join(&name))?;

        if let Some(cached) = cache::lookup(&name, &dir) {
            if self.cached_iso_is_current(&image, &cached, arch)? {
                info!(path = %cached.display(), "using cached base ISO");
                return Ok(cached);
            }
            info!(path = %cached.display(), "cached base ISO is outdated, extracting again");
        }

        info!(image = %image, "extracting base ISO");
        let paths = self
            .extract_file_to(&image, &format!("/coreos/{name}"), &dir, arch)
            .context("extracting base ISO")?;
        paths.into_iter().next().ok_or_else(|| {
            AssemblyError::Extraction {
                image,
                file: name,
                reason: "no ISO extracted".into(),
            }
            .into()
        })
    }

    /// CoreOS release version shipped in the release payload.
    pub fn get_base_iso_version(&self, arch: Architecture) -> Result<String> {
        let stream = self.release_stream(arch)?;
        Ok(stream.release(arch)?.to_string())
    }

    /// Stream metadata shipped in the `machine-os-images` component.
    pub fn release_stream(&self, arch: Architecture) -> Result<StreamMetadata> {
        let image = self.resolve_component_image(MACHINE_OS_IMAGES, arch)?;
        let paths = self
            .extract_file(&image, COREOS_STREAM_PATH, arch)
            .context("extracting CoreOS stream metadata")?;
        StreamMetadata::load(&paths[0])
    }

    fn cached_iso_is_current(&self, image: &str, cached: &Path, arch: Architecture) -> Result<bool> {
        let actual = cache::sha256_file(cached)?;

        if let Some(expected) = self
            .local_stream
            .as_ref()
            .and_then(|s| s.iso_sha256(arch))
        {
            if expected.eq_ignore_ascii_case(&actual) {
                debug!("cached base ISO matches local stream metadata");
                return Ok(true);
            }
        }

        let checksum_path = format!("/coreos/coreos-{}.iso.sha256", arch.rpm_name());
        let paths = self
            .extract_file(image, &checksum_path, arch)
            .context("extracting base ISO checksum")?;
        let published = fs::read_to_string(&paths[0])
            .with_context(|| format!("reading {}", paths[0].display()))?;
        let expected = published.split_whitespace().next().unwrap_or_default();
        Ok(expected.eq_ignore_ascii_case(&actual))
    }
}

fn matching_files(pattern: &str) -> Result<Vec<PathBuf>> {
    let mut found: Vec<PathBuf> = glob::glob(pattern)
        .with_context(|| format!("invalid glob pattern {pattern}"))?
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .collect();
    found.sort();
    Ok(found)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;
    use std::time::Instant;
    use tempfile::TempDir;

    pub(crate) const ISO_BYTES: &[u8] = b"fake coreos live iso";

    #[derive(Default)]
    pub(crate) struct FakeState {
        pub resolve_calls: u32,
        pub extract_calls: Vec<String>,
        pub failures_before_success: u32,
        pub missing_tool: bool,
        /// components whose resolution reports a missing tool
        pub unavailable_components: Vec<String>,
        /// path in image -> files (name, content) written on extract
        pub files: BTreeMap<String, Vec<(String, Vec<u8>)>>,
    }

    impl FakeState {
        pub(crate) fn extractions_of(&self, path: &str) -> usize {
            self.extract_calls.iter().filter(|p| *p == path).count()
        }
    }

    #[derive(Clone, Default)]
    pub(crate) struct FakeInspector {
        pub state: Rc<RefCell<FakeState>>,
    }

    impl FakeInspector {
        pub(crate) fn serve(&self, path: &str, name: &str, content: &[u8]) {
            self.state
                .borrow_mut()
                .files
                .entry(path.to_string())
                .or_default()
                .push((name.to_string(), content.to_vec()));
        }

        /// Payload with a CoreOS ISO, its checksum and stream metadata.
        pub(crate) fn with_coreos(iso: &[u8]) -> Self {
            let fake = Self::default();
            let sha = format!("{:x}", Sha256::digest(iso));
            fake.serve("/coreos/coreos-x86_64.iso", "coreos-x86_64.iso", iso);
            fake.serve(
                "/coreos/coreos-x86_64.iso.sha256",
                "coreos-x86_64.iso.sha256",
                format!("{sha}  coreos-x86_64.iso\n").as_bytes(),
            );
            fake.serve(
                COREOS_STREAM_PATH,
                "coreos-stream.json",
                stream::tests::sample_stream(&sha).as_bytes(),
            );
            fake
        }
    }

    impl ReleaseInspector for FakeInspector {
        fn resolve_image(&self, query: &ReleaseQuery, component: &str, _arch: Architecture) -> Result<String> {
            let mut state = self.state.borrow_mut();
            if state.missing_tool || state.unavailable_components.iter().any(|c| c == component) {
                return Err(AssemblyError::ToolUnavailable { tool: "oc".into() }.into());
            }
            state.resolve_calls += 1;
            Ok(format!("{}/{}", query.release_image, component))
        }

        fn extract(
            &self,
            _query: &ReleaseQuery,
            image: &str,
            path_in_image: &str,
            dest_dir: &Path,
            _arch: Architecture,
        ) -> Result<()> {
            let mut state = self.state.borrow_mut();
            if state.missing_tool {
                return Err(AssemblyError::ToolUnavailable { tool: "oc".into() }.into());
            }
            state.extract_calls.push(path_in_image.to_string());
            if state.failures_before_success > 0 {
                state.failures_before_success -= 1;
                return Err(AssemblyError::Extraction {
                    image: image.to_string(),
                    file: path_in_image.to_string(),
                    reason: "registry unavailable".into(),
                }
                .into());
            }
            for (name, content) in state.files.get(path_in_image).into_iter().flatten() {
                fs::write(dest_dir.join(name), content).unwrap();
            }
            Ok(())
        }
    }

    fn extractor(fake: &FakeInspector, root: &Path, max_tries: u32, delay: Duration) -> ReleaseExtractor {
        ReleaseExtractor::new(
            ReleaseQuery {
                release_image: "quay.io/ocp-release:4.16".into(),
                ..Default::default()
            },
            Box::new(fake.clone()),
            ContentCache::new(root),
        )
        .with_retry(RetryPolicy { max_tries, delay })
    }

    #[test]
    fn succeeds_on_last_allowed_attempt() {
        let tmp = TempDir::new().unwrap();
        let fake = FakeInspector::default();
        fake.serve("/usr/bin/agent-tui", "agent-tui", b"tui");
        fake.state.borrow_mut().failures_before_success = 2;
        let ex = extractor(&fake, tmp.path(), 3, Duration::from_millis(1));

        let paths = ex
            .extract_file("utils-image", "/usr/bin/agent-tui", Architecture::X86_64)
            .unwrap();

        assert_eq!(paths.len(), 1);
        assert_eq!(fs::read(&paths[0]).unwrap(), b"tui");
        assert_eq!(fake.state.borrow().extract_calls.len(), 3);
    }

    #[test]
    fn gives_up_after_max_tries_with_delay() {
        let tmp = TempDir::new().unwrap();
        let fake = FakeInspector::default();
        fake.state.borrow_mut().failures_before_success = u32::MAX;
        let delay = Duration::from_millis(30);
        let ex = extractor(&fake, tmp.path(), 4, delay);

        let started = Instant::now();
        let err = ex
            .extract_file("utils-image", "/usr/bin/agent-tui", Architecture::X86_64)
            .unwrap_err();

        assert_eq!(kind_of(&err), Some(ErrorKind::Extraction));
        assert_eq!(fake.state.borrow().extract_calls.len(), 4);
        assert!(started.elapsed() >= delay * 3);
    }

    #[test]
    fn missing_tool_is_not_retried() {
        let tmp = TempDir::new().unwrap();
        let fake = FakeInspector::default();
        fake.state.borrow_mut().missing_tool = true;
        let ex = extractor(&fake, tmp.path(), 5, Duration::from_secs(60));

        let err = ex
            .extract_file("utils-image", "/usr/bin/agent-tui", Architecture::X86_64)
            .unwrap_err();

        assert_eq!(kind_of(&err), Some(ErrorKind::ToolUnavailable));
    }

    #[test]
    fn stale_files_do_not_count_as_extracted() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out");
        fs::create_dir_all(&dest).unwrap();
        fs::write(dest.join("agent-tui"), b"stale").unwrap();
        let fake = FakeInspector::default();
        let ex = extractor(&fake, tmp.path(), 2, Duration::from_millis(1));

        let err = ex
            .extract_file_to("utils-image", "/usr/bin/agent-tui", &dest, Architecture::X86_64)
            .unwrap_err();

        assert_eq!(kind_of(&err), Some(ErrorKind::Extraction));
        assert!(!dest.join("agent-tui").exists());
    }

    #[test]
    fn glob_extraction_returns_every_match() {
        let tmp = TempDir::new().unwrap();
        let fake = FakeInspector::default();
        fake.serve("/usr/lib64/libnmstate.so.*", "libnmstate.so.2", b"a");
        fake.serve("/usr/lib64/libnmstate.so.*", "libnmstate.so.2.2.9", b"b");
        let ex = extractor(&fake, tmp.path(), 1, Duration::ZERO);

        let paths = ex
            .extract_file("utils-image", "/usr/lib64/libnmstate.so.*", Architecture::X86_64)
            .unwrap();

        let names: Vec<_> = paths
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, ["libnmstate.so.2", "libnmstate.so.2.2.9"]);
    }

    #[test]
    fn base_iso_is_extracted_once_then_cached() {
        let tmp = TempDir::new().unwrap();
        let fake = FakeInspector::with_coreos(ISO_BYTES);
        let ex = extractor(&fake, tmp.path(), 1, Duration::ZERO);

        let first = ex.get_base_iso(Architecture::X86_64).unwrap();
        assert_eq!(fs::read(&first).unwrap(), ISO_BYTES);
        assert_eq!(
            first,
            tmp.path().join("agent/image_cache/coreos-x86_64.iso")
        );

        let second = ex.get_base_iso(Architecture::X86_64).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            fake.state.borrow().extractions_of("/coreos/coreos-x86_64.iso"),
            1
        );
    }

    #[test]
    fn local_stream_metadata_skips_checksum_extraction() {
        let tmp = TempDir::new().unwrap();
        let fake = FakeInspector::with_coreos(ISO_BYTES);
        let sha = format!("{:x}", Sha256::digest(ISO_BYTES));
        let stream =
            StreamMetadata::from_slice(stream::tests::sample_stream(&sha).as_bytes()).unwrap();
        let ex = extractor(&fake, tmp.path(), 1, Duration::ZERO).with_local_stream(stream);

        ex.get_base_iso(Architecture::X86_64).unwrap();
        ex.get_base_iso(Architecture::X86_64).unwrap();

        let state = fake.state.borrow();
        assert_eq!(state.extractions_of("/coreos/coreos-x86_64.iso.sha256"), 0);
        assert_eq!(state.extractions_of("/coreos/coreos-x86_64.iso"), 1);
    }

    #[test]
    fn outdated_cached_iso_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let dir = cache::cache_dir_in(tmp.path(), IMAGE_DATA_TYPE).unwrap();
        fs::write(dir.join("coreos-x86_64.iso"), b"previous release").unwrap();
        let fake = FakeInspector::with_coreos(ISO_BYTES);
        let ex = extractor(&fake, tmp.path(), 1, Duration::ZERO);

        let path = ex.get_base_iso(Architecture::X86_64).unwrap();

        assert_eq!(fs::read(path).unwrap(), ISO_BYTES);
        let state = fake.state.borrow();
        assert_eq!(state.extractions_of("/coreos/coreos-x86_64.iso.sha256"), 1);
        assert_eq!(state.extractions_of("/coreos/coreos-x86_64.iso"), 1);
    }

    #[test]
    fn base_iso_version_comes_from_payload_stream() {
        let tmp = TempDir::new().unwrap();
        let fake = FakeInspector::with_coreos(ISO_BYTES);
        let ex = extractor(&fake, tmp.path(), 1, Duration::ZERO);

        let version = ex.get_base_iso_version(Architecture::X86_64).unwrap();

        assert_eq!(version, "416.94.202405291527-0");
    }
}
