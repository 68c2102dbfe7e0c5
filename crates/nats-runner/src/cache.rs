//! Version-keyed cache of nats-server executables.
//!
//! Layout: `<root>/bin/<tag>/<binary>`. An executable present at its final
//! path is complete and never rewritten, so lookups need no lock. Misses are
//! serialized by one lock per cache root and re-checked once it is held.

use crate::archive::{ArchiveExtractor, FlatteningExtractor};
use crate::download::{DownloadError, DownloadTransport, ReqwestTransport};
use crate::platform::{Platform, executable_name, version_tag};
use nats_runner_core::{RunnerError, RunnerOptions};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static SHARED: OnceLock<std::sync::Mutex<HashMap<PathBuf, Weak<CacheManager>>>> = OnceLock::new();

pub struct CacheManager {
    root: PathBuf,
    transport: Arc<dyn DownloadTransport>,
    extractor: Arc<dyn ArchiveExtractor>,
    lock: Mutex<()>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    /// Cache manager downloading with [`ReqwestTransport`]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_collaborators(
            root,
            Arc::new(ReqwestTransport::default()),
            Arc::new(FlatteningExtractor),
        )
    }

    pub fn with_collaborators(
        root: impl Into<PathBuf>,
        transport: Arc<dyn DownloadTransport>,
        extractor: Arc<dyn ArchiveExtractor>,
    ) -> Self {
        Self {
            root: root.into(),
            transport,
            extractor,
            lock: Mutex::new(()),
        }
    }

    /// The process-wide manager for `root`.
    ///
    /// Every live runner in this process whose cache root resolves to the
    /// same directory shares one manager and therefore one download lock.
    /// Entries are dropped with the last runner using them. Callers that want
    /// explicit ownership build a manager themselves and hand it to
    /// `NatsRunner::with_cache_manager`.
    pub fn shared(root: &Path) -> Arc<CacheManager> {
        let key = registry_key(root);
        let registry = SHARED.get_or_init(Default::default);
        let mut managers = registry.lock().unwrap();
        managers.retain(|_, manager| manager.strong_count() > 0);

        if let Some(manager) = managers.get(&key).and_then(Weak::upgrade) {
            return manager;
        }
        let manager = Arc::new(CacheManager::new(key.clone()));
        managers.insert(key, Arc::downgrade(&manager));
        manager
    }

    /// `<local data dir>/nats-runner`, or the temp directory when there is none
    pub fn default_root() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("nats-runner")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final location of the executable for a release tag
    pub fn binary_path(&self, tag: &str, platform: &Platform) -> PathBuf {
        self.root.join("bin").join(tag).join(platform.binary_name())
    }

    /// Resolve an executable for `options`, downloading it on a cache miss
    pub async fn ensure(
        &self,
        options: &RunnerOptions,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, RunnerError> {
        if let Some(directory) = &options.binary_directory {
            let candidate = directory.join(executable_name());
            if candidate.is_file() {
                debug!(path = %candidate.display(), "Using caller-supplied nats-server");
                return Ok(candidate);
            }
            return Err(RunnerError::BinaryNotFound {
                directory: directory.clone(),
                binary: executable_name().to_string(),
            });
        }

        let platform = Platform::current()?;
        let tag = version_tag(options.effective_version());
        let target = self.binary_path(&tag, &platform);

        if target.is_file() {
            debug!(version = %tag, path = %target.display(), "nats-server cache hit");
            return Ok(target);
        }

        let _guard = self.lock.lock().await;
        if target.is_file() {
            debug!(version = %tag, "nats-server cached while waiting for the download lock");
            return Ok(target);
        }

        self.acquire(options, &platform, &tag, &target, cancel)
            .await?;
        Ok(target)
    }

    async fn acquire(
        &self,
        options: &RunnerOptions,
        platform: &Platform,
        tag: &str,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), RunnerError> {
        let url = platform.download_url(&options.download_base_url, tag);
        let binary = platform.binary_name();
        info!(version = %tag, url = %url, "Acquiring nats-server");

        let scratch = ScratchWorkspace::create(&self.root.join("tmp"))?;

        let archive = match self.transport.fetch(&url, cancel).await {
            Ok(archive) => archive,
            Err(DownloadError::NotFound { url }) => {
                return Err(RunnerError::VersionNotFound {
                    version: options.effective_version().to_string(),
                    url,
                });
            }
            Err(DownloadError::Cancelled) => {
                return Err(RunnerError::acquisition(format!(
                    "Download of {url} was cancelled"
                )));
            }
            Err(e) => return Err(RunnerError::acquisition(format!("{url}: {e}"))),
        };

        let archive_path = scratch.download_dir().join(platform.asset_name(tag));
        tokio::fs::write(&archive_path, &archive)
            .await
            .map_err(|e| RunnerError::acquisition(format!("Failed to store archive: {e}")))?;

        let extractor = self.extractor.clone();
        let kind = platform.archive_kind();
        let extract_dir = scratch.extract_dir();
        let extracted = tokio::task::spawn_blocking(move || {
            extractor.extract(&archive_path, kind, &extract_dir)
        })
        .await
        .map_err(|e| RunnerError::acquisition(format!("Extraction task failed: {e}")))?;
        extracted.map_err(|e| RunnerError::acquisition(format!("Failed to extract {url}: {e:#}")))?;

        let located = scratch.extract_dir().join(binary);
        if !located.is_file() {
            return Err(RunnerError::PackageMalformed {
                url,
                binary: binary.to_string(),
            });
        }

        let destination = target.to_path_buf();
        tokio::task::spawn_blocking(move || install_binary(&located, &destination))
            .await
            .map_err(|e| RunnerError::acquisition(format!("Install task failed: {e}")))?
            .map_err(|e| {
                RunnerError::acquisition(format!("Failed to install {}: {e}", target.display()))
            })?;

        info!(version = %tag, path = %target.display(), "Cached nats-server");
        scratch.close();
        Ok(())
    }
}

/// Resolved spelling of a cache root: symlinks resolved for the part that
/// exists, `.` and `..` folded for the rest
fn registry_key(root: &Path) -> PathBuf {
    let absolute = std::path::absolute(root).unwrap_or_else(|_| root.to_path_buf());
    let mut existing = absolute.as_path();
    let mut missing = Vec::new();

    loop {
        if let Ok(mut key) = std::fs::canonicalize(existing) {
            for part in missing.iter().rev() {
                match part {
                    Component::ParentDir => {
                        key.pop();
                    }
                    Component::Normal(name) => key.push(name),
                    _ => {}
                }
            }
            return key;
        }
        let mut components = existing.components();
        match components.next_back() {
            Some(last) => {
                missing.push(last);
                existing = components.as_path();
            }
            None => return absolute.clone(),
        }
    }
}

/// Download and extract directories of one acquisition, removed on drop
struct ScratchWorkspace {
    dir: tempfile::TempDir,
}

impl ScratchWorkspace {
    fn create(parent: &Path) -> Result<Self, RunnerError> {
        let make = || -> std::io::Result<tempfile::TempDir> {
            std::fs::create_dir_all(parent)?;
            let dir = tempfile::Builder::new().prefix("scratch-").tempdir_in(parent)?;
            std::fs::create_dir(dir.path().join("download"))?;
            std::fs::create_dir(dir.path().join("extract"))?;
            Ok(dir)
        };
        make()
            .map(|dir| Self { dir })
            .map_err(|e| RunnerError::acquisition(format!("Failed to create scratch workspace: {e}")))
    }

    fn download_dir(&self) -> PathBuf {
        self.dir.path().join("download")
    }

    fn extract_dir(&self) -> PathBuf {
        self.dir.path().join("extract")
    }

    fn close(self) {
        let path = self.dir.path().to_path_buf();
        if let Err(e) = self.dir.close() {
            warn!(path = %path.display(), "Failed to remove scratch workspace: {e}");
        }
    }
}

/// Copy `source` next to `destination` under a unique name, make it
/// executable and rename it into place
fn install_binary(source: &Path, destination: &Path) -> std::io::Result<()> {
    let parent = destination
        .parent()
        .ok_or_else(|| std::io::Error::other("cache path has no parent directory"))?;
    std::fs::create_dir_all(parent)?;

    let file_name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = parent.join(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

    let staged = (|| {
        std::fs::copy(source, &staging)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&staging, std::fs::Permissions::from_mode(0o755))?;
        }
        std::fs::rename(&staging, destination)
    })();

    if staged.is_err() {
        let _ = std::fs::remove_file(&staging);
    }
    staged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::ArchiveKind;
    use crate::testing::{tar_gz, zip_archive};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_util::bytes::Bytes;

    /// Serves one archive for every URL and counts requests
    struct CountingTransport {
        archive: Option<Bytes>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CountingTransport {
        fn serving(archive: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                archive: Some(Bytes::from(archive)),
                calls: AtomicUsize::new(0),
                delay: Duration::from_millis(50),
            })
        }

        fn not_found() -> Arc<Self> {
            Arc::new(Self {
                archive: None,
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl DownloadTransport for CountingTransport {
        async fn fetch(
            &self,
            url: &str,
            _cancel: &CancellationToken,
        ) -> Result<Bytes, DownloadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.archive.clone().ok_or_else(|| DownloadError::NotFound {
                url: url.to_string(),
            })
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl DownloadTransport for FailingTransport {
        async fn fetch(&self, _: &str, _: &CancellationToken) -> Result<Bytes, DownloadError> {
            Err(DownloadError::Transport("connection reset".to_string()))
        }
    }

    fn release_archive(with_binary: bool) -> Vec<u8> {
        let platform = Platform::current().unwrap();
        let binary = format!("nats-server-v2.10.22/{}", platform.binary_name());
        let mut entries: Vec<(&str, &[u8])> = Vec::new();
        entries.push(("nats-server-v2.10.22/LICENSE", &b"Apache-2.0"[..]));
        if with_binary {
            entries.push((binary.as_str(), &b"#!/bin/sh\necho fake\n"[..]));
        }
        match platform.archive_kind() {
            ArchiveKind::TarGz => tar_gz(&entries),
            ArchiveKind::Zip => zip_archive(&entries),
        }
    }

    fn manager(root: &Path, transport: Arc<dyn DownloadTransport>) -> CacheManager {
        CacheManager::with_collaborators(root, transport, Arc::new(FlatteningExtractor))
    }

    fn options(version: &str) -> RunnerOptions {
        RunnerOptions::builder().version(version).build().unwrap()
    }

    fn scratch_is_empty(root: &Path) -> bool {
        std::fs::read_dir(root.join("tmp"))
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    #[tokio::test]
    async fn test_download_then_cache_hit() {
        let root = tempfile::tempdir().unwrap();
        let transport = CountingTransport::serving(release_archive(true));
        let cache = manager(root.path(), transport.clone());
        let cancel = CancellationToken::new();

        let first = cache.ensure(&options("2.10.22"), &cancel).await.unwrap();
        let second = cache.ensure(&options("v2.10.22"), &cancel).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(
            first,
            root.path()
                .join("bin")
                .join("v2.10.22")
                .join(executable_name())
        );
        assert_eq!(std::fs::read(&first).unwrap(), b"#!/bin/sh\necho fake\n");
        assert_eq!(transport.calls(), 1);
        assert!(scratch_is_empty(root.path()));
    }

    #[tokio::test]
    async fn test_concurrent_misses_download_once() {
        let root = tempfile::tempdir().unwrap();
        let transport = CountingTransport::serving(release_archive(true));
        let cache = Arc::new(manager(root.path(), transport.clone()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    cache
                        .ensure(&options("2.10.22"), &CancellationToken::new())
                        .await
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_version_is_named() {
        let root = tempfile::tempdir().unwrap();
        let cache = manager(root.path(), CountingTransport::not_found());

        let err = cache
            .ensure(&options("0.0.1-nope"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::VersionNotFound { .. }));
        assert!(err.to_string().contains("0.0.1-nope"));
        assert!(scratch_is_empty(root.path()));
    }

    #[tokio::test]
    async fn test_archive_without_binary_is_malformed() {
        let root = tempfile::tempdir().unwrap();
        let cache = manager(root.path(), CountingTransport::serving(release_archive(false)));

        let err = cache
            .ensure(&options("2.10.22"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::PackageMalformed { .. }));
        assert!(!root.path().join("bin").join("v2.10.22").join(executable_name()).exists());
        assert!(scratch_is_empty(root.path()));
    }

    #[tokio::test]
    async fn test_transport_failure_is_acquisition_error() {
        let root = tempfile::tempdir().unwrap();
        let cache = manager(root.path(), Arc::new(FailingTransport));

        let err = cache
            .ensure(&options("2.10.22"), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::AcquisitionFailed(_)));
        assert!(err.to_string().contains("connection reset"));
    }

    #[tokio::test]
    async fn test_binary_directory_never_downloads() {
        let root = tempfile::tempdir().unwrap();
        let bin_dir = tempfile::tempdir().unwrap();
        let transport = CountingTransport::serving(release_archive(true));
        let cache = manager(root.path(), transport.clone());

        let opts = RunnerOptions::builder()
            .binary_directory(bin_dir.path())
            .build()
            .unwrap();
        let err = cache
            .ensure(&opts, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::BinaryNotFound { .. }));

        std::fs::write(bin_dir.path().join(executable_name()), b"bin").unwrap();
        let path = cache.ensure(&opts, &CancellationToken::new()).await.unwrap();
        assert_eq!(path, bin_dir.path().join(executable_name()));
        assert_eq!(transport.calls(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cached_binary_is_executable() {
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let cache = manager(root.path(), CountingTransport::serving(release_archive(true)));
        let path = cache
            .ensure(&options("2.10.22"), &CancellationToken::new())
            .await
            .unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
        // No staging leftovers next to the binary
        assert_eq!(std::fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_shared_is_per_root() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();

        assert!(Arc::ptr_eq(
            &CacheManager::shared(a.path()),
            &CacheManager::shared(a.path())
        ));
        assert!(!Arc::ptr_eq(
            &CacheManager::shared(a.path()),
            &CacheManager::shared(b.path())
        ));
    }

    #[test]
    fn test_shared_resolves_spellings_of_the_same_root() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("cache");
        std::fs::create_dir_all(root.join("bin")).unwrap();

        let plain = CacheManager::shared(&root);
        let dotted = CacheManager::shared(&root.join(".").join("bin").join(".."));
        assert!(Arc::ptr_eq(&plain, &dotted));

        // Not created yet, then created: still one manager
        let later = temp.path().join("later");
        let before = CacheManager::shared(&later.join("x").join(".."));
        std::fs::create_dir(&later).unwrap();
        let after = CacheManager::shared(&later);
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.root(), std::fs::canonicalize(&later).unwrap());
    }

    #[cfg(unix)]
    #[test]
    fn test_shared_follows_symlinked_root() {
        let temp = tempfile::tempdir().unwrap();
        let real = temp.path().join("real");
        std::fs::create_dir(&real).unwrap();
        let link = temp.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        let via_real = CacheManager::shared(&real);
        let via_link = CacheManager::shared(&link);
        assert!(Arc::ptr_eq(&via_real, &via_link));
    }

    #[test]
    fn test_shared_forgets_unused_roots() {
        let temp = tempfile::tempdir().unwrap();
        let manager = CacheManager::shared(temp.path());
        let weak = Arc::downgrade(&manager);
        drop(manager);
        assert!(weak.upgrade().is_none());

        let fresh = CacheManager::shared(temp.path());
        assert_eq!(Arc::strong_count(&fresh), 1);
    }
}
