//! Orchestrates detection, lookup, extraction and the process-level load.

use crate::cache::LibraryCache;
use crate::config::NativeCodeConfig;
use crate::locator::{ArtifactLocator, ResourceRoot};
use crate::{NativeCodeError, Result};
use libloading::Library;
use platform::{HostInfo, PlatformTable, ResolvedPlatform};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Loads native code from a path into the running process.
pub trait NativeLoad: Send + Sync {
    /// Keeps the library mapped while it is alive.
    type Handle: Send + Sync;

    fn load(&self, path: &Path) -> std::result::Result<Self::Handle, BoxError>;
}

/// `dlopen`/`LoadLibrary` through libloading.
#[derive(Debug, Default, Clone, Copy)]
pub struct DynamicLoader;

impl NativeLoad for DynamicLoader {
    type Handle = Library;

    fn load(&self, path: &Path) -> std::result::Result<Library, BoxError> {
        // A bare file name would make the system loader search its own paths.
        let path = if path.is_relative() {
            std::env::current_dir()?.join(path)
        } else {
            path.to_path_buf()
        };
        // SAFETY: bundled artifacts are trusted; their initializers run here.
        let library = unsafe { Library::new(&path)? };
        Ok(library)
    }
}

/// Result of a load request that did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { path: PathBuf },
    AlreadyLoaded { path: PathBuf },
    UnsupportedPlatform,
    ArtifactNotFound { relative_path: String },
}

impl LoadOutcome {
    pub fn is_available(&self) -> bool {
        matches!(
            self,
            LoadOutcome::Loaded { .. } | LoadOutcome::AlreadyLoaded { .. }
        )
    }
}

impl fmt::Display for LoadOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadOutcome::Loaded { path } => write!(f, "loaded from {}", path.display()),
            LoadOutcome::AlreadyLoaded { path } => {
                write!(f, "already loaded from {}", path.display())
            }
            LoadOutcome::UnsupportedPlatform => write!(f, "unsupported platform"),
            LoadOutcome::ArtifactNotFound { relative_path } => {
                write!(f, "no packaged artifact {relative_path}")
            }
        }
    }
}

struct LoadedLibrary<H> {
    path: PathBuf,
    _handle: H,
}

/// Per-name load state; empty until the native load succeeds.
type LoadSlot<H> = Arc<Mutex<Option<LoadedLibrary<H>>>>;

pub struct Loader<L: NativeLoad = DynamicLoader> {
    platform: ResolvedPlatform,
    locator: ArtifactLocator,
    default_cache_dir: Option<PathBuf>,
    backend: L,
    // Declared before `cache`: handles are released before temporary files are removed.
    loaded: Mutex<HashMap<String, LoadSlot<L::Handle>>>,
    cache: LibraryCache,
}

impl Loader<DynamicLoader> {
    pub fn new(platform: ResolvedPlatform, locator: ArtifactLocator) -> Self {
        Self::with_backend(platform, locator, DynamicLoader)
    }

    pub fn from_config(config: &NativeCodeConfig) -> Result<Self> {
        let platform = match &config.platforms {
            Some(specs) => PlatformTable::from_specs(specs)?.detect(&HostInfo::current()),
            None => platform::current().clone(),
        };
        let roots = config
            .resource_roots_or_default()
            .into_iter()
            .map(ResourceRoot::Directory)
            .collect();

        let mut loader = Self::new(platform, ArtifactLocator::new(roots));
        loader.default_cache_dir = config.cache_dir.clone();
        Ok(loader)
    }
}

impl<L: NativeLoad> Loader<L> {
    pub fn with_backend(platform: ResolvedPlatform, locator: ArtifactLocator, backend: L) -> Self {
        Self {
            platform,
            locator,
            default_cache_dir: None,
            backend,
            loaded: Mutex::new(HashMap::new()),
            cache: LibraryCache::new(),
        }
    }

    /// Cache directory used when a request does not name one.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.default_cache_dir = Some(dir.into());
        self
    }

    pub fn platform(&self) -> &ResolvedPlatform {
        &self.platform
    }

    pub fn locator(&self) -> &ArtifactLocator {
        &self.locator
    }

    pub fn cache(&self) -> &LibraryCache {
        &self.cache
    }

    /// Make `name` available in this process.
    ///
    /// Unsupported platforms and missing artifacts are reported as outcomes;
    /// only extraction and load failures are errors. A name is loaded at most
    /// once, later requests are no-ops reporting the original path. Loads of
    /// different names do not wait for each other.
    pub fn try_load(&self, cache_dir: Option<&Path>, name: &str) -> Result<LoadOutcome> {
        let Some(tag) = self.platform.tag() else {
            warn!(
                "native library {} unavailable: unsupported platform {}",
                name, self.platform
            );
            return Ok(LoadOutcome::UnsupportedPlatform);
        };

        if let Some(path) = self.loaded_path(name) {
            debug!("native library {} already loaded from {}", name, path.display());
            return Ok(LoadOutcome::AlreadyLoaded { path });
        }

        let Some(artifact) = self.locator.locate(tag, name) else {
            let relative_path = ArtifactLocator::relative_path(tag, name);
            warn!("could not find native library {}", relative_path);
            return Ok(LoadOutcome::ArtifactNotFound { relative_path });
        };

        let file_name = platform::map_library_name(name);
        let target = cache_dir.or(self.default_cache_dir.as_deref()).into();
        let path = self
            .cache
            .resolve_path(name, &file_name, target, |writer| artifact.copy_to(writer))?;

        let slot = self.load_slot(name);
        let mut entry = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = entry.as_ref() {
            return Ok(LoadOutcome::AlreadyLoaded {
                path: existing.path.clone(),
            });
        }

        let handle = self
            .backend
            .load(&path)
            .map_err(|source| NativeCodeError::LoadFailed {
                name: name.to_string(),
                path: path.clone(),
                source,
            })?;
        info!("loaded native library {} from {}", name, path.display());
        *entry = Some(LoadedLibrary {
            path: path.clone(),
            _handle: handle,
        });
        Ok(LoadOutcome::Loaded { path })
    }

    pub fn load_library(&self, cache_dir: Option<&Path>, name: &str) -> Result<bool> {
        self.try_load(cache_dir, name)
            .map(|outcome| outcome.is_available())
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded_path(name).is_some()
    }

    pub fn loaded_libraries(&self) -> Vec<String> {
        let slots: Vec<(String, LoadSlot<L::Handle>)> = self
            .loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, slot)| (name.clone(), Arc::clone(slot)))
            .collect();
        let mut names: Vec<String> = slots
            .into_iter()
            .filter(|(_, slot)| {
                slot.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .is_some()
            })
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names
    }

    pub fn purge_temporaries(&self) {
        self.cache.purge_temporaries();
    }

    /// Waits for an in-flight load of `name`, if any.
    fn loaded_path(&self, name: &str) -> Option<PathBuf> {
        let slot = self
            .loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()?;
        let entry = slot.lock().unwrap_or_else(PoisonError::into_inner);
        entry.as_ref().map(|loaded| loaded.path.clone())
    }

    fn load_slot(&self, name: &str) -> LoadSlot<L::Handle> {
        let mut loaded = self.loaded.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(loaded.entry(name.to_string()).or_default())
    }
}

impl<L: NativeLoad + 'static> Loader<L> {
    /// [`Loader::load_library`] on the blocking thread pool.
    pub async fn load_library_async(
        self: Arc<Self>,
        cache_dir: Option<PathBuf>,
        name: String,
    ) -> Result<bool> {
        tokio::task::spawn_blocking(move || self.load_library(cache_dir.as_deref(), &name))
            .await
            .map_err(|e| NativeCodeError::TaskFailed(format!("native load task failed: {e}")))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct CountingLoader {
        loads: AtomicUsize,
    }

    impl NativeLoad for Arc<CountingLoader> {
        type Handle = PathBuf;

        fn load(&self, path: &Path) -> std::result::Result<PathBuf, BoxError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(path.to_path_buf())
        }
    }

    struct RejectingLoader;

    impl NativeLoad for RejectingLoader {
        type Handle = ();

        fn load(&self, _path: &Path) -> std::result::Result<(), BoxError> {
            Err("invalid ELF header".into())
        }
    }

    /// Fails its first load only.
    #[derive(Default)]
    struct FlakyLoader {
        attempts: AtomicUsize,
    }

    impl NativeLoad for FlakyLoader {
        type Handle = ();

        fn load(&self, _path: &Path) -> std::result::Result<(), BoxError> {
            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err("resource temporarily unavailable".into());
            }
            Ok(())
        }
    }

    /// Parks the load of `slow` until a load of another name has run.
    struct OverlapLoader {
        entered: Mutex<mpsc::Sender<()>>,
        release_tx: Mutex<mpsc::Sender<()>>,
        release_rx: Mutex<mpsc::Receiver<()>>,
    }

    impl NativeLoad for OverlapLoader {
        type Handle = ();

        fn load(&self, path: &Path) -> std::result::Result<(), BoxError> {
            if path.ends_with(platform::map_library_name("slow")) {
                self.entered.lock().unwrap().send(())?;
                self.release_rx
                    .lock()
                    .unwrap()
                    .recv_timeout(Duration::from_secs(10))?;
            } else {
                self.release_tx.lock().unwrap().send(())?;
            }
            Ok(())
        }
    }

    fn bundle_with(name: &str) -> TempDir {
        bundle_with_all(&[name])
    }

    fn bundle_with_all(names: &[&str]) -> TempDir {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("test-tag");
        fs::create_dir_all(&dir).unwrap();
        for name in names {
            fs::write(dir.join(platform::map_library_name(name)), b"native").unwrap();
        }
        root
    }

    fn supported() -> ResolvedPlatform {
        ResolvedPlatform::supported(HostInfo::new("linux", "x86_64"), "test-tag")
    }

    #[test]
    fn unsupported_platform_short_circuits() {
        let root = bundle_with("solver");
        let backend = Arc::new(CountingLoader::default());
        let loader = Loader::with_backend(
            ResolvedPlatform::unsupported(HostInfo::new("SolarisX", "sparc")),
            ArtifactLocator::new(vec![root.path().into()]),
            Arc::clone(&backend),
        );

        let outcome = loader.try_load(None, "solver").unwrap();
        assert_eq!(outcome, LoadOutcome::UnsupportedPlatform);
        assert!(!loader.load_library(None, "solver").unwrap());
        assert!(loader.cache().is_empty());
        assert_eq!(backend.loads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn repeated_load_is_a_no_op() {
        let root = bundle_with("solver");
        let cache_dir = TempDir::new().unwrap();
        let backend = Arc::new(CountingLoader::default());
        let loader = Loader::with_backend(
            supported(),
            ArtifactLocator::new(vec![root.path().into()]),
            Arc::clone(&backend),
        );

        let first = loader.try_load(Some(cache_dir.path()), "solver").unwrap();
        let second = loader.try_load(Some(cache_dir.path()), "solver").unwrap();

        let expected = cache_dir.path().join(platform::map_library_name("solver"));
        assert_eq!(first, LoadOutcome::Loaded { path: expected.clone() });
        assert_eq!(second, LoadOutcome::AlreadyLoaded { path: expected });
        assert_eq!(backend.loads.load(Ordering::SeqCst), 1);
        assert_eq!(loader.loaded_libraries(), vec!["solver".to_string()]);
    }

    #[test]
    fn load_failure_is_an_error_and_not_recorded() {
        let root = bundle_with("solver");
        let loader = Loader::with_backend(
            supported(),
            ArtifactLocator::new(vec![root.path().into()]),
            RejectingLoader,
        );

        let err = loader.load_library(None, "solver").unwrap_err();
        assert!(matches!(err, NativeCodeError::LoadFailed { ref name, .. } if name == "solver"));
        assert!(!loader.is_loaded("solver"));
        loader.purge_temporaries();
    }

    #[test]
    fn different_names_load_concurrently() {
        let root = bundle_with_all(&["slow", "fast"]);
        let cache_dir = TempDir::new().unwrap();
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let loader = Loader::with_backend(
            supported(),
            ArtifactLocator::new(vec![root.path().into()]),
            OverlapLoader {
                entered: Mutex::new(entered_tx),
                release_tx: Mutex::new(release_tx),
                release_rx: Mutex::new(release_rx),
            },
        );

        thread::scope(|scope| {
            let slow = scope.spawn(|| loader.try_load(Some(cache_dir.path()), "slow"));
            entered_rx.recv_timeout(Duration::from_secs(10)).unwrap();

            // `slow` is still inside its native load here.
            let fast = loader.try_load(Some(cache_dir.path()), "fast").unwrap();
            assert!(matches!(fast, LoadOutcome::Loaded { .. }));
            let slow = slow.join().unwrap().unwrap();
            assert!(matches!(slow, LoadOutcome::Loaded { .. }));
        });
        assert_eq!(
            loader.loaded_libraries(),
            vec!["fast".to_string(), "slow".to_string()]
        );
    }

    #[test]
    fn failed_load_can_be_retried() {
        let root = bundle_with("solver");
        let cache_dir = TempDir::new().unwrap();
        let loader = Loader::with_backend(
            supported(),
            ArtifactLocator::new(vec![root.path().into()]),
            FlakyLoader::default(),
        );

        assert!(loader.load_library(Some(cache_dir.path()), "solver").is_err());
        assert!(loader.loaded_libraries().is_empty());
        assert!(loader.load_library(Some(cache_dir.path()), "solver").unwrap());
        assert_eq!(loader.loaded_libraries(), vec!["solver".to_string()]);
    }

    #[test]
    fn default_cache_dir_applies_when_request_has_none() {
        let root = bundle_with("solver");
        let cache_dir = TempDir::new().unwrap();
        let loader = Loader::with_backend(
            supported(),
            ArtifactLocator::new(vec![root.path().into()]),
            Arc::new(CountingLoader::default()),
        )
        .with_cache_dir(cache_dir.path());

        assert!(loader.load_library(None, "solver").unwrap());
        assert!(cache_dir
            .path()
            .join(platform::map_library_name("solver"))
            .is_file());
    }

    #[test]
    fn outcome_display_names_the_cause() {
        let outcome = LoadOutcome::ArtifactNotFound {
            relative_path: "x86-linux/libsolver.so".into(),
        };
        assert_eq!(outcome.to_string(), "no packaged artifact x86-linux/libsolver.so");
        assert!(!outcome.is_available());
        assert!(LoadOutcome::AlreadyLoaded { path: "a".into() }.is_available());
    }
}
