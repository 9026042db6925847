//! Native library resolution and loading
//! Finds the pre-built artifact for the host platform, extracts it once and loads it once per name.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::warn;

pub mod cache;
pub mod config;
pub mod loader;
pub mod locator;

pub use cache::{CacheTarget, LibraryCache};
pub use config::NativeCodeConfig;
pub use loader::{BoxError, DynamicLoader, LoadOutcome, Loader, NativeLoad};
pub use locator::{Artifact, ArtifactLocator, EmbeddedBundle, ResourceRoot};
pub use platform::{HostInfo, PlatformError, PlatformRule, PlatformTable, ResolvedPlatform};

/// Native-code errors. An unsupported platform or a missing artifact is not
/// an error; see [`LoadOutcome`].
#[derive(Debug, Error)]
pub enum NativeCodeError {
    #[error("Failed to extract native library {name}: {source}")]
    Extraction {
        name: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("Failed to load native library {name} from {}: {source}", path.display())]
    LoadFailed {
        name: String,
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),
}

pub type Result<T> = std::result::Result<T, NativeCodeError>;

static GLOBAL: OnceLock<Arc<Loader>> = OnceLock::new();

/// Process-wide loader, configured from the environment on first use.
///
/// Building it also registers an exit hook that removes its temporary
/// extractions when the process exits normally.
pub fn global() -> &'static Arc<Loader> {
    GLOBAL.get_or_init(|| {
        let loader = global_loader(NativeCodeConfig::from_env());
        register_exit_cleanup();
        Arc::new(loader)
    })
}

/// A configuration that cannot be read or applied falls back to the built-in
/// platform table and the default resource root.
fn global_loader(config: Result<NativeCodeConfig>) -> Loader {
    config
        .and_then(|config| Loader::from_config(&config))
        .unwrap_or_else(|e| {
            warn!("ignoring native code configuration: {}", e);
            let roots = NativeCodeConfig::default()
                .resource_roots_or_default()
                .into_iter()
                .map(ResourceRoot::Directory)
                .collect();
            Loader::new(platform::current().clone(), ArtifactLocator::new(roots))
        })
}

extern "C" fn purge_on_exit() {
    cleanup();
}

fn register_exit_cleanup() {
    // SAFETY: the hook only reads `GLOBAL`, which outlives every exit handler.
    if unsafe { libc::atexit(purge_on_exit) } != 0 {
        warn!("could not register exit cleanup for temporary native libraries");
    }
}

/// Load `name` through the process-wide loader.
///
/// Returns `Ok(false)` when the platform is unsupported or no artifact is
/// packaged for it; extraction and load failures are errors.
pub fn load_library(cache_dir: Option<&Path>, name: &str) -> Result<bool> {
    global().load_library(cache_dir, name)
}

pub async fn load_library_async(cache_dir: Option<PathBuf>, name: impl Into<String>) -> Result<bool> {
    Arc::clone(global())
        .load_library_async(cache_dir, name.into())
        .await
}

/// Remove temporary extractions made by the process-wide loader. Runs automatically at normal exit.
pub fn cleanup() {
    if let Some(loader) = GLOBAL.get() {
        loader.purge_temporaries();
    }
}
