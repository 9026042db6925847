//! Artifact discovery across an explicit, ordered list of resource roots.
//!
//! Artifacts live at `<platform tag>/<native file name>` inside every root,
//! matching the layout of existing per-platform bundles.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

/// A static table of `relative path -> bytes`, typically filled with `include_bytes!`.
#[derive(Debug, Clone, Copy)]
pub struct EmbeddedBundle {
    entries: &'static [(&'static str, &'static [u8])],
}

impl EmbeddedBundle {
    pub const fn new(entries: &'static [(&'static str, &'static [u8])]) -> Self {
        Self { entries }
    }

    fn get(&self, relative_path: &str) -> Option<&'static [u8]> {
        self.entries
            .iter()
            .find(|(path, _)| *path == relative_path)
            .map(|(_, bytes)| *bytes)
    }
}

/// One place to search for packaged artifacts.
#[derive(Debug, Clone)]
pub enum ResourceRoot {
    Directory(PathBuf),
    Embedded(EmbeddedBundle),
}

impl ResourceRoot {
    fn find(&self, relative_path: &str) -> Option<ArtifactSource> {
        match self {
            ResourceRoot::Directory(dir) => {
                let candidate = relative_path
                    .split('/')
                    .fold(dir.clone(), |path, part| path.join(part));
                candidate.is_file().then_some(ArtifactSource::File(candidate))
            }
            ResourceRoot::Embedded(bundle) => bundle.get(relative_path).map(ArtifactSource::Embedded),
        }
    }
}

impl From<PathBuf> for ResourceRoot {
    fn from(dir: PathBuf) -> Self {
        ResourceRoot::Directory(dir)
    }
}

impl From<&Path> for ResourceRoot {
    fn from(dir: &Path) -> Self {
        ResourceRoot::Directory(dir.to_path_buf())
    }
}

impl From<EmbeddedBundle> for ResourceRoot {
    fn from(bundle: EmbeddedBundle) -> Self {
        ResourceRoot::Embedded(bundle)
    }
}

#[derive(Debug, Clone)]
enum ArtifactSource {
    File(PathBuf),
    Embedded(&'static [u8]),
}

/// A located artifact whose bytes can be streamed out.
#[derive(Debug, Clone)]
pub struct Artifact {
    relative_path: String,
    source: ArtifactSource,
}

impl Artifact {
    pub fn relative_path(&self) -> &str {
        &self.relative_path
    }

    /// On-disk location, if the artifact comes from a directory root.
    pub fn file_path(&self) -> Option<&Path> {
        match &self.source {
            ArtifactSource::File(path) => Some(path),
            ArtifactSource::Embedded(_) => None,
        }
    }

    pub fn open(&self) -> io::Result<Box<dyn Read + Send>> {
        match &self.source {
            ArtifactSource::File(path) => Ok(Box::new(BufReader::new(File::open(path)?))),
            ArtifactSource::Embedded(bytes) => Ok(Box::new(*bytes)),
        }
    }

    pub fn copy_to(&self, writer: &mut dyn Write) -> io::Result<u64> {
        let mut reader = self.open()?;
        io::copy(&mut reader, writer)
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            ArtifactSource::File(path) => write!(f, "{}", path.display()),
            ArtifactSource::Embedded(_) => write!(f, "embedded:{}", self.relative_path),
        }
    }
}

/// Maps (platform tag, logical name) onto the first matching artifact.
#[derive(Debug, Clone, Default)]
pub struct ArtifactLocator {
    roots: Vec<ResourceRoot>,
}

impl ArtifactLocator {
    pub fn new(roots: Vec<ResourceRoot>) -> Self {
        Self { roots }
    }

    pub fn roots(&self) -> &[ResourceRoot] {
        &self.roots
    }

    pub fn relative_path(platform_tag: &str, library_name: &str) -> String {
        format!(
            "{platform_tag}/{}",
            platform::map_library_name(library_name)
        )
    }

    /// Search roots in order; the first hit wins and later duplicates are ignored.
    pub fn locate(&self, platform_tag: &str, library_name: &str) -> Option<Artifact> {
        let relative_path = Self::relative_path(platform_tag, library_name);
        let source = self.roots.iter().find_map(|root| root.find(&relative_path))?;
        let artifact = Artifact {
            relative_path,
            source,
        };
        debug!("located native library {} at {}", library_name, artifact);
        Some(artifact)
    }
}
