//! Per-name memoization of extracted library paths.
//!
//! The first request for a name runs its extraction; every other request,
//! concurrent or later, waits for that extraction and reuses its outcome.
//! Failures are memoized too: a name whose extraction failed keeps returning
//! the same error for the lifetime of the cache instead of retrying.

use crate::{NativeCodeError, Result};
use std::collections::HashMap;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tempfile::{Builder, NamedTempFile, TempPath};
use tracing::{debug, info, warn};

type Slot = std::result::Result<PathBuf, Arc<io::Error>>;

/// Where an extracted artifact should be materialized.
#[derive(Debug, Clone, Copy)]
pub enum CacheTarget<'a> {
    /// `dir/<file name>`; survives the process and may be reused by later runs.
    Directory(&'a Path),
    /// A uniquely named file in the system temp directory, removed on cleanup.
    Temporary,
}

impl<'a> From<Option<&'a Path>> for CacheTarget<'a> {
    fn from(dir: Option<&'a Path>) -> Self {
        dir.map_or(CacheTarget::Temporary, CacheTarget::Directory)
    }
}

#[derive(Debug, Default)]
pub struct LibraryCache {
    entries: Mutex<HashMap<String, Arc<OnceLock<Slot>>>>,
    temporaries: Mutex<Vec<TempPath>>,
}

impl LibraryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Path of the artifact for `name`, extracting it on first request.
    ///
    /// `extract` streams the artifact bytes and runs at most once per name.
    /// The path is handed out only after the file is completely written.
    pub fn resolve_path<F>(
        &self,
        name: &str,
        file_name: &str,
        target: CacheTarget<'_>,
        extract: F,
    ) -> Result<PathBuf>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<u64>,
    {
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(entries.entry(name.to_string()).or_default())
        };

        let slot = entry.get_or_init(|| {
            self.materialize(name, file_name, target, extract)
                .map_err(|e| {
                    warn!("failed to extract native library {}: {}", name, e);
                    Arc::new(e)
                })
        });

        slot.clone().map_err(|source| NativeCodeError::Extraction {
            name: name.to_string(),
            source,
        })
    }

    fn materialize<F>(
        &self,
        name: &str,
        file_name: &str,
        target: CacheTarget<'_>,
        extract: F,
    ) -> io::Result<PathBuf>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<u64>,
    {
        match target {
            CacheTarget::Directory(dir) => {
                fs::create_dir_all(dir)?;
                let destination = dir.join(file_name);

                let staging = NamedTempFile::new_in(dir)?;
                let bytes = write_all(staging.as_file(), extract)?;
                staging.persist(&destination).map_err(|e| e.error)?;

                info!(
                    "extracted native library {} ({} bytes) to {}",
                    name,
                    bytes,
                    destination.display()
                );
                Ok(destination)
            }
            CacheTarget::Temporary => {
                let file = Builder::new()
                    .prefix(&format!("{name}-"))
                    .suffix(&format!("-{file_name}"))
                    .tempfile()?;
                let bytes = write_all(file.as_file(), extract)?;
                let path = file.into_temp_path();
                let location = path.to_path_buf();

                debug!(
                    "extracted native library {} ({} bytes) to temporary file {}",
                    name,
                    bytes,
                    location.display()
                );
                self.temporaries
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(path);
                Ok(location)
            }
        }
    }

    pub fn cached_path(&self, name: &str) -> Option<PathBuf> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(name)
            .and_then(|entry| entry.get())
            .and_then(|slot| slot.as_ref().ok())
            .cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete temporary extractions. Memoized paths are kept, so a purged name is not re-extracted.
    pub fn purge_temporaries(&self) {
        let paths: Vec<TempPath> = self
            .temporaries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for path in paths {
            let shown = path.display().to_string();
            if let Err(e) = path.close() {
                warn!("failed to remove temporary native library {}: {}", shown, e);
            }
        }
    }
}

fn write_all<F>(file: &fs::File, extract: F) -> io::Result<u64>
where
    F: FnOnce(&mut dyn Write) -> io::Result<u64>,
{
    let mut writer = BufWriter::new(file);
    let bytes = extract(&mut writer)?;
    writer.flush()?;
    file.sync_all()?;
    Ok(bytes)
}
