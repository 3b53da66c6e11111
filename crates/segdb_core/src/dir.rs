//! Store directory management.
//!
//! This module handles the file system layout for a segdb store:
//!
//! ```text
//! <store_path>/
//! ├─ MANIFEST          # Geometry (segment capacity, address layout)
//! ├─ LOCK              # Advisory lock for single-writer
//! ├─ addr.dat          # Index -> address table
//! └─ segs/             # Segment files and pool meta
//! ```
//!
//! The LOCK file ensures only one process can write to the store at a time.

use crate::error::{CoreError, CoreResult};
use crate::manifest::StoreManifest;
use fs2::FileExt;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

const MANIFEST_FILE: &str = "MANIFEST";
const LOCK_FILE: &str = "LOCK";
const ADDRESS_FILE: &str = "addr.dat";
const SEGMENTS_DIR: &str = "segs";

/// Holds the exclusive lock on a store directory.
///
/// Only one `StoreDir` can exist per directory at a time; the lock is
/// released when it is dropped.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    /// Opens or creates a store directory.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock (returns `StoreLocked`)
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "store directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::StoreLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path to the MANIFEST file.
    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.path.join(MANIFEST_FILE)
    }

    /// Returns the path to the address table.
    #[must_use]
    pub fn address_path(&self) -> PathBuf {
        self.path.join(ADDRESS_FILE)
    }

    /// Returns the directory holding segment files.
    #[must_use]
    pub fn segments_dir(&self) -> PathBuf {
        self.path.join(SEGMENTS_DIR)
    }

    /// Whether no manifest has been written yet.
    #[must_use]
    pub fn is_new_store(&self) -> bool {
        !self.manifest_path().exists()
    }

    /// Loads the manifest; `None` for a new store.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest exists but cannot be decoded.
    pub fn load_manifest(&self) -> CoreResult<Option<StoreManifest>> {
        match read_file_if_exists(&self.manifest_path())? {
            Some(data) if !data.is_empty() => Ok(Some(StoreManifest::decode(&data)?)),
            _ => Ok(None),
        }
    }

    /// Saves the manifest atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or rename fails.
    pub fn save_manifest(&self, manifest: &StoreManifest) -> CoreResult<()> {
        write_file_atomic(&self.manifest_path(), &manifest.encode())
    }
}

/// Reads a whole file, or `None` if it does not exist.
pub(crate) fn read_file_if_exists(path: &Path) -> CoreResult<Option<Vec<u8>>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    Ok(Some(data))
}

/// Replaces `path` with `data` crash-safely.
///
/// 1. Write to a sibling temporary file
/// 2. Sync it to disk
/// 3. Rename it over `path`
/// 4. Fsync the parent directory so the rename is durable
pub(crate) fn write_file_atomic(path: &Path, data: &[u8]) -> CoreResult<()> {
    replace_file(path, data, true)
}

/// Replaces `path` with `data` via a temporary file and rename.
///
/// Readers never observe a half-written file. Only with `sync` does the new
/// content survive a power loss.
pub(crate) fn replace_file(path: &Path, data: &[u8], sync: bool) -> CoreResult<()> {
    let mut temp_name = path.file_name().map(OsString::from).unwrap_or_default();
    temp_name.push(".tmp");
    let temp_path = path.with_file_name(temp_name);

    let mut file = File::create(&temp_path)?;
    file.write_all(data)?;
    if sync {
        file.sync_all()?;
    }
    drop(file);

    fs::rename(&temp_path, path)?;

    if sync {
        if let Some(parent) = path.parent() {
            sync_directory(parent)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn sync_directory(dir: &Path) -> CoreResult<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_directory(_dir: &Path) -> CoreResult<()> {
    // NTFS journals metadata; directory handles cannot be fsynced.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use tempfile::tempdir;

    #[test]
    fn open_creates_directory() {
        let temp = tempdir().unwrap();
        let store_path = temp.path().join("new_store");

        let dir = StoreDir::open(&store_path, true).unwrap();
        assert!(store_path.is_dir());
        assert!(dir.is_new_store());
    }

    #[test]
    fn open_fails_if_not_exists_and_no_create() {
        let temp = tempdir().unwrap();
        assert!(StoreDir::open(&temp.path().join("missing"), false).is_err());
    }

    #[test]
    fn lock_prevents_second_open() {
        let temp = tempdir().unwrap();
        let store_path = temp.path().join("locked");

        let _first = StoreDir::open(&store_path, true).unwrap();
        assert!(matches!(
            StoreDir::open(&store_path, true),
            Err(CoreError::StoreLocked)
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        let store_path = temp.path().join("reopen");

        drop(StoreDir::open(&store_path, true).unwrap());
        let _again = StoreDir::open(&store_path, true).unwrap();
    }

    #[test]
    fn manifest_round_trip() {
        let temp = tempdir().unwrap();
        let dir = StoreDir::open(temp.path(), true).unwrap();
        assert!(dir.load_manifest().unwrap().is_none());

        let manifest = StoreManifest::from_config(&StoreConfig::new().segment_capacity(4096));
        dir.save_manifest(&manifest).unwrap();

        assert_eq!(dir.load_manifest().unwrap(), Some(manifest));
        assert!(!dir.is_new_store());
        assert!(!temp.path().join("MANIFEST.tmp").exists());
    }

    #[test]
    fn paths_are_correct() {
        let temp = tempdir().unwrap();
        let dir = StoreDir::open(temp.path(), true).unwrap();

        assert_eq!(dir.address_path(), temp.path().join("addr.dat"));
        assert_eq!(dir.segments_dir(), temp.path().join("segs"));
        assert_eq!(dir.manifest_path(), temp.path().join("MANIFEST"));
    }

    #[test]
    fn atomic_write_replaces_contents() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("data.bin");

        write_file_atomic(&path, b"first").unwrap();
        write_file_atomic(&path, b"second").unwrap();
        assert_eq!(read_file_if_exists(&path).unwrap().unwrap(), b"second");
        assert!(read_file_if_exists(&temp.path().join("none")).unwrap().is_none());
    }
}
