//! File-based storage backend for persistent segments.

use crate::backend::{append_streamed, StorageBackend};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// A file-based storage backend.
///
/// # Durability
///
/// - `flush()` calls `File::flush()` to push data to the OS
/// - `sync()` calls `File::sync_all()` to ensure data is on disk
///
/// # Thread Safety
///
/// On unix, reads are positional (`pread`) and only take the file lock in
/// shared mode, so many readers of a sealed segment never serialize on each
/// other. Elsewhere reads fall back to seek-and-read under the exclusive lock.
///
/// # Example
///
/// ```no_run
/// use segdb_storage::{StorageBackend, FileBackend};
/// use std::path::Path;
///
/// let mut backend = FileBackend::open(Path::new("0.seg")).unwrap();
/// let offset = backend.append(b"persistent data").unwrap();
/// backend.sync().unwrap();
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    file: RwLock<File>,
    size: RwLock<u64>,
}

impl FileBackend {
    /// Opens or creates a file backend at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or created.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let size = file.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            size: RwLock::new(size),
        })
    }

    /// Creates a fresh, empty file backend, discarding any previous contents.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            file: RwLock::new(file),
            size: RwLock::new(0),
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_range(&self, offset: u64, len: usize) -> StorageResult<()> {
        let size = *self.size.read();
        let end = offset.saturating_add(len as u64);

        if offset > size || end > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }
        Ok(())
    }

    #[cfg(unix)]
    fn read_exact_at(&self, offset: u64, buffer: &mut [u8]) -> io::Result<()> {
        use std::os::unix::fs::FileExt;

        self.file.read().read_exact_at(buffer, offset)
    }

    #[cfg(not(unix))]
    fn read_exact_at(&self, offset: u64, buffer: &mut [u8]) -> io::Result<()> {
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buffer)
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.check_range(offset, len)?;

        if len == 0 {
            return Ok(Vec::new());
        }

        let mut buffer = vec![0u8; len];
        self.read_exact_at(offset, &mut buffer)?;
        Ok(buffer)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let size = *self.size.read();
        let end = offset.saturating_add(data.len() as u64);
        if end > size {
            return Err(StorageError::WritePastEnd {
                offset,
                len: data.len(),
                size,
            });
        }

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        if data.is_empty() {
            return Ok(*self.size.read());
        }

        let mut file = self.file.write();
        let mut size = self.size.write();

        let offset = *size;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        *size += data.len() as u64;

        Ok(offset)
    }

    fn transfer_to(&self, offset: u64, len: usize, sink: &mut dyn Write) -> StorageResult<u64> {
        self.check_range(offset, len)?;

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        let copied = io::copy(&mut (&*file).take(len as u64), sink)?;

        if copied != len as u64 {
            return Err(StorageError::Corrupted(format!(
                "short transfer from {}: wanted {len} bytes, got {copied}",
                self.path.display()
            )));
        }
        Ok(copied)
    }

    fn append_from(
        &mut self,
        source: &dyn StorageBackend,
        offset: u64,
        len: usize,
    ) -> StorageResult<u64> {
        let Some(source) = source.as_file_backend() else {
            return append_streamed(self, source, offset, len);
        };
        source.check_range(offset, len)?;

        let mut target = self.file.write();
        let mut size = self.size.write();
        let position = *size;
        target.seek(SeekFrom::Start(position))?;

        // `&File` readers into a `File` writer let `io::copy` use the
        // kernel's file-to-file path.
        let reader = source.file.write();
        let mut handle = &*reader;
        handle.seek(SeekFrom::Start(offset))?;
        let copied = io::copy(&mut handle.take(len as u64), &mut *target)?;
        *size += copied;

        if copied != len as u64 {
            return Err(StorageError::Corrupted(format!(
                "short transfer from {}: wanted {len} bytes, got {copied}",
                source.path.display()
            )));
        }
        Ok(position)
    }

    fn as_file_backend(&self) -> Option<&FileBackend> {
        Some(self)
    }

    fn flush(&mut self) -> StorageResult<()> {
        self.file.write().flush()?;
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(*self.size.read())
    }

    fn sync(&mut self) -> StorageResult<()> {
        let file = self.file.write();
        file.sync_all()?;
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let file = self.file.write();
        let mut size = self.size.write();

        if new_size > *size {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "cannot truncate to size {} which is greater than current size {}",
                    new_size, *size
                ),
            )));
        }

        file.set_len(new_size)?;
        *size = new_size;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BackendAppender;
    use tempfile::tempdir;

    #[test]
    fn file_create_new() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.seg");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
        assert!(path.exists());
    }

    #[test]
    fn file_append_and_read() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("0.seg")).unwrap();

        assert_eq!(backend.append(b"hello").unwrap(), 0);
        assert_eq!(backend.append(b" world").unwrap(), 5);
        assert_eq!(backend.size().unwrap(), 11);
        assert_eq!(backend.read_at(6, 5).unwrap(), b"world");
    }

    #[test]
    fn file_read_past_end_fails() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("0.seg")).unwrap();
        backend.append(b"hello").unwrap();

        let result = backend.read_at(10, 5);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
    }

    #[test]
    fn file_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.seg");

        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.append(b"persistent data").unwrap();
            backend.sync().unwrap();
        }

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 15);
        assert_eq!(backend.read_at(0, 15).unwrap(), b"persistent data");
    }

    #[test]
    fn file_create_discards_previous_contents() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.seg");

        {
            let mut backend = FileBackend::open(&path).unwrap();
            backend.append(b"stale").unwrap();
        }

        let backend = FileBackend::create(&path).unwrap();
        assert_eq!(backend.size().unwrap(), 0);
    }

    #[test]
    fn file_write_at_header() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("0.seg")).unwrap();
        backend.append(b"HDR0payload").unwrap();

        backend.write_at(3, b"1").unwrap();
        assert_eq!(backend.read_at(0, 11).unwrap(), b"HDR1payload");

        // Appends still land at the end
        assert_eq!(backend.append(b"!").unwrap(), 11);
    }

    #[test]
    fn file_write_at_past_end_fails() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("0.seg")).unwrap();
        backend.append(b"abc").unwrap();

        let result = backend.write_at(1, b"xyz");
        assert!(matches!(result, Err(StorageError::WritePastEnd { .. })));
    }

    #[test]
    fn file_transfer_between_files() {
        let dir = tempdir().unwrap();
        let mut source = FileBackend::open(&dir.path().join("0.seg")).unwrap();
        let mut target = FileBackend::open(&dir.path().join("1.seg")).unwrap();

        source.append(b"....record....").unwrap();
        target.append(b"T").unwrap();

        {
            let mut sink = BackendAppender::new(&mut target);
            source.transfer_to(4, 6, &mut sink).unwrap();
        }

        assert_eq!(target.size().unwrap(), 7);
        assert_eq!(target.read_at(1, 6).unwrap(), b"record");
    }

    #[test]
    fn file_append_from_file() {
        let dir = tempdir().unwrap();
        let mut source = FileBackend::open(&dir.path().join("0.seg")).unwrap();
        let mut target = FileBackend::open(&dir.path().join("1.seg")).unwrap();

        source.append(b"....record....").unwrap();
        target.append(b"T").unwrap();

        assert_eq!(target.append_from(&source, 4, 6).unwrap(), 1);
        assert_eq!(target.append(b"!").unwrap(), 7);
        assert_eq!(target.read_at(0, 8).unwrap(), b"Trecord!");

        let result = target.append_from(&source, 10, 8);
        assert!(matches!(result, Err(StorageError::ReadPastEnd { .. })));
        assert_eq!(target.size().unwrap(), 8);
    }

    #[test]
    fn file_append_from_memory_streams() {
        let dir = tempdir().unwrap();
        let mut target = FileBackend::open(&dir.path().join("0.seg")).unwrap();
        let source = crate::InMemoryBackend::with_data(b"0123456789".to_vec());

        assert_eq!(target.append_from(&source, 7, 3).unwrap(), 0);
        assert_eq!(target.read_at(0, 3).unwrap(), b"789");
    }

    #[test]
    fn file_truncate_rolls_back_append() {
        let dir = tempdir().unwrap();
        let mut backend = FileBackend::open(&dir.path().join("0.seg")).unwrap();
        backend.append(b"keep").unwrap();
        backend.append(b"drop").unwrap();

        backend.truncate(4).unwrap();
        assert_eq!(backend.size().unwrap(), 4);
        assert_eq!(backend.append(b"next").unwrap(), 4);
        assert_eq!(backend.read_at(0, 8).unwrap(), b"keepnext");
    }

    #[test]
    fn file_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("0.seg");

        let backend = FileBackend::open(&path).unwrap();
        assert_eq!(backend.path(), path);
    }
}
