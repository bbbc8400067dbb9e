//! Block I/O over regular files stored in a single directory.

use std::fs::{self, File};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use log::{debug, info};
use parking_lot::Mutex;
use thiserror::Error;

use crate::io::BlockIo;
use crate::page::FileId;

/// Responsible for opening files of a single directory and serving the cache's
/// block reads and writes on them.
///
/// Every file is identified by the [`FileId`] handed out by
/// [`FilesManager::open_file`]. Reads and writes of one file are serialized by its
/// mutex since seeking and transferring must happen together.
pub struct FilesManager {
    open_files: DashMap<FileId, Arc<Mutex<File>>>,
    names: DashMap<String, FileId>,
    directory: PathBuf,
    next_id: AtomicU32,
}

/// Error for [`FilesManager`] related operations
#[derive(Error, Debug)]
pub enum FilesManagerError {
    #[error("couldn't find the data directory")]
    DirectoryNotFound,
    #[error("io error occurred: {0}")]
    IoError(#[from] io::Error),
}

impl FilesManager {
    /// Creates a new [`FilesManager`] for files stored in `directory`.
    ///
    /// Can fail if `directory` doesn't exist.
    pub fn new(directory: impl AsRef<Path>) -> Result<Self, FilesManagerError> {
        if let Ok(exists) = directory.as_ref().try_exists()
            && exists
        {
            Ok(FilesManager {
                open_files: DashMap::new(),
                names: DashMap::new(),
                directory: directory.as_ref().into(),
                next_id: AtomicU32::new(1),
            })
        } else {
            Err(FilesManagerError::DirectoryNotFound)
        }
    }

    /// Returns the [`FileId`] of file `name`, opening (and creating) it if it is not
    /// open yet. Opening the same name twice returns the same id.
    pub fn open_file(&self, name: &str) -> Result<FileId, FilesManagerError> {
        if let Some(id) = self.names.get(name) {
            return Ok(*id);
        }
        let path = self.directory.join(name);
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let entry = self.names.entry(name.to_string()).or_insert_with(|| {
            let id = FileId(self.next_id.fetch_add(1, Ordering::Relaxed));
            self.open_files.insert(id, Arc::new(Mutex::new(file)));
            info!("Opened file {} as {id}", path.display());
            id
        });
        Ok(*entry)
    }

    /// Closes file `id`. Later block operations on it fail with
    /// [`ErrorKind::NotFound`]. The cache must not hold pages of the file anymore.
    pub fn close_file(&self, id: FileId) {
        if self.open_files.remove(&id).is_some() {
            self.names.retain(|_, open| *open != id);
            debug!("Closed file {id}");
        }
    }

    fn file(&self, id: FileId) -> io::Result<Arc<Mutex<File>>> {
        self.open_files
            .get(&id)
            .map(|file| file.value().clone())
            .ok_or_else(|| io::Error::new(ErrorKind::NotFound, format!("file {id} is not open")))
    }
}

impl BlockIo for FilesManager {
    /// Reads the block at `offset`. The part of the block lying past the end of the
    /// file reads as zeros.
    fn block_read(&self, file: FileId, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let file = self.file(file)?;
        let mut file = file.lock();
        let len = file.metadata()?.len();
        let available = len.saturating_sub(offset).min(buf.len() as u64) as usize;
        if available > 0 {
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(&mut buf[..available])?;
        }
        buf[available..].fill(0);
        Ok(())
    }

    fn block_write(&self, file: FileId, offset: u64, buf: &[u8]) -> io::Result<()> {
        let file = self.file(file)?;
        let mut file = file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn sync(&self, file: FileId) -> io::Result<()> {
        self.file(file)?.lock().sync_all()
    }
}
