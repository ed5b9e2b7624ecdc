use std::{
    fs::File,
    path::{Path, PathBuf},
};

use fs4::fs_std::FileExt;
use log::debug;
use thiserror::Error;

/// Exclusive advisory lock on a file, released when dropped.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{} is locked by another process", .0.display())]
    Contended(PathBuf),
    #[error(transparent)]
    IO(#[from] std::io::Error),
}

impl FileLock {
    /// Takes the lock without waiting; a held lock is reported as [`Error::Contended`].
    pub fn new(path: &Path) -> Result<Self, Error> {
        let file = File::create(path)?;
        match file.try_lock_exclusive() {
            Ok(_) => {
                debug!("Acquired a lock on {}", path.display());
                Ok(Self { _file: file })
            }
            Err(error) if error.raw_os_error() == fs4::lock_contended_error().raw_os_error() => {
                Err(Error::Contended(path.to_path_buf()))
            }
            Err(error) => Err(error.into()),
        }
    }
}
