//! Single-instance lock over the client's working directory.
//!
//! Only one client may use a home directory at a time, since they would
//! otherwise corrupt each other's identity store. The guard holds an
//! exclusive advisory lock on a file in the directory. The operating
//! system drops the lock when the file is closed, including when the
//! process dies, so a crash never leaves the directory locked.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, Write};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;

use crate::ClientError;

/// Held while a client is connecting or connected.
#[derive(Debug)]
pub struct DirectoryLock {
    path: PathBuf,
    file: File,
}

impl DirectoryLock {
    pub const FILE_NAME: &'static str = "tether.lock";

    /// Takes the lock on `home`, creating the directory if needed.
    ///
    /// A lock file left behind by a process that exited without
    /// releasing it is reused.
    ///
    /// # Errors
    /// [`ClientError::DirectoryLocked`] if another client holds it.
    pub fn acquire(home: &Path) -> Result<Self, ClientError> {
        fs::create_dir_all(home)?;
        let path = home.join(Self::FILE_NAME);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if let Err(e) = FileExt::try_lock_exclusive(&file) {
            if is_contended(&e) {
                return Err(ClientError::DirectoryLocked(home.to_path_buf()));
            }
            return Err(e.into());
        }

        // Informational only; ownership is the lock, not the contents.
        if let Err(e) = write_pid(&mut file) {
            tracing::debug!(error = %e, "could not write pid to lock file");
        }
        tracing::debug!(path = %path.display(), "directory lock acquired");
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// `EWOULDBLOCK` on Unix, `ERROR_LOCK_VIOLATION` on Windows.
fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock || (cfg!(windows) && e.raw_os_error() == Some(33))
}

fn write_pid(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.rewind()?;
    writeln!(file, "{}", std::process::id())
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        // Closing the file releases the lock as well.
        match FileExt::unlock(&self.file) {
            Ok(()) => tracing::debug!(path = %self.path.display(), "directory lock released"),
            Err(e) => tracing::warn!(
                path = %self.path.display(),
                error = %e,
                "could not release directory lock"
            ),
        }
    }
}
