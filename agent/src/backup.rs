use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use protocol::PatchError;
use tracing::{debug, info};

/// Manages `<path><tag>` copies taken before a file is mutated.
#[derive(Debug, Clone)]
pub struct BackupStore {
    tag: String,
}

impl BackupStore {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into() }
    }

    pub fn backup_path(&self, path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_os_string();
        name.push(&self.tag);
        PathBuf::from(name)
    }

    pub fn has_backup(&self, path: &Path) -> bool {
        self.backup_path(path).exists()
    }

    /// Copies `path` to its backup location. An existing backup that differs
    /// from the current file aborts unless `force` is set.
    pub fn backup(&self, path: &Path, force: bool) -> Result<PathBuf, PatchError> {
        if !path.exists() {
            return Err(PatchError::missing_file(path));
        }

        let backup = self.backup_path(path);
        if backup.exists() && !force {
            if are_identical(path, &backup)? {
                debug!(path = %path.display(), "identical backup already present");
                return Ok(backup);
            }
            return Err(PatchError::FileOperation(format!(
                "Backup failed - {} exists and differs from {}",
                backup.display(),
                path.display()
            )));
        }

        fs::copy(path, &backup).map_err(|err| PatchError::io_at(&backup, err))?;
        debug!(path = %path.display(), backup = %backup.display(), "created backup");
        Ok(backup)
    }

    /// Copies the backup back over `path` and deletes it.
    pub fn restore(&self, path: &Path) -> Result<(), PatchError> {
        let backup = self.backup_path(path);
        if !backup.exists() {
            return Err(PatchError::missing_file(&backup));
        }

        fs::copy(&backup, path).map_err(|err| PatchError::io_at(path, err))?;
        fs::remove_file(&backup).map_err(|err| PatchError::io_at(&backup, err))?;
        info!(path = %path.display(), "restored backup");
        Ok(())
    }

    /// Restores the backup when there is one. Returns whether it did.
    pub fn restore_if_present(&self, path: &Path) -> Result<bool, PatchError> {
        if !self.has_backup(path) {
            return Ok(false);
        }
        self.restore(path)?;
        Ok(true)
    }

    /// Deletes the backup when it matches the current file byte for byte.
    pub fn discard_if_identical(&self, path: &Path) -> Result<bool, PatchError> {
        let backup = self.backup_path(path);
        if !backup.exists() || !are_identical(path, &backup)? {
            return Ok(false);
        }
        fs::remove_file(&backup).map_err(|err| PatchError::io_at(&backup, err))?;
        Ok(true)
    }

    /// Overwrites `path` with `replacement` after taking a backup. The backup
    /// is put back if the copy fails.
    pub fn replace_file(&self, path: &Path, replacement: &Path) -> Result<(), PatchError> {
        self.backup(path, false)?;
        if let Err(err) = fs::copy(replacement, path) {
            self.restore(path)?;
            return Err(PatchError::io_at(path, err));
        }
        Ok(())
    }
}

pub fn are_identical(left: &Path, right: &Path) -> Result<bool, PatchError> {
    let left_meta = fs::metadata(left).map_err(|err| PatchError::io_at(left, err))?;
    let right_meta = fs::metadata(right).map_err(|err| PatchError::io_at(right, err))?;
    if left_meta.len() != right_meta.len() {
        return Ok(false);
    }

    let mut left_file = fs::File::open(left).map_err(|err| PatchError::io_at(left, err))?;
    let mut right_file = fs::File::open(right).map_err(|err| PatchError::io_at(right, err))?;
    let mut left_buf = [0u8; 8192];
    let mut right_buf = [0u8; 8192];
    loop {
        let read = read_chunk(&mut left_file, &mut left_buf).map_err(|err| PatchError::io_at(left, err))?;
        let other = read_chunk(&mut right_file, &mut right_buf).map_err(|err| PatchError::io_at(right, err))?;
        if read != other || left_buf[..read] != right_buf[..other] {
            return Ok(false);
        }
        if read == 0 {
            return Ok(true);
        }
    }
}

fn read_chunk(file: &mut fs::File, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match file.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}
