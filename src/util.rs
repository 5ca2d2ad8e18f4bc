//! Filesystem helpers: directory size, free disk space, directory copy.

use std::ffi::OsStr;
use std::fs;
use std::path::Path;

use crate::error::Result;

/// Total size in bytes of every file under `dir_path`, recursively.
pub fn dir_size(dir_path: &Path) -> Result<u64> {
    let mut size = 0;
    for entry in fs::read_dir(dir_path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_dir() {
            size += dir_size(&entry.path())?;
        } else {
            size += metadata.len();
        }
    }
    Ok(size)
}

/// Free bytes available on the volume holding `dir_path`.
pub fn available_disk_size(dir_path: &Path) -> Result<u64> {
    Ok(fs2::available_space(dir_path)?)
}

/// Recursively copies `src` into `dest`, skipping entries whose file
/// name matches one of `exclude`. Used for backups, which must not carry
/// the directory lock file along.
pub fn copy_dir(src: &Path, dest: &Path, exclude: &[&str]) -> Result<()> {
    if !dest.is_dir() {
        fs::create_dir_all(dest)?;
    }

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if exclude.iter().any(|excluded| name == OsStr::new(excluded)) {
            continue;
        }

        let dest_path = dest.join(&name);
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &dest_path, exclude)?;
        } else {
            fs::copy(entry.path(), &dest_path)?;
        }
    }

    Ok(())
}
