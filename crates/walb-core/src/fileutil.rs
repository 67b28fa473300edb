//! Atomic file persistence.
//!
//! Every piece of per-volume state is written by tmp + rename so that a
//! crash never leaves a half-written file, and the parent directory is
//! synced so the rename itself is durable.

use std::fs;
use std::io::Write;
use std::path::Path;

/// Write `data` to `path` atomically.
///
/// The data lands in `<path>.tmp`, is fsynced, renamed over `path`, and
/// the parent directory entry is synced.
///
/// # Errors
///
/// Returns any underlying I/O error.
pub fn write_file_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_data()?;
    }
    fs::rename(&tmp_path, path)?;
    if let Some(parent) = path.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

/// Sync a directory to ensure its entries (file names) are persisted.
pub fn sync_dir(dir: &Path) -> std::io::Result<()> {
    let f = fs::File::open(dir)?;
    f.sync_all()
}

/// Read a whole file as a trimmed UTF-8 string.
///
/// # Errors
///
/// Returns any underlying I/O error; non-UTF-8 content maps to
/// `InvalidData`.
pub fn read_string(path: &Path) -> std::io::Result<String> {
    let s = fs::read_to_string(path)?;
    Ok(s.trim_end().to_string())
}

/// Write a string plus trailing newline atomically.
///
/// # Errors
///
/// Returns any underlying I/O error.
pub fn write_string_atomic(path: &Path, s: &str) -> std::io::Result<()> {
    let mut data = s.as_bytes().to_vec();
    data.push(b'\n');
    write_file_atomic(path, &data)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_atomic_write_and_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state");

        write_string_atomic(&path, "Target").unwrap();
        assert_eq!(read_string(&path).unwrap(), "Target");

        // Overwrite replaces the content, no .tmp left behind.
        write_string_atomic(&path, "Stopped").unwrap();
        assert_eq!(read_string(&path).unwrap(), "Stopped");
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_binary_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blob");
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        write_file_atomic(&path, &data).unwrap();
        assert_eq!(fs::read(&path).unwrap(), data);
    }
}
