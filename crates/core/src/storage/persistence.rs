//! Disk persistence for per-owner partitions using bincode serialization.
//!
//! Partitions are serialized to `.store` files. Writes use atomic temp-file +
//! rename to prevent corruption on crash. A CRC32 checksum is appended as a
//! footer for integrity verification: `[bincode payload][magic "TMK1"][u32 CRC32 BE]`.

use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Magic bytes written before the CRC32 footer of every partition file.
const PARTITION_CRC_MAGIC: &[u8; 4] = b"TMK1";

/// Appends `[magic][CRC32 BE]` to a serialized payload.
pub(crate) fn seal(payload: Vec<u8>, magic: &[u8; 4]) -> Vec<u8> {
    let crc = crc32fast::hash(&payload);
    let mut output = payload;
    output.reserve(8);
    output.extend_from_slice(magic);
    output.extend_from_slice(&crc.to_be_bytes());
    output
}

/// Verifies and strips the `[magic][CRC32 BE]` footer.
pub(crate) fn unseal<'a>(raw: &'a [u8], magic: &[u8; 4], what: &str) -> Result<&'a [u8]> {
    if raw.len() < 8 || &raw[raw.len() - 8..raw.len() - 4] != magic {
        return Err(Error::Corrupt(format!("{what}: missing checksum footer")));
    }
    let payload = &raw[..raw.len() - 8];
    let stored_crc = u32::from_be_bytes([
        raw[raw.len() - 4],
        raw[raw.len() - 3],
        raw[raw.len() - 2],
        raw[raw.len() - 1],
    ]);
    let computed_crc = crc32fast::hash(payload);
    if computed_crc != stored_crc {
        return Err(Error::Corrupt(format!(
            "{what}: CRC32 mismatch, expected {:#010x}, got {:#010x}",
            stored_crc, computed_crc
        )));
    }
    Ok(payload)
}

/// Creates `dir` (and parents) restricted to the owner on unix.
pub(crate) fn create_private_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(dir, fs::Permissions::from_mode(0o700));
    }
    Ok(())
}

/// Save a partition to `path` with an atomic write.
pub fn save_partition<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    let bytes = bincode::serialize(value)?;
    let output = seal(bytes, PARTITION_CRC_MAGIC);

    if let Some(parent) = path.parent() {
        create_private_dir(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = Path::new(&tmp_name);

    {
        let mut opts = OpenOptions::new();
        opts.create(true).write(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.mode(0o600);
        }
        let mut file = opts.open(tmp_path)?;
        file.write_all(&output)?;
        file.sync_all()?;
    }
    fs::rename(tmp_path, path)?;

    tracing::debug!(path = %path.display(), bytes = output.len(), "saved partition");
    Ok(())
}

/// Load a partition from disk, verifying its CRC32 footer.
pub fn load_partition<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read(path)?;
    let payload = unseal(&raw, PARTITION_CRC_MAGIC, &path.display().to_string())?;
    let value = bincode::deserialize(payload)
        .map_err(|e| Error::Corrupt(format!("{}: {}", path.display(), e)))?;
    Ok(value)
}

/// Remove a partition file. Missing files are not an error.
pub fn remove_partition(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
