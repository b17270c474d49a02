//! Deterministic shard placement.
//!
//! An owner id is hashed with SHA-256; the first four digest bytes, read as a
//! big-endian `u32`, are reduced modulo the shard count. The mapping holds no
//! state beyond `shard_count`, so it is identical across processes and
//! restarts.
//!
//! On disk every owner has one partition file per tier:
//!
//! ```text
//! <base_dir>/
//! +-- shard_000/
//! |   +-- owner-a.store
//! |   +-- owner-b.store
//! +-- shard_001/
//! +-- ...
//! ```

use crate::config;
use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::path::{Component, Path, PathBuf};

/// Maps owner ids to shards and to safe on-disk store paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    shard_count: u32,
}

impl ShardRouter {
    /// Creates a router over `shard_count` shards. Zero shards is rejected.
    pub fn new(shard_count: u32) -> Result<Self> {
        if shard_count == 0 {
            return Err(Error::InvalidConfig("shard_count must be > 0".into()));
        }
        Ok(Self { shard_count })
    }

    pub fn shard_count(&self) -> u32 {
        self.shard_count
    }

    /// Returns the shard in `[0, shard_count)` that owns `owner_id`.
    ///
    /// Total: any string maps to a shard. Use [`validate_owner_id`] first when
    /// the id comes from outside.
    pub fn shard_for(&self, owner_id: &str) -> u32 {
        let digest = Sha256::digest(owner_id.as_bytes());
        let prefix = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
        prefix % self.shard_count
    }

    /// Directory holding every partition of `shard_id` under `base_dir`.
    pub fn shard_dir(base_dir: &Path, shard_id: u32) -> PathBuf {
        base_dir.join(format!("shard_{:03}", shard_id))
    }

    /// Returns `base_dir/shard_{id:03}/{owner_id}.store`.
    ///
    /// Rejects invalid owner ids and any path that would not stay beneath
    /// `base_dir`. Performs no I/O.
    pub fn path_for(&self, owner_id: &str, base_dir: &Path) -> Result<PathBuf> {
        validate_owner_id(owner_id)?;
        let shard_id = self.shard_for(owner_id);
        let path = Self::shard_dir(base_dir, shard_id)
            .join(format!("{}.{}", owner_id, config::STORE_EXTENSION));

        let relative = path
            .strip_prefix(base_dir)
            .map_err(|_| Error::PathEscape(path.display().to_string()))?;
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
            || relative.components().count() != 2
        {
            return Err(Error::PathEscape(path.display().to_string()));
        }
        Ok(path)
    }

    /// Shards a query must visit: the owner's shard, or every shard when unfiltered.
    pub fn target_shards(&self, owner_id: Option<&str>) -> Result<Vec<u32>> {
        match owner_id {
            Some(owner) => {
                validate_owner_id(owner)?;
                Ok(vec![self.shard_for(owner)])
            }
            None => Ok((0..self.shard_count).collect()),
        }
    }
}

impl Default for ShardRouter {
    fn default() -> Self {
        Self {
            shard_count: config::DEFAULT_SHARD_COUNT,
        }
    }
}

/// Checks that an owner id is non-empty, bounded, and made of `[A-Za-z0-9_-]`.
pub fn validate_owner_id(owner_id: &str) -> Result<()> {
    if owner_id.is_empty() {
        return Err(Error::InvalidOwnerId("owner id must not be empty".into()));
    }
    if owner_id.len() > config::MAX_OWNER_ID_LEN {
        return Err(Error::InvalidOwnerId(format!(
            "owner id exceeds {} bytes",
            config::MAX_OWNER_ID_LEN
        )));
    }
    if !owner_id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    {
        return Err(Error::InvalidOwnerId(format!(
            "owner id '{}' must contain only [A-Za-z0-9_-]",
            owner_id.escape_default()
        )));
    }
    Ok(())
}
