//! Object storage capability used by the Cold tier.
//!
//! The Cold exporter needs exactly four operations from its backing store,
//! so that is all [`ObjectStore`] exposes. Keys are `/`-separated relative
//! paths such as `cold/date=2024-01-01/3f2a....tcb`.

use crate::error::{Error, Result};
use crate::storage::persistence::create_private_dir;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub trait ObjectStore: Send + Sync {
    /// Uploads the file at `local_path` under `key`. Overwrites are allowed;
    /// callers that need create-only semantics check [`ObjectStore::exists`].
    fn put_file(&self, key: &str, local_path: &Path) -> Result<()>;

    fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Keys starting with `prefix`, sorted.
    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    fn exists(&self, key: &str) -> Result<bool>;
}

/// Backend selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectStoreKind {
    Local,
    Memory,
}

impl FromStr for ObjectStoreKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "memory" => Ok(Self::Memory),
            other => Err(Error::InvalidConfig(format!(
                "unknown object store '{}', expected 'local' or 'memory'",
                other
            ))),
        }
    }
}

/// Rejects absolute keys and keys with empty, `.` or `..` segments.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() || key.starts_with('/') || key.contains('\\') || key.contains('\0') {
        return Err(Error::InvalidObjectKey(key.escape_default().to_string()));
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(Error::InvalidObjectKey(key.escape_default().to_string()));
    }
    Ok(())
}

/// Objects stored as files beneath a root directory.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        create_private_dir(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.root.clone(), |p, seg| p.join(seg)))
    }

    fn collect_keys(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let key = if prefix.is_empty() {
                name
            } else {
                format!("{}/{}", prefix, name)
            };
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.collect_keys(&entry.path(), &key, out)?;
            } else if file_type.is_file() && !key.ends_with(".part") {
                out.push(key);
            }
        }
        Ok(())
    }
}

impl ObjectStore for LocalObjectStore {
    fn put_file(&self, key: &str, local_path: &Path) -> Result<()> {
        let dest = self.path_for(key)?;
        if let Some(parent) = dest.parent() {
            create_private_dir(parent)?;
        }
        let mut part_name = dest.as_os_str().to_owned();
        part_name.push(".part");
        let part = PathBuf::from(part_name);

        {
            let mut source = File::open(local_path)?;
            let mut opts = OpenOptions::new();
            opts.create(true).write(true).truncate(true);
            #[cfg(unix)]
            {
                use std::os::unix::fs::OpenOptionsExt;
                opts.mode(0o600);
            }
            let mut target = opts.open(&part)?;
            io::copy(&mut source, &mut target)?;
            target.sync_all()?;
        }
        fs::rename(&part, &dest)?;
        tracing::debug!(key, path = %dest.display(), "stored object");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(Error::ObjectNotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        if self.root.exists() {
            self.collect_keys(&self.root, "", &mut keys)?;
        }
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path_for(key)?.is_file())
    }
}

/// Objects held in process memory.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put_file(&self, key: &str, local_path: &Path) -> Result<()> {
        validate_key(key)?;
        let bytes = fs::read(local_path)?;
        self.objects.write().insert(key.to_string(), bytes);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        validate_key(key)?;
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::ObjectNotFound(key.to_string()))
    }

    fn list_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.objects.read().contains_key(key))
    }
}
