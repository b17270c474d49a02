//! Cold tier: immutable columnar batches in object storage.
//!
//! Batch file layout: `[bincode ColumnarBatch][magic "TCB1"][u32 CRC32 BE]`.
//! Each export writes a new object under
//! `{prefix}/{partition_path}/{uuid-v4-simple}.tcb`; objects are never
//! rewritten.

use crate::config;
use crate::error::{Error, Result};
use crate::record::ColdRecord;
use crate::storage::object_store::{validate_key, ObjectStore};
use crate::storage::persistence::{create_private_dir, seal, unseal};
use crate::summarize::first_sentence;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

const BATCH_CRC_MAGIC: &[u8; 4] = b"TCB1";
const BATCH_FORMAT_VERSION: u32 = 1;

/// Column-oriented encoding of a set of [`ColdRecord`]s.
///
/// Every column has one entry per row. `daily_metrics` holds each row's
/// metric map as a JSON object string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnarBatch {
    pub version: u32,
    pub owner_id: Vec<String>,
    pub record_id: Vec<String>,
    pub fingerprint: Vec<[u8; 32]>,
    pub ultra_summary: Vec<String>,
    /// Milliseconds since the Unix epoch, UTC.
    pub timestamp: Vec<i64>,
    pub daily_metrics: Vec<String>,
}

impl ColumnarBatch {
    pub fn from_records(records: &[ColdRecord]) -> Result<Self> {
        let mut batch = Self {
            version: BATCH_FORMAT_VERSION,
            owner_id: Vec::with_capacity(records.len()),
            record_id: Vec::with_capacity(records.len()),
            fingerprint: Vec::with_capacity(records.len()),
            ultra_summary: Vec::with_capacity(records.len()),
            timestamp: Vec::with_capacity(records.len()),
            daily_metrics: Vec::with_capacity(records.len()),
        };
        for r in records {
            batch.owner_id.push(r.owner_id.clone());
            batch.record_id.push(r.record_id.clone());
            batch.fingerprint.push(r.fingerprint);
            batch.ultra_summary.push(r.ultra_summary.clone());
            batch.timestamp.push(r.timestamp.timestamp_millis());
            batch.daily_metrics.push(serde_json::to_string(&r.daily_metrics)?);
        }
        Ok(batch)
    }

    pub fn len(&self) -> usize {
        self.owner_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owner_id.is_empty()
    }

    /// Pivots back to rows, checking that every column has the same length.
    pub fn into_records(self) -> Result<Vec<ColdRecord>> {
        if self.version != BATCH_FORMAT_VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported batch version {}",
                self.version
            )));
        }
        let n = self.owner_id.len();
        let lengths = [
            self.record_id.len(),
            self.fingerprint.len(),
            self.ultra_summary.len(),
            self.timestamp.len(),
            self.daily_metrics.len(),
        ];
        if lengths.iter().any(|&l| l != n) {
            return Err(Error::Corrupt(format!(
                "column lengths disagree: {} owner ids vs {:?}",
                n, lengths
            )));
        }

        let mut out = Vec::with_capacity(n);
        for i in 0..n {
            let ms = self.timestamp[i];
            let timestamp = DateTime::from_timestamp_millis(ms)
                .ok_or_else(|| Error::Corrupt(format!("timestamp {} out of range", ms)))?;
            let daily_metrics: BTreeMap<String, f64> =
                serde_json::from_str(&self.daily_metrics[i])?;
            out.push(ColdRecord {
                owner_id: self.owner_id[i].clone(),
                record_id: self.record_id[i].clone(),
                fingerprint: self.fingerprint[i],
                ultra_summary: self.ultra_summary[i].clone(),
                timestamp,
                daily_metrics,
            });
        }
        Ok(out)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(seal(bincode::serialize(self)?, BATCH_CRC_MAGIC))
    }

    pub fn decode(raw: &[u8], what: &str) -> Result<Self> {
        let payload = unseal(raw, BATCH_CRC_MAGIC, what)?;
        bincode::deserialize(payload).map_err(|e| Error::Corrupt(format!("{}: {}", what, e)))
    }
}

/// Result of a successful export.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportReceipt {
    pub key: String,
    pub record_count: usize,
    pub bytes: usize,
}

/// Writes Cold batches to an [`ObjectStore`].
#[derive(Clone)]
pub struct ColdExporter {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    scratch_dir: PathBuf,
}

impl std::fmt::Debug for ColdExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ColdExporter")
            .field("prefix", &self.prefix)
            .field("scratch_dir", &self.scratch_dir)
            .finish_non_exhaustive()
    }
}

impl ColdExporter {
    /// `scratch_dir` holds staged batch files until upload; it is created
    /// owner-only if missing.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        prefix: impl Into<String>,
        scratch_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        let prefix = prefix.into().trim_matches('/').to_string();
        validate_key(&prefix)?;
        let scratch_dir = scratch_dir.into();
        create_private_dir(&scratch_dir)?;
        Ok(Self {
            store,
            prefix,
            scratch_dir,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Encodes `records` as one columnar batch and uploads it under
    /// `{prefix}/{partition_path}/{random}.tcb`.
    pub fn export_batch(&self, records: &[ColdRecord], partition_path: &str) -> Result<ExportReceipt> {
        if records.is_empty() {
            return Err(Error::InvalidRecord("cannot export an empty batch".into()));
        }
        validate_partition_path(partition_path)?;

        let encoded = ColumnarBatch::from_records(records)?.encode()?;

        let key = format!(
            "{}/{}/{}.{}",
            self.prefix,
            partition_path,
            Uuid::new_v4().simple(),
            config::COLD_BATCH_EXTENSION
        );
        validate_key(&key)?;
        if self.store.exists(&key)? {
            return Err(Error::ObjectExists(key));
        }

        // Removed on drop, whether or not the upload succeeds.
        let mut staged = tempfile::Builder::new()
            .prefix(".tcb-")
            .tempfile_in(&self.scratch_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(staged.path(), std::fs::Permissions::from_mode(0o600))?;
        }
        staged.write_all(&encoded)?;
        staged.as_file().sync_all()?;

        self.store.put_file(&key, staged.path())?;

        tracing::info!(
            key = %key,
            records = records.len(),
            bytes = encoded.len(),
            "exported cold batch"
        );
        Ok(ExportReceipt {
            key,
            record_count: records.len(),
            bytes: encoded.len(),
        })
    }

    /// Reads and verifies a batch written by [`ColdExporter::export_batch`].
    pub fn read_batch(&self, key: &str) -> Result<Vec<ColdRecord>> {
        let raw = self.store.get(key)?;
        ColumnarBatch::decode(&raw, key)?.into_records()
    }

    /// Batch keys under this exporter's prefix, optionally narrowed to one partition.
    pub fn list_batches(&self, partition_path: Option<&str>) -> Result<Vec<String>> {
        let prefix = match partition_path {
            Some(p) => {
                validate_partition_path(p)?;
                format!("{}/{}/", self.prefix, p)
            }
            None => format!("{}/", self.prefix),
        };
        self.store.list_prefix(&prefix)
    }
}

/// Relative `/`-separated path of `[A-Za-z0-9_=.-]` segments, e.g. `date=2024-01-31`.
pub fn validate_partition_path(partition_path: &str) -> Result<()> {
    let bad = || Error::InvalidPartition(partition_path.escape_default().to_string());
    if partition_path.is_empty() || partition_path.starts_with('/') {
        return Err(bad());
    }
    for segment in partition_path.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(bad());
        }
        if !segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'=' | b'.' | b'-'))
        {
            return Err(bad());
        }
    }
    Ok(())
}

/// SHA-256 dedup digest over owner, record id and text.
pub fn fingerprint_for(owner_id: &str, record_id: &str, text: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(owner_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(record_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    hasher.finalize().into()
}

/// One-sentence summary for the Cold tier.
pub fn ultra_summary(text: &str) -> String {
    first_sentence(text, config::ULTRA_SUMMARY_MAX_CHARS)
}
