//! On-disk catalog snapshot.
//!
//! The last successfully built [`CatalogSnapshot`] is written as a single
//! JSON document. Embeddings are stored as base64-encoded little-endian
//! `f32` bytes so vectors survive a save/load cycle bit-for-bit.
//!
//! Writes go to a uniquely named temporary file in the same directory, are
//! flushed to disk, and are then renamed over the target. A reader therefore
//! only ever sees the previous complete file or the new complete file.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::models::{CatalogEntry, CatalogSnapshot};

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotFile {
    version: u32,
    built_at: DateTime<Utc>,
    fingerprint: String,
    dims: usize,
    entries: Vec<EntryRecord>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryRecord {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameter_schema: Value,
    embedding: String,
}

/// Reads and writes the persisted snapshot at a fixed path.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted snapshot, or `None` if no file exists yet.
    pub async fn load(&self) -> Result<Option<CatalogSnapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read snapshot: {}", self.path.display()))
            }
        };
        decode(&bytes)
            .with_context(|| format!("Failed to parse snapshot: {}", self.path.display()))
            .map(Some)
    }

    /// Atomically replace the persisted snapshot.
    pub async fn save(&self, snapshot: &CatalogSnapshot) -> Result<()> {
        let bytes = encode(snapshot)?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create snapshot directory: {}", dir.display()))?;

        let tmp = self.temp_path(&dir);
        if let Err(e) = write_synced(&tmp, &bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e)
                .with_context(|| format!("Failed to publish snapshot: {}", self.path.display()));
        }

        Ok(())
    }

    fn temp_path(&self, dir: &Path) -> PathBuf {
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "catalog.json".to_string());
        dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()))
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("Failed to create {}", path.display()))?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

fn encode(snapshot: &CatalogSnapshot) -> Result<Vec<u8>> {
    let file = SnapshotFile {
        version: FORMAT_VERSION,
        built_at: snapshot.built_at,
        fingerprint: snapshot.fingerprint.clone(),
        dims: snapshot.dims(),
        entries: snapshot
            .entries
            .iter()
            .map(|e| EntryRecord {
                name: e.name.clone(),
                description: e.description.clone(),
                parameter_schema: e.parameter_schema.clone(),
                embedding: BASE64.encode(vec_to_blob(&e.embedding)),
            })
            .collect(),
    };
    Ok(serde_json::to_vec_pretty(&file)?)
}

fn decode(bytes: &[u8]) -> Result<CatalogSnapshot> {
    let file: SnapshotFile = serde_json::from_slice(bytes)?;
    if file.version != FORMAT_VERSION {
        bail!("unsupported snapshot version {}", file.version);
    }

    let mut entries = Vec::with_capacity(file.entries.len());
    for record in file.entries {
        let raw = BASE64
            .decode(record.embedding.as_bytes())
            .with_context(|| format!("bad embedding encoding for '{}'", record.name))?;
        if raw.len() % 4 != 0 {
            bail!("truncated embedding for '{}'", record.name);
        }
        let embedding = blob_to_vec(&raw);
        if embedding.len() != file.dims {
            bail!(
                "embedding for '{}' has {} dims, expected {}",
                record.name,
                embedding.len(),
                file.dims
            );
        }
        entries.push(CatalogEntry {
            name: record.name,
            description: record.description,
            parameter_schema: record.parameter_schema,
            embedding,
        });
    }

    Ok(CatalogSnapshot {
        entries,
        built_at: file.built_at,
        fingerprint: file.fingerprint,
    })
}
