//! Store snapshots on disk.
//!
//! Writes go to a temp file in the target directory which is then renamed
//! over the destination, so a crash never leaves a half-written snapshot.

use crate::core::{Entity, EntityRef, KernelError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

pub const STORE_SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub issued_ids: Vec<EntityRef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotFormat {
    /// Human-readable, diffable
    #[default]
    Json,
    /// Compact binary
    MessagePack,
}

impl SnapshotFormat {
    fn encode(&self, snapshot: &StoreSnapshot) -> Result<Vec<u8>> {
        match self {
            Self::Json => serde_json::to_vec_pretty(snapshot).map_err(KernelError::from),
            Self::MessagePack => rmp_serde::to_vec_named(snapshot).map_err(|e| {
                KernelError::SerializationError(format!("Failed to serialize snapshot: {}", e))
            }),
        }
    }

    fn decode(&self, data: &[u8]) -> Result<StoreSnapshot> {
        match self {
            Self::Json => serde_json::from_slice(data).map_err(KernelError::from),
            Self::MessagePack => rmp_serde::from_slice(data).map_err(|e| {
                KernelError::SerializationError(format!("Failed to deserialize snapshot: {}", e))
            }),
        }
    }
}

pub struct SnapshotManager {
    snapshot_path: PathBuf,
    format: SnapshotFormat,
}

impl SnapshotManager {
    pub fn new<P: AsRef<Path>>(snapshot_path: P, format: SnapshotFormat) -> Self {
        Self {
            snapshot_path: snapshot_path.as_ref().to_path_buf(),
            format,
        }
    }

    pub fn path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn save(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let parent = match self.snapshot_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)
            .map_err(|e| KernelError::IoError(format!("Failed to create snapshot directory: {}", e)))?;

        let bytes = self.format.encode(snapshot)?;
        let mut temp = NamedTempFile::new_in(&parent)
            .map_err(|e| KernelError::IoError(format!("Failed to create temp file: {}", e)))?;
        temp.write_all(&bytes)
            .map_err(|e| KernelError::IoError(format!("Failed to write snapshot: {}", e)))?;
        temp.as_file()
            .sync_all()
            .map_err(|e| KernelError::IoError(format!("Failed to sync snapshot: {}", e)))?;
        temp.persist(&self.snapshot_path)
            .map_err(|e| KernelError::IoError(format!("Failed to rename snapshot: {}", e)))?;
        Ok(())
    }

    pub fn load(&self) -> Result<Option<StoreSnapshot>> {
        if !self.snapshot_path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.snapshot_path)
            .map_err(|e| KernelError::IoError(format!("Failed to read snapshot: {}", e)))?;
        self.format.decode(&data).map(Some)
    }

    pub fn exists(&self) -> bool {
        self.snapshot_path.exists()
    }

    pub fn delete(&self) -> Result<()> {
        if self.snapshot_path.exists() {
            fs::remove_file(&self.snapshot_path)
                .map_err(|e| KernelError::IoError(format!("Failed to delete snapshot: {}", e)))?;
        }
        Ok(())
    }
}
