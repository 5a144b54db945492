//! Persistence layer.
//!
//! Saves and loads scenario records to/from JSON files keyed by scenario id.
//! The record carries status and progress for external polling, and keeps
//! partial results (e.g. the aggregated simulation) retrievable even when a
//! later phase fails.

use std::path::{Path, PathBuf};
use tracing::{debug, info};
use uuid::Uuid;

use crate::types::{ScenarioError, ScenarioRecord};

/// JSON-file store, one record per scenario id.
pub struct ScenarioStore {
    dir: PathBuf,
}

impl ScenarioStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Persist a record, creating the store directory on first use.
    pub fn save(&self, record: &ScenarioRecord) -> Result<(), ScenarioError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            ScenarioError::Storage(format!("failed to create {}: {e}", self.dir.display()))
        })?;

        let path = self.path_for(record.id);
        let json = serde_json::to_string_pretty(record)
            .map_err(|e| ScenarioError::Storage(format!("failed to serialise record: {e}")))?;
        std::fs::write(&path, &json).map_err(|e| {
            ScenarioError::Storage(format!("failed to write {}: {e}", path.display()))
        })?;

        debug!(
            id = %record.id,
            status = %record.status,
            progress = record.progress,
            "Scenario record saved"
        );
        Ok(())
    }

    /// Load a record. Returns None if no record exists for the id.
    pub fn load(&self, id: Uuid) -> Result<Option<ScenarioRecord>, ScenarioError> {
        let path = self.path_for(id);
        if !Path::new(&path).exists() {
            return Ok(None);
        }

        let json = std::fs::read_to_string(&path).map_err(|e| {
            ScenarioError::Storage(format!("failed to read {}: {e}", path.display()))
        })?;
        let record: ScenarioRecord = serde_json::from_str(&json).map_err(|e| {
            ScenarioError::Storage(format!("failed to parse {}: {e}", path.display()))
        })?;

        info!(id = %id, status = %record.status, "Scenario record loaded");
        Ok(Some(record))
    }

    /// Delete a record (for testing or reset).
    pub fn delete(&self, id: Uuid) -> Result<(), ScenarioError> {
        let path = self.path_for(id);
        if Path::new(&path).exists() {
            std::fs::remove_file(&path).map_err(|e| {
                ScenarioError::Storage(format!("failed to delete {}: {e}", path.display()))
            })?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
