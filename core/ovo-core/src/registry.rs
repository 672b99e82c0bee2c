//! File-backed project registry.
//!
//! `projects.json` is the only durable record of which projects exist. The
//! daemon knows about live processes; it never decides project existence.
//!
//! # File Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "projects": [
//!     { "id": "test2qyiab2", "name": "test2", "path": "/Users/vidar/ovo/test2",
//!       "type": "node", "port": 3000, "status": "stopped",
//!       "createdAt": "...", "updatedAt": "..." }
//!   ]
//! }
//! ```
//!
//! A bare array of records (the pre-versioned shape) is still accepted on load.
//!
//! # Writers
//!
//! Every mutation takes the registry's write lock, reloads the file, applies
//! the change and saves before releasing it. Two mutations never interleave,
//! so no update is lost.
//!
//! # Atomic Writes
//!
//! Saves go through a temp file in the same directory that is fsynced and
//! renamed over the target. A crash leaves either the old file or the new one.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use fs_err as fs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{OvoError, Result};
use crate::types::{ProjectPatch, ProjectRecord, ProjectStatus};

const REGISTRY_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    version: u32,
    projects: Vec<ProjectRecord>,
}

pub struct ProjectRegistry {
    file_path: PathBuf,
    write_lock: Mutex<()>,
}

impl ProjectRegistry {
    pub fn open(file_path: &Path) -> Self {
        Self {
            file_path: file_path.to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn load_all(&self) -> Result<Vec<ProjectRecord>> {
        let _guard = self.lock();
        self.read_file()
    }

    /// Replaces the whole registry.
    pub fn save(&self, records: &[ProjectRecord]) -> Result<()> {
        let _guard = self.lock();
        let mut seen = HashSet::new();
        for record in records {
            if !seen.insert(record.id.as_str()) {
                return Err(OvoError::DuplicateId(record.id.clone()));
            }
        }
        self.write_file(records)
    }

    pub fn get(&self, id: &str) -> Result<ProjectRecord> {
        self.load_all()?
            .into_iter()
            .find(|record| record.id == id)
            .ok_or_else(|| OvoError::UnknownProjectId(id.to_string()))
    }

    /// Registers a project. Fails with `DuplicateId` when the id is taken,
    /// unless `overwrite` is set, in which case the stored record is replaced
    /// but keeps its original `createdAt`.
    pub fn add(&self, record: ProjectRecord, overwrite: bool) -> Result<ProjectRecord> {
        if !record.has_consistent_id() {
            return Err(OvoError::InvalidRequest(format!(
                "id {} does not match name and path",
                record.id
            )));
        }

        let _guard = self.lock();
        let mut records = self.read_file()?;

        let stored = match records.iter_mut().find(|r| r.id == record.id) {
            Some(_) if !overwrite => return Err(OvoError::DuplicateId(record.id)),
            Some(existing) => {
                let created_at = existing.created_at;
                *existing = record;
                existing.created_at = created_at;
                existing.touch();
                existing.clone()
            }
            None => {
                records.push(record.clone());
                record
            }
        };

        self.write_file(&records)?;
        info!(project_id = %stored.id, path = %stored.path, overwrite, "Project registered");
        Ok(stored)
    }

    /// Removes a project. Unknown ids are a successful no-op.
    pub fn remove(&self, id: &str) -> Result<Option<ProjectRecord>> {
        let _guard = self.lock();
        let mut records = self.read_file()?;

        let Some(index) = records.iter().position(|r| r.id == id) else {
            debug!(project_id = %id, "Remove of unknown project ignored");
            return Ok(None);
        };

        let removed = records.remove(index);
        self.write_file(&records)?;
        info!(project_id = %id, "Project removed");
        Ok(Some(removed))
    }

    pub fn update(&self, id: &str, patch: ProjectPatch) -> Result<ProjectRecord> {
        self.mutate(id, |record| {
            if patch.name.as_deref().is_some_and(|n| n != record.name)
                || patch.path.as_deref().is_some_and(|p| p != record.path)
            {
                return Err(OvoError::InvalidRequest(
                    "name and path identify the project and cannot change; add it again instead"
                        .to_string(),
                ));
            }
            if let Some(project_type) = patch.project_type.as_deref().map(str::trim) {
                if !project_type.is_empty() {
                    record.project_type = project_type.to_string();
                }
            }
            if let Some(port) = patch.port {
                record.port = Some(port);
            }
            Ok(())
        })
    }

    pub fn update_status(
        &self,
        id: &str,
        status: ProjectStatus,
        reason: Option<String>,
    ) -> Result<ProjectRecord> {
        self.mutate(id, |record| {
            record.status = status;
            record.last_error = reason;
            Ok(())
        })
    }

    pub fn update_port(&self, id: &str, port: u16) -> Result<ProjectRecord> {
        self.mutate(id, |record| {
            record.port = Some(port);
            Ok(())
        })
    }

    /// Compare-and-set on status: moves to `next` only if the stored status is
    /// still `expected`. Returns `None` when the precondition no longer holds.
    pub fn transition(
        &self,
        id: &str,
        expected: ProjectStatus,
        next: ProjectStatus,
    ) -> Result<Option<ProjectRecord>> {
        let _guard = self.lock();
        let mut records = self.read_file()?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| OvoError::UnknownProjectId(id.to_string()))?;

        if record.status != expected {
            debug!(
                project_id = %id,
                expected = %expected,
                actual = %record.status,
                "Status transition skipped; precondition no longer holds"
            );
            return Ok(None);
        }

        record.status = next;
        record.last_error = None;
        record.touch();
        let updated = record.clone();
        self.write_file(&records)?;
        Ok(Some(updated))
    }

    /// Applies `apply` to every record under a single lock and saves once if
    /// anything changed. `apply` returns true when it modified the record.
    pub fn update_all<F>(&self, mut apply: F) -> Result<Vec<ProjectRecord>>
    where
        F: FnMut(&mut ProjectRecord) -> bool,
    {
        let _guard = self.lock();
        let mut records = self.read_file()?;
        let mut changed = false;
        for record in records.iter_mut() {
            if apply(record) {
                record.touch();
                changed = true;
            }
        }
        if changed {
            self.write_file(&records)?;
        }
        Ok(records)
    }

    fn mutate<F>(&self, id: &str, apply: F) -> Result<ProjectRecord>
    where
        F: FnOnce(&mut ProjectRecord) -> Result<()>,
    {
        let _guard = self.lock();
        let mut records = self.read_file()?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| OvoError::UnknownProjectId(id.to_string()))?;

        apply(record)?;
        record.touch();
        let updated = record.clone();
        self.write_file(&records)?;
        Ok(updated)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // The guarded value is (), so a poisoned lock carries no broken state.
        self.write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_file(&self) -> Result<Vec<ProjectRecord>> {
        let content = match fs::read_to_string(&self.file_path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(OvoError::io("Failed to read project registry", err)),
        };

        if content.trim().is_empty() {
            warn!(path = %self.file_path.display(), "Empty project registry file; treating as empty");
            return Ok(Vec::new());
        }

        let records = parse_registry(&content).map_err(|details| OvoError::CorruptedRegistry {
            path: self.file_path.clone(),
            details,
        })?;

        Ok(collapse_duplicates(records))
    }

    fn write_file(&self, records: &[ProjectRecord]) -> Result<()> {
        let parent_dir = self.file_path.parent().ok_or_else(|| {
            OvoError::Internal("Registry path has no parent directory".to_string())
        })?;
        fs::create_dir_all(parent_dir)
            .map_err(|e| OvoError::io("Failed to create registry directory", e))?;

        let file = RegistryFile {
            version: REGISTRY_VERSION,
            projects: records.to_vec(),
        };
        let content = serde_json::to_string_pretty(&file).map_err(|e| OvoError::Json {
            context: "Failed to serialize project registry".to_string(),
            source: e,
        })?;

        let mut temp_file = NamedTempFile::new_in(parent_dir)
            .map_err(|e| OvoError::io("Failed to create temp registry file", e))?;
        temp_file
            .write_all(content.as_bytes())
            .map_err(|e| OvoError::io("Failed to write temp registry file", e))?;
        temp_file
            .flush()
            .map_err(|e| OvoError::io("Failed to flush temp registry file", e))?;
        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| OvoError::io("Failed to sync temp registry file", e))?;
        temp_file
            .persist(&self.file_path)
            .map_err(|e| OvoError::io("Failed to replace project registry", e.error))?;

        Ok(())
    }
}

fn parse_registry(content: &str) -> std::result::Result<Vec<ProjectRecord>, String> {
    let value: Value = serde_json::from_str(content).map_err(|e| e.to_string())?;

    if value.is_array() {
        return serde_json::from_value(value).map_err(|e| e.to_string());
    }

    let file: RegistryFile = serde_json::from_value(value).map_err(|e| e.to_string())?;
    if file.version != REGISTRY_VERSION {
        return Err(format!(
            "unsupported registry version {} (expected {})",
            file.version, REGISTRY_VERSION
        ));
    }
    Ok(file.projects)
}

/// Keeps one record per id, preferring the most recently updated one.
fn collapse_duplicates(records: Vec<ProjectRecord>) -> Vec<ProjectRecord> {
    let mut order: Vec<String> = Vec::with_capacity(records.len());
    let mut by_id: HashMap<String, ProjectRecord> = HashMap::with_capacity(records.len());

    for record in records {
        if !record.has_consistent_id() {
            warn!(
                project_id = %record.id,
                name = %record.name,
                path = %record.path,
                "Registry record id does not match its name and path; keeping stored id"
            );
        }
        match by_id.get(&record.id) {
            Some(existing) => {
                warn!(project_id = %record.id, "Duplicate registry record collapsed");
                if record.updated_at > existing.updated_at {
                    by_id.insert(record.id.clone(), record);
                }
            }
            None => {
                order.push(record.id.clone());
                by_id.insert(record.id.clone(), record);
            }
        }
    }

    order
        .into_iter()
        .filter_map(|id| by_id.remove(&id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn registry(temp: &TempDir) -> ProjectRegistry {
        ProjectRegistry::open(&temp.path().join("projects.json"))
    }

    fn record(name: &str) -> ProjectRecord {
        ProjectRecord::new(name, &format!("/Users/dev/{}", name), None, Some(3000))
    }

    #[test]
    fn missing_file_is_empty_registry() {
        let temp = TempDir::new().unwrap();
        assert!(registry(&temp).load_all().unwrap().is_empty());
    }

    #[test]
    fn add_then_load() {
        let temp = TempDir::new().unwrap();
        let reg = registry(&temp);
        let added = reg.add(record("web"), false).unwrap();

        let loaded = reg.load_all().unwrap();
        assert_eq!(loaded, vec![added]);
    }

    #[test]
    fn add_duplicate_fails_without_overwrite() {
        let temp = TempDir::new().unwrap();
        let reg = registry(&temp);
        reg.add(record("web"), false).unwrap();

        let err = reg.add(record("web"), false).unwrap_err();
        assert!(matches!(err, OvoError::DuplicateId(_)));
        assert_eq!(reg.load_all().unwrap().len(), 1);
    }

    #[test]
    fn add_with_overwrite_replaces_but_keeps_created_at() {
        let temp = TempDir::new().unwrap();
        let reg = registry(&temp);
        let first = reg.add(record("web"), false).unwrap();

        let mut replacement = record("web");
        replacement.project_type = "vite".to_string();
        let stored = reg.add(replacement, true).unwrap();

        assert_eq!(stored.project_type, "vite");
        assert_eq!(stored.created_at, first.created_at);
        assert_eq!(reg.load_all().unwrap().len(), 1);
    }

    #[test]
    fn add_rejects_forged_id() {
        let temp = TempDir::new().unwrap();
        let mut forged = record("web");
        forged.id = "somethingelse".to_string();
        let err = registry(&temp).add(forged, false).unwrap_err();
        assert!(matches!(err, OvoError::InvalidRequest(_)));
    }

    #[test]
    fn remove_unknown_is_noop() {
        let temp = TempDir::new().unwrap();
        let reg = registry(&temp);
        let kept = reg.add(record("web"), false).unwrap();
        let before = fs::read_to_string(reg.path()).unwrap();

        assert!(reg.remove("nope12345").unwrap().is_none());

        assert_eq!(reg.load_all().unwrap(), vec![kept]);
        assert_eq!(fs::read_to_string(reg.path()).unwrap(), before);
    }

    #[test]
    fn remove_known_returns_record() {
        let temp = TempDir::new().unwrap();
        let reg = registry(&temp);
        let added = reg.add(record("web"), false).unwrap();

        let removed = reg.remove(&added.id).unwrap().unwrap();
        assert_eq!(removed.id, added.id);
        assert!(reg.load_all().unwrap().is_empty());
    }

    #[test]
    fn save_load_round_trip_is_field_exact() {
        let temp = TempDir::new().unwrap();
        let reg = registry(&temp);
        reg.add(record("web"), false).unwrap();
        reg.add(record("api"), false).unwrap();
        reg.update_status(&record("api").id, ProjectStatus::Error, Some("boom".into()))
            .unwrap();

        let loaded = reg.load_all().unwrap();
        reg.save(&loaded).unwrap();
        let reloaded = reg.load_all().unwrap();

        let by_id = |records: &[ProjectRecord]| -> HashMap<String, ProjectRecord> {
            records.iter().map(|r| (r.id.clone(), r.clone())).collect()
        };
        assert_eq!(by_id(&loaded), by_id(&reloaded));
    }

    #[test]
    fn save_rejects_duplicate_ids() {
        let temp = TempDir::new().unwrap();
        let reg = registry(&temp);
        let err = reg.save(&[record("web"), record("web")]).unwrap_err();
        assert!(matches!(err, OvoError::DuplicateId(_)));
        assert!(!reg.path().exists());
    }

    #[test]
    fn corrupted_file_is_surfaced_and_left_untouched() {
        let temp = TempDir::new().unwrap();
        let reg = registry(&temp);
        fs::write(reg.path(), "{ not json").unwrap();

        let err = reg.load_all().unwrap_err();
        assert!(matches!(err, OvoError::CorruptedRegistry { .. }));
        assert!(reg.add(record("web"), false).is_err());
        assert_eq!(fs::read_to_string(reg.path()).unwrap(), "{ not json");
    }

    #[test]
    fn unsupported_version_is_corrupted() {
        let temp = TempDir::new().unwrap();
        let reg = registry(&temp);
        fs::write(reg.path(), r#"{"version": 99, "projects": []}"#).unwrap();
        assert!(matches!(
            reg.load_all().unwrap_err(),
            OvoError::CorruptedRegistry { .. }
        ));
    }

    #[test]
    fn legacy_array_shape_loads() {
        let temp = TempDir::new().unwrap();
        let reg = registry(&temp);
        let legacy = vec![record("web")];
        fs::write(reg.path(), serde_json::to_string(&legacy).unwrap()).unwrap();

        assert_eq!(reg.load_all().unwrap(), legacy);
    }

    #[test]
    fn whitespace_file_is_empty_registry() {
        let temp = TempDir::new().unwrap();
        let reg = registry(&temp);
        fs::write(reg.path(), "  \n").unwrap();
        assert!(reg.load_all().unwrap().is_empty());
    }

    #[test]
    fn duplicate_records_on_disk_collapse_to_newest() {
        let temp = TempDir::new().unwrap();
        let reg = registry(&temp);
        let older = record("web");
        let mut newer = older.clone();
        newer.updated_at = Utc::now() + Duration::seconds(5);
        newer.port = Some(4000);
        let file = RegistryFile {
            version: REGISTRY_VERSION,
            projects: vec![older, newer],
        };
        fs::write(reg.path(), serde_json::to_string(&file).unwrap()).unwrap();

        let loaded = reg.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].port, Some(4000));
    }

    #[test]
    fn update_rejects_identity_change() {
        let temp = TempDir::new().unwrap();
        let reg = registry(&temp);
        let added = reg.add(record("web"), false).unwrap();

        let err = reg
            .update(
                &added.id,
                ProjectPatch {
                    name: Some("renamed".to_string()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, OvoError::InvalidRequest(_)));
    }

    #[test]
    fn update_changes_type_and_port() {
        let temp = TempDir::new().unwrap();
        let reg = registry(&temp);
        let added = reg.add(record("web"), false).unwrap();

        let updated = reg
            .update(
                &added.id,
                ProjectPatch {
                    name: Some("web".to_string()),
                    project_type: Some("next".to_string()),
                    port: Some(4321),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.project_type, "next");
        assert_eq!(updated.port, Some(4321));
        assert!(updated.updated_at >= added.updated_at);
    }

    #[test]
    fn update_unknown_id_fails() {
        let temp = TempDir::new().unwrap();
        let err = registry(&temp).update_port("missing1", 8080).unwrap_err();
        assert!(matches!(err, OvoError::UnknownProjectId(_)));
    }

    #[test]
    fn transition_only_applies_when_precondition_holds() {
        let temp = TempDir::new().unwrap();
        let reg = registry(&temp);
        let added = reg.add(record("web"), false).unwrap();

        let moved = reg
            .transition(&added.id, ProjectStatus::Stopped, ProjectStatus::Starting)
            .unwrap();
        assert_eq!(moved.unwrap().status, ProjectStatus::Starting);

        let skipped = reg
            .transition(&added.id, ProjectStatus::Stopped, ProjectStatus::Starting)
            .unwrap();
        assert!(skipped.is_none());
    }

    #[test]
    fn concurrent_adds_are_not_lost() {
        let temp = TempDir::new().unwrap();
        let reg = Arc::new(registry(&temp));
        let count = 32;

        let handles: Vec<_> = (0..count)
            .map(|i| {
                let reg = Arc::clone(&reg);
                thread::spawn(move || reg.add(record(&format!("app{}", i)), false))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap().unwrap();
        }

        assert_eq!(reg.load_all().unwrap().len(), count);
    }

    #[test]
    fn no_temp_files_left_behind() {
        let temp = TempDir::new().unwrap();
        let reg = registry(&temp);
        reg.add(record("web"), false).unwrap();
        reg.add(record("api"), false).unwrap();

        let entries: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(entries.len(), 1);
    }
}
