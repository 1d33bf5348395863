// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

/// Watermark checks of views against base-table files.
pub mod freshness;

/// Spot checks of view contents against the base table.
pub mod integrity;

use std::{
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    build::locks::MvLockGuard,
    error::{Error, Result},
    staging::write_json_atomic,
};
use integrity::{CheckOutcome, IntegrityReport};

/// Usability of a materialized view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MvStatus {
    /// Published and consistent with the base table; the only status routing uses.
    Ready,
    /// A build holds the view's lock.
    Building,
    /// The last build failed or the last check errored.
    Failed,
    /// Never built, or known to lag the base table.
    Stale,
}

impl fmt::Display for MvStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ready => "READY",
            Self::Building => "BUILDING",
            Self::Failed => "FAILED",
            Self::Stale => "STALE",
        })
    }
}

/// Everything known about one view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MvHealthRecord {
    /// View name. Keys the snapshot, so not repeated inside it.
    #[serde(skip)]
    pub name: String,
    /// Current status.
    pub status: MvStatus,
    /// When the record last changed.
    pub last_checked: DateTime<Utc>,
    /// Rows written by the last successful build.
    #[serde(default)]
    pub total_rows: Option<u64>,
    /// Keys that matched in the last spot check.
    #[serde(default)]
    pub spot_check_ok: u64,
    /// Keys that mismatched in the last spot check.
    #[serde(default)]
    pub spot_check_mismatched: u64,
    /// Last build or check error.
    #[serde(default)]
    pub error: Option<String>,
    /// Published artifact.
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    /// When the published artifact was built.
    #[serde(default)]
    pub built_at: Option<DateTime<Utc>>,
}

impl MvHealthRecord {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: MvStatus::Stale,
            last_checked: Utc::now(),
            total_rows: None,
            spot_check_ok: 0,
            spot_check_mismatched: 0,
            error: None,
            output_path: None,
            built_at: None,
        }
    }
}

/// Metadata accompanying a status change. `None` fields leave the record unchanged,
/// except `error`, which is always replaced.
#[derive(Debug, Clone, Default)]
pub struct StatusUpdate {
    /// Rows in the published artifact.
    pub total_rows: Option<u64>,
    /// Published artifact.
    pub output_path: Option<PathBuf>,
    /// Build time of the published artifact.
    pub built_at: Option<DateTime<Utc>>,
    /// Error to record, or `None` to clear it.
    pub error: Option<String>,
}

impl StatusUpdate {
    /// An update that only records an error.
    pub fn error(error: impl fmt::Display) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Default::default()
        }
    }
}

/// Process-wide health state of every view, snapshotted to `mv_build_registry.json`.
///
/// All access goes through `&self` methods that lock internally, so reads and writes
/// are linearizable.
#[derive(Debug)]
pub struct HealthRegistry {
    path: Option<PathBuf>,
    records: Mutex<BTreeMap<String, MvHealthRecord>>,
}

impl HealthRegistry {
    /// A registry that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::default(),
        }
    }

    /// Open the registry persisted at `path`, starting empty if the file does not exist.
    ///
    /// No build survives a restart, so records snapshotted as `BUILDING` are demoted to `STALE`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut records: BTreeMap<String, MvHealthRecord> = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::Config(format!("corrupt build registry {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        for (name, record) in records.iter_mut() {
            record.name.clone_from(name);
            if record.status == MvStatus::Building {
                log::warn!("{name} was building when the registry was last saved, marking stale");
                record.status = MvStatus::Stale;
            }
        }

        Ok(Self {
            path: Some(path),
            records: Mutex::new(records),
        })
    }

    /// Status of `name`; views never seen are `STALE`.
    pub fn get_status(&self, name: &str) -> MvStatus {
        self.records
            .lock()
            .get(name)
            .map_or(MvStatus::Stale, |r| r.status)
    }

    /// Full record of `name`.
    pub fn record(&self, name: &str) -> Option<MvHealthRecord> {
        self.records.lock().get(name).cloned()
    }

    /// Every record, ordered by name.
    pub fn records(&self) -> Vec<MvHealthRecord> {
        self.records.lock().values().cloned().collect()
    }

    /// Views that are `FAILED` or `STALE`.
    pub fn list_unhealthy(&self) -> Vec<String> {
        self.records
            .lock()
            .values()
            .filter(|r| matches!(r.status, MvStatus::Failed | MvStatus::Stale))
            .map(|r| r.name.clone())
            .collect()
    }

    /// Set the status of `name`.
    ///
    /// Moving to `BUILDING` fails with [`Error::AlreadyBuilding`] if the view is already `BUILDING`;
    /// build code goes through [`Self::mark_building`], which also demands the view's lock.
    pub fn set_status(&self, name: &str, status: MvStatus, update: StatusUpdate) -> Result<()> {
        self.commit(|records| {
            let record = records
                .entry(name.to_string())
                .or_insert_with(|| MvHealthRecord::new(name));

            if status == MvStatus::Building && record.status == MvStatus::Building {
                return Err(Error::AlreadyBuilding(name.to_string()));
            }

            log::debug!("{name}: {} -> {status}", record.status);
            record.status = status;
            record.last_checked = Utc::now();
            record.error = update.error;
            if update.total_rows.is_some() {
                record.total_rows = update.total_rows;
            }
            if update.output_path.is_some() {
                record.output_path = update.output_path;
            }
            if update.built_at.is_some() {
                record.built_at = update.built_at;
            }
            Ok(())
        })
    }

    /// Demote `name` from `READY` to `STALE`, recording `reason`. Any other status is left alone.
    pub fn mark_stale_if_ready(&self, name: &str, reason: impl fmt::Display) -> Result<bool> {
        self.commit(|records| {
            let Some(record) = records.get_mut(name).filter(|r| r.status == MvStatus::Ready) else {
                return Ok(false);
            };

            record.status = MvStatus::Stale;
            record.last_checked = Utc::now();
            record.error = Some(reason.to_string());
            Ok(true)
        })
    }

    /// Demote `name` to `STALE` unless it is `BUILDING` or was never recorded.
    ///
    /// Used when the view's definition changes under a published artifact.
    pub fn mark_stale(&self, name: &str, reason: impl fmt::Display) -> Result<bool> {
        self.commit(|records| {
            let Some(record) = records
                .get_mut(name)
                .filter(|r| r.status != MvStatus::Building)
            else {
                return Ok(false);
            };

            log::debug!("{name}: {} -> {}", record.status, MvStatus::Stale);
            record.status = MvStatus::Stale;
            record.last_checked = Utc::now();
            record.error = Some(reason.to_string());
            Ok(true)
        })
    }

    /// Mark `name` `FAILED` because its published artifact at `path` is unusable.
    ///
    /// Only applies while the view is `READY` with that same artifact, so a newer build that
    /// already replaced it is left alone.
    pub fn mark_artifact_failed(
        &self,
        name: &str,
        path: &Path,
        reason: impl fmt::Display,
    ) -> Result<bool> {
        self.commit(|records| {
            let Some(record) = records.get_mut(name).filter(|r| {
                r.status == MvStatus::Ready && r.output_path.as_deref() == Some(path)
            }) else {
                return Ok(false);
            };

            record.status = MvStatus::Failed;
            record.last_checked = Utc::now();
            record.error = Some(reason.to_string());
            Ok(true)
        })
    }

    /// Move `name` to `BUILDING` while holding its lock.
    pub fn mark_building(&self, guard: &MvLockGuard) -> Result<()> {
        self.set_status(guard.name(), MvStatus::Building, StatusUpdate::default())
    }

    /// Store the outcome of a spot check.
    ///
    /// `OK` makes the view `READY`, `STALE` makes it `STALE`, `ERROR` makes it `FAILED`.
    /// A view that is `BUILDING` keeps its status; its counts are still recorded.
    pub fn record_check(&self, report: &IntegrityReport) -> Result<MvStatus> {
        self.commit(|records| Ok(Self::apply_check(records, report)))
    }

    fn apply_check(
        records: &mut BTreeMap<String, MvHealthRecord>,
        report: &IntegrityReport,
    ) -> MvStatus {
        let record = records
            .entry(report.mv_name.clone())
            .or_insert_with(|| MvHealthRecord::new(&report.mv_name));

        record.spot_check_ok = report.matched() as u64;
        record.spot_check_mismatched = report.mismatched as u64;
        record.last_checked = report.checked_at;

        if record.status == MvStatus::Building {
            log::debug!(
                "{} is building, not applying {:?} check result",
                report.mv_name,
                report.outcome
            );
        } else {
            record.status = match report.outcome {
                CheckOutcome::Ok => MvStatus::Ready,
                CheckOutcome::Stale => MvStatus::Stale,
                CheckOutcome::Error => MvStatus::Failed,
            };
            record.error = report.error.clone();
            log::info!(
                "integrity check of {}: {:?} ({} of {} mismatched)",
                report.mv_name,
                report.outcome,
                report.mismatched,
                report.total_checked
            );
        }

        record.status
    }

    /// Apply `change` to a copy of the records and make the copy current once its snapshot is
    /// written. On any error the records are left as they were.
    fn commit<T>(
        &self,
        change: impl FnOnce(&mut BTreeMap<String, MvHealthRecord>) -> Result<T>,
    ) -> Result<T> {
        let mut records = self.records.lock();
        let mut next = records.clone();
        let out = change(&mut next)?;
        if next != *records {
            self.persist(&next)?;
            *records = next;
        }
        Ok(out)
    }

    fn persist(&self, records: &BTreeMap<String, MvHealthRecord>) -> Result<()> {
        match &self.path {
            Some(path) => write_json_atomic(path, records),
            None => Ok(()),
        }
    }

    /// Location of the snapshot, if persisted.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod test {
    use chrono::Utc;

    use super::{
        integrity::{CheckOutcome, IntegrityReport},
        HealthRegistry, MvStatus, StatusUpdate,
    };
    use crate::{build::locks::MvLocks, error::Error};

    #[test]
    fn unknown_views_are_stale() {
        let registry = HealthRegistry::in_memory();
        assert_eq!(registry.get_status("mv_x"), MvStatus::Stale);
        assert!(registry.record("mv_x").is_none());
    }

    #[tokio::test]
    async fn building_twice_is_rejected() {
        let registry = HealthRegistry::in_memory();
        let locks = MvLocks::new();

        let guard = locks.acquire("mv_x").await;
        registry.mark_building(&guard).unwrap();
        assert!(matches!(
            registry.mark_building(&guard),
            Err(Error::AlreadyBuilding(name)) if name == "mv_x"
        ));

        registry
            .set_status(
                "mv_x",
                MvStatus::Ready,
                StatusUpdate {
                    total_rows: Some(42),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(registry.get_status("mv_x"), MvStatus::Ready);
        assert_eq!(registry.record("mv_x").unwrap().total_rows, Some(42));
    }

    #[test]
    fn snapshot_survives_reopen_and_demotes_building() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mv_build_registry.json");

        let registry = HealthRegistry::open(&path).unwrap();
        registry
            .set_status("mv_a", MvStatus::Ready, StatusUpdate::default())
            .unwrap();
        registry
            .set_status("mv_b", MvStatus::Building, StatusUpdate::default())
            .unwrap();
        registry
            .set_status("mv_c", MvStatus::Failed, StatusUpdate::error("boom"))
            .unwrap();

        let reopened = HealthRegistry::open(&path).unwrap();
        assert_eq!(reopened.get_status("mv_a"), MvStatus::Ready);
        assert_eq!(reopened.get_status("mv_b"), MvStatus::Stale);
        let failed = reopened.record("mv_c").unwrap();
        assert_eq!(failed.name, "mv_c");
        assert_eq!(failed.error.as_deref(), Some("boom"));
        assert_eq!(reopened.list_unhealthy(), vec!["mv_b", "mv_c"]);
    }

    #[test]
    fn failed_snapshot_leaves_records_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let registry = HealthRegistry::open(dir.path().join("gone/mv_build_registry.json")).unwrap();

        assert!(registry
            .set_status("mv_a", MvStatus::Ready, StatusUpdate::default())
            .is_err());
        assert!(registry.record("mv_a").is_none());
        assert!(registry.list_unhealthy().is_empty());
    }

    #[tokio::test]
    async fn replaced_definitions_demote_everything_but_building() {
        let registry = HealthRegistry::in_memory();
        assert!(!registry.mark_stale("mv_a", "definition replaced").unwrap());

        registry
            .set_status("mv_a", MvStatus::Ready, StatusUpdate::default())
            .unwrap();
        assert!(registry.mark_stale("mv_a", "definition replaced").unwrap());
        let record = registry.record("mv_a").unwrap();
        assert_eq!(record.status, MvStatus::Stale);
        assert_eq!(record.error.as_deref(), Some("definition replaced"));

        let locks = MvLocks::new();
        let guard = locks.acquire("mv_a").await;
        registry.mark_building(&guard).unwrap();
        assert!(!registry.mark_stale("mv_a", "definition replaced").unwrap());
        assert_eq!(registry.get_status("mv_a"), MvStatus::Building);
    }

    #[test]
    fn corrupt_snapshot_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mv_build_registry.json");
        std::fs::write(&path, b"{ not json").unwrap();
        assert!(matches!(HealthRegistry::open(&path), Err(Error::Config(_))));
    }

    #[test]
    fn check_results_map_to_statuses() {
        let registry = HealthRegistry::in_memory();
        let report = |outcome, mismatched| IntegrityReport {
            mv_name: "mv_a".into(),
            outcome,
            total_checked: 10,
            mismatched,
            error: None,
            checked_at: Utc::now(),
        };

        registry
            .set_status("mv_a", MvStatus::Ready, StatusUpdate::default())
            .unwrap();
        assert_eq!(
            registry.record_check(&report(CheckOutcome::Stale, 3)).unwrap(),
            MvStatus::Stale
        );
        let record = registry.record("mv_a").unwrap();
        assert_eq!((record.spot_check_ok, record.spot_check_mismatched), (7, 3));

        assert_eq!(
            registry.record_check(&report(CheckOutcome::Ok, 0)).unwrap(),
            MvStatus::Ready
        );
        assert_eq!(
            registry.record_check(&report(CheckOutcome::Error, 0)).unwrap(),
            MvStatus::Failed
        );

        registry
            .set_status("mv_a", MvStatus::Building, StatusUpdate::default())
            .unwrap();
        assert_eq!(
            registry.record_check(&report(CheckOutcome::Ok, 0)).unwrap(),
            MvStatus::Building
        );
    }
}
