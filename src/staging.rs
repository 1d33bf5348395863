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

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;

const STAGING_DIR: &str = "staging";
const READY_DIR: &str = "ready";

/// Two-directory publication protocol.
///
/// Artifacts are written under `staging/` with a unique temporary name and become visible under
/// `ready/` only through a single rename. Both directories live under the same root so the rename
/// never crosses a filesystem.
#[derive(Debug, Clone)]
pub struct StagingManager {
    staging: PathBuf,
    ready: PathBuf,
}

impl StagingManager {
    /// Create the `staging/` and `ready/` directories under `root` if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let staging = root.join(STAGING_DIR);
        let ready = root.join(READY_DIR);
        fs::create_dir_all(&staging)?;
        fs::create_dir_all(&ready)?;
        Ok(Self { staging, ready })
    }

    /// Directory of in-progress artifacts.
    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    /// Directory of published artifacts.
    pub fn ready_dir(&self) -> &Path {
        &self.ready
    }

    /// Published location of the artifact named `name`.
    pub fn ready_path(&self, name: &str) -> PathBuf {
        self.ready.join(name)
    }

    /// Reserve a temporary location for the artifact that will be published as `name`.
    ///
    /// Nothing is created on disk. The caller writes to [`StagedFile::path`] and then calls
    /// [`StagedFile::promote`]; dropping the handle without promoting removes whatever was written.
    pub fn stage(&self, name: &str) -> StagedFile {
        let temp = self
            .staging
            .join(format!("{name}.{}.tmp", Uuid::new_v4().simple()));
        StagedFile {
            temp,
            target: self.ready_path(name),
            promoted: false,
        }
    }

    /// Write `bytes` through staging and publish them as `name`.
    pub fn publish_bytes(&self, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let staged = self.stage(name);
        fs::write(staged.path(), bytes)?;
        staged.promote()
    }

    /// Remove temporary artifacts older than `max_age`, returning how many were removed.
    ///
    /// Orphans are left behind only when a process dies between writing and promoting.
    pub fn cleanup_staging(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;

        for entry in fs::read_dir(&self.staging)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }
            let age = now
                .duration_since(metadata.modified()?)
                .unwrap_or(Duration::ZERO);
            if age < max_age {
                continue;
            }

            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        if removed > 0 {
            log::info!("removed {removed} orphaned staging artifacts");
        }
        Ok(removed)
    }
}

/// A temporary artifact awaiting promotion.
///
/// Either [`promote`](Self::promote) moves it to its final path, or dropping it removes it,
/// so a half-written artifact is never visible under `ready/`.
#[derive(Debug)]
#[must_use = "a staged file is deleted when dropped without being promoted"]
pub struct StagedFile {
    temp: PathBuf,
    target: PathBuf,
    promoted: bool,
}

impl StagedFile {
    /// Where to write the artifact.
    pub fn path(&self) -> &Path {
        &self.temp
    }

    /// Where the artifact will be published.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Atomically publish the artifact, replacing any previous version.
    pub fn promote(mut self) -> Result<PathBuf> {
        fs::rename(&self.temp, &self.target)?;
        self.promoted = true;
        log::debug!(
            "promoted {} to {}",
            self.temp.display(),
            self.target.display()
        );
        Ok(self.target.clone())
    }
}

impl Drop for StagedFile {
    fn drop(&mut self) {
        if self.promoted {
            return;
        }
        match fs::remove_file(&self.temp) {
            Ok(()) => log::debug!("discarded staged artifact {}", self.temp.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => log::warn!(
                "couldn't remove staged artifact {}: {e}",
                self.temp.display()
            ),
        }
    }
}

/// Serialize `value` as JSON and replace `path` with it in one rename.
///
/// Readers observe either the previous contents or the new ones, never a partial write.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = path.with_file_name(format!("{file_name}.{}.tmp", Uuid::new_v4().simple()));

    fs::write(&temp, json)?;
    if let Err(e) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::{fs, time::Duration};

    use super::{write_json_atomic, StagingManager};

    #[test]
    fn promotion_moves_staged_file() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingManager::new(dir.path()).unwrap();

        let staged = staging.stage("mv_day.parquet");
        let temp = staged.path().to_path_buf();
        assert!(temp.starts_with(staging.staging_dir()));
        assert!(temp.to_string_lossy().ends_with(".tmp"));

        fs::write(&temp, b"v1").unwrap();
        let published = staged.promote().unwrap();

        assert_eq!(published, staging.ready_path("mv_day.parquet"));
        assert_eq!(fs::read(&published).unwrap(), b"v1");
        assert!(!temp.exists());
    }

    #[test]
    fn dropped_stage_leaves_ready_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingManager::new(dir.path()).unwrap();
        staging.publish_bytes("report.csv", b"old").unwrap();

        let temp = {
            let staged = staging.stage("report.csv");
            fs::write(staged.path(), b"half written").unwrap();
            staged.path().to_path_buf()
            // dropped here without promotion
        };

        assert!(!temp.exists());
        assert_eq!(fs::read(staging.ready_path("report.csv")).unwrap(), b"old");
        assert_eq!(fs::read_dir(staging.staging_dir()).unwrap().count(), 0);
    }

    #[test]
    fn cleanup_removes_only_old_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let staging = StagingManager::new(dir.path()).unwrap();
        fs::write(staging.staging_dir().join("orphan.abc.tmp"), b"x").unwrap();

        assert_eq!(staging.cleanup_staging(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(staging.cleanup_staging(Duration::ZERO).unwrap(), 1);
        assert_eq!(fs::read_dir(staging.staging_dir()).unwrap().count(), 0);
    }

    #[test]
    fn json_snapshot_is_replaced_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");

        write_json_atomic(&path, &serde_json::json!({"a": 1})).unwrap();
        write_json_atomic(&path, &serde_json::json!({"b": 2})).unwrap();

        let contents: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(contents, serde_json::json!({"b": 2}));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
