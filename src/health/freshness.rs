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

use super::{HealthRegistry, MvStatus};
use crate::{engine::lake::ParquetLake, error::Result};

/// Marks views stale when base data changes after they were built.
///
/// A `READY` view is stale if any file of the base dataset was modified after the view's
/// `built_at`. Views without a `built_at` are left alone.
#[derive(Debug, Clone)]
pub struct FreshnessMonitor {
    lake: ParquetLake,
}

impl FreshnessMonitor {
    /// Watch the files of `lake`.
    pub fn new(lake: ParquetLake) -> Self {
        Self { lake }
    }

    /// Check every `READY` view, returning the names marked `STALE`.
    pub async fn sweep(&self, health: &HealthRegistry) -> Result<Vec<String>> {
        let Some(watermark) = self.lake.last_modified().await? else {
            return Ok(vec![]);
        };

        let mut marked = vec![];
        for record in health.records() {
            if record.status != MvStatus::Ready {
                continue;
            }
            let Some(built_at) = record.built_at else {
                continue;
            };
            if watermark <= built_at {
                continue;
            }

            // a build may have started since the snapshot was taken
            if !health.mark_stale_if_ready(
                &record.name,
                format!("base data modified at {watermark}"),
            )? {
                continue;
            }
            log::info!(
                "{} built at {built_at} predates base data modified at {watermark}",
                record.name
            );
            marked.push(record.name);
        }

        Ok(marked)
    }
}

#[cfg(test)]
mod test {
    use std::fs;

    use chrono::{Duration, Utc};

    use super::FreshnessMonitor;
    use crate::{
        engine::lake::ParquetLake,
        health::{HealthRegistry, MvStatus, StatusUpdate},
    };

    #[tokio::test]
    async fn views_older_than_base_files_go_stale() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("day=2024-01-01")).unwrap();
        fs::write(dir.path().join("day=2024-01-01/part-0.parquet"), b"not read").unwrap();

        let lake = ParquetLake::open(dir.path()).await.unwrap();
        let health = HealthRegistry::in_memory();
        let ready = |name: &str, built_at| {
            health
                .set_status(
                    name,
                    MvStatus::Ready,
                    StatusUpdate {
                        built_at,
                        ..Default::default()
                    },
                )
                .unwrap()
        };
        ready("mv_old", Some(Utc::now() - Duration::hours(1)));
        ready("mv_new", Some(Utc::now() + Duration::hours(1)));
        ready("mv_unknown", None);
        health
            .set_status("mv_failed", MvStatus::Failed, StatusUpdate::default())
            .unwrap();

        let marked = FreshnessMonitor::new(lake).sweep(&health).await.unwrap();
        assert_eq!(marked, vec!["mv_old"]);
        assert_eq!(health.get_status("mv_old"), MvStatus::Stale);
        assert_eq!(health.get_status("mv_new"), MvStatus::Ready);
        assert_eq!(health.get_status("mv_unknown"), MvStatus::Ready);
        assert_eq!(health.get_status("mv_failed"), MvStatus::Failed);
    }
}
