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

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Named mutexes, one per materialized view.
///
/// Locks are created on first use and never removed, so two callers can never race on
/// creating different mutexes for the same name.
#[derive(Debug, Default)]
pub struct MvLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

/// Proof that the holder owns the lock of one view. Released on drop.
#[derive(Debug)]
pub struct MvLockGuard {
    name: String,
    _guard: OwnedMutexGuard<()>,
}

impl MvLockGuard {
    /// Name of the locked view.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl MvLocks {
    /// An empty lock map.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.entry(name.to_string()).or_default().value())
    }

    /// Wait for the lock of `name`.
    pub async fn acquire(&self, name: &str) -> MvLockGuard {
        let guard = self.lock_for(name).lock_owned().await;
        log::trace!("acquired lock for {name}");
        MvLockGuard {
            name: name.to_string(),
            _guard: guard,
        }
    }

    /// Take the lock of `name` if nobody holds it.
    pub fn try_acquire(&self, name: &str) -> Option<MvLockGuard> {
        let guard = self.lock_for(name).try_lock_owned().ok()?;
        Some(MvLockGuard {
            name: name.to_string(),
            _guard: guard,
        })
    }

    /// Number of names a lock has been created for.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no lock has been created yet.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
