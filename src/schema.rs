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
    collections::BTreeMap,
    fmt,
    path::{Path, PathBuf},
};

use arrow_schema::Schema;
use itertools::Itertools;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    staging::write_json_atomic,
};

/// Canonical column signature of a table: `(column, type)` pairs sorted by column name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaSignature(Vec<(String, String)>);

impl SchemaSignature {
    /// Build a signature from arbitrary `(column, type)` pairs.
    pub fn new(columns: impl IntoIterator<Item = (String, String)>) -> Self {
        Self(columns.into_iter().sorted().collect())
    }

    /// Signature of an Arrow schema. Nullability and metadata are ignored.
    pub fn of(schema: &Schema) -> Self {
        Self::new(
            schema
                .fields()
                .iter()
                .map(|f| (f.name().clone(), f.data_type().to_string())),
        )
    }

    /// The sorted pairs.
    pub fn columns(&self) -> &[(String, String)] {
        &self.0
    }
}

impl fmt::Display for SchemaSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}]",
            self.0.iter().map(|(c, t)| format!("{c}: {t}")).join(", ")
        )
    }
}

/// Authoritative signature per table name.
///
/// The first registration of a name wins; later registrations must match it exactly.
/// The map is snapshotted to `schema_registry.json` after every change.
#[derive(Debug)]
pub struct SchemaRegistry {
    path: Option<PathBuf>,
    signatures: Mutex<BTreeMap<String, SchemaSignature>>,
}

impl SchemaRegistry {
    /// A registry that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            signatures: Mutex::default(),
        }
    }

    /// Open the registry persisted at `path`, starting empty if the file does not exist.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let signatures = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::Config(format!("corrupt schema registry {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path: Some(path),
            signatures: Mutex::new(signatures),
        })
    }

    /// Register `signature` for `table`.
    ///
    /// A new signature is only kept once the snapshot holding it has been written.
    ///
    /// Returns `true` if `table` was unseen (the signature is stored) or already holds an equal
    /// signature, and `false` on drift. A rejected signature never replaces the stored one.
    pub fn register(&self, table: &str, signature: &SchemaSignature) -> Result<bool> {
        let mut signatures = self.signatures.lock();
        match signatures.get(table) {
            Some(stored) if stored == signature => Ok(true),
            Some(stored) => {
                log::warn!("schema drift on {table}: registered {stored}, got {signature}");
                Ok(false)
            }
            None => {
                let mut next = signatures.clone();
                next.insert(table.to_string(), signature.clone());
                self.persist(&next)?;
                *signatures = next;
                log::debug!("registered schema for {table}: {signature}");
                Ok(true)
            }
        }
    }

    /// Stored signature for `table`.
    pub fn get(&self, table: &str) -> Option<SchemaSignature> {
        self.signatures.lock().get(table).cloned()
    }

    /// Forget the signature of `table` so the next build may register a new one.
    pub fn reset(&self, table: &str) -> Result<Option<SchemaSignature>> {
        let mut signatures = self.signatures.lock();
        if !signatures.contains_key(table) {
            return Ok(None);
        }

        let mut next = signatures.clone();
        let previous = next.remove(table);
        self.persist(&next)?;
        *signatures = next;
        log::info!("reset schema for {table}");
        Ok(previous)
    }

    fn persist(&self, signatures: &BTreeMap<String, SchemaSignature>) -> Result<()> {
        match &self.path {
            Some(path) => write_json_atomic(path, signatures),
            None => Ok(()),
        }
    }

    /// Location of the snapshot, if persisted.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}
