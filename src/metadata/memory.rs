/*
 * Copyright 2019-2021 Wren Powell
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{Error, Result};

use super::store::{ChunkMetadataStore, MetadataTransaction};
use super::StorageMetadata;

/// A [`ChunkMetadataStore`] which keeps all records in memory.
///
/// Every record carries a version counter. A transaction remembers the version of each key it
/// reads for update (or expects to be absent when creating), and `commit` re-validates those
/// versions under the store lock, so two transactions racing on the same segment cannot both
/// commit.
///
/// This store never evicts entries, so pinning is tracked but has no observable effect.
///
/// [`ChunkMetadataStore`]: crate::metadata::ChunkMetadataStore
#[derive(Debug)]
pub struct MemoryMetadataStore {
    state: Arc<Mutex<StoreState>>,
}

#[derive(Debug, Default)]
struct StoreState {
    entries: HashMap<String, VersionedRecord>,
    pinned: HashSet<String>,
}

#[derive(Debug)]
struct VersionedRecord {
    value: StorageMetadata,
    version: u64,
}

impl MemoryMetadataStore {
    /// Create a new, empty store.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StoreState::default())),
        }
    }

    /// Return whether the record under `key` is pinned.
    pub fn is_pinned(&self, key: &str) -> bool {
        self.state.lock().unwrap().pinned.contains(key)
    }
}

impl Default for MemoryMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChunkMetadataStore for MemoryMetadataStore {
    type Transaction = MemoryMetadataTransaction;

    async fn get(&self, key: &str) -> Result<Option<StorageMetadata>> {
        let state = self.state.lock().unwrap();
        Ok(state.entries.get(key).map(|record| record.value.clone()))
    }

    async fn transaction(&self) -> Result<Self::Transaction> {
        Ok(MemoryMetadataTransaction {
            state: Arc::clone(&self.state),
            intents: HashMap::new(),
            writes: HashMap::new(),
        })
    }

    async fn pin(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.pinned.insert(key.to_string());
        Ok(())
    }

    async fn unpin(&self, key: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.pinned.remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        let mut keys = state.entries.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        Ok(keys)
    }
}

/// A transaction against a [`MemoryMetadataStore`].
///
/// [`MemoryMetadataStore`]: crate::metadata::MemoryMetadataStore
#[derive(Debug)]
pub struct MemoryMetadataTransaction {
    state: Arc<Mutex<StoreState>>,

    /// The version each key with write intent had when it was first read, or `None` if the key
    /// was absent (or is expected to be absent, for creations).
    intents: HashMap<String, Option<u64>>,

    /// Buffered mutations, applied at commit. `None` deletes the key.
    writes: HashMap<String, Option<StorageMetadata>>,
}

impl MemoryMetadataTransaction {
    fn read(&self, key: &str) -> Option<StorageMetadata> {
        if let Some(buffered) = self.writes.get(key) {
            return buffered.clone();
        }
        let state = self.state.lock().unwrap();
        state.entries.get(key).map(|record| record.value.clone())
    }

    fn current_version(&self, key: &str) -> Option<u64> {
        let state = self.state.lock().unwrap();
        state.entries.get(key).map(|record| record.version)
    }
}

#[async_trait]
impl MetadataTransaction for MemoryMetadataTransaction {
    async fn get(&mut self, key: &str) -> Result<Option<StorageMetadata>> {
        Ok(self.read(key))
    }

    async fn get_for_update(&mut self, key: &str) -> Result<Option<StorageMetadata>> {
        if !self.intents.contains_key(key) {
            let version = self.current_version(key);
            self.intents.insert(key.to_string(), version);
        }
        Ok(self.read(key))
    }

    fn create(&mut self, key: &str, value: StorageMetadata) {
        // Unless the key was already read in this transaction, it is expected to be absent at
        // commit time.
        self.intents.entry(key.to_string()).or_insert(None);
        self.writes.insert(key.to_string(), Some(value));
    }

    fn update(&mut self, key: &str, value: StorageMetadata) {
        self.writes.insert(key.to_string(), Some(value));
    }

    fn delete(&mut self, key: &str) {
        self.writes.insert(key.to_string(), None);
    }

    async fn commit(&mut self) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        for (key, expected) in &self.intents {
            let actual = state.entries.get(key).map(|record| record.version);
            if actual != *expected {
                return Err(Error::VersionConflict);
            }
        }

        for (key, write) in self.writes.drain() {
            match write {
                Some(value) => {
                    let version = state
                        .entries
                        .get(&key)
                        .map(|record| record.version + 1)
                        .unwrap_or(1);
                    state.entries.insert(key, VersionedRecord { value, version });
                }
                None => {
                    state.entries.remove(&key);
                    state.pinned.remove(&key);
                }
            }
        }

        self.intents.clear();
        Ok(())
    }

    async fn abort(&mut self) -> Result<()> {
        self.writes.clear();
        self.intents.clear();
        Ok(())
    }
}
