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

use async_trait::async_trait;

use super::StorageMetadata;

/// A pessimistic, transactional key-value store for segment and chunk metadata.
///
/// The only unit of work which can mutate the store is a [`MetadataTransaction`]. Keys read
/// through [`MetadataTransaction::get_for_update`] acquire write intent; when a concurrent
/// transaction commits a change to such a key first, `commit` fails with
/// `Error::VersionConflict` and the caller retries its whole operation.
///
/// Implementations backed by a cache may evict entries under memory pressure, but must never
/// evict pinned entries or entries with uncommitted changes.
///
/// [`MetadataTransaction`]: crate::metadata::MetadataTransaction
/// [`MetadataTransaction::get_for_update`]: crate::metadata::MetadataTransaction::get_for_update
#[async_trait]
pub trait ChunkMetadataStore: Send + Sync {
    /// The transaction type for this store.
    type Transaction: MetadataTransaction;

    /// Read the record stored under `key` without acquiring write intent.
    ///
    /// This is the path for long-running readers; it never conflicts with writers.
    async fn get(&self, key: &str) -> crate::Result<Option<StorageMetadata>>;

    /// Begin a new transaction.
    async fn transaction(&self) -> crate::Result<Self::Transaction>;

    /// Pin the record stored under `key` so it is never evicted.
    async fn pin(&self, key: &str) -> crate::Result<()>;

    /// Remove the pin from the record stored under `key`.
    async fn unpin(&self, key: &str) -> crate::Result<()>;

    /// Return the keys of all records in the store.
    async fn keys(&self) -> crate::Result<Vec<String>>;
}

/// A single unit of work against a [`ChunkMetadataStore`].
///
/// Mutations are buffered in the transaction and applied atomically by [`commit`]. Dropping a
/// transaction without committing discards its buffered mutations.
///
/// [`ChunkMetadataStore`]: crate::metadata::ChunkMetadataStore
/// [`commit`]: crate::metadata::MetadataTransaction::commit
#[async_trait]
pub trait MetadataTransaction: Send {
    /// Read the record stored under `key`.
    ///
    /// Buffered mutations made earlier in this transaction are visible.
    async fn get(&mut self, key: &str) -> crate::Result<Option<StorageMetadata>>;

    /// Read the record stored under `key`, acquiring write intent on it.
    ///
    /// The commit will fail with `Error::VersionConflict` if another transaction commits a
    /// change to this key first.
    async fn get_for_update(&mut self, key: &str) -> crate::Result<Option<StorageMetadata>>;

    /// Buffer the creation of a record under `key`.
    ///
    /// The commit will fail with `Error::VersionConflict` if the key exists by the time this
    /// transaction commits.
    fn create(&mut self, key: &str, value: StorageMetadata);

    /// Buffer an update of the record under `key`.
    fn update(&mut self, key: &str, value: StorageMetadata);

    /// Buffer the deletion of the record under `key`.
    fn delete(&mut self, key: &str);

    /// Atomically apply all buffered mutations.
    ///
    /// # Errors
    /// - `Error::VersionConflict`: A key this transaction read for update, created, or deleted
    /// was mutated by a concurrent transaction.
    async fn commit(&mut self) -> crate::Result<()>;

    /// Discard all buffered mutations.
    async fn abort(&mut self) -> crate::Result<()>;
}
