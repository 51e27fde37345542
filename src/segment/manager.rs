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

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::warn;
use once_cell::sync::OnceCell;
use uuid::Uuid;

use crate::journal::{
    is_reserved_name, ChunkAddedRecord, SystemJournal, SystemJournalRecord, TruncationRecord,
};
use crate::metadata::{
    ChunkMetadata, ChunkMetadataStore, MetadataTransaction, SegmentMetadata, SegmentStatus,
};
use crate::store::{ChunkHandle, ChunkStorage};
use crate::{Error, Result};

use super::config::{ChunkManagerConfig, RollingPolicy};
use super::handle::{SegmentHandle, SegmentInfo};

/// The engine which maps segments onto chunks.
///
/// A `ChunkManager` serves one container. It translates the segment-level operations (append,
/// read, truncate, seal, concat, delete) into chunk storage operations and metadata
/// transactions, applies the rolling policy, and keeps the [`SystemJournal`] ahead of every
/// structural change to a system segment.
///
/// A manager must be initialized with its container epoch and then bootstrapped before it
/// serves any segment operation. All operations take an optional deadline; when the deadline
/// passes the operation fails with `Error::OperationTimeout`, leaving at worst orphan chunks
/// behind, never partially updated metadata.
///
/// [`SystemJournal`]: crate::journal::SystemJournal
#[derive(Debug)]
pub struct ChunkManager<S, M: ChunkMetadataStore> {
    container_id: u32,
    chunk_storage: Arc<S>,
    metadata_store: Arc<M>,
    journal: SystemJournal<S, M>,
    config: ChunkManagerConfig,
    epoch: OnceCell<u64>,
    bootstrapped: AtomicBool,
    garbage: Mutex<Vec<GarbageEntry>>,
}

#[derive(Debug)]
struct GarbageEntry {
    chunk: String,
    due: Instant,
}

impl<S: ChunkStorage, M: ChunkMetadataStore> ChunkManager<S, M> {
    /// Create a manager for the given container.
    ///
    /// The manager is unusable until [`initialize`] and [`bootstrap`] have been called.
    ///
    /// [`initialize`]: crate::segment::ChunkManager::initialize
    /// [`bootstrap`]: crate::segment::ChunkManager::bootstrap
    pub fn new(
        container_id: u32,
        chunk_storage: Arc<S>,
        metadata_store: Arc<M>,
        config: ChunkManagerConfig,
    ) -> Self {
        let journal = SystemJournal::new(
            container_id,
            Arc::clone(&chunk_storage),
            Arc::clone(&metadata_store),
            config.clone(),
        );
        Self {
            container_id,
            chunk_storage,
            metadata_store,
            journal,
            config,
            epoch: OnceCell::new(),
            bootstrapped: AtomicBool::new(false),
            garbage: Mutex::new(Vec::new()),
        }
    }

    /// Bind the manager to its container epoch.
    ///
    /// The epoch is provided by the container lifecycle and is immutable afterwards; every
    /// mutating operation re-checks it against the owner epoch stored in segment metadata.
    ///
    /// # Errors
    /// - `Error::InvalidArgument`: The manager is already initialized.
    pub fn initialize(&self, epoch: u64) -> Result<()> {
        self.epoch
            .set(epoch)
            .map_err(|_| Error::InvalidArgument("the chunk manager is already initialized"))?;
        self.journal.set_epoch(epoch)
    }

    /// The id of the container this manager serves.
    pub fn container_id(&self) -> u32 {
        self.container_id
    }

    /// The epoch this manager was initialized with, if any.
    pub fn current_epoch(&self) -> Option<u64> {
        self.epoch.get().copied()
    }

    /// The names of the system segments of this container.
    pub fn system_segments(&self) -> &[String] {
        self.journal.system_segments()
    }

    /// Rebuild the system segments from the journal and start serving.
    ///
    /// This delegates to [`SystemJournal::bootstrap`], which repopulates the metadata store
    /// with the layout of the system segments as of the last durable state, verifies that every
    /// referenced chunk exists, writes a fresh snapshot for the current epoch, and opens a
    /// fresh journal file.
    ///
    /// # Errors
    /// - `Error::ContainerNotReady`: [`initialize`] has not been called.
    /// - `Error::Bootstrap`: Recovery failed; the container must not proceed.
    ///
    /// [`SystemJournal::bootstrap`]: crate::journal::SystemJournal::bootstrap
    /// [`initialize`]: crate::segment::ChunkManager::initialize
    pub async fn bootstrap(&self, timeout: Option<Duration>) -> Result<()> {
        with_deadline(timeout, async {
            self.epoch().ok_or(Error::ContainerNotReady)?;
            self.journal.bootstrap().await?;
            self.bootstrapped.store(true, Ordering::SeqCst);
            Ok(())
        })
        .await
    }

    /// Create a new, empty segment.
    ///
    /// When `policy` is `None` the default rolling policy from the configuration is used. The
    /// policy is fixed for the lifetime of the segment.
    ///
    /// # Errors
    /// - `Error::SegmentExists`: A segment with this name already exists.
    /// - `Error::InvalidArgument`: The name is empty or reserved for internal use.
    pub async fn create(
        &self,
        name: &str,
        policy: Option<RollingPolicy>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let policy = policy.unwrap_or(self.config.default_rolling_policy);
        with_deadline(timeout, self.with_retries(|| self.try_create(name, policy))).await
    }

    /// Open a segment for reading.
    ///
    /// Reading does not fence, so a handle from a fenced-out instance keeps working.
    ///
    /// # Errors
    /// - `Error::SegmentNotFound`: There is no segment with this name.
    pub async fn open_read(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<SegmentHandle> {
        with_deadline(timeout, async {
            self.ensure_ready()?;
            self.metadata_store
                .get(name)
                .await?
                .ok_or_else(|| Error::SegmentNotFound(name.to_string()))?
                .into_segment()?;
            Ok(SegmentHandle::read(name))
        })
        .await
    }

    /// Open a segment for writing, claiming ownership for the current epoch.
    ///
    /// # Errors
    /// - `Error::SegmentNotFound`: There is no segment with this name.
    /// - `Error::StorageNotPrimary`: The segment is owned by a newer epoch.
    pub async fn open_write(
        &self,
        name: &str,
        timeout: Option<Duration>,
    ) -> Result<SegmentHandle> {
        with_deadline(timeout, self.with_retries(|| self.try_open_write(name))).await
    }

    /// Append `data` to a segment at `offset`.
    ///
    /// The write is split across one or more chunks according to the segment's rolling policy.
    /// All metadata changes land in a single transaction, so readers observe either the
    /// pre-write or the post-write segment, never a half-linked chunk. For system segments the
    /// journal record batch is durably appended before the transaction commits.
    ///
    /// # Errors
    /// - `Error::BadOffset`: `offset` is not the current length of the segment.
    /// - `Error::SegmentSealed`: The segment is sealed.
    /// - `Error::StorageNotPrimary`: The segment is not owned by the current epoch.
    pub async fn write(
        &self,
        handle: &SegmentHandle,
        offset: u64,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<()> {
        if handle.is_read_only() {
            return Err(Error::InvalidArgument(
                "cannot write through a read-only segment handle",
            ));
        }
        with_deadline(
            timeout,
            self.with_retries(|| self.try_write(handle.name(), offset, data)),
        )
        .await
    }

    /// Read from a segment at `offset`, filling `buf`, and return the number of bytes read.
    ///
    /// # Errors
    /// - `Error::OutOfBounds`: The range is outside `[start_offset, length)`.
    pub async fn read(
        &self,
        handle: &SegmentHandle,
        offset: u64,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        match timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.read_inner(handle.name(), offset, buf))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::OperationTimeout),
                }
            }
            None => self.read_inner(handle.name(), offset, buf).await,
        }
    }

    /// Advance the start offset of a segment, discarding the bytes before it.
    ///
    /// Chunks which end at or before `new_start_offset` are unlinked and queued for garbage
    /// collection. The chunk containing `new_start_offset` becomes the first chunk, which is
    /// why the first chunk can start before the segment's start offset.
    ///
    /// # Errors
    /// - `Error::BadOffset`: `new_start_offset` is outside `[start_offset, length]`.
    /// - `Error::SegmentSealed`: The segment is sealed.
    /// - `Error::StorageNotPrimary`: The segment is not owned by the current epoch.
    pub async fn truncate(
        &self,
        handle: &SegmentHandle,
        new_start_offset: u64,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if handle.is_read_only() {
            return Err(Error::InvalidArgument(
                "cannot truncate through a read-only segment handle",
            ));
        }
        with_deadline(
            timeout,
            self.with_retries(|| self.try_truncate(handle.name(), new_start_offset)),
        )
        .await
    }

    /// Seal a segment, rejecting all further writes and truncations.
    ///
    /// Sealing an already sealed segment does nothing.
    ///
    /// # Errors
    /// - `Error::StorageNotPrimary`: The segment is not owned by the current epoch.
    pub async fn seal(&self, handle: &SegmentHandle, timeout: Option<Duration>) -> Result<()> {
        if handle.is_read_only() {
            return Err(Error::InvalidArgument(
                "cannot seal through a read-only segment handle",
            ));
        }
        with_deadline(timeout, self.with_retries(|| self.try_seal(handle.name()))).await
    }

    /// Append all bytes of the sealed segment `source` onto `target` at `target_offset`.
    ///
    /// When the backend supports server-side concat and the target's last chunk is already
    /// full, the source's chunks are relinked into the target without moving any bytes;
    /// otherwise the source is copied through the target's rolling pipeline. The source segment
    /// is removed on success.
    ///
    /// # Errors
    /// - `Error::BadOffset`: `target_offset` is not the current length of the target.
    /// - `Error::InvalidArgument`: The source is not sealed, is truncated, or is a system
    /// segment.
    pub async fn concat(
        &self,
        target: &SegmentHandle,
        target_offset: u64,
        source: &str,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if target.is_read_only() {
            return Err(Error::InvalidArgument(
                "cannot concat through a read-only segment handle",
            ));
        }
        with_deadline(
            timeout,
            self.with_retries(|| self.try_concat(target.name(), target_offset, source)),
        )
        .await
    }

    /// Delete a segment and schedule all of its chunks for deletion.
    ///
    /// # Errors
    /// - `Error::SegmentNotFound`: There is no segment with this name.
    /// - `Error::StorageNotPrimary`: The segment is not owned by the current epoch.
    /// - `Error::InvalidArgument`: The segment is a system segment.
    pub async fn delete(&self, handle: &SegmentHandle, timeout: Option<Duration>) -> Result<()> {
        if handle.is_read_only() {
            return Err(Error::InvalidArgument(
                "cannot delete through a read-only segment handle",
            ));
        }
        with_deadline(timeout, self.with_retries(|| self.try_delete(handle.name()))).await
    }

    /// Return information about a segment.
    ///
    /// # Errors
    /// - `Error::SegmentNotFound`: There is no segment with this name.
    pub async fn info(&self, name: &str, timeout: Option<Duration>) -> Result<SegmentInfo> {
        with_deadline(timeout, async {
            self.ensure_ready()?;
            let segment = self
                .metadata_store
                .get(name)
                .await?
                .ok_or_else(|| Error::SegmentNotFound(name.to_string()))?
                .into_segment()?;
            Ok(SegmentInfo::from(&segment))
        })
        .await
    }

    /// List all segments of this container.
    pub async fn list_segments(&self, timeout: Option<Duration>) -> Result<Vec<SegmentInfo>> {
        with_deadline(timeout, async {
            self.ensure_ready()?;
            let mut segments = Vec::new();
            for key in self.metadata_store.keys().await? {
                if let Some(crate::metadata::StorageMetadata::Segment(segment)) =
                    self.metadata_store.get(&key).await?
                {
                    segments.push(SegmentInfo::from(&segment));
                }
            }
            Ok(segments)
        })
        .await
    }

    /// Queue every chunk under the segment's name prefix which its metadata does not
    /// reference, and return how many were queued.
    ///
    /// Orphan chunks are a normal consequence of failed or cancelled writes; they never affect
    /// correctness and are reclaimed here. Freshly written chunks are protected by the garbage
    /// collection delay, which outlasts any in-flight transaction.
    pub async fn sweep_orphans(&self, name: &str, timeout: Option<Duration>) -> Result<usize> {
        with_deadline(timeout, async {
            self.ensure_ready()?;
            let segment = self
                .metadata_store
                .get(name)
                .await?
                .ok_or_else(|| Error::SegmentNotFound(name.to_string()))?
                .into_segment()?;

            let mut referenced = HashSet::new();
            let mut cursor = segment.first_chunk.clone();
            while let Some(chunk_name) = cursor {
                let chunk = self
                    .metadata_store
                    .get(&chunk_name)
                    .await?
                    .ok_or_else(|| {
                        Error::CorruptMetadata(format!(
                            "chunk `{}` of segment `{}` has no metadata record",
                            chunk_name, name
                        ))
                    })?
                    .into_chunk()?;
                cursor = chunk.next_chunk.clone();
                referenced.insert(chunk_name);
            }

            let listed = self
                .chunk_storage
                .list(&format!("{}.E-", name))
                .await?;
            let mut queued = 0;
            for chunk in listed {
                if !referenced.contains(&chunk.name) {
                    self.queue_garbage(vec![chunk.name]);
                    queued += 1;
                }
            }
            Ok(queued)
        })
        .await
    }

    /// Delete every queued garbage chunk whose delay has passed, and return how many were
    /// deleted.
    ///
    /// Failures are logged and the chunk is dropped from the queue; a later orphan sweep will
    /// find it again.
    pub async fn collect_garbage(&self) -> usize {
        let now = Instant::now();
        let due = {
            let mut queue = self.garbage.lock().unwrap();
            let mut due = Vec::new();
            queue.retain(|entry| {
                if entry.due <= now {
                    due.push(entry.chunk.clone());
                    false
                } else {
                    true
                }
            });
            due
        };

        let mut deleted = 0;
        for chunk in due {
            match self.chunk_storage.delete(&chunk).await {
                Ok(()) | Err(Error::ChunkNotFound(_)) => deleted += 1,
                Err(error) => warn!("could not delete garbage chunk `{}`: {}", chunk, error),
            }
        }
        deleted
    }

    /// The number of chunks currently waiting in the garbage queue.
    pub fn pending_garbage(&self) -> usize {
        self.garbage.lock().unwrap().len()
    }

    fn epoch(&self) -> Option<u64> {
        self.epoch.get().copied()
    }

    fn ensure_ready(&self) -> Result<u64> {
        if !self.bootstrapped.load(Ordering::SeqCst) {
            return Err(Error::ContainerNotReady);
        }
        self.epoch().ok_or(Error::ContainerNotReady)
    }

    /// Retry an operation on metadata version conflicts with doubling backoff.
    async fn with_retries<T, F, Fut>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Err(Error::VersionConflict) if attempt < self.config.max_metadata_retries => {
                    attempt += 1;
                    let backoff = self.config.retry_base_delay * 2u32.saturating_pow(attempt - 1);
                    tokio::time::sleep(backoff).await;
                }
                result => return result,
            }
        }
    }

    /// Append the journal records, then commit; abort and propagate on any failure.
    ///
    /// The journal append must succeed before the metadata transaction commits. If the commit
    /// fails afterwards, the already-durable records describe a state which never became
    /// current, and recovery will skip them.
    async fn finish(
        &self,
        mut transaction: M::Transaction,
        result: Result<Vec<SystemJournalRecord>>,
    ) -> Result<()> {
        match result {
            Ok(records) => {
                let pins = records
                    .iter()
                    .filter_map(|record| match record {
                        SystemJournalRecord::ChunkAdded(record) => {
                            Some(record.new_chunk_name.clone())
                        }
                        _ => None,
                    })
                    .collect::<Vec<_>>();
                if !records.is_empty() {
                    if let Err(error) = self.journal.append_records(records).await {
                        transaction.abort().await.ok();
                        return Err(error);
                    }
                }
                transaction.commit().await?;
                for chunk in pins {
                    if let Err(error) = self.metadata_store.pin(&chunk).await {
                        warn!("could not pin system chunk record `{}`: {}", chunk, error);
                    }
                }
                Ok(())
            }
            Err(error) => {
                transaction.abort().await.ok();
                Err(error)
            }
        }
    }

    async fn try_create(&self, name: &str, policy: RollingPolicy) -> Result<()> {
        let epoch = self.ensure_ready()?;
        if name.is_empty() {
            return Err(Error::InvalidArgument("segment names cannot be empty"));
        }
        if is_reserved_name(name) || name.starts_with("_system/") {
            return Err(Error::InvalidArgument("segment name is reserved"));
        }
        let mut transaction = self.metadata_store.transaction().await?;
        if transaction.get(name).await?.is_some() {
            transaction.abort().await.ok();
            return Err(Error::SegmentExists(name.to_string()));
        }
        transaction.create(name, SegmentMetadata::new(name, policy, epoch).into());
        transaction.commit().await
    }

    async fn try_open_write(&self, name: &str) -> Result<SegmentHandle> {
        let epoch = self.ensure_ready()?;
        let mut transaction = self.metadata_store.transaction().await?;
        let mut segment = match transaction.get_for_update(name).await? {
            Some(record) => record.into_segment()?,
            None => {
                transaction.abort().await.ok();
                return Err(Error::SegmentNotFound(name.to_string()));
            }
        };
        if segment.owner_epoch > epoch {
            transaction.abort().await.ok();
            return Err(Error::StorageNotPrimary(name.to_string()));
        }
        if segment.owner_epoch < epoch {
            segment.owner_epoch = epoch;
            segment.touch();
            transaction.update(name, segment.into());
            transaction.commit().await?;
        } else {
            transaction.abort().await.ok();
        }
        Ok(SegmentHandle::write(name))
    }

    async fn try_write(&self, name: &str, offset: u64, data: &[u8]) -> Result<()> {
        let epoch = self.ensure_ready()?;
        let mut transaction = self.metadata_store.transaction().await?;
        let mut created = Vec::new();
        let result = self
            .write_in_transaction(&mut transaction, name, offset, data, epoch, &mut created)
            .await;
        let outcome = self.finish(transaction, result).await;
        if outcome.is_err() {
            // Nothing we created got linked; reclaim it later.
            self.queue_garbage(created);
        }
        outcome
    }

    async fn write_in_transaction(
        &self,
        transaction: &mut M::Transaction,
        name: &str,
        offset: u64,
        data: &[u8],
        epoch: u64,
        created: &mut Vec<String>,
    ) -> Result<Vec<SystemJournalRecord>> {
        let mut segment = transaction
            .get_for_update(name)
            .await?
            .ok_or_else(|| Error::SegmentNotFound(name.to_string()))?
            .into_segment()?;
        if segment.is_sealed() {
            return Err(Error::SegmentSealed(name.to_string()));
        }
        if segment.owner_epoch != epoch {
            return Err(Error::StorageNotPrimary(name.to_string()));
        }
        if offset != segment.length {
            return Err(Error::BadOffset {
                segment: name.to_string(),
                offset,
            });
        }

        let mut records = Vec::new();
        self.append_in_transaction(transaction, &mut segment, data, epoch, &mut records, created)
            .await?;
        segment.touch();
        transaction.update(name, segment.into());
        Ok(records)
    }

    /// Split `data` across chunks per the rolling policy and link them into `segment`.
    ///
    /// Chunk records and the previous chunk's link are updated through `transaction`; segment
    /// tallies are updated in place. Names of chunks created here are pushed to `created` so
    /// the caller can reclaim them if the transaction never commits.
    async fn append_in_transaction(
        &self,
        transaction: &mut M::Transaction,
        segment: &mut SegmentMetadata,
        data: &[u8],
        epoch: u64,
        records: &mut Vec<SystemJournalRecord>,
        created: &mut Vec<String>,
    ) -> Result<()> {
        let journaled = segment.is_system();
        let max_chunk = segment
            .max_rolling_length
            .min(self.config.max_chunk_size)
            .max(1);
        let mut remaining = data;
        let mut force_roll = false;

        while !remaining.is_empty() {
            let extend_target = if force_roll || !self.chunk_storage.supports_append() {
                None
            } else {
                segment.last_chunk.clone().and_then(|last| {
                    let used = segment.last_chunk_length();
                    if used < max_chunk {
                        Some((last, used))
                    } else {
                        None
                    }
                })
            };

            match extend_target {
                Some((last_name, used)) => {
                    let take = ((max_chunk - used) as usize).min(remaining.len());
                    let handle = ChunkHandle::write(last_name.as_str());
                    match self
                        .chunk_storage
                        .write(&handle, used, &remaining[..take])
                        .await
                    {
                        Ok(_) => {
                            let mut chunk = transaction
                                .get(&last_name)
                                .await?
                                .ok_or_else(|| {
                                    Error::CorruptMetadata(format!(
                                        "chunk `{}` of segment `{}` has no metadata record",
                                        last_name, segment.name
                                    ))
                                })?
                                .into_chunk()?;
                            chunk.length += take as u64;
                            transaction.update(&last_name, chunk.into());
                            segment.length += take as u64;
                            remaining = &remaining[take..];
                        }
                        Err(Error::InvalidOffset { .. }) => {
                            // The chunk is physically longer than our view of it: a fenced-out
                            // owner appended to it. Those bytes are past the metadata length
                            // and unreachable; close the chunk and roll to a fresh one.
                            warn!(
                                "chunk `{}` of segment `{}` grew outside this epoch; rolling over",
                                last_name, segment.name
                            );
                            force_roll = true;
                        }
                        Err(error) => return Err(error),
                    }
                }
                None => {
                    let chunk_name = new_chunk_name(&segment.name, epoch, segment.length);
                    let take = (max_chunk as usize).min(remaining.len());
                    let handle = self.chunk_storage.create(&chunk_name).await?;
                    created.push(chunk_name.clone());
                    self.chunk_storage
                        .write(&handle, 0, &remaining[..take])
                        .await?;

                    let old_chunk = segment.last_chunk.clone();
                    if let Some(previous) = &old_chunk {
                        let mut chunk = transaction
                            .get(previous)
                            .await?
                            .ok_or_else(|| {
                                Error::CorruptMetadata(format!(
                                    "chunk `{}` of segment `{}` has no metadata record",
                                    previous, segment.name
                                ))
                            })?
                            .into_chunk()?;
                        chunk.next_chunk = Some(chunk_name.clone());
                        transaction.update(previous, chunk.into());
                    } else {
                        segment.first_chunk = Some(chunk_name.clone());
                        segment.first_chunk_start_offset = segment.length;
                    }
                    transaction.create(
                        &chunk_name,
                        ChunkMetadata::new(chunk_name.as_str(), take as u64).into(),
                    );
                    if journaled {
                        records.push(SystemJournalRecord::ChunkAdded(ChunkAddedRecord {
                            segment_name: segment.name.clone(),
                            new_chunk_name: chunk_name.clone(),
                            old_chunk_name: old_chunk,
                            offset: segment.length,
                        }));
                    }
                    segment.last_chunk = Some(chunk_name);
                    segment.last_chunk_start_offset = segment.length;
                    segment.length += take as u64;
                    segment.chunk_count += 1;
                    remaining = &remaining[take..];
                    force_roll = false;
                }
            }
        }
        Ok(())
    }

    async fn read_inner(&self, name: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.ensure_ready()?;
        let segment = self
            .metadata_store
            .get(name)
            .await?
            .ok_or_else(|| Error::SegmentNotFound(name.to_string()))?
            .into_segment()?;
        if offset < segment.start_offset || offset + buf.len() as u64 > segment.length {
            return Err(Error::OutOfBounds(name.to_string()));
        }
        if buf.is_empty() {
            return Ok(0);
        }

        let mut cursor = segment.first_chunk.clone();
        let mut chunk_start = segment.first_chunk_start_offset;
        let mut position = offset;
        let mut filled = 0;
        while filled < buf.len() {
            let chunk_name = match cursor {
                Some(chunk_name) => chunk_name,
                None => {
                    return Err(Error::CorruptMetadata(format!(
                        "the chunk list of segment `{}` ends before offset {}",
                        name, position
                    )))
                }
            };
            let chunk = self
                .metadata_store
                .get(&chunk_name)
                .await?
                .ok_or_else(|| {
                    Error::CorruptMetadata(format!(
                        "chunk `{}` of segment `{}` has no metadata record",
                        chunk_name, name
                    ))
                })?
                .into_chunk()?;
            let chunk_end = chunk_start + chunk.length;
            if position >= chunk_end {
                chunk_start = chunk_end;
                cursor = chunk.next_chunk;
                continue;
            }

            let local = position - chunk_start;
            let take = ((chunk.length - local) as usize).min(buf.len() - filled);
            self.chunk_storage
                .read(
                    &ChunkHandle::read(chunk_name.as_str()),
                    local,
                    &mut buf[filled..filled + take],
                )
                .await?;
            filled += take;
            position += take as u64;
            chunk_start = chunk_end;
            cursor = chunk.next_chunk;
        }
        Ok(filled)
    }

    async fn try_truncate(&self, name: &str, new_start_offset: u64) -> Result<()> {
        let epoch = self.ensure_ready()?;
        let mut transaction = self.metadata_store.transaction().await?;
        let result = self
            .truncate_in_transaction(&mut transaction, name, new_start_offset, epoch)
            .await;
        let (result, garbage) = match result {
            Ok((records, garbage)) => (Ok(records), garbage),
            Err(error) => (Err(error), Vec::new()),
        };
        self.finish(transaction, result).await?;
        for chunk in &garbage {
            self.metadata_store.unpin(chunk).await.ok();
        }
        self.queue_garbage(garbage);
        Ok(())
    }

    async fn truncate_in_transaction(
        &self,
        transaction: &mut M::Transaction,
        name: &str,
        new_start_offset: u64,
        epoch: u64,
    ) -> Result<(Vec<SystemJournalRecord>, Vec<String>)> {
        let mut segment = transaction
            .get_for_update(name)
            .await?
            .ok_or_else(|| Error::SegmentNotFound(name.to_string()))?
            .into_segment()?;
        if segment.is_sealed() {
            return Err(Error::SegmentSealed(name.to_string()));
        }
        if segment.owner_epoch != epoch {
            return Err(Error::StorageNotPrimary(name.to_string()));
        }
        if new_start_offset < segment.start_offset || new_start_offset > segment.length {
            return Err(Error::BadOffset {
                segment: name.to_string(),
                offset: new_start_offset,
            });
        }
        if new_start_offset == segment.start_offset {
            return Ok((Vec::new(), Vec::new()));
        }

        let mut garbage = Vec::new();
        let mut cursor = segment.first_chunk.clone();
        let mut cumulative = segment.first_chunk_start_offset;
        while let Some(chunk_name) = cursor.clone() {
            let chunk = transaction
                .get(&chunk_name)
                .await?
                .ok_or_else(|| {
                    Error::CorruptMetadata(format!(
                        "chunk `{}` of segment `{}` has no metadata record",
                        chunk_name, name
                    ))
                })?
                .into_chunk()?;
            let chunk_end = cumulative + chunk.length;
            if chunk_end > new_start_offset {
                break;
            }
            transaction.delete(&chunk_name);
            garbage.push(chunk_name);
            cumulative = chunk_end;
            cursor = chunk.next_chunk;
        }

        match &cursor {
            Some(first) => {
                segment.first_chunk = Some(first.clone());
                segment.first_chunk_start_offset = cumulative;
            }
            None => {
                segment.first_chunk = None;
                segment.last_chunk = None;
                segment.first_chunk_start_offset = segment.length;
                segment.last_chunk_start_offset = segment.length;
            }
        }
        segment.chunk_count -= garbage.len() as u32;
        segment.start_offset = new_start_offset;
        segment.touch();

        let mut records = Vec::new();
        if segment.is_system() {
            records.push(SystemJournalRecord::Truncation(TruncationRecord {
                segment_name: name.to_string(),
                offset: new_start_offset,
                first_chunk_name: segment.first_chunk.clone(),
                start_offset: segment.first_chunk_start_offset,
            }));
        }
        transaction.update(name, segment.into());
        Ok((records, garbage))
    }

    async fn try_seal(&self, name: &str) -> Result<()> {
        let epoch = self.ensure_ready()?;
        let mut transaction = self.metadata_store.transaction().await?;
        let mut segment = match transaction.get_for_update(name).await? {
            Some(record) => record.into_segment()?,
            None => {
                transaction.abort().await.ok();
                return Err(Error::SegmentNotFound(name.to_string()));
            }
        };
        if segment.is_system() {
            transaction.abort().await.ok();
            return Err(Error::InvalidArgument("cannot seal a system segment"));
        }
        if segment.owner_epoch != epoch {
            transaction.abort().await.ok();
            return Err(Error::StorageNotPrimary(name.to_string()));
        }
        if segment.is_sealed() {
            transaction.abort().await.ok();
            return Ok(());
        }
        segment.status |= SegmentStatus::SEALED;
        segment.touch();
        transaction.update(name, segment.into());
        transaction.commit().await
    }

    async fn try_delete(&self, name: &str) -> Result<()> {
        let epoch = self.ensure_ready()?;
        let mut transaction = self.metadata_store.transaction().await?;
        let result = self.delete_in_transaction(&mut transaction, name, epoch).await;
        let (result, garbage) = match result {
            Ok(garbage) => (Ok(Vec::new()), garbage),
            Err(error) => (Err(error), Vec::new()),
        };
        self.finish(transaction, result).await?;
        for chunk in &garbage {
            self.metadata_store.unpin(chunk).await.ok();
        }
        self.queue_garbage(garbage);
        Ok(())
    }

    async fn delete_in_transaction(
        &self,
        transaction: &mut M::Transaction,
        name: &str,
        epoch: u64,
    ) -> Result<Vec<String>> {
        let segment = transaction
            .get_for_update(name)
            .await?
            .ok_or_else(|| Error::SegmentNotFound(name.to_string()))?
            .into_segment()?;
        if segment.is_system() {
            return Err(Error::InvalidArgument("cannot delete a system segment"));
        }
        if segment.owner_epoch != epoch {
            return Err(Error::StorageNotPrimary(name.to_string()));
        }

        let mut garbage = Vec::new();
        let mut cursor = segment.first_chunk.clone();
        while let Some(chunk_name) = cursor {
            let chunk = transaction
                .get(&chunk_name)
                .await?
                .ok_or_else(|| {
                    Error::CorruptMetadata(format!(
                        "chunk `{}` of segment `{}` has no metadata record",
                        chunk_name, name
                    ))
                })?
                .into_chunk()?;
            transaction.delete(&chunk_name);
            cursor = chunk.next_chunk;
            garbage.push(chunk_name);
        }
        transaction.delete(name);
        Ok(garbage)
    }

    async fn try_concat(&self, target: &str, target_offset: u64, source: &str) -> Result<()> {
        let epoch = self.ensure_ready()?;
        let mut transaction = self.metadata_store.transaction().await?;
        let mut created = Vec::new();
        let result = self
            .concat_in_transaction(
                &mut transaction,
                target,
                target_offset,
                source,
                epoch,
                &mut created,
            )
            .await;
        let (result, garbage) = match result {
            Ok((records, garbage)) => (Ok(records), garbage),
            Err(error) => (Err(error), Vec::new()),
        };
        let outcome = self.finish(transaction, result).await;
        match outcome {
            Ok(()) => {
                self.queue_garbage(garbage);
                Ok(())
            }
            Err(error) => {
                self.queue_garbage(created);
                Err(error)
            }
        }
    }

    async fn concat_in_transaction(
        &self,
        transaction: &mut M::Transaction,
        target: &str,
        target_offset: u64,
        source: &str,
        epoch: u64,
        created: &mut Vec<String>,
    ) -> Result<(Vec<SystemJournalRecord>, Vec<String>)> {
        let mut target_segment = transaction
            .get_for_update(target)
            .await?
            .ok_or_else(|| Error::SegmentNotFound(target.to_string()))?
            .into_segment()?;
        let source_segment = transaction
            .get_for_update(source)
            .await?
            .ok_or_else(|| Error::SegmentNotFound(source.to_string()))?
            .into_segment()?;

        if source_segment.is_system() {
            return Err(Error::InvalidArgument(
                "cannot concat a system segment into another segment",
            ));
        }
        if target_segment.is_sealed() {
            return Err(Error::SegmentSealed(target.to_string()));
        }
        if target_segment.owner_epoch != epoch {
            return Err(Error::StorageNotPrimary(target.to_string()));
        }
        if !source_segment.is_sealed() {
            return Err(Error::InvalidArgument("the concat source must be sealed"));
        }
        if source_segment.start_offset != 0 {
            return Err(Error::InvalidArgument(
                "cannot concat a truncated segment",
            ));
        }
        if target_offset != target_segment.length {
            return Err(Error::BadOffset {
                segment: target.to_string(),
                offset: target_offset,
            });
        }

        let mut records = Vec::new();
        let mut garbage = Vec::new();

        if source_segment.length == 0 {
            transaction.delete(source);
            target_segment.touch();
            transaction.update(target, target_segment.into());
            return Ok((records, garbage));
        }

        let max_chunk = target_segment
            .max_rolling_length
            .min(self.config.max_chunk_size)
            .max(1);
        let last_chunk_full = match &target_segment.last_chunk {
            Some(_) => target_segment.last_chunk_length() >= max_chunk,
            None => true,
        };
        let relink = self.chunk_storage.supports_concat()
            && last_chunk_full
            && source_segment.length >= self.config.min_size_for_concat;

        if relink {
            // The source's chunks become the target's chunks without moving a byte.
            let old_last = target_segment.last_chunk.clone();
            if target_segment.is_system() {
                let mut old_chunk = old_last.clone();
                let mut cumulative = 0;
                let mut cursor = source_segment.first_chunk.clone();
                while let Some(chunk_name) = cursor {
                    let chunk = transaction
                        .get(&chunk_name)
                        .await?
                        .ok_or_else(|| {
                            Error::CorruptMetadata(format!(
                                "chunk `{}` of segment `{}` has no metadata record",
                                chunk_name, source
                            ))
                        })?
                        .into_chunk()?;
                    records.push(SystemJournalRecord::ChunkAdded(ChunkAddedRecord {
                        segment_name: target.to_string(),
                        new_chunk_name: chunk_name.clone(),
                        old_chunk_name: old_chunk.clone(),
                        offset: target_segment.length + cumulative,
                    }));
                    cumulative += chunk.length;
                    old_chunk = Some(chunk_name);
                    cursor = chunk.next_chunk;
                }
            }

            match &old_last {
                Some(previous) => {
                    let mut chunk = transaction
                        .get(previous)
                        .await?
                        .ok_or_else(|| {
                            Error::CorruptMetadata(format!(
                                "chunk `{}` of segment `{}` has no metadata record",
                                previous, target
                            ))
                        })?
                        .into_chunk()?;
                    chunk.next_chunk = source_segment.first_chunk.clone();
                    transaction.update(previous, chunk.into());
                }
                None => {
                    target_segment.first_chunk = source_segment.first_chunk.clone();
                    target_segment.first_chunk_start_offset = target_segment.length;
                }
            }
            target_segment.last_chunk = source_segment.last_chunk.clone();
            target_segment.last_chunk_start_offset =
                target_segment.length + source_segment.last_chunk_start_offset;
            target_segment.length += source_segment.length;
            target_segment.chunk_count += source_segment.chunk_count;
        } else {
            // Copy the source through the target's rolling pipeline, chunk by chunk.
            let mut cursor = source_segment.first_chunk.clone();
            while let Some(chunk_name) = cursor {
                let chunk = transaction
                    .get(&chunk_name)
                    .await?
                    .ok_or_else(|| {
                        Error::CorruptMetadata(format!(
                            "chunk `{}` of segment `{}` has no metadata record",
                            chunk_name, source
                        ))
                    })?
                    .into_chunk()?;
                let mut data = vec![0; chunk.length as usize];
                if !data.is_empty() {
                    self.chunk_storage
                        .read(&ChunkHandle::read(chunk_name.as_str()), 0, &mut data)
                        .await?;
                    self.append_in_transaction(
                        transaction,
                        &mut target_segment,
                        &data,
                        epoch,
                        &mut records,
                        created,
                    )
                    .await?;
                }
                transaction.delete(&chunk_name);
                cursor = chunk.next_chunk;
                garbage.push(chunk_name);
            }
        }

        transaction.delete(source);
        target_segment.touch();
        transaction.update(target, target_segment.into());
        Ok((records, garbage))
    }

    fn queue_garbage(&self, chunks: Vec<String>) {
        if chunks.is_empty() {
            return;
        }
        let due = Instant::now() + self.config.garbage_collection_delay;
        let mut queue = self.garbage.lock().unwrap();
        queue.extend(
            chunks
                .into_iter()
                .map(|chunk| GarbageEntry { chunk, due }),
        );
    }
}

/// Generate a unique chunk name under the segment's name prefix.
///
/// The prefix is what lets the orphan sweep enumerate every chunk ever created for a segment;
/// the epoch and offset make the name meaningful in storage listings.
fn new_chunk_name(segment: &str, epoch: u64, offset: u64) -> String {
    format!(
        "{}.E-{}-O-{}-{}",
        segment,
        epoch,
        offset,
        Uuid::new_v4().to_simple()
    )
}

async fn with_deadline<T, F>(deadline: Option<Duration>, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match deadline {
        Some(limit) => match tokio::time::timeout(limit, operation).await {
            Ok(result) => result,
            Err(_) => Err(Error::OperationTimeout),
        },
        None => operation.await,
    }
}
