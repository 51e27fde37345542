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

//! The write-ahead log for system segments.
//!
//! System segments store the metadata of every other segment, so their own layout cannot live
//! only in the metadata store: after a failover the new container instance has to rebuild it
//! from chunk storage alone. The [`SystemJournal`] makes that possible by recording every
//! structural change to a system segment (a chunk added, a truncation) as a durable record
//! batch, and by periodically writing a snapshot of all system segments.
//!
//! Each record batch is appended to the current journal file before the metadata transaction
//! which it describes is committed. On recovery, the journal picks the newest snapshot written
//! by an older epoch and replays the batches after it, validating every record against the
//! evolving state. Records written by a fenced-out predecessor describe a chunk chain that
//! diverges from the surviving one, so they fail validation and are skipped; garbage bytes a
//! predecessor appended to a journal file fail to decode and end replay of that file.
//!
//! [`SystemJournal`]: crate::journal::SystemJournal

pub use self::record::{
    ChunkAddedRecord, SegmentSnapshotRecord, SystemJournalRecord, SystemJournalRecordBatch,
    SystemSnapshotRecord, TruncationRecord,
};

mod record;
pub mod serialize;

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use tokio::sync::Mutex;

use crate::metadata::{
    ChunkMetadata, ChunkMetadataStore, MetadataTransaction, SegmentMetadata, SegmentStatus,
};
use crate::segment::ChunkManagerConfig;
use crate::store::{ChunkHandle, ChunkStorage};
use crate::{Error, Result};

/// The name prefix of journal record-batch chunks.
const JOURNAL_NAME_PREFIX: &str = "_sysjournal";

/// The name prefix of snapshot chunks.
const SNAPSHOT_NAME_PREFIX: &str = "_syssnapshot";

/// The namespace of the segments which store container-level metadata.
const SYSTEM_SEGMENT_NAMESPACE: &str = "_system/containers";

/// Return the names of the canonical system segments for a container.
///
/// These segments are declared to exist by this mapping; they have no creation event.
pub fn system_segments(container_id: u32) -> Vec<String> {
    vec![
        format!("{}/metadata_{}", SYSTEM_SEGMENT_NAMESPACE, container_id),
        format!(
            "{}/metadata_{}$attributes.index",
            SYSTEM_SEGMENT_NAMESPACE, container_id
        ),
        format!("{}/storage_metadata_{}", SYSTEM_SEGMENT_NAMESPACE, container_id),
        format!(
            "{}/storage_metadata_{}$attributes.index",
            SYSTEM_SEGMENT_NAMESPACE, container_id
        ),
    ]
}

/// Return whether `name` is reserved for journal or snapshot chunks.
pub(crate) fn is_reserved_name(name: &str) -> bool {
    name.starts_with(JOURNAL_NAME_PREFIX) || name.starts_with(SNAPSHOT_NAME_PREFIX)
}

fn journal_prefix(container_id: u32) -> String {
    format!("{}.c{}.", JOURNAL_NAME_PREFIX, container_id)
}

fn snapshot_prefix(container_id: u32) -> String {
    format!("{}.c{}.", SNAPSHOT_NAME_PREFIX, container_id)
}

fn journal_file_name(container_id: u32, epoch: u64, file: u64) -> String {
    format!("{}e{}.f{}", journal_prefix(container_id), epoch, file)
}

fn journal_batch_name(container_id: u32, epoch: u64, file: u64, batch: u64) -> String {
    format!("{}.b{}", journal_file_name(container_id, epoch, file), batch)
}

fn snapshot_name(container_id: u32, epoch: u64, index: u64) -> String {
    format!("{}e{}.s{}", snapshot_prefix(container_id), epoch, index)
}

/// The position of a record-batch chunk in the journal's total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct JournalChunkId {
    epoch: u64,
    file: u64,
    batch: u64,
}

fn parse_journal_name(container_id: u32, name: &str) -> Option<JournalChunkId> {
    let rest = name.strip_prefix(&journal_prefix(container_id))?;
    let mut parts = rest.split('.');
    let epoch = parts.next()?.strip_prefix('e')?.parse().ok()?;
    let file = parts.next()?.strip_prefix('f')?.parse().ok()?;
    let batch = match parts.next() {
        Some(part) => part.strip_prefix('b')?.parse().ok()?,
        None => 0,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(JournalChunkId { epoch, file, batch })
}

fn parse_snapshot_name(container_id: u32, name: &str) -> Option<(u64, u64)> {
    let rest = name.strip_prefix(&snapshot_prefix(container_id))?;
    let mut parts = rest.split('.');
    let epoch = parts.next()?.strip_prefix('e')?.parse().ok()?;
    let index = parts.next()?.strip_prefix('s')?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((epoch, index))
}

/// The state of a single system segment while it is being rebuilt.
#[derive(Debug)]
struct RecoveredSegment {
    segment: SegmentMetadata,
    chunks: HashMap<String, ChunkMetadata>,
}

impl RecoveredSegment {
    fn empty(name: &str, config: &ChunkManagerConfig, epoch: u64) -> Self {
        let mut segment =
            SegmentMetadata::new(name, config.default_rolling_policy, epoch);
        segment.status |= SegmentStatus::SYSTEM;
        Self {
            segment,
            chunks: HashMap::new(),
        }
    }
}

/// The write-ahead log and snapshot engine for the system segments of one container.
///
/// All appends for a container serialize through this value, which gives journal records a
/// global order. The journal only reads and writes chunk storage and the metadata store; the
/// [`ChunkManager`] drives it.
///
/// [`ChunkManager`]: crate::segment::ChunkManager
#[derive(Debug)]
pub struct SystemJournal<S, M> {
    chunk_storage: Arc<S>,
    metadata_store: Arc<M>,
    container_id: u32,
    epoch: OnceCell<u64>,
    config: ChunkManagerConfig,
    system_segments: Vec<String>,
    state: Mutex<WriterState>,
}

#[derive(Debug, Default)]
struct WriterState {
    /// The index of the journal file currently being written.
    file_index: u64,

    /// The index of the next batch within the current file. Only meaningful on backends
    /// without append support, where every batch is its own chunk.
    next_batch_index: u64,

    /// The number of bytes written to the current file.
    file_length: u64,

    /// The chunk holding the current file, once it has been created. Always `None` on backends
    /// without append support.
    current_file: Option<ChunkHandle>,

    /// The number of records appended since the last snapshot.
    records_since_snapshot: u64,

    /// The index of the next snapshot to write for this epoch.
    next_snapshot_index: u64,
}

impl<S: ChunkStorage, M: ChunkMetadataStore> SystemJournal<S, M> {
    /// Create a journal for the given container.
    ///
    /// The journal is not usable until [`set_epoch`] is called.
    ///
    /// [`set_epoch`]: crate::journal::SystemJournal::set_epoch
    pub fn new(
        container_id: u32,
        chunk_storage: Arc<S>,
        metadata_store: Arc<M>,
        config: ChunkManagerConfig,
    ) -> Self {
        Self {
            chunk_storage,
            metadata_store,
            container_id,
            epoch: OnceCell::new(),
            system_segments: system_segments(container_id),
            config,
            state: Mutex::new(WriterState::default()),
        }
    }

    /// The names of the system segments this journal covers.
    pub fn system_segments(&self) -> &[String] {
        &self.system_segments
    }

    /// Return whether `name` is one of the system segments of this container.
    pub fn is_system_segment(&self, name: &str) -> bool {
        self.system_segments.iter().any(|segment| segment == name)
    }

    /// Bind the journal to the container epoch.
    ///
    /// # Errors
    /// - `Error::InvalidArgument`: The epoch was already set.
    pub fn set_epoch(&self, epoch: u64) -> Result<()> {
        self.epoch
            .set(epoch)
            .map_err(|_| Error::InvalidArgument("the journal epoch is already set"))
    }

    fn epoch(&self) -> Result<u64> {
        self.epoch.get().copied().ok_or(Error::ContainerNotReady)
    }

    /// Durably append `records` as one batch.
    ///
    /// This must complete before the metadata transaction describing the same change commits.
    ///
    /// # Errors
    /// - `Error::JournalWrite`: The batch could not be serialized or durably written. The
    /// caller must fail its operation without committing any metadata.
    pub async fn append_records(&self, records: Vec<SystemJournalRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let epoch = self.epoch()?;
        let count = records.len() as u64;
        let batch = SystemJournalRecordBatch { records };
        let data = serialize::serialize_batch(&batch)
            .map_err(|error| Error::JournalWrite(Box::new(error)))?;

        let mut state = self.state.lock().await;
        self.append_batch(&mut state, epoch, &data)
            .await
            .map_err(|error| Error::JournalWrite(Box::new(error)))?;
        state.records_since_snapshot += count;

        if state.records_since_snapshot >= self.config.journal_snapshot_interval {
            // A failed snapshot must not fail the operation whose record is already durable.
            if let Err(error) = self.write_snapshot(&mut state, epoch).await {
                warn!("could not write a system snapshot: {}", error);
            }
        }
        Ok(())
    }

    /// Write a batch to the current journal file, rotating files as needed.
    async fn append_batch(&self, state: &mut WriterState, epoch: u64, data: &[u8]) -> Result<()> {
        if !self.chunk_storage.supports_append() {
            // Every batch is its own chunk; the file is a virtual sequence of them.
            let name = journal_batch_name(
                self.container_id,
                epoch,
                state.file_index,
                state.next_batch_index,
            );
            let handle = self.chunk_storage.create(&name).await?;
            self.chunk_storage.write(&handle, 0, data).await?;
            state.next_batch_index += 1;
            state.file_length += data.len() as u64;
            if state.file_length >= self.config.journal_max_file_size {
                self.start_new_file(state);
            }
            return Ok(());
        }

        let mut retried = false;
        loop {
            let handle = match &state.current_file {
                Some(handle) => handle.clone(),
                None => {
                    let name = journal_file_name(self.container_id, epoch, state.file_index);
                    let handle = self.chunk_storage.create(&name).await?;
                    state.file_length = 0;
                    state.current_file = Some(handle.clone());
                    handle
                }
            };
            match self.chunk_storage.write(&handle, state.file_length, data).await {
                Ok(_) => {
                    state.file_length += data.len() as u64;
                    if state.file_length >= self.config.journal_max_file_size {
                        self.start_new_file(state);
                    }
                    return Ok(());
                }
                Err(error) if !retried => {
                    // The file may have grown under us if a fenced-out writer appended to it.
                    // The tail of the old file will fail to decode on recovery; move on.
                    warn!(
                        "append to journal file `{}` failed ({}); rotating to a new file",
                        handle.name(),
                        error
                    );
                    self.start_new_file(state);
                    retried = true;
                }
                Err(error) => return Err(error),
            }
        }
    }

    fn start_new_file(&self, state: &mut WriterState) {
        state.current_file = None;
        state.file_index += 1;
        state.file_length = 0;
        state.next_batch_index = 0;
    }

    /// Write a snapshot of all system segments and start a fresh journal file.
    async fn write_snapshot(&self, state: &mut WriterState, epoch: u64) -> Result<()> {
        let snapshot = self.build_snapshot(epoch).await?;
        let batch = SystemJournalRecordBatch {
            records: vec![SystemJournalRecord::SystemSnapshot(snapshot)],
        };
        let data = serialize::serialize_batch(&batch)?;

        let name = snapshot_name(self.container_id, epoch, state.next_snapshot_index);
        let handle = self.chunk_storage.create(&name).await?;
        self.chunk_storage.write(&handle, 0, &data).await?;
        state.next_snapshot_index += 1;
        state.records_since_snapshot = 0;
        self.start_new_file(state);
        info!("wrote system snapshot `{}`", name);

        self.prune_stale(epoch, state.next_snapshot_index - 1).await;
        Ok(())
    }

    /// Build a snapshot record from the metadata store.
    async fn build_snapshot(&self, epoch: u64) -> Result<SystemSnapshotRecord> {
        let mut segments = Vec::new();
        for name in &self.system_segments {
            let segment = match self.metadata_store.get(name).await? {
                Some(record) => record.into_segment()?,
                None => continue,
            };
            let mut chunks = Vec::new();
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
                chunks.push(chunk);
            }
            segments.push(SegmentSnapshotRecord { segment, chunks });
        }
        Ok(SystemSnapshotRecord { epoch, segments })
    }

    /// Best-effort deletion of journal files and snapshots made obsolete by a new snapshot.
    async fn prune_stale(&self, epoch: u64, current_snapshot_index: u64) {
        let journal_chunks = match self.chunk_storage.list(&journal_prefix(self.container_id)).await
        {
            Ok(chunks) => chunks,
            Err(error) => {
                debug!("could not list journal chunks for pruning: {}", error);
                return;
            }
        };
        for chunk in journal_chunks {
            if let Some(id) = parse_journal_name(self.container_id, &chunk.name) {
                if id.epoch < epoch {
                    if let Err(error) = self.chunk_storage.delete(&chunk.name).await {
                        debug!("could not delete stale journal chunk `{}`: {}", chunk.name, error);
                    }
                }
            }
        }

        let snapshots = match self.chunk_storage.list(&snapshot_prefix(self.container_id)).await {
            Ok(chunks) => chunks,
            Err(error) => {
                debug!("could not list snapshot chunks for pruning: {}", error);
                return;
            }
        };
        for chunk in snapshots {
            if let Some((snapshot_epoch, index)) = parse_snapshot_name(self.container_id, &chunk.name)
            {
                if snapshot_epoch < epoch || (snapshot_epoch == epoch && index < current_snapshot_index)
                {
                    if let Err(error) = self.chunk_storage.delete(&chunk.name).await {
                        debug!("could not delete stale snapshot `{}`: {}", chunk.name, error);
                    }
                }
            }
        }
    }

    /// Rebuild the metadata of all system segments from snapshots and journal records.
    ///
    /// This repopulates the metadata store with the layout of the system segments as of the
    /// last durable state, ignoring everything written by the current epoch or newer, writes a
    /// fresh snapshot tagged with the current epoch, and opens a fresh journal file.
    ///
    /// # Errors
    /// - `Error::Bootstrap`: The rebuilt state references a chunk which does not exist, or is
    /// internally inconsistent. The container must not serve traffic.
    pub async fn bootstrap(&self) -> Result<()> {
        let epoch = self.epoch()?;
        let mut state = self.state.lock().await;
        info!(
            "bootstrapping container {} at epoch {}",
            self.container_id, epoch
        );

        let journal_chunks = self
            .chunk_storage
            .list(&journal_prefix(self.container_id))
            .await?;
        let snapshot_chunks = self
            .chunk_storage
            .list(&snapshot_prefix(self.container_id))
            .await?;

        // Never reuse a file or snapshot name this epoch may have written before a crash.
        state.file_index = journal_chunks
            .iter()
            .filter_map(|chunk| parse_journal_name(self.container_id, &chunk.name))
            .filter(|id| id.epoch == epoch)
            .map(|id| id.file + 1)
            .max()
            .unwrap_or(0);
        state.current_file = None;
        state.file_length = 0;
        state.next_batch_index = 0;
        state.next_snapshot_index = snapshot_chunks
            .iter()
            .filter_map(|chunk| parse_snapshot_name(self.container_id, &chunk.name))
            .filter(|(snapshot_epoch, _)| *snapshot_epoch == epoch)
            .map(|(_, index)| index + 1)
            .max()
            .unwrap_or(0);

        // Anything written at the current epoch or newer is a zombie's work and is ignored.
        let mut snapshots = snapshot_chunks
            .iter()
            .filter_map(|chunk| {
                parse_snapshot_name(self.container_id, &chunk.name)
                    .map(|(snapshot_epoch, index)| (snapshot_epoch, index, chunk.name.clone()))
            })
            .filter(|(snapshot_epoch, _, _)| *snapshot_epoch < epoch)
            .collect::<Vec<_>>();
        snapshots.sort();
        snapshots.reverse();

        let (mut recovered, snapshot_epoch) = self.load_base_state(&snapshots).await?;
        for name in &self.system_segments {
            if !recovered.contains_key(name) {
                recovered.insert(
                    name.clone(),
                    RecoveredSegment::empty(name, &self.config, epoch),
                );
            }
        }

        self.replay(&mut recovered, &journal_chunks, snapshot_epoch, epoch)
            .await?;
        self.adjust_and_validate(&mut recovered).await?;
        self.commit_recovered(recovered, epoch).await?;

        self.write_snapshot(&mut state, epoch).await?;
        info!(
            "container {} bootstrapped at epoch {}",
            self.container_id, epoch
        );
        Ok(())
    }

    /// Load the newest usable snapshot older than the current epoch, or empty state.
    async fn load_base_state(
        &self,
        snapshots: &[(u64, u64, String)],
    ) -> Result<(HashMap<String, RecoveredSegment>, Option<u64>)> {
        for (snapshot_epoch, _, name) in snapshots {
            let data = match self.read_chunk_fully(name).await {
                Ok(data) => data,
                Err(error) => {
                    warn!("could not read snapshot `{}`: {}", name, error);
                    continue;
                }
            };
            let mut remaining = data.as_slice();
            let mut records = match serialize::deserialize_batch(&mut remaining) {
                Ok(batch) => batch.records,
                Err(error) => {
                    warn!("snapshot `{}` does not decode: {}", name, error);
                    continue;
                }
            };
            let snapshot = match (records.len(), records.pop()) {
                (1, Some(SystemJournalRecord::SystemSnapshot(snapshot))) => snapshot,
                _ => {
                    warn!("snapshot `{}` does not contain a system snapshot record", name);
                    continue;
                }
            };

            let mut recovered = HashMap::new();
            for segment_snapshot in snapshot.segments {
                let chunks = segment_snapshot
                    .chunks
                    .into_iter()
                    .map(|chunk| (chunk.name.clone(), chunk))
                    .collect();
                recovered.insert(
                    segment_snapshot.segment.name.clone(),
                    RecoveredSegment {
                        segment: segment_snapshot.segment,
                        chunks,
                    },
                );
            }
            debug!("recovering from snapshot `{}`", name);
            return Ok((recovered, Some(*snapshot_epoch)));
        }
        Ok((HashMap::new(), None))
    }

    /// Replay journal batches in `(epoch, file, batch)` order on top of the base state.
    async fn replay(
        &self,
        recovered: &mut HashMap<String, RecoveredSegment>,
        journal_chunks: &[crate::store::ChunkInfo],
        snapshot_epoch: Option<u64>,
        epoch: u64,
    ) -> Result<()> {
        let mut entries = journal_chunks
            .iter()
            .filter_map(|chunk| {
                parse_journal_name(self.container_id, &chunk.name)
                    .map(|id| (id, chunk.name.clone()))
            })
            .filter(|(id, _)| id.epoch < epoch)
            .filter(|(id, _)| snapshot_epoch.map_or(true, |snapshot| id.epoch >= snapshot))
            .collect::<Vec<_>>();
        entries.sort();

        // Once a batch fails to decode, the rest of its file is unreachable garbage.
        let mut poisoned_file = None;
        for (id, name) in entries {
            if poisoned_file == Some((id.epoch, id.file)) {
                continue;
            }
            let data = self.read_chunk_fully(&name).await?;
            let mut remaining = data.as_slice();
            while !remaining.is_empty() {
                match serialize::deserialize_batch(&mut remaining) {
                    Ok(batch) => {
                        for record in batch.records {
                            self.apply_record(recovered, record);
                        }
                    }
                    Err(_) => {
                        debug!("replay of journal chunk `{}` stops at undecodable data", name);
                        poisoned_file = Some((id.epoch, id.file));
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn apply_record(
        &self,
        recovered: &mut HashMap<String, RecoveredSegment>,
        record: SystemJournalRecord,
    ) {
        match record {
            SystemJournalRecord::ChunkAdded(record) => self.apply_chunk_added(recovered, record),
            SystemJournalRecord::Truncation(record) => self.apply_truncation(recovered, record),
            SystemJournalRecord::SegmentSnapshot(_) | SystemJournalRecord::SystemSnapshot(_) => {
                debug!("skipping snapshot record found inside a journal file");
            }
        }
    }

    fn apply_chunk_added(
        &self,
        recovered: &mut HashMap<String, RecoveredSegment>,
        record: ChunkAddedRecord,
    ) {
        let entry = match recovered.get_mut(&record.segment_name) {
            Some(entry) => entry,
            None => return,
        };
        match (&record.old_chunk_name, entry.segment.last_chunk.clone()) {
            (Some(old), Some(last)) if *old == last => {
                if record.offset < entry.segment.last_chunk_start_offset {
                    debug!("skipping chunk-added record with a stale offset");
                    return;
                }
                // The offset the new chunk starts at fixes the length of the one before it,
                // which may have grown through appends that produce no journal records.
                let previous_length = record.offset - entry.segment.last_chunk_start_offset;
                if let Some(previous) = entry.chunks.get_mut(&last) {
                    previous.length = previous_length;
                    previous.next_chunk = Some(record.new_chunk_name.clone());
                }
                entry
                    .chunks
                    .insert(record.new_chunk_name.clone(), ChunkMetadata::new(record.new_chunk_name.as_str(), 0));
                entry.segment.last_chunk = Some(record.new_chunk_name);
                entry.segment.last_chunk_start_offset = record.offset;
                entry.segment.length = record.offset;
                entry.segment.chunk_count += 1;
            }
            (None, None) => {
                if record.offset != entry.segment.length {
                    debug!("skipping first-chunk record with a mismatched offset");
                    return;
                }
                entry
                    .chunks
                    .insert(record.new_chunk_name.clone(), ChunkMetadata::new(record.new_chunk_name.as_str(), 0));
                entry.segment.first_chunk = Some(record.new_chunk_name.clone());
                entry.segment.last_chunk = Some(record.new_chunk_name);
                entry.segment.first_chunk_start_offset = record.offset;
                entry.segment.last_chunk_start_offset = record.offset;
                entry.segment.chunk_count = 1;
            }
            _ => {
                // The record belongs to a chain that diverged from the surviving one; this is
                // how a fenced-out writer's records are discarded.
                debug!(
                    "skipping chunk-added record for `{}`: it does not extend the current chain",
                    record.segment_name
                );
            }
        }
    }

    fn apply_truncation(
        &self,
        recovered: &mut HashMap<String, RecoveredSegment>,
        record: TruncationRecord,
    ) {
        let entry = match recovered.get_mut(&record.segment_name) {
            Some(entry) => entry,
            None => return,
        };
        if record.offset < entry.segment.start_offset
            || record.offset > entry.segment.length
            || record.start_offset > record.offset
        {
            debug!("skipping truncation record with an out-of-range offset");
            return;
        }

        match &record.first_chunk_name {
            None => {
                // The truncation consumed every chunk.
                if record.offset != entry.segment.length {
                    debug!("skipping full-truncation record not at the segment length");
                    return;
                }
                entry.chunks.clear();
                entry.segment.first_chunk = None;
                entry.segment.last_chunk = None;
                entry.segment.first_chunk_start_offset = entry.segment.length;
                entry.segment.last_chunk_start_offset = entry.segment.length;
                entry.segment.chunk_count = 0;
                entry.segment.start_offset = record.offset;
            }
            Some(target) => {
                let mut cumulative = entry.segment.first_chunk_start_offset;
                let mut cursor = entry.segment.first_chunk.clone();
                let mut garbage = Vec::new();
                let mut found = false;
                while let Some(name) = cursor {
                    if name == *target {
                        found = cumulative == record.start_offset;
                        break;
                    }
                    match entry.chunks.get(&name) {
                        Some(chunk) => {
                            cumulative += chunk.length;
                            cursor = chunk.next_chunk.clone();
                            garbage.push(name);
                        }
                        None => break,
                    }
                }
                if !found {
                    debug!(
                        "skipping truncation record for `{}`: first chunk does not match",
                        record.segment_name
                    );
                    return;
                }
                for name in garbage {
                    entry.chunks.remove(&name);
                    entry.segment.chunk_count -= 1;
                }
                entry.segment.first_chunk = Some(target.clone());
                entry.segment.first_chunk_start_offset = record.start_offset;
                entry.segment.start_offset = record.offset;
            }
        }
    }

    /// Fix up the tail of every segment from chunk storage and check internal consistency.
    ///
    /// Appends into an existing last chunk produce no journal records, so the length of the
    /// final chunk of each segment is only known to chunk storage.
    async fn adjust_and_validate(
        &self,
        recovered: &mut HashMap<String, RecoveredSegment>,
    ) -> Result<()> {
        for entry in recovered.values_mut() {
            for chunk in entry.chunks.values_mut() {
                let info = match self.chunk_storage.info(&chunk.name).await {
                    Ok(info) => info,
                    Err(Error::ChunkNotFound(_)) => {
                        return Err(Error::Bootstrap(format!(
                            "chunk `{}` of segment `{}` does not exist in chunk storage",
                            chunk.name, entry.segment.name
                        )));
                    }
                    Err(error) => return Err(error),
                };
                if entry.segment.last_chunk.as_deref() == Some(chunk.name.as_str()) {
                    chunk.length = info.length;
                } else if info.length < chunk.length {
                    return Err(Error::Bootstrap(format!(
                        "chunk `{}` of segment `{}` is shorter in storage than its metadata",
                        chunk.name, entry.segment.name
                    )));
                }
            }
            if let Some(last) = entry.segment.last_chunk.clone() {
                let last_length = entry
                    .chunks
                    .get(&last)
                    .map(|chunk| chunk.length)
                    .unwrap_or(0);
                entry.segment.length = entry.segment.last_chunk_start_offset + last_length;
            }
            if entry.segment.start_offset > entry.segment.length {
                entry.segment.start_offset = entry.segment.length;
            }
            self.validate_layout(entry)?;
        }
        Ok(())
    }

    fn validate_layout(&self, entry: &RecoveredSegment) -> Result<()> {
        let segment = &entry.segment;
        let mut count = 0u32;
        let mut total = 0u64;
        let mut cursor = segment.first_chunk.clone();
        let mut last_seen = None;
        while let Some(name) = cursor {
            let chunk = entry.chunks.get(&name).ok_or_else(|| {
                Error::Bootstrap(format!(
                    "segment `{}` references chunk `{}` which was not recovered",
                    segment.name, name
                ))
            })?;
            count += 1;
            total += chunk.length;
            cursor = chunk.next_chunk.clone();
            last_seen = Some(name);
        }
        let consistent = count == segment.chunk_count
            && total == segment.length - segment.first_chunk_start_offset
            && last_seen == segment.last_chunk;
        if !consistent {
            return Err(Error::Bootstrap(format!(
                "segment `{}` was rebuilt into an inconsistent layout",
                segment.name
            )));
        }
        Ok(())
    }

    /// Commit the rebuilt state into the metadata store, one transaction per segment.
    async fn commit_recovered(
        &self,
        recovered: HashMap<String, RecoveredSegment>,
        epoch: u64,
    ) -> Result<()> {
        for (name, entry) in recovered {
            let mut segment = entry.segment;
            segment.owner_epoch = epoch;
            segment.touch();

            let mut transaction = self.metadata_store.transaction().await?;
            match transaction.get_for_update(&name).await? {
                Some(_) => transaction.update(&name, segment.into()),
                None => transaction.create(&name, segment.into()),
            }
            let mut chunk_keys = Vec::with_capacity(entry.chunks.len());
            for (chunk_name, chunk) in entry.chunks {
                match transaction.get(&chunk_name).await? {
                    Some(_) => transaction.update(&chunk_name, chunk.into()),
                    None => transaction.create(&chunk_name, chunk.into()),
                }
                chunk_keys.push(chunk_name);
            }
            transaction.commit().await?;

            // System segment records must survive any cache eviction.
            self.metadata_store.pin(&name).await?;
            for chunk_name in chunk_keys {
                self.metadata_store.pin(&chunk_name).await?;
            }
        }
        Ok(())
    }

    async fn read_chunk_fully(&self, name: &str) -> Result<Vec<u8>> {
        let info = self.chunk_storage.info(name).await?;
        let mut data = vec![0u8; info.length as usize];
        if !data.is_empty() {
            self.chunk_storage
                .read(&ChunkHandle::read(name), 0, &mut data)
                .await?;
        }
        Ok(data)
    }
}
