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

use crate::metadata::{ChunkMetadata, SegmentMetadata};

/// A record stating that a new chunk was linked into a system segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAddedRecord {
    /// The name of the segment the chunk was linked into.
    pub segment_name: String,

    /// The name of the new chunk.
    pub new_chunk_name: String,

    /// The chunk the new chunk was linked after, or `None` if it became the first chunk.
    pub old_chunk_name: Option<String>,

    /// The offset in the segment at which the new chunk starts.
    pub offset: u64,
}

/// A record stating that a system segment was truncated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncationRecord {
    /// The name of the segment which was truncated.
    pub segment_name: String,

    /// The new start offset of the segment.
    pub offset: u64,

    /// The first surviving chunk, or `None` if the truncation consumed every chunk.
    pub first_chunk_name: Option<String>,

    /// The offset of the first byte of the first surviving chunk.
    pub start_offset: u64,
}

/// A point-in-time image of a single system segment and all of its chunks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentSnapshotRecord {
    /// The segment metadata.
    pub segment: SegmentMetadata,

    /// The metadata of every chunk in the segment, in list order.
    pub chunks: Vec<ChunkMetadata>,
}

/// An authoritative image of all system segments of a container at a known epoch.
///
/// Recovery needs nothing outside this record except the journal batches written after it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemSnapshotRecord {
    /// The epoch whose owner wrote this snapshot.
    pub epoch: u64,

    /// One snapshot per system segment.
    pub segments: Vec<SegmentSnapshotRecord>,
}

/// A structural change to a system segment, or a snapshot of all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SystemJournalRecord {
    /// A chunk was linked into a segment.
    ChunkAdded(ChunkAddedRecord),

    /// A segment was truncated.
    Truncation(TruncationRecord),

    /// A snapshot of a single segment. Only appears nested in a system snapshot.
    SegmentSnapshot(SegmentSnapshotRecord),

    /// A snapshot of all system segments.
    SystemSnapshot(SystemSnapshotRecord),
}

/// The atomic unit of journal durability.
///
/// A batch is serialized into a single blob and written as exactly one chunk write; it is either
/// fully durable or not written at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemJournalRecordBatch {
    /// The records in this batch, in application order.
    pub records: Vec<SystemJournalRecord>,
}
