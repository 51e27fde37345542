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

//! Typed metadata records and the transactional store they live in.
//!
//! Segment metadata maps each segment name to its layout: the linked list of chunks which hold
//! its bytes, its readable range, and its ownership epoch. Chunk metadata maps each chunk name
//! to its length and its successor in the list. Both are stored in a [`ChunkMetadataStore`],
//! a pessimistic transactional key-value store.
//!
//! For ordinary segments the metadata store is authoritative. For system segments it is a cache
//! which is rebuilt from the system journal on every bootstrap.
//!
//! [`ChunkMetadataStore`]: crate::metadata::ChunkMetadataStore

pub use self::memory::MemoryMetadataStore;
pub use self::store::{ChunkMetadataStore, MetadataTransaction};

mod memory;
mod store;

use std::time::SystemTime;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::segment::RollingPolicy;
use crate::{Error, Result};

bitflags! {
    /// Status bits for a segment.
    #[derive(Serialize, Deserialize)]
    pub struct SegmentStatus: u32 {
        /// The segment exists and accepts operations.
        const ACTIVE = 0b0001;

        /// The segment is sealed; writes and truncations are rejected.
        const SEALED = 0b0010;

        /// The segment stores container-level metadata and its layout changes are journaled.
        const SYSTEM = 0b0100;
    }
}

/// Metadata describing the layout and state of a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentMetadata {
    /// The name of the segment.
    pub name: String,

    /// The exclusive end offset of the segment.
    pub length: u64,

    /// The inclusive begin offset of the readable range, advanced by truncation.
    pub start_offset: u64,

    /// The number of chunks which make up the segment.
    pub chunk_count: u32,

    /// The name of the first chunk in the list, or `None` if the segment has no chunks.
    pub first_chunk: Option<String>,

    /// The name of the last chunk in the list, or `None` if the segment has no chunks.
    pub last_chunk: Option<String>,

    /// The offset of the first byte of the first chunk.
    ///
    /// This can be strictly less than `start_offset` when a truncation lands inside a chunk.
    pub first_chunk_start_offset: u64,

    /// The offset of the first byte of the last chunk.
    pub last_chunk_start_offset: u64,

    /// The maximum length any single chunk of this segment may reach, fixed at create time.
    pub max_rolling_length: u64,

    /// The status bits of the segment.
    pub status: SegmentStatus,

    /// The epoch of the container instance which owns the segment.
    pub owner_epoch: u64,

    /// The time the segment was last modified.
    pub last_modified: SystemTime,
}

impl SegmentMetadata {
    /// Create metadata for a new, empty segment owned by `epoch`.
    pub fn new(name: impl Into<String>, policy: RollingPolicy, epoch: u64) -> Self {
        Self {
            name: name.into(),
            length: 0,
            start_offset: 0,
            chunk_count: 0,
            first_chunk: None,
            last_chunk: None,
            first_chunk_start_offset: 0,
            last_chunk_start_offset: 0,
            max_rolling_length: policy.max_length,
            status: SegmentStatus::ACTIVE,
            owner_epoch: epoch,
            last_modified: SystemTime::now(),
        }
    }

    /// Whether the segment is sealed.
    pub fn is_sealed(&self) -> bool {
        self.status.contains(SegmentStatus::SEALED)
    }

    /// Whether the segment stores container-level metadata.
    pub fn is_system(&self) -> bool {
        self.status.contains(SegmentStatus::SYSTEM)
    }

    /// The length of the last chunk implied by the segment tallies.
    pub fn last_chunk_length(&self) -> u64 {
        self.length - self.last_chunk_start_offset
    }

    /// Record a modification at the current time.
    pub(crate) fn touch(&mut self) {
        self.last_modified = SystemTime::now();
    }
}

/// Metadata describing a single chunk of a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// The name of the chunk.
    pub name: String,

    /// The length of the chunk in bytes.
    ///
    /// This is the authoritative length: a chunk may physically be longer in storage if a
    /// fenced-out owner appended to it, and those bytes are never readable.
    pub length: u64,

    /// The name of the next chunk in the segment, or `None` for the last chunk.
    pub next_chunk: Option<String>,
}

impl ChunkMetadata {
    /// Create metadata for a new last chunk.
    pub fn new(name: impl Into<String>, length: u64) -> Self {
        Self {
            name: name.into(),
            length,
            next_chunk: None,
        }
    }
}

/// A typed record in a [`ChunkMetadataStore`].
///
/// [`ChunkMetadataStore`]: crate::metadata::ChunkMetadataStore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageMetadata {
    /// Metadata for a segment, keyed by segment name.
    Segment(SegmentMetadata),

    /// Metadata for a chunk, keyed by chunk name.
    Chunk(ChunkMetadata),
}

impl StorageMetadata {
    /// Unwrap a segment record.
    ///
    /// # Errors
    /// - `Error::CorruptMetadata`: The record is not a segment record.
    pub fn into_segment(self) -> Result<SegmentMetadata> {
        match self {
            StorageMetadata::Segment(segment) => Ok(segment),
            StorageMetadata::Chunk(chunk) => Err(Error::CorruptMetadata(format!(
                "expected a segment record, found the chunk record `{}`",
                chunk.name
            ))),
        }
    }

    /// Unwrap a chunk record.
    ///
    /// # Errors
    /// - `Error::CorruptMetadata`: The record is not a chunk record.
    pub fn into_chunk(self) -> Result<ChunkMetadata> {
        match self {
            StorageMetadata::Chunk(chunk) => Ok(chunk),
            StorageMetadata::Segment(segment) => Err(Error::CorruptMetadata(format!(
                "expected a chunk record, found the segment record `{}`",
                segment.name
            ))),
        }
    }
}

impl From<SegmentMetadata> for StorageMetadata {
    fn from(segment: SegmentMetadata) -> Self {
        StorageMetadata::Segment(segment)
    }
}

impl From<ChunkMetadata> for StorageMetadata {
    fn from(chunk: ChunkMetadata) -> Self {
        StorageMetadata::Chunk(chunk)
    }
}
