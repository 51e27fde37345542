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

use std::time::SystemTime;

use crate::metadata::SegmentMetadata;

/// A handle for operating on a segment.
///
/// A handle doesn't hold any state; it names a segment and records whether it was opened for
/// writing. Handles are created by [`ChunkManager::open_read`] and [`ChunkManager::open_write`].
///
/// [`ChunkManager::open_read`]: crate::segment::ChunkManager::open_read
/// [`ChunkManager::open_write`]: crate::segment::ChunkManager::open_write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHandle {
    name: String,
    read_only: bool,
}

impl SegmentHandle {
    pub(crate) fn read(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            read_only: true,
        }
    }

    pub(crate) fn write(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            read_only: false,
        }
    }

    /// The name of the segment this handle refers to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle can be used for mutation.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// Information about a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    /// The name of the segment.
    pub name: String,

    /// The exclusive end offset of the segment.
    pub length: u64,

    /// The inclusive begin offset of the readable range.
    pub start_offset: u64,

    /// Whether the segment is sealed.
    pub sealed: bool,

    /// Whether the segment stores container-level metadata.
    pub is_system: bool,

    /// The number of chunks which make up the segment.
    pub chunk_count: u32,

    /// The time the segment was last modified.
    pub last_modified: SystemTime,
}

impl From<&SegmentMetadata> for SegmentInfo {
    fn from(segment: &SegmentMetadata) -> Self {
        Self {
            name: segment.name.clone(),
            length: segment.length,
            start_offset: segment.start_offset,
            sealed: segment.is_sealed(),
            is_system: segment.is_system(),
            chunk_count: segment.chunk_count,
            last_modified: segment.last_modified,
        }
    }
}
