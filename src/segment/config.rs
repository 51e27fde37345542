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

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The rule bounding how large any single chunk of a segment may grow.
///
/// When a write would push the current last chunk past `max_length`, the chunk is closed and a
/// new one is started; a single logical write may produce several chunks. The policy is fixed
/// per segment when the segment is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollingPolicy {
    /// The maximum length of a single chunk in bytes.
    pub max_length: u64,
}

impl RollingPolicy {
    /// Create a policy with the given maximum chunk length.
    pub const fn new(max_length: u64) -> Self {
        Self { max_length }
    }
}

impl Default for RollingPolicy {
    fn default() -> Self {
        // 128 MiB keeps chunk counts low without creating unwieldy blobs.
        Self::new(128 * 1024 * 1024)
    }
}

/// Configuration for a [`ChunkManager`].
///
/// [`ChunkManager`]: crate::segment::ChunkManager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkManagerConfig {
    /// The rolling policy used for segments created without an explicit one, and for the
    /// system segments.
    pub default_rolling_policy: RollingPolicy,

    /// The number of journal records after which a new system snapshot is written.
    pub journal_snapshot_interval: u64,

    /// The size in bytes past which the current journal file is closed and a new one started.
    pub journal_max_file_size: u64,

    /// How long a chunk stays in the garbage queue before it is actually deleted.
    pub garbage_collection_delay: Duration,

    /// The maximum number of segment records a caching metadata store should keep indexed in
    /// memory. Stores which are not caches are free to ignore this.
    pub max_indexed_segments: usize,

    /// A hard upper bound on the size of any chunk, applied on top of every rolling policy.
    pub max_chunk_size: u64,

    /// Sources smaller than this are merged into the target by copying bytes instead of
    /// relinking their chunks.
    pub min_size_for_concat: u64,

    /// How many times an operation is retried after a metadata version conflict.
    pub max_metadata_retries: u32,

    /// The backoff before the first retry; it doubles on every further attempt.
    pub retry_base_delay: Duration,
}

impl Default for ChunkManagerConfig {
    fn default() -> Self {
        Self {
            default_rolling_policy: RollingPolicy::default(),
            journal_snapshot_interval: 100,
            journal_max_file_size: 8 * 1024 * 1024,
            garbage_collection_delay: Duration::from_secs(60),
            max_indexed_segments: 1024,
            max_chunk_size: 1024 * 1024 * 1024,
            min_size_for_concat: 4 * 1024,
            max_metadata_retries: 5,
            retry_base_delay: Duration::from_millis(10),
        }
    }
}
