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

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use segstore::metadata::MemoryMetadataStore;
use segstore::segment::{ChunkManager, ChunkManagerConfig, RollingPolicy};
use segstore::store::MemoryChunkStore;

pub const CONTAINER_ID: u32 = 42;

pub type TestManager = ChunkManager<MemoryChunkStore, MemoryMetadataStore>;

/// A configuration with a small rolling length and no garbage collection delay, so tests can
/// exercise chunk boundaries and reclaim orphans immediately.
pub fn config(max_length: u64) -> ChunkManagerConfig {
    ChunkManagerConfig {
        default_rolling_policy: RollingPolicy::new(max_length),
        journal_max_file_size: 1024,
        garbage_collection_delay: Duration::from_millis(0),
        ..ChunkManagerConfig::default()
    }
}

/// Start a container instance at `epoch` with a fresh metadata store, as a failover does.
pub async fn start_container(
    chunk_storage: &Arc<MemoryChunkStore>,
    epoch: u64,
    max_length: u64,
) -> (TestManager, Arc<MemoryMetadataStore>) {
    start_container_with(chunk_storage, epoch, config(max_length)).await
}

pub async fn start_container_with(
    chunk_storage: &Arc<MemoryChunkStore>,
    epoch: u64,
    config: ChunkManagerConfig,
) -> (TestManager, Arc<MemoryMetadataStore>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let metadata_store = Arc::new(MemoryMetadataStore::new());
    let manager = ChunkManager::new(
        CONTAINER_ID,
        Arc::clone(chunk_storage),
        Arc::clone(&metadata_store),
        config,
    );
    manager.initialize(epoch).unwrap();
    manager.bootstrap(None).await.unwrap();
    (manager, metadata_store)
}

/// Read the whole readable range of a segment.
pub async fn read_all(manager: &TestManager, name: &str) -> Vec<u8> {
    let info = manager.info(name, None).await.unwrap();
    let mut contents = vec![0; (info.length - info.start_offset) as usize];
    let handle = manager.open_read(name, None).await.unwrap();
    manager
        .read(&handle, info.start_offset, &mut contents, None)
        .await
        .unwrap();
    contents
}

/// Append `data` at the current end of the segment.
pub async fn append(manager: &TestManager, name: &str, data: &[u8]) {
    let info = manager.info(name, None).await.unwrap();
    let handle = manager.open_write(name, None).await.unwrap();
    manager.write(&handle, info.length, data, None).await.unwrap();
}
