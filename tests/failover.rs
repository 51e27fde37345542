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

//! Failover tests: every epoch gets a fresh metadata store, only chunk storage survives, and
//! fenced-out instances keep writing.

mod common;

use std::sync::Arc;

use segstore::store::{ChunkStorage, MemoryChunkStore};
use segstore::Error;

use common::{append, config, read_all, start_container, start_container_with, TestManager};

/// The system segment the tests write through, by way of its owning manager.
fn system_segment(manager: &TestManager) -> String {
    manager.system_segments()[0].clone()
}

#[tokio::test]
async fn single_failover_rebuilds_layout() {
    let storage = Arc::new(MemoryChunkStore::new());

    let (manager, _) = start_container(&storage, 1, 8).await;
    let segment = system_segment(&manager);
    append(&manager, &segment, b"Hello").await;
    append(&manager, &segment, b" World").await;

    // Epoch 2 starts from nothing but chunk storage.
    let (manager, _) = start_container(&storage, 2, 8).await;
    let info = manager.info(&segment, None).await.unwrap();
    assert_eq!(info.length, 11);
    assert_eq!(info.start_offset, 0);
    assert_eq!(info.chunk_count, 2);
    assert_eq!(read_all(&manager, &segment).await, b"Hello World");
}

#[tokio::test]
async fn zombie_writer_cannot_pollute_the_segment() {
    let storage = Arc::new(MemoryChunkStore::new());

    let (zombie, _) = start_container(&storage, 1, 8).await;
    let segment = system_segment(&zombie);
    append(&zombie, &segment, b"Hello").await;
    append(&zombie, &segment, b" World").await;

    let (manager, _) = start_container(&storage, 2, 8).await;

    // The fenced-out instance is still alive and writes garbage at the same offset. Its own
    // metadata store accepts it, and the bytes physically land in a chunk the new epoch owns.
    append(&zombie, &segment, b"junk").await;

    // The new epoch writes at the same offset and must not see the garbage.
    append(&manager, &segment, b" World").await;
    let info = manager.info(&segment, None).await.unwrap();
    assert_eq!(info.length, 17);
    let mut first = vec![0; 11];
    let handle = manager.open_read(&segment, None).await.unwrap();
    manager.read(&handle, 0, &mut first, None).await.unwrap();
    assert_eq!(first, b"Hello World");
    assert_eq!(read_all(&manager, &segment).await, b"Hello World World");

    // The layout rebuilt by the next epoch agrees byte for byte.
    let (manager, _) = start_container(&storage, 3, 8).await;
    assert_eq!(manager.info(&segment, None).await.unwrap().length, 17);
    assert_eq!(read_all(&manager, &segment).await, b"Hello World World");
}

#[tokio::test]
async fn repeated_failovers_with_zombie_writers() {
    let storage = Arc::new(MemoryChunkStore::new());
    let mut expected = Vec::new();
    let mut zombies: Vec<TestManager> = Vec::new();

    let (first, _) = start_container(&storage, 1, 8).await;
    let segment = system_segment(&first);
    zombies.push(first);

    for generation in 1..=9u32 {
        let (manager, _) = start_container(&storage, u64::from(generation) + 1, 8).await;

        // Every prior epoch tries to write garbage before the new owner gets a word in. Some
        // of those writes land physically; none of them may become part of the segment.
        for zombie in &zombies {
            let info = zombie.info(&segment, None).await.unwrap();
            let handle = zombie.open_write(&segment, None).await.unwrap();
            zombie
                .write(&handle, info.length, b"junk", None)
                .await
                .unwrap();
        }

        let data = format!("Test{}", generation);
        append(&manager, &segment, data.as_bytes()).await;
        expected.extend_from_slice(data.as_bytes());
        zombies.push(manager);
    }

    let (manager, _) = start_container(&storage, 11, 8).await;
    let info = manager.info(&segment, None).await.unwrap();
    assert_eq!(info.start_offset, 0);
    assert_eq!(info.length, expected.len() as u64);
    assert_eq!(read_all(&manager, &segment).await, expected);
}

#[tokio::test]
async fn truncation_survives_failover() {
    let storage = Arc::new(MemoryChunkStore::new());

    let (manager, _) = start_container(&storage, 1, 8).await;
    let segment = system_segment(&manager);
    append(&manager, &segment, b"JUNKJUNKJUNK").await;
    append(&manager, &segment, b"Hello").await;
    let handle = manager.open_write(&segment, None).await.unwrap();
    manager.truncate(&handle, 6, None).await.unwrap();

    let (manager, _) = start_container(&storage, 2, 8).await;
    append(&manager, &segment, b" World").await;

    let info = manager.info(&segment, None).await.unwrap();
    assert_eq!(info.length, 23);
    assert_eq!(info.start_offset, 6);

    // The readable range picks up right where the truncation left it.
    let handle = manager.open_read(&segment, None).await.unwrap();
    let mut tail = vec![0; 11];
    manager.read(&handle, 12, &mut tail, None).await.unwrap();
    assert_eq!(tail, b"Hello World");
    let mut buf = vec![0; 1];
    assert!(matches!(
        manager.read(&handle, 5, &mut buf, None).await,
        Err(Error::OutOfBounds(_))
    ));
    assert_eq!(read_all(&manager, &segment).await, b"NKJUNKHello World");
}

#[tokio::test]
async fn snapshot_alone_is_enough_to_recover() {
    let storage = Arc::new(MemoryChunkStore::new());

    let (manager, _) = start_container(&storage, 1, 8).await;
    let segment = system_segment(&manager);
    append(&manager, &segment, b"Hello").await;
    append(&manager, &segment, b" World").await;
    let handle = manager.open_write(&segment, None).await.unwrap();
    manager.truncate(&handle, 3, None).await.unwrap();

    // Epoch 2's bootstrap snapshots the recovered state; after that, no journal file from
    // epoch 1 is needed (bootstrap itself prunes them, this makes it explicit).
    let (manager, _) = start_container(&storage, 2, 8).await;
    let expected_info = manager.info(&segment, None).await.unwrap();
    let expected_contents = read_all(&manager, &segment).await;
    for chunk in storage.list("_sysjournal.").await.unwrap() {
        if !chunk.name.contains(".e2.") {
            storage.delete(&chunk.name).await.unwrap();
        }
    }

    let (manager, _) = start_container(&storage, 3, 8).await;
    let info = manager.info(&segment, None).await.unwrap();
    assert_eq!(info.length, expected_info.length);
    assert_eq!(info.start_offset, expected_info.start_offset);
    assert_eq!(info.chunk_count, expected_info.chunk_count);
    assert_eq!(read_all(&manager, &segment).await, expected_contents);
}

#[tokio::test]
async fn failover_on_a_backend_without_append() {
    let storage = Arc::new(MemoryChunkStore::non_appendable());

    let (manager, _) = start_container(&storage, 1, 8).await;
    let segment = system_segment(&manager);
    append(&manager, &segment, b"Hello").await;
    append(&manager, &segment, b" World").await;

    let (manager, _) = start_container(&storage, 2, 8).await;
    let info = manager.info(&segment, None).await.unwrap();
    assert_eq!(info.length, 11);
    assert!(info.chunk_count >= 2);
    assert_eq!(read_all(&manager, &segment).await, b"Hello World");
}

#[tokio::test]
async fn snapshots_triggered_by_record_count() {
    let storage = Arc::new(MemoryChunkStore::new());
    let mut config = config(4);
    config.journal_snapshot_interval = 3;
    let (manager, _) = start_container_with(&storage, 1, config.clone()).await;
    let segment = system_segment(&manager);

    // Force many chunk additions so the journal crosses the snapshot interval repeatedly.
    let mut expected = Vec::new();
    for index in 0..10u8 {
        let data = [b'a' + index; 6];
        append(&manager, &segment, &data).await;
        expected.extend_from_slice(&data);
    }
    // Older snapshots are pruned as newer ones land, so an index above zero proves the
    // interval fired after the bootstrap snapshot.
    let snapshots = storage.list("_syssnapshot.").await.unwrap();
    assert!(snapshots.iter().any(|chunk| !chunk.name.ends_with(".s0")));

    let (manager, _) = start_container_with(&storage, 2, config).await;
    let info = manager.info(&segment, None).await.unwrap();
    assert_eq!(info.length, expected.len() as u64);
    assert_eq!(read_all(&manager, &segment).await, expected);
}

#[tokio::test]
async fn journal_files_rotate_by_size() {
    let storage = Arc::new(MemoryChunkStore::new());
    let mut config = config(4);
    // Each record batch is larger than this, so every append rotates the journal file.
    config.journal_max_file_size = 16;
    let (manager, _) = start_container_with(&storage, 1, config.clone()).await;
    let segment = system_segment(&manager);

    let mut expected = Vec::new();
    for index in 0..6u8 {
        let data = [b'a' + index; 6];
        append(&manager, &segment, &data).await;
        expected.extend_from_slice(&data);
    }
    let journal_files = storage.list("_sysjournal.").await.unwrap();
    assert!(journal_files.len() > 1);

    let (manager, _) = start_container_with(&storage, 2, config).await;
    assert_eq!(read_all(&manager, &segment).await, expected);
}
