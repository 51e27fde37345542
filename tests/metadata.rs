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

use segstore::metadata::{
    ChunkMetadata, ChunkMetadataStore, MemoryMetadataStore, MetadataTransaction, SegmentMetadata,
    StorageMetadata,
};
use segstore::segment::RollingPolicy;
use segstore::Error;

fn segment(name: &str) -> StorageMetadata {
    SegmentMetadata::new(name, RollingPolicy::new(1024), 1).into()
}

fn chunk(name: &str, length: u64) -> StorageMetadata {
    ChunkMetadata::new(name, length).into()
}

#[tokio::test]
async fn committed_records_are_visible() {
    let store = MemoryMetadataStore::new();
    let mut transaction = store.transaction().await.unwrap();
    transaction.create("events", segment("events"));
    transaction.create("events.chunk-0", chunk("events.chunk-0", 12));
    transaction.commit().await.unwrap();

    assert!(store.get("events").await.unwrap().is_some());
    assert_eq!(
        store
            .get("events.chunk-0")
            .await
            .unwrap()
            .unwrap()
            .into_chunk()
            .unwrap()
            .length,
        12
    );
    assert_eq!(store.keys().await.unwrap().len(), 2);
}

#[tokio::test]
async fn buffered_mutations_are_invisible_until_commit() {
    let store = MemoryMetadataStore::new();
    let mut transaction = store.transaction().await.unwrap();
    transaction.create("events", segment("events"));

    // Visible inside the transaction, not outside of it.
    assert!(transaction.get("events").await.unwrap().is_some());
    assert!(store.get("events").await.unwrap().is_none());

    transaction.abort().await.unwrap();
    transaction.commit().await.unwrap();
    assert!(store.get("events").await.unwrap().is_none());
}

#[tokio::test]
async fn conflicting_writers_cannot_both_commit() {
    let store = MemoryMetadataStore::new();
    let mut setup = store.transaction().await.unwrap();
    setup.create("events", segment("events"));
    setup.commit().await.unwrap();

    let mut first = store.transaction().await.unwrap();
    let mut second = store.transaction().await.unwrap();
    let mut record = first
        .get_for_update("events")
        .await
        .unwrap()
        .unwrap()
        .into_segment()
        .unwrap();
    second.get_for_update("events").await.unwrap();

    record.length = 100;
    first.update("events", record.into());
    first.commit().await.unwrap();

    assert!(matches!(
        second.commit().await,
        Err(Error::VersionConflict)
    ));
    assert_eq!(
        store
            .get("events")
            .await
            .unwrap()
            .unwrap()
            .into_segment()
            .unwrap()
            .length,
        100
    );
}

#[tokio::test]
async fn racing_creates_conflict() {
    let store = MemoryMetadataStore::new();
    let mut first = store.transaction().await.unwrap();
    let mut second = store.transaction().await.unwrap();
    first.create("events", segment("events"));
    second.create("events", segment("events"));

    first.commit().await.unwrap();
    assert!(matches!(
        second.commit().await,
        Err(Error::VersionConflict)
    ));
}

#[tokio::test]
async fn plain_reads_do_not_conflict() {
    let store = MemoryMetadataStore::new();
    let mut setup = store.transaction().await.unwrap();
    setup.create("events", segment("events"));
    setup.commit().await.unwrap();

    let mut reader = store.transaction().await.unwrap();
    reader.get("events").await.unwrap();

    let mut writer = store.transaction().await.unwrap();
    let record = writer.get_for_update("events").await.unwrap().unwrap();
    writer.update("events", record);
    writer.commit().await.unwrap();

    // The reader acquired no write intent, so it commits fine.
    reader.commit().await.unwrap();
}

#[tokio::test]
async fn deleted_records_are_gone() {
    let store = MemoryMetadataStore::new();
    let mut setup = store.transaction().await.unwrap();
    setup.create("events", segment("events"));
    setup.commit().await.unwrap();
    store.pin("events").await.unwrap();

    let mut transaction = store.transaction().await.unwrap();
    transaction.get_for_update("events").await.unwrap();
    transaction.delete("events");
    transaction.commit().await.unwrap();

    assert!(store.get("events").await.unwrap().is_none());
    assert!(!store.is_pinned("events"));
}

#[tokio::test]
async fn pinning_is_tracked() {
    let store = MemoryMetadataStore::new();
    let mut setup = store.transaction().await.unwrap();
    setup.create("events", segment("events"));
    setup.commit().await.unwrap();

    store.pin("events").await.unwrap();
    assert!(store.is_pinned("events"));
    store.unpin("events").await.unwrap();
    assert!(!store.is_pinned("events"));
}

#[tokio::test]
async fn type_mismatches_are_corruption() {
    let store = MemoryMetadataStore::new();
    let mut setup = store.transaction().await.unwrap();
    setup.create("events", segment("events"));
    setup.commit().await.unwrap();

    let record = store.get("events").await.unwrap().unwrap();
    assert!(matches!(
        record.into_chunk(),
        Err(Error::CorruptMetadata(_))
    ));
}
