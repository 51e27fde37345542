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

use std::time::{Duration, UNIX_EPOCH};

use segstore::journal::serialize::{deserialize_batch, deserialize_batches, serialize_batch};
use segstore::journal::{
    ChunkAddedRecord, SegmentSnapshotRecord, SystemJournalRecord, SystemJournalRecordBatch,
    SystemSnapshotRecord, TruncationRecord,
};
use segstore::metadata::{ChunkMetadata, SegmentMetadata, SegmentStatus};
use segstore::segment::RollingPolicy;
use segstore::Error;

fn chunk_added(old: Option<&str>) -> SystemJournalRecord {
    SystemJournalRecord::ChunkAdded(ChunkAddedRecord {
        segment_name: String::from("_system/containers/metadata_7"),
        new_chunk_name: String::from("_system/containers/metadata_7.E-3-O-128-abc"),
        old_chunk_name: old.map(String::from),
        offset: 128,
    })
}

fn truncation(first: Option<&str>) -> SystemJournalRecord {
    SystemJournalRecord::Truncation(TruncationRecord {
        segment_name: String::from("_system/containers/metadata_7"),
        offset: 96,
        first_chunk_name: first.map(String::from),
        start_offset: 64,
    })
}

fn segment_snapshot() -> SegmentSnapshotRecord {
    let mut segment = SegmentMetadata::new(
        "_system/containers/storage_metadata_7",
        RollingPolicy::new(4096),
        3,
    );
    // The wire format keeps millisecond precision, so the fixture must too.
    segment.last_modified = UNIX_EPOCH + Duration::from_millis(1_600_000_000_000);
    segment.length = 300;
    segment.chunk_count = 2;
    segment.first_chunk = Some(String::from("chunk-0"));
    segment.last_chunk = Some(String::from("chunk-1"));
    segment.last_chunk_start_offset = 256;
    segment.status |= SegmentStatus::SYSTEM;
    SegmentSnapshotRecord {
        segment,
        chunks: vec![
            ChunkMetadata {
                name: String::from("chunk-0"),
                length: 256,
                next_chunk: Some(String::from("chunk-1")),
            },
            ChunkMetadata {
                name: String::from("chunk-1"),
                length: 44,
                next_chunk: None,
            },
        ],
    }
}

fn system_snapshot() -> SystemJournalRecord {
    SystemJournalRecord::SystemSnapshot(SystemSnapshotRecord {
        epoch: 3,
        segments: vec![segment_snapshot()],
    })
}

fn round_trip(batch: &SystemJournalRecordBatch) -> SystemJournalRecordBatch {
    let data = serialize_batch(batch).unwrap();
    let mut remaining = data.as_ref();
    let decoded = deserialize_batch(&mut remaining).unwrap();
    assert!(remaining.is_empty());
    decoded
}

#[test]
fn round_trip_chunk_added() {
    for old in [None, Some("previous-chunk")].iter() {
        let batch = SystemJournalRecordBatch {
            records: vec![chunk_added(*old)],
        };
        assert_eq!(round_trip(&batch), batch);
    }
}

#[test]
fn round_trip_truncation() {
    for first in [None, Some("surviving-chunk")].iter() {
        let batch = SystemJournalRecordBatch {
            records: vec![truncation(*first)],
        };
        assert_eq!(round_trip(&batch), batch);
    }
}

#[test]
fn round_trip_snapshots() {
    let batch = SystemJournalRecordBatch {
        records: vec![
            system_snapshot(),
            SystemJournalRecord::SegmentSnapshot(segment_snapshot()),
        ],
    };
    assert_eq!(round_trip(&batch), batch);
}

#[test]
fn round_trip_mixed_batch() {
    let batch = SystemJournalRecordBatch {
        records: vec![
            chunk_added(None),
            chunk_added(Some("previous-chunk")),
            truncation(Some("surviving-chunk")),
        ],
    };
    assert_eq!(round_trip(&batch), batch);
}

#[test]
fn empty_input_does_not_decode() {
    let mut remaining: &[u8] = &[];
    assert!(matches!(
        deserialize_batch(&mut remaining),
        Err(Error::Serialization(_))
    ));
}

#[test]
fn truncated_batch_does_not_decode() {
    let batch = SystemJournalRecordBatch {
        records: vec![chunk_added(Some("previous-chunk"))],
    };
    let data = serialize_batch(&batch).unwrap();
    for len in 0..data.len() {
        let mut remaining = &data[..len];
        assert!(
            deserialize_batch(&mut remaining).is_err(),
            "a {} byte prefix decoded",
            len
        );
    }
}

#[test]
fn unknown_version_does_not_decode() {
    let batch = SystemJournalRecordBatch {
        records: vec![chunk_added(None)],
    };
    let mut data = serialize_batch(&batch).unwrap().to_vec();
    data[0] = 0xff;
    let mut remaining = data.as_slice();
    assert!(matches!(
        deserialize_batch(&mut remaining),
        Err(Error::Serialization(_))
    ));
}

#[test]
fn decoding_stops_at_garbage() {
    let first = SystemJournalRecordBatch {
        records: vec![chunk_added(None)],
    };
    let second = SystemJournalRecordBatch {
        records: vec![truncation(None)],
    };
    let mut data = serialize_batch(&first).unwrap().to_vec();
    data.extend_from_slice(&serialize_batch(&second).unwrap());
    data.extend_from_slice(b"a zombie scribbled here");

    let batches = deserialize_batches(&data);
    assert_eq!(batches, vec![first, second]);
}

#[test]
fn garbage_only_input_decodes_to_nothing() {
    assert!(deserialize_batches(b"not a journal file").is_empty());
}

#[test]
fn consecutive_batches_decode_in_order() {
    let batches = (0..5u64)
        .map(|index| SystemJournalRecordBatch {
            records: vec![SystemJournalRecord::ChunkAdded(ChunkAddedRecord {
                segment_name: String::from("segment"),
                new_chunk_name: format!("segment.E-1-O-{}-x", index * 10),
                old_chunk_name: if index == 0 {
                    None
                } else {
                    Some(format!("segment.E-1-O-{}-x", (index - 1) * 10))
                },
                offset: index * 10,
            })],
        })
        .collect::<Vec<_>>();

    let mut data = Vec::new();
    for batch in &batches {
        data.extend_from_slice(&serialize_batch(batch).unwrap());
    }
    assert_eq!(deserialize_batches(&data), batches);
}
