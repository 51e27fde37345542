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

//! The wire format for journal records.
//!
//! Every batch starts with a format version byte and a body length prefix so that future
//! versions can be added and so that a truncated or garbage tail fails to decode instead of
//! being misread. Integers are fixed-width, signed, and big-endian; strings are length-prefixed
//! UTF-8 with a one-byte presence flag when nullable; arrays are length-prefixed.

use std::convert::TryFrom;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::metadata::{ChunkMetadata, SegmentMetadata, SegmentStatus};
use crate::{Error, Result};

use super::record::{
    ChunkAddedRecord, SegmentSnapshotRecord, SystemJournalRecord, SystemJournalRecordBatch,
    SystemSnapshotRecord, TruncationRecord,
};

/// The current version of the batch framing format.
pub const BATCH_FORMAT_VERSION: u8 = 1;

const CHUNK_ADDED: u8 = 1;
const TRUNCATION: u8 = 2;
const SEGMENT_SNAPSHOT: u8 = 3;
const SYSTEM_SNAPSHOT: u8 = 4;

/// The number of bytes of framing before a batch body: the version byte and the length prefix.
const BATCH_HEADER_LEN: usize = 5;

/// Serialize a batch into a single blob.
pub fn serialize_batch(batch: &SystemJournalRecordBatch) -> Result<Bytes> {
    let mut body = BytesMut::new();
    put_count(&mut body, batch.records.len())?;
    for record in &batch.records {
        put_record(&mut body, record)?;
    }

    let mut framed = BytesMut::with_capacity(BATCH_HEADER_LEN + body.len());
    framed.put_u8(BATCH_FORMAT_VERSION);
    let body_len = u32::try_from(body.len())
        .map_err(|_| Error::Serialization(String::from("batch body is too large")))?;
    framed.put_u32(body_len);
    framed.extend_from_slice(&body);
    Ok(framed.freeze())
}

/// Deserialize one batch from the front of `input`, advancing it past the batch.
///
/// # Errors
/// - `Error::Serialization`: The data is truncated, carries an unknown version, or does not
/// decode to a well-formed batch.
pub fn deserialize_batch(input: &mut &[u8]) -> Result<SystemJournalRecordBatch> {
    if input.remaining() < BATCH_HEADER_LEN {
        return Err(truncated());
    }
    let version = input.get_u8();
    if version != BATCH_FORMAT_VERSION {
        return Err(Error::Serialization(format!(
            "unsupported batch format version {}",
            version
        )));
    }
    let body_len = input.get_u32() as usize;
    if input.remaining() < body_len {
        return Err(truncated());
    }
    let (body, rest) = input.split_at(body_len);

    let mut body = body;
    let count = get_count(&mut body)?;
    // Each record is at least one byte, so a count larger than the body is garbage.
    if count > body.len() {
        return Err(Error::Serialization(String::from("record count is invalid")));
    }
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        records.push(get_record(&mut body)?);
    }
    if !body.is_empty() {
        return Err(Error::Serialization(String::from(
            "trailing bytes inside a batch body",
        )));
    }

    *input = rest;
    Ok(SystemJournalRecordBatch { records })
}

/// Deserialize consecutive batches from `data` until it is exhausted or a batch fails to
/// decode.
///
/// A decode failure ends the sequence without being an error: a torn tail from a crash, or
/// garbage appended by a fenced-out writer, simply terminates replay of the blob.
pub fn deserialize_batches(data: &[u8]) -> Vec<SystemJournalRecordBatch> {
    let mut remaining = data;
    let mut batches = Vec::new();
    while !remaining.is_empty() {
        match deserialize_batch(&mut remaining) {
            Ok(batch) => batches.push(batch),
            Err(_) => break,
        }
    }
    batches
}

fn put_record(buf: &mut BytesMut, record: &SystemJournalRecord) -> Result<()> {
    match record {
        SystemJournalRecord::ChunkAdded(record) => {
            buf.put_u8(CHUNK_ADDED);
            put_string(buf, &record.segment_name)?;
            put_string(buf, &record.new_chunk_name)?;
            put_opt_string(buf, &record.old_chunk_name)?;
            put_offset(buf, record.offset)?;
        }
        SystemJournalRecord::Truncation(record) => {
            buf.put_u8(TRUNCATION);
            put_string(buf, &record.segment_name)?;
            put_offset(buf, record.offset)?;
            put_opt_string(buf, &record.first_chunk_name)?;
            put_offset(buf, record.start_offset)?;
        }
        SystemJournalRecord::SegmentSnapshot(record) => {
            buf.put_u8(SEGMENT_SNAPSHOT);
            put_segment_snapshot(buf, record)?;
        }
        SystemJournalRecord::SystemSnapshot(record) => {
            buf.put_u8(SYSTEM_SNAPSHOT);
            put_offset(buf, record.epoch)?;
            put_count(buf, record.segments.len())?;
            for segment in &record.segments {
                put_segment_snapshot(buf, segment)?;
            }
        }
    }
    Ok(())
}

fn get_record(buf: &mut &[u8]) -> Result<SystemJournalRecord> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    match buf.get_u8() {
        CHUNK_ADDED => Ok(SystemJournalRecord::ChunkAdded(ChunkAddedRecord {
            segment_name: get_string(buf)?,
            new_chunk_name: get_string(buf)?,
            old_chunk_name: get_opt_string(buf)?,
            offset: get_offset(buf)?,
        })),
        TRUNCATION => Ok(SystemJournalRecord::Truncation(TruncationRecord {
            segment_name: get_string(buf)?,
            offset: get_offset(buf)?,
            first_chunk_name: get_opt_string(buf)?,
            start_offset: get_offset(buf)?,
        })),
        SEGMENT_SNAPSHOT => Ok(SystemJournalRecord::SegmentSnapshot(get_segment_snapshot(
            buf,
        )?)),
        SYSTEM_SNAPSHOT => {
            let epoch = get_offset(buf)?;
            let count = get_count(buf)?;
            let mut segments = Vec::with_capacity(count.min(buf.remaining()));
            for _ in 0..count {
                segments.push(get_segment_snapshot(buf)?);
            }
            Ok(SystemJournalRecord::SystemSnapshot(SystemSnapshotRecord {
                epoch,
                segments,
            }))
        }
        discriminator => Err(Error::Serialization(format!(
            "unknown record discriminator {}",
            discriminator
        ))),
    }
}

fn put_segment_snapshot(buf: &mut BytesMut, record: &SegmentSnapshotRecord) -> Result<()> {
    put_segment_metadata(buf, &record.segment)?;
    put_count(buf, record.chunks.len())?;
    for chunk in &record.chunks {
        put_chunk_metadata(buf, chunk)?;
    }
    Ok(())
}

fn get_segment_snapshot(buf: &mut &[u8]) -> Result<SegmentSnapshotRecord> {
    let segment = get_segment_metadata(buf)?;
    let count = get_count(buf)?;
    let mut chunks = Vec::with_capacity(count.min(buf.remaining()));
    for _ in 0..count {
        chunks.push(get_chunk_metadata(buf)?);
    }
    Ok(SegmentSnapshotRecord { segment, chunks })
}

fn put_segment_metadata(buf: &mut BytesMut, segment: &SegmentMetadata) -> Result<()> {
    put_string(buf, &segment.name)?;
    put_offset(buf, segment.length)?;
    put_offset(buf, segment.start_offset)?;
    buf.put_u32(segment.chunk_count);
    put_opt_string(buf, &segment.first_chunk)?;
    put_opt_string(buf, &segment.last_chunk)?;
    put_offset(buf, segment.first_chunk_start_offset)?;
    put_offset(buf, segment.last_chunk_start_offset)?;
    put_offset(buf, segment.max_rolling_length)?;
    buf.put_u32(segment.status.bits());
    put_offset(buf, segment.owner_epoch)?;
    buf.put_i64(time_to_millis(segment.last_modified));
    Ok(())
}

fn get_segment_metadata(buf: &mut &[u8]) -> Result<SegmentMetadata> {
    let name = get_string(buf)?;
    let length = get_offset(buf)?;
    let start_offset = get_offset(buf)?;
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    let chunk_count = buf.get_u32();
    let first_chunk = get_opt_string(buf)?;
    let last_chunk = get_opt_string(buf)?;
    let first_chunk_start_offset = get_offset(buf)?;
    let last_chunk_start_offset = get_offset(buf)?;
    let max_rolling_length = get_offset(buf)?;
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    let status = SegmentStatus::from_bits_truncate(buf.get_u32());
    let owner_epoch = get_offset(buf)?;
    if buf.remaining() < 8 {
        return Err(truncated());
    }
    let last_modified = millis_to_time(buf.get_i64());
    Ok(SegmentMetadata {
        name,
        length,
        start_offset,
        chunk_count,
        first_chunk,
        last_chunk,
        first_chunk_start_offset,
        last_chunk_start_offset,
        max_rolling_length,
        status,
        owner_epoch,
        last_modified,
    })
}

fn put_chunk_metadata(buf: &mut BytesMut, chunk: &ChunkMetadata) -> Result<()> {
    put_string(buf, &chunk.name)?;
    put_offset(buf, chunk.length)?;
    put_opt_string(buf, &chunk.next_chunk)?;
    Ok(())
}

fn get_chunk_metadata(buf: &mut &[u8]) -> Result<ChunkMetadata> {
    Ok(ChunkMetadata {
        name: get_string(buf)?,
        length: get_offset(buf)?,
        next_chunk: get_opt_string(buf)?,
    })
}

fn put_string(buf: &mut BytesMut, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| Error::Serialization(String::from("string is too long to encode")))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn get_string(buf: &mut &[u8]) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(truncated());
    }
    let (bytes, rest) = buf.split_at(len);
    let value = String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::Serialization(String::from("string is not valid UTF-8")))?;
    *buf = rest;
    Ok(value)
}

fn put_opt_string(buf: &mut BytesMut, value: &Option<String>) -> Result<()> {
    match value {
        Some(value) => {
            buf.put_u8(1);
            put_string(buf, value)
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

fn get_opt_string(buf: &mut &[u8]) -> Result<Option<String>> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    match buf.get_u8() {
        0 => Ok(None),
        1 => Ok(Some(get_string(buf)?)),
        flag => Err(Error::Serialization(format!(
            "invalid presence flag {}",
            flag
        ))),
    }
}

fn put_offset(buf: &mut BytesMut, value: u64) -> Result<()> {
    let value = i64::try_from(value)
        .map_err(|_| Error::Serialization(String::from("value does not fit in a signed field")))?;
    buf.put_i64(value);
    Ok(())
}

fn get_offset(buf: &mut &[u8]) -> Result<u64> {
    if buf.remaining() < 8 {
        return Err(truncated());
    }
    let value = buf.get_i64();
    u64::try_from(value)
        .map_err(|_| Error::Serialization(format!("field has a negative value {}", value)))
}

fn put_count(buf: &mut BytesMut, count: usize) -> Result<()> {
    let count = u32::try_from(count)
        .map_err(|_| Error::Serialization(String::from("array is too long to encode")))?;
    buf.put_u32(count);
    Ok(())
}

fn get_count(buf: &mut &[u8]) -> Result<usize> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_u32() as usize)
}

fn time_to_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}

fn millis_to_time(millis: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64)
}

fn truncated() -> Error {
    Error::Serialization(String::from("unexpected end of data"))
}
