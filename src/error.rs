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

use std::io;

use thiserror::Error;

/// The result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for this crate.
///
/// Errors which originate in a chunk storage backend are wrapped in
/// [`Error::ChunkStorage`]; everything else maps one-to-one to a failure mode of the segment or
/// journal layer.
///
/// [`Error::ChunkStorage`]: crate::Error::ChunkStorage
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The requested segment does not exist.
    #[error("there is no segment with the name `{0}`")]
    SegmentNotFound(String),

    /// A segment with this name already exists.
    #[error("a segment with the name `{0}` already exists")]
    SegmentExists(String),

    /// The segment is sealed and can no longer be written to or truncated.
    #[error("the segment `{0}` is sealed")]
    SegmentSealed(String),

    /// A write was not a strict append, or a truncation offset was outside the valid range.
    #[error("offset {offset} is not valid for segment `{segment}`")]
    BadOffset {
        /// The name of the segment.
        segment: String,
        /// The offending offset.
        offset: u64,
    },

    /// A read was outside the readable range of the segment.
    #[error("the requested range is outside the readable range of segment `{0}`")]
    OutOfBounds(String),

    /// The segment is owned by a higher epoch; this instance has been fenced out.
    #[error("the segment `{0}` is owned by a newer epoch")]
    StorageNotPrimary(String),

    /// A metadata transaction conflicted with a concurrent transaction.
    ///
    /// Callers retry the whole operation with bounded backoff before surfacing this.
    #[error("the metadata transaction conflicted with a concurrent transaction")]
    VersionConflict,

    /// The requested chunk does not exist in chunk storage.
    #[error("there is no chunk with the name `{0}`")]
    ChunkNotFound(String),

    /// A chunk with this name already exists in chunk storage.
    #[error("a chunk with the name `{0}` already exists")]
    ChunkAlreadyExists(String),

    /// A chunk write was not contiguous with the current chunk length.
    #[error("offset {offset} is not the current length of chunk `{chunk}`")]
    InvalidOffset {
        /// The name of the chunk.
        chunk: String,
        /// The offending offset.
        offset: u64,
    },

    /// The chunk storage backend does not support the requested operation.
    #[error("the chunk storage backend does not support `{0}`")]
    NotSupported(&'static str),

    /// An argument was structurally invalid for the requested operation.
    #[error("{0}")]
    InvalidArgument(&'static str),

    /// An error occurred in the chunk storage backend.
    #[error("an error occurred in the chunk storage backend: {0}")]
    ChunkStorage(anyhow::Error),

    /// A record batch could not be durably appended to the system journal.
    ///
    /// The operation which produced the batch fails without any metadata change.
    #[error("a record batch could not be appended to the system journal: {0}")]
    JournalWrite(#[source] Box<Error>),

    /// Recovery could not rebuild the system segments. The container must not proceed.
    #[error("bootstrap could not rebuild the system segment state: {0}")]
    Bootstrap(String),

    /// A journal record, batch, or snapshot could not be serialized or deserialized.
    #[error("invalid journal data: {0}")]
    Serialization(String),

    /// The operation did not complete before its deadline.
    #[error("the operation did not complete before its deadline")]
    OperationTimeout,

    /// The operation was cancelled by the caller.
    #[error("the operation was cancelled")]
    OperationCancelled,

    /// The chunk manager has not been initialized and bootstrapped yet.
    #[error("the container has not been bootstrapped")]
    ContainerNotReady,

    /// A metadata record had an unexpected shape.
    ///
    /// This indicates a corrupted metadata store and is not recoverable by retrying.
    #[error("corrupt metadata: {0}")]
    CorruptMetadata(String),

    /// An I/O error occurred.
    #[error("an I/O error occurred: {0}")]
    Io(#[from] io::Error),
}
