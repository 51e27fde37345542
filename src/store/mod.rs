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

//! Low-level chunk storage backends.
//!
//! A [`ChunkStorage`] is a flat store of named, append-only blobs called chunks. The segment
//! layer never mutates chunk contents in place; chunks only grow at the tail (on backends which
//! support appending) or are written exactly once (on backends which don't).
//!
//! Backends advertise what they can do through capability flags, and the segment layer picks its
//! write and concat strategies accordingly.
//!
//! [`ChunkStorage`]: crate::store::ChunkStorage

pub use self::memory::MemoryChunkStore;

mod memory;

use async_trait::async_trait;

/// A handle for accessing a chunk in a [`ChunkStorage`].
///
/// A handle doesn't own any data; it names a chunk and records whether it was opened for
/// writing.
///
/// [`ChunkStorage`]: crate::store::ChunkStorage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHandle {
    name: String,
    read_only: bool,
}

impl ChunkHandle {
    /// Create a read-only handle for the chunk with the given `name`.
    pub fn read(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            read_only: true,
        }
    }

    /// Create a writable handle for the chunk with the given `name`.
    pub fn write(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            read_only: false,
        }
    }

    /// The name of the chunk this handle refers to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle can be used for writing.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}

/// Information about a chunk in a [`ChunkStorage`].
///
/// [`ChunkStorage`]: crate::store::ChunkStorage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    /// The name of the chunk.
    pub name: String,

    /// The current length of the chunk in bytes.
    pub length: u64,
}

/// A flat store of named, append-only blobs.
///
/// Implementations must be safe to share across tasks; all operations take `&self`.
#[async_trait]
pub trait ChunkStorage: Send + Sync {
    /// Whether chunks can grow after they are created.
    ///
    /// When this is `false`, each chunk accepts exactly one write, at offset 0, and is immutable
    /// afterwards.
    fn supports_append(&self) -> bool;

    /// Whether chunks can be truncated in place with [`truncate`].
    ///
    /// [`truncate`]: crate::store::ChunkStorage::truncate
    fn supports_truncate(&self) -> bool;

    /// Whether the backend can concatenate chunks server-side with [`concat`].
    ///
    /// [`concat`]: crate::store::ChunkStorage::concat
    fn supports_concat(&self) -> bool;

    /// Create a new, empty chunk with the given `name` and return a writable handle.
    ///
    /// # Errors
    /// - `Error::ChunkAlreadyExists`: A chunk with this name already exists.
    async fn create(&self, name: &str) -> crate::Result<ChunkHandle>;

    /// Open the chunk with the given `name` for reading.
    ///
    /// # Errors
    /// - `Error::ChunkNotFound`: There is no chunk with this name.
    async fn open_read(&self, name: &str) -> crate::Result<ChunkHandle>;

    /// Write `data` to the chunk at the given `offset` and return the number of bytes written.
    ///
    /// Writes must be contiguous: `offset` must equal the current length of the chunk.
    ///
    /// # Errors
    /// - `Error::ChunkNotFound`: There is no chunk with this name.
    /// - `Error::InvalidOffset`: `offset` is not the current length of the chunk, or the chunk
    /// is already written and the backend does not support appending.
    /// - `Error::InvalidArgument`: The handle is read-only.
    async fn write(&self, handle: &ChunkHandle, offset: u64, data: &[u8]) -> crate::Result<usize>;

    /// Read from the chunk at the given `offset`, filling `buf`, and return the number of bytes
    /// read.
    ///
    /// # Errors
    /// - `Error::ChunkNotFound`: There is no chunk with this name.
    /// - `Error::OutOfBounds`: The requested range extends past the end of the chunk.
    async fn read(&self, handle: &ChunkHandle, offset: u64, buf: &mut [u8])
        -> crate::Result<usize>;

    /// Atomically append the contents of `sources` to `target`, delete the sources, and return
    /// the new length of the target.
    ///
    /// # Errors
    /// - `Error::NotSupported`: The backend does not support server-side concat.
    /// - `Error::ChunkNotFound`: The target or one of the sources does not exist.
    /// - `Error::InvalidArgument`: `sources` contains the target itself.
    async fn concat(&self, target: &ChunkHandle, sources: &[String]) -> crate::Result<u64> {
        let _ = (target, sources);
        Err(crate::Error::NotSupported("concat"))
    }

    /// Truncate the chunk to `length` bytes.
    ///
    /// # Errors
    /// - `Error::NotSupported`: The backend does not support truncation.
    /// - `Error::ChunkNotFound`: There is no chunk with this name.
    /// - `Error::OutOfBounds`: `length` is greater than the current length of the chunk.
    async fn truncate(&self, handle: &ChunkHandle, length: u64) -> crate::Result<()> {
        let _ = (handle, length);
        Err(crate::Error::NotSupported("truncate"))
    }

    /// Delete the chunk with the given `name`.
    ///
    /// # Errors
    /// - `Error::ChunkNotFound`: There is no chunk with this name.
    async fn delete(&self, name: &str) -> crate::Result<()>;

    /// Return whether a chunk with the given `name` exists.
    async fn exists(&self, name: &str) -> crate::Result<bool>;

    /// Return information about the chunk with the given `name`.
    ///
    /// # Errors
    /// - `Error::ChunkNotFound`: There is no chunk with this name.
    async fn info(&self, name: &str) -> crate::Result<ChunkInfo>;

    /// List all chunks whose names start with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> crate::Result<Vec<ChunkInfo>>;
}
