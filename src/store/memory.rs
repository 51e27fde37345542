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

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::{Error, Result};

use super::{ChunkHandle, ChunkInfo, ChunkStorage};

/// A [`ChunkStorage`] which stores chunks in memory.
///
/// This backend is intended for testing and for embedding; chunks are persisted only for the
/// lifetime of the value. Whether chunks can grow after creation is chosen at construction time,
/// which makes it possible to exercise both write strategies of the segment layer.
///
/// [`ChunkStorage`]: crate::store::ChunkStorage
#[derive(Debug)]
pub struct MemoryChunkStore {
    chunks: RwLock<HashMap<String, Vec<u8>>>,
    appendable: bool,
}

impl MemoryChunkStore {
    /// Create a new in-memory store whose chunks can grow after creation.
    pub fn new() -> Self {
        Self {
            chunks: RwLock::new(HashMap::new()),
            appendable: true,
        }
    }

    /// Create a new in-memory store whose chunks accept exactly one write.
    ///
    /// This mimics object stores without an append primitive, where every logical append
    /// becomes a new chunk.
    pub fn non_appendable() -> Self {
        Self {
            chunks: RwLock::new(HashMap::new()),
            appendable: false,
        }
    }

    /// Append `data` directly to the chunk with the given `name`, bypassing the append
    /// capability check.
    ///
    /// This exists so tests can simulate a prior owner writing into chunks it no longer owns.
    pub fn append_raw(&self, name: &str, data: &[u8]) -> Result<()> {
        let mut chunks = self.chunks.write().unwrap();
        let chunk = chunks
            .get_mut(name)
            .ok_or_else(|| Error::ChunkNotFound(name.to_string()))?;
        chunk.extend_from_slice(data);
        Ok(())
    }
}

impl Default for MemoryChunkStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChunkStorage for MemoryChunkStore {
    fn supports_append(&self) -> bool {
        self.appendable
    }

    fn supports_truncate(&self) -> bool {
        self.appendable
    }

    fn supports_concat(&self) -> bool {
        true
    }

    async fn create(&self, name: &str) -> Result<ChunkHandle> {
        let mut chunks = self.chunks.write().unwrap();
        if chunks.contains_key(name) {
            return Err(Error::ChunkAlreadyExists(name.to_string()));
        }
        chunks.insert(name.to_string(), Vec::new());
        Ok(ChunkHandle::write(name))
    }

    async fn open_read(&self, name: &str) -> Result<ChunkHandle> {
        let chunks = self.chunks.read().unwrap();
        if !chunks.contains_key(name) {
            return Err(Error::ChunkNotFound(name.to_string()));
        }
        Ok(ChunkHandle::read(name))
    }

    async fn write(&self, handle: &ChunkHandle, offset: u64, data: &[u8]) -> Result<usize> {
        if handle.is_read_only() {
            return Err(Error::InvalidArgument("cannot write through a read-only chunk handle"));
        }
        let mut chunks = self.chunks.write().unwrap();
        let chunk = chunks
            .get_mut(handle.name())
            .ok_or_else(|| Error::ChunkNotFound(handle.name().to_string()))?;
        if offset != chunk.len() as u64 || (!self.appendable && offset != 0) {
            return Err(Error::InvalidOffset {
                chunk: handle.name().to_string(),
                offset,
            });
        }
        chunk.extend_from_slice(data);
        Ok(data.len())
    }

    async fn read(&self, handle: &ChunkHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let chunks = self.chunks.read().unwrap();
        let chunk = chunks
            .get(handle.name())
            .ok_or_else(|| Error::ChunkNotFound(handle.name().to_string()))?;
        let end = offset as usize + buf.len();
        if end > chunk.len() {
            return Err(Error::OutOfBounds(handle.name().to_string()));
        }
        buf.copy_from_slice(&chunk[offset as usize..end]);
        Ok(buf.len())
    }

    async fn concat(&self, target: &ChunkHandle, sources: &[String]) -> Result<u64> {
        let mut chunks = self.chunks.write().unwrap();
        for source in sources {
            if source == target.name() {
                return Err(Error::InvalidArgument("cannot concat a chunk into itself"));
            }
            if !chunks.contains_key(source) {
                return Err(Error::ChunkNotFound(source.to_string()));
            }
        }
        if !chunks.contains_key(target.name()) {
            return Err(Error::ChunkNotFound(target.name().to_string()));
        }
        for source in sources {
            if let Some(data) = chunks.remove(source) {
                if let Some(chunk) = chunks.get_mut(target.name()) {
                    chunk.extend_from_slice(&data);
                }
            }
        }
        Ok(chunks[target.name()].len() as u64)
    }

    async fn truncate(&self, handle: &ChunkHandle, length: u64) -> Result<()> {
        if !self.appendable {
            return Err(Error::NotSupported("truncate"));
        }
        let mut chunks = self.chunks.write().unwrap();
        let chunk = chunks
            .get_mut(handle.name())
            .ok_or_else(|| Error::ChunkNotFound(handle.name().to_string()))?;
        if length > chunk.len() as u64 {
            return Err(Error::OutOfBounds(handle.name().to_string()));
        }
        chunk.truncate(length as usize);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let mut chunks = self.chunks.write().unwrap();
        chunks
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::ChunkNotFound(name.to_string()))
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.chunks.read().unwrap().contains_key(name))
    }

    async fn info(&self, name: &str) -> Result<ChunkInfo> {
        let chunks = self.chunks.read().unwrap();
        let chunk = chunks
            .get(name)
            .ok_or_else(|| Error::ChunkNotFound(name.to_string()))?;
        Ok(ChunkInfo {
            name: name.to_string(),
            length: chunk.len() as u64,
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ChunkInfo>> {
        let chunks = self.chunks.read().unwrap();
        let mut infos = chunks
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, data)| ChunkInfo {
                name: name.clone(),
                length: data.len() as u64,
            })
            .collect::<Vec<_>>();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }
}
