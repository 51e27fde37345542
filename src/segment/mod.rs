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

//! The segment API: named, append-only byte sequences stored as chunk lists.
//!
//! This module contains the [`ChunkManager`], the engine which serves one container's
//! segments. Segments are created, appended to, read, truncated, sealed, concatenated, and
//! deleted through it; every operation is asynchronous and optionally deadline-bounded.
//!
//! # Examples
//! Create a segment, write to it, and read it back.
//! ```
//!     use std::sync::Arc;
//!
//!     use segstore::metadata::MemoryMetadataStore;
//!     use segstore::segment::{ChunkManager, ChunkManagerConfig, RollingPolicy};
//!     use segstore::store::MemoryChunkStore;
//!
//!     #[tokio::main(flavor = "current_thread")]
//!     async fn main() -> segstore::Result<()> {
//!         let manager = ChunkManager::new(
//!             0,
//!             Arc::new(MemoryChunkStore::new()),
//!             Arc::new(MemoryMetadataStore::new()),
//!             ChunkManagerConfig::default(),
//!         );
//!         manager.initialize(1)?;
//!         manager.bootstrap(None).await?;
//!
//!         manager.create("events", Some(RollingPolicy::new(1024)), None).await?;
//!         let handle = manager.open_write("events", None).await?;
//!         manager.write(&handle, 0, b"hello", None).await?;
//!
//!         let handle = manager.open_read("events", None).await?;
//!         let mut contents = vec![0; 5];
//!         manager.read(&handle, 0, &mut contents, None).await?;
//!
//!         assert_eq!(contents, b"hello");
//!         Ok(())
//!     }
//! ```

pub use self::config::{ChunkManagerConfig, RollingPolicy};
pub use self::handle::{SegmentHandle, SegmentInfo};
pub use self::manager::ChunkManager;

mod config;
mod handle;
mod manager;
