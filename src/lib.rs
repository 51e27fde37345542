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

#![cfg_attr(docsrs, feature(doc_cfg))]

//! `segstore` is a library for chunked, journaled, failover-safe segment storage.
//!
//! A *segment* is a named, append-only byte sequence realized as a linked list of *chunks* in a
//! flat blob store. The [`ChunkManager`] serves the segment API for one container over two
//! pluggable backends: a [`ChunkStorage`] for the bytes and a [`ChunkMetadataStore`] for the
//! layout. A rolling policy bounds how large any single chunk may grow.
//!
//! A small set of *system segments* stores the metadata of everything else, so their own layout
//! cannot depend on the metadata store surviving a failover. The [`SystemJournal`] writes every
//! structural change to a system segment ahead of the metadata commit and periodically
//! snapshots all of them; on bootstrap it rebuilds their exact layout from chunk storage alone,
//! fencing out anything written by the current epoch or newer, so a half-dead predecessor can
//! keep writing garbage without corrupting the new instance.
//!
//! See the [`segment`] module for a usage example.
//!
//! [`ChunkManager`]: crate::segment::ChunkManager
//! [`ChunkStorage`]: crate::store::ChunkStorage
//! [`ChunkMetadataStore`]: crate::metadata::ChunkMetadataStore
//! [`SystemJournal`]: crate::journal::SystemJournal
//! [`segment`]: crate::segment

pub use error::{Error, Result};

pub mod error;
pub mod journal;
pub mod metadata;
pub mod segment;
pub mod store;
