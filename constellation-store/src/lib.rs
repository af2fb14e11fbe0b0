// SPDX-License-Identifier: MIT OR Apache-2.0

//! Storage layer for replicated authorization logs.
//!
//! The [`LogStore`] trait describes a content-addressed blob store holding append-only logs. Each
//! log is opened with an [`AppendValidator`] which decides which entries get merged. The
//! [`HandleManager`] sits on top of any such store and shares one underlying handle per address
//! between all concurrent users, closing it only after the last user released it.
//!
//! An in-memory implementation is provided with [`MemoryStore`].
pub mod handles;
pub mod memory;
mod traits;

pub use handles::{HandleError, HandleManager, SharedLog};
pub use memory::{HandleStats, MemoryLog, MemoryStore, StoreError};
pub use traits::{AppendValidator, BlobStore, Log, LogEvent, LogStore};
