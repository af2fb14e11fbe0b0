// SPDX-License-Identifier: MIT OR Apache-2.0

use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use constellation_core::{Address, Entry, Hash};
use tokio::sync::broadcast;

/// Predicate deciding if an entry may become part of a log.
///
/// Log stores call this hook on every append attempt before an entry gets durably merged. A
/// `false` answer means the entry is never materialized into the log's accepted state.
#[async_trait]
pub trait AppendValidator: Send + Sync {
    async fn can_append(&self, entry: &Entry) -> bool;
}

/// Content-addressed storage for arbitrary bytes.
#[async_trait]
pub trait BlobStore: Clone + Send + Sync + 'static {
    type Error: Error + Send + Sync + 'static;

    /// Store bytes and return their content hash.
    async fn put_blob(&self, bytes: Vec<u8>) -> Result<Hash, Self::Error>;

    /// Get bytes by their content hash.
    async fn get_blob(&self, hash: &Hash) -> Result<Option<Vec<u8>>, Self::Error>;
}

/// Store of replicated, append-only logs.
///
/// Entries are content-addressed blobs and can be fetched by their hash independent of the
/// handle they were appended through.
#[async_trait]
pub trait LogStore: BlobStore {
    type Log: Log<Error = Self::Error>;

    /// Open a handle to the log at this address, registering the validation hook for all
    /// appends made through it.
    async fn open(
        &self,
        address: &Address,
        validator: Arc<dyn AppendValidator>,
    ) -> Result<Self::Log, Self::Error>;

    /// Get an entry by its hash.
    ///
    /// Blobs which are not decodable as an entry are treated as missing.
    async fn get_entry(&self, hash: &Hash) -> Result<Option<Entry>, Self::Error> {
        let entry = self
            .get_blob(hash)
            .await?
            .and_then(|bytes| Entry::decode(&bytes).ok());
        Ok(entry)
    }

    /// Store an entry as a blob without appending it to any log.
    ///
    /// This is how replicated entries become available for ancestor lookups before a log had the
    /// chance to process them.
    async fn put_entry(&self, entry: &Entry) -> Result<Hash, Self::Error> {
        self.put_blob(entry.to_bytes()).await
    }
}

/// Change notifications of a log.
#[derive(Clone, Debug, PartialEq)]
pub enum LogEvent {
    /// Entry was accepted and merged.
    Appended(Entry),

    /// Log was destroyed and all of its handles are unusable.
    Destroyed,
}

/// Handle to one replicated log.
#[async_trait]
pub trait Log: Send + Sync + 'static {
    type Error: Error + Send + Sync + 'static;

    fn address(&self) -> &Address;

    /// Hashes of all entries which are not referenced by any other entry yet.
    async fn heads(&self) -> Result<Vec<Hash>, Self::Error>;

    /// All accepted entries, most-recent-first.
    async fn traverse(&self) -> Result<Vec<Entry>, Self::Error>;

    /// Attempt to append an entry.
    ///
    /// Returns `true` when the entry is part of the log after this call and `false` if it was
    /// rejected by the validation hook.
    async fn append(&self, entry: Entry) -> Result<bool, Self::Error>;

    /// Subscribe to change notifications.
    fn subscribe(&self) -> Result<broadcast::Receiver<LogEvent>, Self::Error>;

    /// Release this handle.
    async fn close(&self) -> Result<(), Self::Error>;

    /// Destroy the log, this makes every handle to it unusable.
    async fn destroy(&self) -> Result<(), Self::Error>;
}
