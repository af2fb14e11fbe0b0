// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-memory log store implementation.
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use constellation_core::{Address, Entry, Hash};
use thiserror::Error;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, trace};

use crate::traits::{AppendValidator, BlobStore, Log, LogEvent, LogStore};

/// Number of buffered change notifications per log.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Number of underlying handles which were opened and closed for one address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HandleStats {
    pub opened: usize,
    pub closed: usize,
}

impl HandleStats {
    /// Number of currently open handles.
    pub fn open(&self) -> usize {
        self.opened.saturating_sub(self.closed)
    }
}

/// Log store keeping blobs and logs in memory.
///
/// Log state outlives the handles to it: closing a handle releases only that handle, the
/// accepted entries remain until the log gets destroyed.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    blobs: HashMap<Hash, Vec<u8>>,
    logs: HashMap<Address, Arc<LogState>>,
    stats: HashMap<Address, HandleStats>,
}

#[derive(Debug)]
struct LogState {
    entries: RwLock<HashMap<Hash, Entry>>,
    events: broadcast::Sender<LogEvent>,
    destroyed: AtomicBool,
}

impl LogState {
    fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries: RwLock::new(HashMap::new()),
            events,
            destroyed: AtomicBool::new(false),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statistics about underlying handles opened for this address.
    pub async fn handle_stats(&self, address: &Address) -> HandleStats {
        let inner = self.inner.read().await;
        inner.stats.get(address).copied().unwrap_or_default()
    }

    async fn record_close(&self, address: &Address) {
        let mut inner = self.inner.write().await;
        inner.stats.entry(address.clone()).or_default().closed += 1;
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    type Error = StoreError;

    async fn put_blob(&self, bytes: Vec<u8>) -> Result<Hash, Self::Error> {
        let hash = Hash::new(&bytes);
        let mut inner = self.inner.write().await;
        inner.blobs.entry(hash).or_insert(bytes);
        Ok(hash)
    }

    async fn get_blob(&self, hash: &Hash) -> Result<Option<Vec<u8>>, Self::Error> {
        let inner = self.inner.read().await;
        Ok(inner.blobs.get(hash).cloned())
    }
}

#[async_trait]
impl LogStore for MemoryStore {
    type Log = MemoryLog;

    async fn open(
        &self,
        address: &Address,
        validator: Arc<dyn AppendValidator>,
    ) -> Result<Self::Log, Self::Error> {
        let state = {
            let mut inner = self.inner.write().await;
            inner.stats.entry(address.clone()).or_default().opened += 1;
            inner
                .logs
                .entry(address.clone())
                .or_insert_with(|| Arc::new(LogState::new()))
                .clone()
        };

        trace!(%address, "opened log handle");

        Ok(MemoryLog {
            address: address.clone(),
            state,
            store: self.clone(),
            validator,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Handle to a log kept in a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryLog {
    address: Address,
    state: Arc<LogState>,
    store: MemoryStore,
    validator: Arc<dyn AppendValidator>,
    closed: Arc<AtomicBool>,
}

impl MemoryLog {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::SeqCst) || self.state.destroyed.load(Ordering::SeqCst) {
            return Err(StoreError::Closed(self.address.clone()));
        }
        Ok(())
    }

    /// Collect ancestors of an entry which are available as blobs but not part of this log yet
    /// and keep the ones the validation hook accepts, oldest first.
    async fn join_ancestors(&self, entry: &Entry) -> Result<Vec<Entry>, StoreError> {
        let mut queue: VecDeque<Hash> = entry.next.iter().copied().collect();
        let mut visited = HashSet::new();
        let mut missing = Vec::new();

        while let Some(hash) = queue.pop_front() {
            if !visited.insert(hash) {
                continue;
            }

            if self.state.entries.read().await.contains_key(&hash) {
                continue;
            }

            let Some(parent) = self.store.get_entry(&hash).await? else {
                trace!(address = %self.address, hash = %hash.short(), "ancestor not available");
                continue;
            };

            if parent.id != self.address {
                continue;
            }

            queue.extend(parent.next.iter().copied());
            missing.push(parent);
        }

        missing.sort_by(|a, b| a.clock.cmp(&b.clock).then_with(|| a.hash().cmp(&b.hash())));

        let mut accepted = Vec::with_capacity(missing.len());
        for parent in missing {
            if self.validator.can_append(&parent).await {
                accepted.push(parent);
            }
        }

        Ok(accepted)
    }

    async fn merge(&self, entries: Vec<Entry>) -> Result<(), StoreError> {
        for entry in entries {
            let hash = self.store.put_entry(&entry).await?;
            let inserted = {
                let mut accepted = self.state.entries.write().await;
                accepted.insert(hash, entry.clone()).is_none()
            };

            if inserted {
                trace!(address = %self.address, hash = %hash.short(), "merged entry");
                // Nobody listening is not an error.
                let _ = self.state.events.send(LogEvent::Appended(entry));
            }
        }

        Ok(())
    }
}

impl fmt::Debug for MemoryLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryLog")
            .field("address", &self.address)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl Log for MemoryLog {
    type Error = StoreError;

    fn address(&self) -> &Address {
        &self.address
    }

    async fn heads(&self) -> Result<Vec<Hash>, Self::Error> {
        self.ensure_open()?;
        let entries = self.state.entries.read().await;
        let referenced: HashSet<&Hash> = entries.values().flat_map(|entry| &entry.next).collect();
        let mut heads: Vec<Hash> = entries
            .keys()
            .filter(|hash| !referenced.contains(hash))
            .copied()
            .collect();
        heads.sort();
        Ok(heads)
    }

    async fn traverse(&self) -> Result<Vec<Entry>, Self::Error> {
        self.ensure_open()?;
        let entries = self.state.entries.read().await;
        let mut result: Vec<(Hash, Entry)> = entries
            .iter()
            .map(|(hash, entry)| (*hash, entry.clone()))
            .collect();
        result.sort_by(|(hash_a, a), (hash_b, b)| {
            b.clock.cmp(&a.clock).then_with(|| hash_b.cmp(hash_a))
        });
        Ok(result.into_iter().map(|(_, entry)| entry).collect())
    }

    async fn append(&self, entry: Entry) -> Result<bool, Self::Error> {
        self.ensure_open()?;

        if entry.id != self.address {
            debug!(address = %self.address, log_id = %entry.id, "entry belongs to another log");
            return Ok(false);
        }

        let hash = entry.hash();
        if self.state.entries.read().await.contains_key(&hash) {
            return Ok(true);
        }

        if !self.validator.can_append(&entry).await {
            debug!(address = %self.address, hash = %hash.short(), "entry rejected");
            return Ok(false);
        }

        // The log might have been closed while the validator was busy.
        self.ensure_open()?;

        let mut entries = self.join_ancestors(&entry).await?;
        entries.push(entry);
        self.merge(entries).await?;

        Ok(true)
    }

    fn subscribe(&self) -> Result<broadcast::Receiver<LogEvent>, Self::Error> {
        self.ensure_open()?;
        Ok(self.state.events.subscribe())
    }

    async fn close(&self) -> Result<(), Self::Error> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.store.record_close(&self.address).await;
            trace!(address = %self.address, "closed log handle");
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), Self::Error> {
        if self.state.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        {
            let mut inner = self.store.inner.write().await;
            inner.logs.remove(&self.address);
        }

        let _ = self.state.events.send(LogEvent::Destroyed);
        self.close().await?;
        debug!(address = %self.address, "destroyed log");

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("log {0} is closed")]
    Closed(Address),
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use constellation_core::{Address, Entry, Hash, Identity, Payload, PrivateKey};

    use crate::traits::{AppendValidator, BlobStore, Log, LogEvent, LogStore};

    use super::{MemoryStore, StoreError};

    /// Accepts every entry except for grants of the "REJECT" value.
    struct TestValidator;

    #[async_trait]
    impl AppendValidator for TestValidator {
        async fn can_append(&self, entry: &Entry) -> bool {
            entry.payload.value.as_deref() != Some("REJECT")
        }
    }

    fn address() -> Address {
        Address::new("test", Hash::new(b"log")).unwrap()
    }

    fn entry(private_key: &PrivateKey, value: &str, next: Vec<Hash>, clock: u64) -> Entry {
        let identity = Identity::new(private_key);
        let mut entry = Entry::new(
            address(),
            identity.hash(),
            Payload::put("bob", value),
            next,
            clock,
        );
        entry.sign(private_key);
        entry
    }

    #[tokio::test]
    async fn append_and_traverse() {
        let store = MemoryStore::new();
        let log = store.open(&address(), Arc::new(TestValidator)).await.unwrap();
        let private_key = PrivateKey::new();

        let entry_1 = entry(&private_key, "MEMBER", vec![], 1);
        let entry_2 = entry(&private_key, "MODERATOR", vec![entry_1.hash()], 2);

        assert!(log.append(entry_1.clone()).await.unwrap());
        assert!(log.append(entry_2.clone()).await.unwrap());

        // Appending again is a no-op which still reports the entry as part of the log.
        assert!(log.append(entry_2.clone()).await.unwrap());

        assert_eq!(log.traverse().await.unwrap(), vec![entry_2.clone(), entry_1.clone()]);
        assert_eq!(log.heads().await.unwrap(), vec![entry_2.hash()]);

        // Entries are content-addressed independent of the handle.
        assert_eq!(store.get_entry(&entry_1.hash()).await.unwrap(), Some(entry_1));
    }

    #[tokio::test]
    async fn validator_rejects() {
        let store = MemoryStore::new();
        let log = store.open(&address(), Arc::new(TestValidator)).await.unwrap();
        let private_key = PrivateKey::new();

        let rejected = entry(&private_key, "REJECT", vec![], 1);
        assert!(!log.append(rejected.clone()).await.unwrap());
        assert!(log.traverse().await.unwrap().is_empty());
        assert_eq!(store.get_entry(&rejected.hash()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn entry_of_other_log_is_rejected() {
        let store = MemoryStore::new();
        let log = store.open(&address(), Arc::new(TestValidator)).await.unwrap();
        let private_key = PrivateKey::new();

        let mut foreign = entry(&private_key, "MEMBER", vec![], 1);
        foreign.id = Address::new("test", Hash::new(b"other")).unwrap();
        foreign.sign(&private_key);

        assert!(!log.append(foreign).await.unwrap());
    }

    #[tokio::test]
    async fn join_available_ancestors() {
        let store = MemoryStore::new();
        let log = store.open(&address(), Arc::new(TestValidator)).await.unwrap();
        let private_key = PrivateKey::new();

        let entry_1 = entry(&private_key, "MEMBER", vec![], 1);
        let entry_2 = entry(&private_key, "MEMBER", vec![entry_1.hash()], 2);
        let entry_3 = entry(&private_key, "MODERATOR", vec![entry_2.hash()], 3);

        // Replicated ancestors are available as blobs before the log processed them.
        store.put_entry(&entry_1).await.unwrap();
        store.put_entry(&entry_2).await.unwrap();

        let mut events = log.subscribe().unwrap();
        assert!(log.append(entry_3.clone()).await.unwrap());

        assert_eq!(log.traverse().await.unwrap(), vec![entry_3.clone(), entry_2.clone(), entry_1.clone()]);

        // Notifications arrive in causal order.
        assert_eq!(events.recv().await.unwrap(), LogEvent::Appended(entry_1));
        assert_eq!(events.recv().await.unwrap(), LogEvent::Appended(entry_2));
        assert_eq!(events.recv().await.unwrap(), LogEvent::Appended(entry_3));
    }

    #[tokio::test]
    async fn concurrent_heads() {
        let store = MemoryStore::new();
        let log = store.open(&address(), Arc::new(TestValidator)).await.unwrap();
        let private_key = PrivateKey::new();

        let root = entry(&private_key, "MEMBER", vec![], 1);
        let left = entry(&private_key, "MEMBER", vec![root.hash()], 2);
        let right = entry(&private_key, "MODERATOR", vec![root.hash()], 2);

        for entry in [root, left.clone(), right.clone()] {
            assert!(log.append(entry).await.unwrap());
        }

        let mut expected = vec![left.hash(), right.hash()];
        expected.sort();
        assert_eq!(log.heads().await.unwrap(), expected);
    }

    #[tokio::test]
    async fn closed_and_destroyed_handles() {
        let store = MemoryStore::new();
        let log_1 = store.open(&address(), Arc::new(TestValidator)).await.unwrap();
        let log_2 = store.open(&address(), Arc::new(TestValidator)).await.unwrap();
        let private_key = PrivateKey::new();

        assert!(log_1.append(entry(&private_key, "MEMBER", vec![], 1)).await.unwrap());

        log_1.close().await.unwrap();
        assert!(matches!(log_1.traverse().await, Err(StoreError::Closed(_))));

        // State outlives closed handles.
        assert_eq!(log_2.traverse().await.unwrap().len(), 1);

        let stats = store.handle_stats(&address()).await;
        assert_eq!(stats.opened, 2);
        assert_eq!(stats.closed, 1);
        assert_eq!(stats.open(), 1);

        // Destroying affects every handle, data is gone for new handles as well.
        let mut events = log_2.subscribe().unwrap();
        log_2.destroy().await.unwrap();
        assert_eq!(events.recv().await.unwrap(), LogEvent::Destroyed);
        assert!(matches!(log_2.heads().await, Err(StoreError::Closed(_))));

        let log_3 = store.open(&address(), Arc::new(TestValidator)).await.unwrap();
        assert!(log_3.traverse().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn blobs_are_content_addressed() {
        let store = MemoryStore::new();
        let hash = store.put_blob(b"hello".to_vec()).await.unwrap();
        assert_eq!(hash, Hash::new(b"hello"));
        assert_eq!(store.get_blob(&hash).await.unwrap(), Some(b"hello".to_vec()));
        assert_eq!(store.get_blob(&Hash::new(b"nope")).await.unwrap(), None);
    }
}
