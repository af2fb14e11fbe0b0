// SPDX-License-Identifier: MIT OR Apache-2.0

//! Reference-counted log handles.
//!
//! Many components ask for a handle to the same log at roughly the same time: every access
//! controller follows its own log, nested account lookups open the logs of other controllers and
//! applications open logs to write to them. The [`HandleManager`] makes sure that all of these
//! users share one underlying handle per address.
//!
//! Every address gets one slot which is never removed. Opening and releasing a handle is
//! serialized through the slot's async mutex, so only the first open reaches the store and only
//! the last release closes the underlying handle again.
//!
//! Destroying a log bypasses counting. The slot starts a new generation and every [`SharedLog`]
//! handed out before becomes stale: releasing it is a no-op while all other operations fail with
//! the store's error for closed logs.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use constellation_core::{Address, Entry, Hash};
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, trace};

use crate::traits::{AppendValidator, Log, LogEvent, LogStore};

struct Slot<L> {
    state: Mutex<SlotState<L>>,
}

struct SlotState<L> {
    log: Option<Arc<L>>,
    refs: usize,
    generation: u64,
}

impl<L> Default for Slot<L> {
    fn default() -> Self {
        Self {
            state: Mutex::new(SlotState {
                log: None,
                refs: 0,
                generation: 0,
            }),
        }
    }
}

impl<L: Log> Slot<L> {
    async fn release(&self, address: &Address, generation: u64) -> Result<(), HandleError<L::Error>> {
        let mut state = self.state.lock().await;

        // Handle was invalidated by destroying the log or shutting down.
        if state.generation != generation {
            trace!(%address, "release of stale log handle");
            return Ok(());
        }

        if state.refs == 0 {
            error!(%address, "log handle released more often than it was opened");
            return Err(HandleError::Exhausted(address.clone()));
        }

        state.refs -= 1;
        trace!(%address, refs = state.refs, "released log handle");

        if state.refs == 0 {
            if let Some(log) = state.log.take() {
                log.close().await.map_err(HandleError::Store)?;
                debug!(%address, "closed underlying log handle");
            }
        }

        Ok(())
    }
}

/// Shares one underlying log handle per address between all concurrent users.
pub struct HandleManager<S: LogStore> {
    store: S,
    slots: Mutex<HashMap<Address, Arc<Slot<S::Log>>>>,
}

impl<S: LogStore> HandleManager<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    async fn slot(&self, address: &Address) -> Arc<Slot<S::Log>> {
        let mut slots = self.slots.lock().await;
        slots.entry(address.clone()).or_default().clone()
    }

    /// Open a counted handle to the log at this address.
    ///
    /// The validation hook is only registered when this call opens the underlying handle, later
    /// callers share the hook of the first one.
    pub async fn open(
        &self,
        address: &Address,
        validator: Arc<dyn AppendValidator>,
    ) -> Result<SharedLog<S::Log>, HandleError<S::Error>> {
        let slot = self.slot(address).await;
        let mut state = slot.state.lock().await;

        let log = match &state.log {
            Some(log) => log.clone(),
            None => {
                let log = self
                    .store
                    .open(address, validator)
                    .await
                    .map_err(HandleError::Store)?;
                debug!(%address, "opened underlying log handle");
                let log = Arc::new(log);
                state.log = Some(log.clone());
                log
            }
        };

        state.refs += 1;
        trace!(%address, refs = state.refs, "acquired log handle");

        Ok(SharedLog {
            address: address.clone(),
            inner: log,
            slot: slot.clone(),
            generation: state.generation,
            released: AtomicBool::new(false),
        })
    }

    /// Number of outstanding handles for this address.
    pub async fn refs(&self, address: &Address) -> usize {
        let slot = {
            let slots = self.slots.lock().await;
            match slots.get(address) {
                Some(slot) => slot.clone(),
                None => return 0,
            }
        };
        let state = slot.state.lock().await;
        state.refs
    }

    /// Close every underlying handle regardless of outstanding references.
    ///
    /// All handles given out so far become stale.
    pub async fn close_all(&self) -> Result<(), HandleError<S::Error>> {
        let slots: Vec<(Address, Arc<Slot<S::Log>>)> = {
            let slots = self.slots.lock().await;
            slots
                .iter()
                .map(|(address, slot)| (address.clone(), slot.clone()))
                .collect()
        };

        for (address, slot) in slots {
            let mut state = slot.state.lock().await;
            state.refs = 0;
            state.generation += 1;
            if let Some(log) = state.log.take() {
                log.close().await.map_err(HandleError::Store)?;
                debug!(%address, "closed underlying log handle on shutdown");
            }
        }

        Ok(())
    }
}

impl<S: LogStore> fmt::Debug for HandleManager<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleManager").finish_non_exhaustive()
    }
}

/// Counted handle to a log, handed out by the [`HandleManager`].
///
/// Every handle needs to be released exactly once with [`Log::close`].
pub struct SharedLog<L: Log> {
    address: Address,
    inner: Arc<L>,
    slot: Arc<Slot<L>>,
    generation: u64,
    released: AtomicBool,
}

impl<L: Log> SharedLog<L> {
    fn ensure_held(&self) -> Result<(), HandleError<L::Error>> {
        if self.released.load(Ordering::SeqCst) {
            return Err(HandleError::Released(self.address.clone()));
        }
        Ok(())
    }
}

impl<L: Log> fmt::Debug for SharedLog<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedLog")
            .field("address", &self.address)
            .field("generation", &self.generation)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl<L: Log> Log for SharedLog<L> {
    type Error = HandleError<L::Error>;

    fn address(&self) -> &Address {
        &self.address
    }

    async fn heads(&self) -> Result<Vec<Hash>, Self::Error> {
        self.ensure_held()?;
        self.inner.heads().await.map_err(HandleError::Store)
    }

    async fn traverse(&self) -> Result<Vec<Entry>, Self::Error> {
        self.ensure_held()?;
        self.inner.traverse().await.map_err(HandleError::Store)
    }

    async fn append(&self, entry: Entry) -> Result<bool, Self::Error> {
        self.ensure_held()?;
        self.inner.append(entry).await.map_err(HandleError::Store)
    }

    fn subscribe(&self) -> Result<broadcast::Receiver<LogEvent>, Self::Error> {
        self.ensure_held()?;
        self.inner.subscribe().map_err(HandleError::Store)
    }

    async fn close(&self) -> Result<(), Self::Error> {
        if self.released.swap(true, Ordering::SeqCst) {
            error!(address = %self.address, "log handle closed more than once");
            return Err(HandleError::Exhausted(self.address.clone()));
        }
        self.slot.release(&self.address, self.generation).await
    }

    async fn destroy(&self) -> Result<(), Self::Error> {
        let mut state = self.slot.state.lock().await;
        self.inner.destroy().await.map_err(HandleError::Store)?;

        if state.generation == self.generation {
            state.log = None;
            state.refs = 0;
            state.generation += 1;
        }
        self.released.store(true, Ordering::SeqCst);

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum HandleError<E> {
    /// More releases than acquisitions for this address.
    #[error("log handle for {0} is exhausted")]
    Exhausted(Address),

    /// Handle was used after it got closed.
    #[error("log handle for {0} was already released")]
    Released(Address),

    #[error(transparent)]
    Store(E),
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use constellation_core::{Address, Entry, Hash, Identity, Payload, PrivateKey};

    use crate::memory::{MemoryStore, StoreError};
    use crate::traits::{AppendValidator, Log};

    use super::{HandleError, HandleManager};

    struct AcceptAll;

    #[async_trait]
    impl AppendValidator for AcceptAll {
        async fn can_append(&self, _entry: &Entry) -> bool {
            true
        }
    }

    fn address() -> Address {
        Address::new("test", Hash::new(b"log")).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_opens_share_one_handle() {
        let store = MemoryStore::new();
        let handles = Arc::new(HandleManager::new(store.clone()));

        // Open
        // ~~~~

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let handles = handles.clone();
            tasks.push(tokio::spawn(async move {
                handles.open(&address(), Arc::new(AcceptAll)).await.unwrap()
            }));
        }

        let mut logs = Vec::new();
        for task in tasks {
            logs.push(task.await.unwrap());
        }

        assert_eq!(handles.refs(&address()).await, 3);
        let stats = store.handle_stats(&address()).await;
        assert_eq!(stats.opened, 1);
        assert_eq!(stats.closed, 0);

        // Close
        // ~~~~~

        logs[0].close().await.unwrap();
        logs[1].close().await.unwrap();
        assert_eq!(store.handle_stats(&address()).await.closed, 0);

        // Remaining user can still write.
        let private_key = PrivateKey::new();
        let identity = Identity::new(&private_key);
        let mut entry = Entry::new(address(), identity.hash(), Payload::put("bob", "MEMBER"), vec![], 1);
        entry.sign(&private_key);
        assert!(logs[2].append(entry).await.unwrap());

        logs[2].close().await.unwrap();
        let stats = store.handle_stats(&address()).await;
        assert_eq!(stats.opened, 1);
        assert_eq!(stats.closed, 1);
        assert_eq!(handles.refs(&address()).await, 0);

        // Opening again after the last release reaches the store again.
        let log = handles.open(&address(), Arc::new(AcceptAll)).await.unwrap();
        assert_eq!(store.handle_stats(&address()).await.opened, 2);
        assert_eq!(log.traverse().await.unwrap().len(), 1);
        log.close().await.unwrap();
    }

    #[tokio::test]
    async fn double_close_is_reported() {
        let handles = HandleManager::new(MemoryStore::new());
        let log_1 = handles.open(&address(), Arc::new(AcceptAll)).await.unwrap();
        let log_2 = handles.open(&address(), Arc::new(AcceptAll)).await.unwrap();

        log_1.close().await.unwrap();
        assert_matches!(log_1.close().await, Err(HandleError::Exhausted(_)));

        // Releasing twice did not steal the reference of the other holder.
        assert_eq!(handles.refs(&address()).await, 1);
        assert!(log_2.heads().await.unwrap().is_empty());
        assert_matches!(log_1.heads().await, Err(HandleError::Released(_)));

        log_2.close().await.unwrap();
    }

    #[tokio::test]
    async fn destroy_invalidates_all_holders() {
        let store = MemoryStore::new();
        let handles = HandleManager::new(store.clone());
        let log_1 = handles.open(&address(), Arc::new(AcceptAll)).await.unwrap();
        let log_2 = handles.open(&address(), Arc::new(AcceptAll)).await.unwrap();

        log_1.destroy().await.unwrap();
        assert_eq!(handles.refs(&address()).await, 0);

        assert_matches!(
            log_2.traverse().await,
            Err(HandleError::Store(StoreError::Closed(_)))
        );

        // Releasing a stale handle is a no-op.
        log_2.close().await.unwrap();
        assert_eq!(store.handle_stats(&address()).await.closed, 1);

        // A fresh handle starts a new generation.
        let log_3 = handles.open(&address(), Arc::new(AcceptAll)).await.unwrap();
        assert_eq!(handles.refs(&address()).await, 1);
        assert!(log_3.traverse().await.unwrap().is_empty());
        log_3.close().await.unwrap();
    }

    #[tokio::test]
    async fn close_all_releases_everything() {
        let store = MemoryStore::new();
        let handles = HandleManager::new(store.clone());
        let other = Address::new("test", Hash::new(b"other")).unwrap();

        let log_1 = handles.open(&address(), Arc::new(AcceptAll)).await.unwrap();
        let _log_2 = handles.open(&address(), Arc::new(AcceptAll)).await.unwrap();
        let _log_3 = handles.open(&other, Arc::new(AcceptAll)).await.unwrap();

        handles.close_all().await.unwrap();

        assert_eq!(store.handle_stats(&address()).await.open(), 0);
        assert_eq!(store.handle_stats(&other).await.open(), 0);
        assert_eq!(handles.refs(&address()).await, 0);

        // Late releases of stale handles are ignored.
        log_1.close().await.unwrap();
    }
}
