// SPDX-License-Identifier: MIT OR Apache-2.0

//! Entry point bundling store, identities, handles and controllers of one node.
use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use constellation_core::{Address, Entry, Payload, PrivateKey};
use constellation_store::{HandleError, HandleManager, Log, LogStore, SharedLog};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::Config;
use crate::controller::AccessController;
use crate::identity::{Identities, IdentityProvider};
use crate::manifest::{Manifest, ManifestError};
use crate::role::Role;

/// Shared state of one engine, referenced weakly by its controllers.
pub(crate) struct Registry<S: LogStore> {
    store: S,
    identities: Identities<S>,
    provider: Arc<dyn IdentityProvider>,
    handles: HandleManager<S>,
    controllers: Mutex<HashMap<Address, Arc<AccessController<S>>>>,
    config: Config,
    closed: AtomicBool,
}

impl<S: LogStore> Registry<S> {
    pub(crate) fn handles(&self) -> &HandleManager<S> {
        &self.handles
    }

    fn ensure_open(&self) -> Result<(), ConstellationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConstellationError::Closed);
        }
        Ok(())
    }

    /// Get the controller of an address, resolving its manifest on first use.
    async fn controller(
        self: &Arc<Self>,
        address: &Address,
    ) -> Result<Arc<AccessController<S>>, ConstellationError> {
        self.ensure_open()?;

        let mut controllers = self.controllers.lock().await;
        if let Some(controller) = controllers.get(address) {
            return Ok(controller.clone());
        }

        let manifest = Manifest::resolve(&self.store, address).await?;
        let controller = Arc::new(AccessController::new(
            address.clone(),
            manifest,
            self.store.clone(),
            self.provider.clone(),
            Arc::downgrade(self),
            &self.config,
        ));
        controllers.insert(address.clone(), controller.clone());
        debug!(%address, "registered access controller");

        Ok(controller)
    }

    /// Get the controller of an address which follows its log.
    pub(crate) async fn attached_controller(
        self: &Arc<Self>,
        address: &Address,
    ) -> Result<Arc<AccessController<S>>, ConstellationError> {
        let controller = self.controller(address).await?;
        controller.attach().await?;
        Ok(controller)
    }
}

/// Access control engine of one node.
///
/// Controllers are created once per address and shared by everybody opening that address, their
/// logs are opened through one [`HandleManager`].
///
/// ```ignore
/// let engine = Constellation::new(MemoryStore::new(), Config::default());
/// let private_key = PrivateKey::new();
/// let alice = engine.identities().create(&private_key).await?;
///
/// let address = engine.create(&alice.id).await?;
/// let log = engine.open(&address).await?;
/// engine.grant(&log, &private_key, "bob", Role::Member).await?;
///
/// let controller = engine.controller(&address).await?;
/// assert!(controller.index().is_member("bob").await);
/// ```
pub struct Constellation<S: LogStore> {
    registry: Arc<Registry<S>>,
}

impl<S: LogStore> Constellation<S> {
    pub fn new(store: S, config: Config) -> Self {
        let identities = Identities::new(store.clone());
        let provider = Arc::new(identities.clone());
        Self::build(store, identities, provider, config)
    }

    /// Create an engine which resolves signers through a custom identity provider.
    ///
    /// Identities published through [`Constellation::identities`] still land in the store, the
    /// provider decides which of them are trusted.
    pub fn with_identity_provider(
        store: S,
        provider: Arc<dyn IdentityProvider>,
        config: Config,
    ) -> Self {
        let identities = Identities::new(store.clone());
        Self::build(store, identities, provider, config)
    }

    fn build(
        store: S,
        identities: Identities<S>,
        provider: Arc<dyn IdentityProvider>,
        config: Config,
    ) -> Self {
        let registry = Registry {
            identities,
            handles: HandleManager::new(store.clone()),
            store,
            provider,
            controllers: Mutex::new(HashMap::new()),
            config,
            closed: AtomicBool::new(false),
        };

        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn store(&self) -> &S {
        &self.registry.store
    }

    /// Identities published in this node's store.
    pub fn identities(&self) -> &Identities<S> {
        &self.registry.identities
    }

    pub fn handles(&self) -> &HandleManager<S> {
        &self.registry.handles
    }

    pub fn config(&self) -> &Config {
        &self.registry.config
    }

    /// Create an access controller with the given genesis writer.
    ///
    /// The writer is a device identity id or the address of an account.
    pub async fn create(&self, writer: &str) -> Result<Address, ConstellationError> {
        self.registry.ensure_open()?;
        let address = Manifest::create(&self.registry.store, writer).await?;
        info!(%address, writer, "created access controller");
        Ok(address)
    }

    /// Controller of the given address, resolving its manifest on first use.
    pub async fn controller(
        &self,
        address: &Address,
    ) -> Result<Arc<AccessController<S>>, ConstellationError> {
        self.registry.controller(address).await
    }

    /// Open a counted handle to a controller's log.
    ///
    /// The controller starts following its log first, so existing grants are known when this
    /// returns. Every handle needs to be released with [`Log::close`].
    pub async fn open(&self, address: &Address) -> Result<SharedLog<S::Log>, ConstellationError> {
        let controller = self.registry.attached_controller(address).await?;
        let log = self.registry.handles.open(address, controller.hook()).await?;
        Ok(log)
    }

    /// Sign and append a grant on top of the current heads of a log.
    ///
    /// Returns the appended entry or `None` if the controller rejected it.
    pub async fn grant(
        &self,
        log: &SharedLog<S::Log>,
        private_key: &PrivateKey,
        key: &str,
        role: Role,
    ) -> Result<Option<Entry>, ConstellationError> {
        self.registry.ensure_open()?;

        let identity = self
            .registry
            .identities
            .create(private_key)
            .await
            .map_err(ConstellationError::store)?;

        let heads = log.heads().await?;
        let mut clock = 0;
        for head in &heads {
            if let Some(parent) = self
                .registry
                .store
                .get_entry(head)
                .await
                .map_err(ConstellationError::store)?
            {
                clock = clock.max(parent.clock);
            }
        }

        let mut entry = Entry::new(
            log.address().clone(),
            identity.hash(),
            Payload::put(key, role.as_str()),
            heads,
            clock + 1,
        );
        entry.sign(private_key);

        if log.append(entry.clone()).await? {
            Ok(Some(entry))
        } else {
            Ok(None)
        }
    }

    /// Stop all controllers and close every log handle.
    pub async fn close(&self) -> Result<(), ConstellationError> {
        if self.registry.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let controllers: Vec<Arc<AccessController<S>>> = {
            let mut controllers = self.registry.controllers.lock().await;
            controllers.drain().map(|(_, controller)| controller).collect()
        };

        for controller in controllers {
            controller.close().await?;
        }

        self.registry.handles.close_all().await?;
        info!("closed access control engine");

        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ConstellationError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    #[error("log handle for {0} is exhausted")]
    HandleExhausted(Address),

    #[error("log handle for {0} was already released")]
    HandleReleased(Address),

    #[error("store error: {0}")]
    Store(Box<dyn Error + Send + Sync + 'static>),

    #[error("engine was closed")]
    Closed,
}

impl ConstellationError {
    pub(crate) fn store<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Store(Box::new(err))
    }
}

impl<E: Error + Send + Sync + 'static> From<HandleError<E>> for ConstellationError {
    fn from(value: HandleError<E>) -> Self {
        match value {
            HandleError::Exhausted(address) => Self::HandleExhausted(address),
            HandleError::Released(address) => Self::HandleReleased(address),
            HandleError::Store(err) => Self::store(err),
        }
    }
}
