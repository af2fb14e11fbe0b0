// SPDX-License-Identifier: MIT OR Apache-2.0

//! Validation of grants appended to access controller logs.
//!
//! An entry is accepted when its signer is a moderator. If the live membership view does not
//! know the signer as moderator yet, the entry might still be legitimate: the grant which made
//! the signer a moderator could be among its causal ancestors which this node has not processed
//! so far. The controller then walks the ancestors available in content-addressed storage and
//! validates them oldest-first until the signer's authority is established or no further
//! ancestor can be accepted.
//!
//! Missing ancestors make the walk fail closed. The same entry is accepted later, after the
//! missing ancestors arrived.
use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use constellation_core::{Address, Entry, Hash, Identity, Op};
use constellation_store::{AppendValidator, LogStore};
use petgraph::algo::toposort;
use petgraph::prelude::DiGraphMap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::config::Config;
use crate::engine::{ConstellationError, Registry};
use crate::identity::IdentityProvider;
use crate::manifest::Manifest;
use crate::membership::AccountMembershipIndex;
use crate::role::Role;

/// Extract the grant of an entry written to the log at `address`.
pub(crate) fn parse_grant(entry: &Entry, address: &Address) -> Result<(String, Role), ValidationError> {
    if entry.payload.op != Op::Put {
        return Err(ValidationError::UnsupportedOp(entry.payload.op.to_string()));
    }

    let value = entry
        .payload
        .value
        .as_deref()
        .ok_or(ValidationError::MissingValue)?;

    let role = value
        .parse::<Role>()
        .map_err(|_| ValidationError::InvalidRole(value.to_string()))?;

    if &entry.id != address {
        return Err(ValidationError::ForeignLog(entry.id.clone()));
    }

    Ok((entry.payload.key.clone(), role))
}

pub struct AccessController<S: LogStore> {
    address: Address,
    manifest: Manifest,
    store: S,
    identities: Arc<dyn IdentityProvider>,
    index: AccountMembershipIndex<S>,
    max_walk_entries: Option<usize>,
}

impl<S: LogStore> AccessController<S> {
    pub(crate) fn new(
        address: Address,
        manifest: Manifest,
        store: S,
        identities: Arc<dyn IdentityProvider>,
        registry: Weak<Registry<S>>,
        config: &Config,
    ) -> Self {
        let index = AccountMembershipIndex::new(
            address.clone(),
            &manifest.writer,
            registry,
            config.max_account_depth,
            config.event_capacity,
        );

        Self {
            address,
            manifest,
            store,
            identities,
            index,
            max_walk_entries: config.max_walk_entries,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// Derived view of the roles in this controller.
    pub fn index(&self) -> &AccountMembershipIndex<S> {
        &self.index
    }

    /// Start following the controller's log with this controller as its validation hook.
    pub(crate) async fn attach(self: &Arc<Self>) -> Result<(), ConstellationError> {
        self.index.follow(self.hook()).await
    }

    /// Validation hook for appends to this controller's log.
    pub fn hook(self: &Arc<Self>) -> Arc<dyn AppendValidator> {
        Arc::new(ValidationHook(Arc::downgrade(self)))
    }

    /// Decide if an entry may be appended to this controller's log.
    ///
    /// Accepted grants are registered in the membership index right away.
    pub async fn can_append(&self, entry: &Entry) -> bool {
        match self.validate(entry).await {
            Ok((key, role)) => {
                self.index.authorize(&key, role).await;
                true
            }
            Err(err) => {
                debug!(
                    address = %self.address,
                    hash = %entry.hash().short(),
                    "rejected entry: {err}"
                );
                false
            }
        }
    }

    async fn validate(&self, entry: &Entry) -> Result<(String, Role), ValidationError> {
        let grant = parse_grant(entry, &self.address)?;
        let signer = self.resolve_signer(entry).await?;

        if self.index.is_moderator(&signer.id).await {
            return Ok(grant);
        }

        self.walk_ancestors(entry, &signer).await?;

        Ok(grant)
    }

    /// Validate an entry against the current view only, without looking at its ancestors.
    async fn validate_shallow(&self, entry: &Entry) -> Result<(String, Role), ValidationError> {
        let grant = parse_grant(entry, &self.address)?;
        let signer = self.resolve_signer(entry).await?;

        if !self.index.is_moderator(&signer.id).await {
            return Err(ValidationError::Unauthorized(signer.id));
        }

        Ok(grant)
    }

    async fn resolve_signer(&self, entry: &Entry) -> Result<Identity, ValidationError> {
        let identity = self
            .identities
            .get_identity(&entry.identity)
            .await
            .ok_or(ValidationError::UnknownIdentity(entry.identity))?;

        if !self.identities.verify_identity(&identity).await {
            return Err(ValidationError::InvalidIdentity(identity.id));
        }

        if !entry.verify(&identity.public_key) {
            return Err(ValidationError::InvalidSignature(identity.id));
        }

        Ok(identity)
    }

    /// Establish the signer's authority from the causal ancestors of an entry.
    async fn walk_ancestors(&self, entry: &Entry, signer: &Identity) -> Result<(), ValidationError> {
        // Collect
        // ~~~~~~~

        let mut queue: VecDeque<Hash> = entry.next.iter().copied().collect();
        let mut visited = HashSet::new();
        let mut ancestors: HashMap<Hash, Entry> = HashMap::new();
        let mut missing = 0;

        while let Some(hash) = queue.pop_front() {
            if !visited.insert(hash) {
                continue;
            }

            if let Some(max) = self.max_walk_entries {
                if ancestors.len() >= max {
                    trace!(address = %self.address, max, "reached ancestor limit");
                    break;
                }
            }

            let ancestor = self
                .store
                .get_entry(&hash)
                .await
                .map_err(|err| ValidationError::Store(Box::new(err)))?;

            match ancestor {
                Some(ancestor) => {
                    queue.extend(ancestor.next.iter().copied());
                    ancestors.insert(hash, ancestor);
                }
                None => {
                    trace!(address = %self.address, hash = %hash.short(), "ancestor missing");
                    missing += 1;
                }
            }
        }

        // Order
        // ~~~~~

        let mut graph: DiGraphMap<Hash, ()> = DiGraphMap::new();
        for (hash, ancestor) in &ancestors {
            graph.add_node(*hash);
            for parent in &ancestor.next {
                if ancestors.contains_key(parent) {
                    graph.add_edge(*parent, *hash, ());
                }
            }
        }

        let mut pending: Vec<Hash> = toposort(&graph, None)
            .map_err(|cycle| ValidationError::Cycle(cycle.node_id()))?;

        // Validate
        // ~~~~~~~~

        // Accepting one ancestor can make an earlier rejected one valid, repeat until nothing
        // changes anymore.
        loop {
            let mut rejected = Vec::new();
            let mut progressed = false;

            for hash in pending {
                let Some(ancestor) = ancestors.get(&hash) else {
                    continue;
                };

                match self.validate_shallow(ancestor).await {
                    Ok((key, role)) => {
                        progressed = true;
                        if self.index.authorize(&key, role).await
                            && self.index.is_moderator(&signer.id).await
                        {
                            trace!(
                                address = %self.address,
                                signer = %signer.id,
                                hash = %hash.short(),
                                "authority established through ancestor"
                            );
                            return Ok(());
                        }
                    }
                    Err(_) => rejected.push(hash),
                }
            }

            if !progressed || rejected.is_empty() {
                break;
            }

            pending = rejected;
        }

        if missing > 0 {
            return Err(ValidationError::UnresolvedAuthority(signer.id.clone(), missing));
        }

        Err(ValidationError::Unauthorized(signer.id.clone()))
    }

    /// Stop following this controller's log and its nested accounts.
    pub async fn close(&self) -> Result<(), ConstellationError> {
        self.index.close().await
    }
}

/// Append validator calling back into an access controller.
///
/// Holds a weak reference, the store never keeps a controller alive.
struct ValidationHook<S: LogStore>(Weak<AccessController<S>>);

#[async_trait]
impl<S: LogStore> AppendValidator for ValidationHook<S> {
    async fn can_append(&self, entry: &Entry) -> bool {
        match self.0.upgrade() {
            Some(controller) => controller.can_append(entry).await,
            None => false,
        }
    }
}

/// Reasons for rejecting an entry.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("unsupported operation {0}")]
    UnsupportedOp(String),

    #[error("grant without value")]
    MissingValue,

    #[error("invalid role \"{0}\"")]
    InvalidRole(String),

    #[error("entry belongs to log {0}")]
    ForeignLog(Address),

    #[error("unknown identity {0}")]
    UnknownIdentity(Hash),

    #[error("identity {0} failed verification")]
    InvalidIdentity(String),

    #[error("entry signature does not match identity {0}")]
    InvalidSignature(String),

    #[error("{0} is not a moderator")]
    Unauthorized(String),

    #[error("authority of {0} unresolved, {1} ancestors missing")]
    UnresolvedAuthority(String, usize),

    #[error("ancestors of entry contain a cycle at {0}")]
    Cycle(Hash),

    #[error("store error: {0}")]
    Store(Box<dyn Error + Send + Sync + 'static>),
}
