// SPDX-License-Identifier: MIT OR Apache-2.0

//! Derived view of who holds which role in one access controller.
//!
//! The index is a grant table keyed by device identity ids and account addresses. It only ever
//! escalates: a grant for a lower or equal role than the current one leaves the table untouched.
//! Every write goes through one fair async mutex, concurrent grants are applied one after another
//! in the order they arrived.
//!
//! Accounts are access controllers themselves. A device belongs to an account when that account
//! recognizes it as moderator, the device then inherits whatever role the account holds here.
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Weak};

use constellation_core::{Address, Entry};
use constellation_store::{AppendValidator, Log, LogEvent, LogStore, SharedLog};
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{Mutex, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::controller::{AccessController, parse_grant};
use crate::engine::{ConstellationError, Registry};
use crate::manifest::ACCESS_CONTROLLER_TYPE;
use crate::role::Role;

/// Notifications about changes of the derived view.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipEvent {
    /// Identity or account was granted a higher role than before.
    Granted { id: String, role: Role },

    /// Grants changed inside of a nested account, devices might have been added to it.
    AccountChanged { account: Address },
}

/// Handle to the followed log together with its change notifications.
struct Follow<S: LogStore> {
    log: SharedLog<S::Log>,
    events: broadcast::Receiver<LogEvent>,
}

struct NestedAccount<S: LogStore> {
    controller: Arc<AccessController<S>>,
    forward: JoinHandle<()>,
}

pub struct AccountMembershipIndex<S: LogStore> {
    address: Address,
    registry: Weak<Registry<S>>,
    grants: Mutex<BTreeMap<String, Role>>,
    events: broadcast::Sender<MembershipEvent>,
    follow: Mutex<Option<Follow<S>>>,
    accounts: Mutex<HashMap<Address, NestedAccount<S>>>,
    max_account_depth: usize,
}

impl<S: LogStore> AccountMembershipIndex<S> {
    pub(crate) fn new(
        address: Address,
        writer: &str,
        registry: Weak<Registry<S>>,
        max_account_depth: usize,
        event_capacity: usize,
    ) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        let mut grants = BTreeMap::new();
        grants.insert(writer.to_string(), Role::Moderator);

        Self {
            address,
            registry,
            grants: Mutex::new(grants),
            events,
            follow: Mutex::new(None),
            accounts: Mutex::new(HashMap::new()),
            max_account_depth,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Grant a role to an identity or account.
    ///
    /// Returns `true` if this changed the derived view, granting a role lower or equal to the
    /// current one is a no-op.
    pub async fn authorize(&self, id: &str, role: Role) -> bool {
        {
            let mut grants = self.grants.lock().await;
            if let Some(current) = grants.get(id) {
                if *current >= role {
                    return false;
                }
            }
            grants.insert(id.to_string(), role);
        }

        debug!(address = %self.address, id, %role, "authorized");

        // Nobody listening is not an error.
        let _ = self.events.send(MembershipEvent::Granted {
            id: id.to_string(),
            role,
        });

        true
    }

    /// Effective role of a device identity or account, including roles inherited through nested
    /// accounts.
    pub async fn role(&self, id: &str) -> Option<Role> {
        self.refresh().await;
        let mut visited = HashSet::from([self.address.clone()]);
        self.resolve_role(id, self.max_account_depth, &mut visited)
            .await
    }

    pub async fn is_moderator(&self, id: &str) -> bool {
        self.role(id).await == Some(Role::Moderator)
    }

    /// Returns `true` only for identities holding exactly the member role.
    pub async fn is_member(&self, id: &str) -> bool {
        self.role(id).await == Some(Role::Member)
    }

    /// Returns `true` for identities holding any role.
    pub async fn is_authorized(&self, id: &str) -> bool {
        self.role(id).await.is_some()
    }

    /// Direct grants of this controller.
    pub async fn members(&self) -> BTreeMap<String, Role> {
        self.refresh().await;
        self.grants.lock().await.clone()
    }

    /// Identities and accounts directly holding the moderator role.
    pub async fn current_moderators(&self) -> BTreeSet<String> {
        self.members()
            .await
            .into_iter()
            .filter(|(_, role)| *role == Role::Moderator)
            .map(|(id, _)| id)
            .collect()
    }

    /// Device identities holding a role, directly or through nested accounts.
    pub async fn current_devices(&self) -> BTreeSet<String> {
        self.refresh().await;
        let mut visited = HashSet::from([self.address.clone()]);
        let mut devices = BTreeSet::new();
        self.collect_devices(self.max_account_depth, false, &mut visited, &mut devices)
            .await;
        devices
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    /// Start following the controller's own log.
    ///
    /// Grants of all entries already in the log are registered right away. Following the same log
    /// twice is a no-op.
    pub(crate) async fn follow(
        &self,
        validator: Arc<dyn AppendValidator>,
    ) -> Result<(), ConstellationError> {
        let mut follow = self.follow.lock().await;
        if follow.is_some() {
            return Ok(());
        }

        let registry = self.registry.upgrade().ok_or(ConstellationError::Closed)?;
        let log = registry.handles().open(&self.address, validator).await?;
        let events = log.subscribe()?;
        self.replay(&log).await?;
        *follow = Some(Follow { log, events });

        Ok(())
    }

    /// Register grants of entries which were appended since the last call.
    pub async fn refresh(&self) {
        let mut follow = self.follow.lock().await;
        let Some(follow) = follow.as_mut() else {
            return;
        };

        loop {
            match follow.events.try_recv() {
                Ok(LogEvent::Appended(entry)) => self.register(&entry).await,
                Ok(LogEvent::Destroyed) => {
                    warn!(address = %self.address, "followed log was destroyed");
                    break;
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    debug!(address = %self.address, skipped, "lagged behind log, replaying");
                    if let Err(err) = self.replay(&follow.log).await {
                        warn!(address = %self.address, "replaying log failed: {err}");
                        break;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }

    async fn replay(&self, log: &SharedLog<S::Log>) -> Result<(), ConstellationError> {
        let entries = log.traverse().await?;
        trace!(address = %self.address, entries = entries.len(), "replaying log");
        for entry in entries.iter().rev() {
            self.register(entry).await;
        }
        Ok(())
    }

    async fn register(&self, entry: &Entry) {
        if let Ok((key, role)) = parse_grant(entry, &self.address) {
            self.authorize(&key, role).await;
        }
    }

    fn resolve_role<'a>(
        &'a self,
        id: &'a str,
        depth: usize,
        visited: &'a mut HashSet<Address>,
    ) -> BoxFuture<'a, Option<Role>> {
        async move {
            let grants = self.grants.lock().await.clone();
            let mut role = grants.get(id).copied();

            if role == Some(Role::Moderator) || depth == 0 {
                return role;
            }

            for (key, account_role) in grants {
                if role >= Some(account_role) {
                    continue;
                }

                let Some(account) = self.account_address(&key) else {
                    continue;
                };

                if !visited.insert(account.clone()) {
                    continue;
                }

                let Some(controller) = self.account(&account).await else {
                    continue;
                };

                let index = controller.index();
                index.refresh().await;
                if index.resolve_role(id, depth - 1, visited).await == Some(Role::Moderator) {
                    trace!(address = %self.address, id, %account, "device recognized through account");
                    role = Some(account_role);
                }
            }

            role
        }
        .boxed()
    }

    /// Collect device identities of this index. Inside of nested accounts only moderators count.
    fn collect_devices<'a>(
        &'a self,
        depth: usize,
        moderators_only: bool,
        visited: &'a mut HashSet<Address>,
        devices: &'a mut BTreeSet<String>,
    ) -> BoxFuture<'a, ()> {
        async move {
            let grants = self.grants.lock().await.clone();

            for (key, role) in grants {
                if moderators_only && role != Role::Moderator {
                    continue;
                }

                let Some(account) = self.account_address(&key) else {
                    devices.insert(key);
                    continue;
                };

                if depth == 0 || !visited.insert(account.clone()) {
                    continue;
                }

                let Some(controller) = self.account(&account).await else {
                    continue;
                };

                let index = controller.index();
                index.refresh().await;
                index
                    .collect_devices(depth - 1, true, visited, devices)
                    .await;
            }
        }
        .boxed()
    }

    fn account_address(&self, key: &str) -> Option<Address> {
        let address: Address = key.parse().ok()?;
        if address.kind() != ACCESS_CONTROLLER_TYPE || address == self.address {
            return None;
        }
        Some(address)
    }

    /// Open the controller of a nested account through the registry and forward its grants.
    async fn account(&self, address: &Address) -> Option<Arc<AccessController<S>>> {
        if let Some(nested) = self.accounts.lock().await.get(address) {
            return Some(nested.controller.clone());
        }

        let registry = self.registry.upgrade()?;
        let controller = match registry.attached_controller(address).await {
            Ok(controller) => controller,
            Err(err) => {
                debug!(address = %self.address, account = %address, "account not available: {err}");
                return None;
            }
        };

        let mut accounts = self.accounts.lock().await;
        let nested = accounts.entry(address.clone()).or_insert_with(|| {
            let forward = forward_grants(
                address.clone(),
                controller.index().subscribe(),
                self.events.clone(),
            );
            NestedAccount {
                controller: controller.clone(),
                forward,
            }
        });

        Some(nested.controller.clone())
    }

    /// Stop following the log and nested accounts.
    pub async fn close(&self) -> Result<(), ConstellationError> {
        {
            let mut accounts = self.accounts.lock().await;
            for (_, nested) in accounts.drain() {
                nested.forward.abort();
            }
        }

        let follow = self.follow.lock().await.take();
        if let Some(follow) = follow {
            follow.log.close().await?;
            trace!(address = %self.address, "stopped following log");
        }

        Ok(())
    }
}

/// Re-fire direct grants of a nested account on the index which contains it.
///
/// Only direct grants are forwarded, this keeps two accounts containing each other from echoing
/// notifications back and forth.
fn forward_grants(
    account: Address,
    mut nested: broadcast::Receiver<MembershipEvent>,
    events: broadcast::Sender<MembershipEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match nested.recv().await {
                Ok(MembershipEvent::Granted { .. }) | Err(broadcast::error::RecvError::Lagged(_)) => {
                    let _ = events.send(MembershipEvent::AccountChanged {
                        account: account.clone(),
                    });
                }
                Ok(MembershipEvent::AccountChanged { .. }) => (),
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
