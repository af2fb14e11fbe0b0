// SPDX-License-Identifier: MIT OR Apache-2.0

//! Resolution of signer references to device identities.
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use constellation_core::cbor::decode_cbor;
use constellation_core::{Hash, Identity, PrivateKey};
use constellation_store::BlobStore;
use tokio::sync::RwLock;
use tracing::{trace, warn};

/// Resolves the signer references carried by log entries.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Look up the identity with this content hash.
    async fn get_identity(&self, hash: &Hash) -> Option<Identity>;

    /// Returns `true` if the identity's id is its own key and it proves control over that key.
    async fn verify_identity(&self, identity: &Identity) -> bool;
}

/// Identity provider keeping identities as content-addressed blobs.
///
/// Storing identities next to the log entries means that replicas receiving an entry can resolve
/// its signer as soon as the identity blob arrived as well.
#[derive(Clone, Debug)]
pub struct Identities<S: BlobStore> {
    store: S,
    cache: Arc<RwLock<HashMap<Hash, Identity>>>,
}

impl<S: BlobStore> Identities<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Derive the device identity of a private key and publish it.
    pub async fn create(&self, private_key: &PrivateKey) -> Result<Identity, S::Error> {
        let identity = Identity::new(private_key);
        self.insert(identity.clone()).await?;
        Ok(identity)
    }

    /// Publish an identity and return its content hash.
    pub async fn insert(&self, identity: Identity) -> Result<Hash, S::Error> {
        let hash = self.store.put_blob(identity.to_bytes()).await?;
        trace!(id = %identity.id, hash = %hash.short(), "inserted identity");
        self.cache.write().await.insert(hash, identity);
        Ok(hash)
    }

    #[cfg(test)]
    pub(crate) async fn is_cached(&self, hash: &Hash) -> bool {
        self.cache.read().await.contains_key(hash)
    }
}

#[async_trait]
impl<S: BlobStore> IdentityProvider for Identities<S> {
    async fn get_identity(&self, hash: &Hash) -> Option<Identity> {
        if let Some(identity) = self.cache.read().await.get(hash) {
            return Some(identity.clone());
        }

        let bytes = match self.store.get_blob(hash).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                warn!(hash = %hash.short(), "failed loading identity: {err}");
                return None;
            }
        };

        let identity: Identity = match decode_cbor(&bytes[..]) {
            Ok(identity) => identity,
            Err(err) => {
                trace!(hash = %hash.short(), "blob is not an identity: {err}");
                return None;
            }
        };

        self.cache.write().await.insert(*hash, identity.clone());
        Some(identity)
    }

    async fn verify_identity(&self, identity: &Identity) -> bool {
        identity.verify()
    }
}

#[cfg(test)]
mod tests {
    use constellation_core::{Hash, Identity, PrivateKey};
    use constellation_store::MemoryStore;

    use super::{Identities, IdentityProvider};

    #[tokio::test]
    async fn resolve_published_identities() {
        let store = MemoryStore::new();
        let identities = Identities::new(store.clone());
        let private_key = PrivateKey::new();

        let identity = identities.create(&private_key).await.unwrap();
        assert_eq!(
            identities.get_identity(&identity.hash()).await,
            Some(identity.clone())
        );
        assert!(identities.verify_identity(&identity).await);

        // Other providers over the same store resolve it from the blob.
        let replica = Identities::new(store);
        assert_eq!(replica.get_identity(&identity.hash()).await, Some(identity));
        assert_eq!(replica.get_identity(&Hash::new(b"unknown")).await, None);
    }

    #[tokio::test]
    async fn forged_identity_does_not_verify() {
        let identities = Identities::new(MemoryStore::new());
        let mut forged = Identity::new(&PrivateKey::new());
        forged.public_key = PrivateKey::new().public_key();
        let hash = identities.insert(forged.clone()).await.unwrap();

        let resolved = identities.get_identity(&hash).await.unwrap();
        assert!(!identities.verify_identity(&resolved).await);
    }

    #[tokio::test]
    async fn impostor_identity_does_not_verify() {
        let identities = Identities::new(MemoryStore::new());
        let alice = identities.create(&PrivateKey::new()).await.unwrap();

        let mallory_key = PrivateKey::new();
        let impostor = Identity {
            id: alice.id.clone(),
            public_key: mallory_key.public_key(),
            signature: mallory_key.sign(alice.id.as_bytes()),
        };
        let hash = identities.insert(impostor).await.unwrap();

        let resolved = identities.get_identity(&hash).await.unwrap();
        assert_eq!(resolved.id, alice.id);
        assert!(!identities.verify_identity(&resolved).await);
    }
}
