// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bootstrap documents of access controllers.
//!
//! A manifest names the genesis writer of an access controller. It is stored as a CBOR blob and
//! the address of the controller is derived from the hash of that blob, so whoever knows the
//! address can fetch the manifest and verify that nobody swapped the writer.
use std::error::Error;

use constellation_core::cbor::{DecodeError, decode_cbor, encode_cbor};
use constellation_core::{Address, AddressError, Hash};
use constellation_store::BlobStore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Type tag of access controller manifests and the first part of their addresses.
pub const ACCESS_CONTROLLER_TYPE: &str = "constellation-access-controller";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "type")]
    pub kind: String,

    /// Device identity id or account address which is moderator from the start.
    pub writer: String,
}

impl Manifest {
    pub fn new(writer: impl Into<String>) -> Self {
        Self {
            kind: ACCESS_CONTROLLER_TYPE.to_string(),
            writer: writer.into(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        encode_cbor(self)
            // Manifests only contain text, encoding fails on critical IO errors only.
            .expect("CBOR encoder failed due to a critical IO error")
    }

    pub fn hash(&self) -> Hash {
        Hash::new(self.to_bytes())
    }

    /// Address of the access controller bootstrapped by this manifest.
    pub fn address(&self) -> Result<Address, ManifestError> {
        Ok(Address::new(&self.kind, self.hash())?)
    }

    /// Store a manifest for the given writer and return the resulting controller address.
    ///
    /// Creating a manifest twice for the same writer yields the same address.
    pub async fn create<S: BlobStore>(
        store: &S,
        writer: impl Into<String>,
    ) -> Result<Address, ManifestError> {
        let manifest = Self::new(writer);
        let address = manifest.address()?;
        store
            .put_blob(manifest.to_bytes())
            .await
            .map_err(|err| ManifestError::Store(Box::new(err)))?;
        debug!(%address, writer = %manifest.writer, "created manifest");
        Ok(address)
    }

    /// Load and verify the manifest behind an address.
    pub async fn resolve<S: BlobStore>(store: &S, address: &Address) -> Result<Self, ManifestError> {
        if address.kind() != ACCESS_CONTROLLER_TYPE {
            return Err(ManifestError::UnexpectedType(address.kind().to_string()));
        }

        let bytes = store
            .get_blob(&address.root())
            .await
            .map_err(|err| ManifestError::Store(Box::new(err)))?
            .ok_or_else(|| ManifestError::NotFound(address.clone()))?;

        let manifest: Manifest = decode_cbor(&bytes[..])?;

        if manifest.kind != ACCESS_CONTROLLER_TYPE {
            return Err(ManifestError::UnexpectedType(manifest.kind));
        }

        let derived = manifest.address()?;
        if &derived != address {
            return Err(ManifestError::AddressMismatch(address.clone(), derived));
        }

        Ok(manifest)
    }
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("no manifest found at {0}")]
    NotFound(Address),

    #[error("unexpected manifest type \"{0}\"")]
    UnexpectedType(String),

    #[error("manifest at {0} resolves to different address {1}")]
    AddressMismatch(Address, Address),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Address(#[from] AddressError),

    #[error("store error: {0}")]
    Store(Box<dyn Error + Send + Sync + 'static>),
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use constellation_core::cbor::encode_cbor;
    use constellation_core::{Address, Hash};
    use constellation_store::{BlobStore, MemoryStore};
    use serde::Serialize;

    use super::{ACCESS_CONTROLLER_TYPE, Manifest, ManifestError};

    #[tokio::test]
    async fn create_and_resolve() {
        let store = MemoryStore::new();
        let address = Manifest::create(&store, "alice").await.unwrap();

        assert_eq!(address.kind(), ACCESS_CONTROLLER_TYPE);
        assert!(address.to_string().starts_with("constellation-access-controller/"));

        let manifest = Manifest::resolve(&store, &address).await.unwrap();
        assert_eq!(manifest.writer, "alice");

        // Deterministic for the same writer.
        assert_eq!(Manifest::create(&store, "alice").await.unwrap(), address);
        assert_ne!(Manifest::create(&store, "bob").await.unwrap(), address);
    }

    #[tokio::test]
    async fn missing_manifest() {
        let store = MemoryStore::new();
        let address = Address::new(ACCESS_CONTROLLER_TYPE, Hash::new(b"nothing")).unwrap();
        assert_matches!(
            Manifest::resolve(&store, &address).await,
            Err(ManifestError::NotFound(_))
        );
    }

    #[tokio::test]
    async fn wrong_type() {
        let store = MemoryStore::new();
        let address = Manifest::create(&store, "alice").await.unwrap();
        let foreign = Address::new("eventlog", address.root()).unwrap();
        assert_matches!(
            Manifest::resolve(&store, &foreign).await,
            Err(ManifestError::UnexpectedType(_))
        );
    }

    #[tokio::test]
    async fn detect_tampering() {
        let store = MemoryStore::new();

        // A manifest with a foreign type stored under a controller address.
        let mut manifest = Manifest::new("mallory");
        manifest.kind = "eventlog".to_string();
        let hash = store.put_blob(manifest.to_bytes()).await.unwrap();
        let address = Address::new(ACCESS_CONTROLLER_TYPE, hash).unwrap();
        assert_matches!(
            Manifest::resolve(&store, &address).await,
            Err(ManifestError::UnexpectedType(_))
        );

        // Bytes which are not a manifest.
        let hash = store.put_blob(vec![0xff, 0x00, 0x13]).await.unwrap();
        let address = Address::new(ACCESS_CONTROLLER_TYPE, hash).unwrap();
        assert_matches!(
            Manifest::resolve(&store, &address).await,
            Err(ManifestError::Decode(_))
        );

        // Extra fields are dropped when decoding, the recomputed address does not match anymore.
        #[derive(Serialize)]
        struct Padded {
            r#type: &'static str,
            writer: &'static str,
            padding: u64,
        }

        let padded = encode_cbor(&Padded {
            r#type: ACCESS_CONTROLLER_TYPE,
            writer: "mallory",
            padding: 42,
        })
        .unwrap();
        let hash = store.put_blob(padded).await.unwrap();
        let address = Address::new(ACCESS_CONTROLLER_TYPE, hash).unwrap();
        assert_matches!(
            Manifest::resolve(&store, &address).await,
            Err(ManifestError::AddressMismatch(_, _))
        );
    }
}
