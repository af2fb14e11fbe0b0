// SPDX-License-Identifier: MIT OR Apache-2.0

use constellation_core::{Address, Entry, Hash, Identity, Payload, PrivateKey};
use constellation_store::{LogStore, MemoryStore};

use crate::config::Config;
use crate::engine::Constellation;

pub fn setup_logging() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}

/// Key pair of one test device together with its identity.
pub struct Device {
    pub private_key: PrivateKey,
    pub identity: Identity,
}

impl Device {
    pub fn new() -> Self {
        let private_key = PrivateKey::new();
        let identity = Identity::new(&private_key);
        Self {
            private_key,
            identity,
        }
    }

    pub fn id(&self) -> &str {
        &self.identity.id
    }

    /// Publish this device's identity in the engine's store.
    pub async fn publish(&self, engine: &Constellation<MemoryStore>) {
        engine
            .identities()
            .insert(self.identity.clone())
            .await
            .unwrap();
    }

    /// Signed entry with an arbitrary payload.
    pub fn write(&self, address: &Address, payload: Payload, next: Vec<&Entry>) -> Entry {
        let clock = next.iter().map(|entry| entry.clock).max().unwrap_or(0) + 1;
        let next: Vec<Hash> = next.iter().map(|entry| entry.hash()).collect();
        let mut entry = Entry::new(address.clone(), self.identity.hash(), payload, next, clock);
        entry.sign(&self.private_key);
        entry
    }

    /// Signed grant on top of the given entries.
    pub fn grant(&self, address: &Address, key: &str, value: &str, next: Vec<&Entry>) -> Entry {
        self.write(address, Payload::put(key, value), next)
    }
}

pub fn engine() -> Constellation<MemoryStore> {
    Constellation::new(MemoryStore::new(), Config::default())
}

/// Make an entry available in content-addressed storage without appending it to any log.
pub async fn replicate(engine: &Constellation<MemoryStore>, entry: &Entry) {
    engine.store().put_entry(entry).await.unwrap();
}

