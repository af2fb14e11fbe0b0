// SPDX-License-Identifier: MIT OR Apache-2.0

//! Immutable units of replicated, append-only logs.
//!
//! Entries point at their causal predecessors through `next`, forming a hash-linked DAG instead
//! of a single chain. They name their signer by the content hash of an [`Identity`], are signed
//! by that identity's key and are themselves content-addressed by the hash of their signed CBOR
//! encoding.
//!
//! [`Identity`]: crate::Identity
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::cbor::{DecodeError, decode_cbor, encode_cbor};
use crate::hash::Hash;
use crate::identity::{PrivateKey, PublicKey, Signature};

/// Operation of an entry payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Op {
    Put,
    Del,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Put => write!(f, "PUT"),
            Op::Del => write!(f, "DEL"),
        }
    }
}

/// Key-value payload carried by an entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub op: Op,
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl Payload {
    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            op: Op::Put,
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self {
            op: Op::Del,
            key: key.into(),
            value: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Address of the log this entry was written to.
    pub id: Address,

    /// Content hash of the signer's identity.
    pub identity: Hash,

    pub payload: Payload,

    /// Hashes of the causally preceding entries.
    pub next: Vec<Hash>,

    /// Lamport clock, one larger than the largest clock of all entries in `next`.
    pub clock: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Signature>,
}

impl Entry {
    /// Returns an unsigned entry.
    pub fn new(id: Address, identity: Hash, payload: Payload, next: Vec<Hash>, clock: u64) -> Self {
        Self {
            id,
            identity,
            payload,
            next,
            clock,
            signature: None,
        }
    }

    /// Sign the entry with the given key.
    pub fn sign(&mut self, private_key: &PrivateKey) {
        // Make sure the signature is not already set before we encode.
        self.signature = None;

        let bytes = self.to_bytes();
        self.signature = Some(private_key.sign(&bytes));
    }

    /// Returns `true` if the entry carries a valid signature of the given public key.
    pub fn verify(&self, public_key: &PublicKey) -> bool {
        match self.signature {
            Some(claimed_signature) => {
                let mut unsigned = self.clone();
                unsigned.signature = None;
                public_key.verify(&unsigned.to_bytes(), &claimed_signature)
            }
            None => false,
        }
    }

    /// Content hash of this entry.
    pub fn hash(&self) -> Hash {
        Hash::new(self.to_bytes())
    }

    /// CBOR encoding of this entry.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_cbor(self)
            // We can be sure that all values in this module are serializable and _if_ ciborium
            // still fails then because of something really bad ..
            .expect("CBOR encoder failed due to a critical IO error")
    }

    /// Decode an entry from its CBOR encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        decode_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use crate::address::Address;
    use crate::hash::Hash;
    use crate::identity::{Identity, PrivateKey};

    use super::{Entry, Op, Payload};

    fn grant(private_key: &PrivateKey, next: Vec<Hash>, clock: u64) -> Entry {
        let identity = Identity::new(private_key);
        let log_id = Address::new("test", Hash::new(b"log")).unwrap();
        let mut entry = Entry::new(
            log_id,
            identity.hash(),
            Payload::put("bob", "MEMBER"),
            next,
            clock,
        );
        entry.sign(private_key);
        entry
    }

    #[test]
    fn sign_and_verify() {
        let private_key = PrivateKey::new();
        let entry = grant(&private_key, vec![], 1);

        assert!(entry.verify(&private_key.public_key()));
        assert!(!entry.verify(&PrivateKey::new().public_key()));
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let private_key = PrivateKey::new();
        let mut entry = grant(&private_key, vec![], 1);
        entry.payload.value = Some("MODERATOR".to_string());

        assert!(!entry.verify(&private_key.public_key()));
    }

    #[test]
    fn unsigned_entry_fails_verification() {
        let private_key = PrivateKey::new();
        let mut entry = grant(&private_key, vec![], 1);
        entry.signature = None;

        assert!(!entry.verify(&private_key.public_key()));
    }

    #[test]
    fn decode_keeps_content_address() {
        let private_key = PrivateKey::new();
        let parent = grant(&private_key, vec![], 1);
        let entry = grant(&private_key, vec![parent.hash()], 2);

        let entry_again = Entry::decode(&entry.to_bytes()).unwrap();
        assert_eq!(entry, entry_again);
        assert_eq!(entry.hash(), entry_again.hash());
        assert_eq!(entry_again.next, vec![parent.hash()]);
        assert!(entry_again.verify(&private_key.public_key()));
    }

    #[test]
    fn payload_wire_shape() {
        let json = serde_json::to_value(Payload::put("bob", "MODERATOR")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "op": "PUT", "key": "bob", "value": "MODERATOR" })
        );

        let json = serde_json::to_value(Payload::del("bob")).unwrap();
        assert_eq!(json, serde_json::json!({ "op": "DEL", "key": "bob" }));

        let payload: Payload = serde_json::from_str(r#"{ "op": "PUT", "key": "bob" }"#).unwrap();
        assert_eq!(payload.op, Op::Put);
        assert_eq!(payload.value, None);
    }
}
