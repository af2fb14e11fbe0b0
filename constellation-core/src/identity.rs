// SPDX-License-Identifier: MIT OR Apache-2.0

//! Ed25519 key pairs and the device identities built on top of them.
use std::fmt;

use ed25519_dalek::{SECRET_KEY_LENGTH, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cbor::encode_cbor;
use crate::hash::Hash;
use crate::serde::{deserialize_hex, serialize_hex};

/// Size of public keys.
pub const PUBLIC_KEY_LEN: usize = ed25519_dalek::PUBLIC_KEY_LENGTH;

/// Size of signatures.
pub const SIGNATURE_LEN: usize = ed25519_dalek::SIGNATURE_LENGTH;

/// Private ed25519 key used for signing.
#[derive(Clone)]
pub struct PrivateKey(SigningKey);

impl PrivateKey {
    /// Generates a new private key using the systems random number generator (CSPRNG) as a seed.
    pub fn new() -> Self {
        let mut csprng: OsRng = OsRng;
        Self(SigningKey::generate(&mut csprng))
    }

    /// Create a `PrivateKey` from its raw bytes representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        let bytes: [u8; SECRET_KEY_LENGTH] = bytes
            .try_into()
            .map_err(|_| IdentityError::InvalidLength(bytes.len(), SECRET_KEY_LENGTH))?;
        Ok(Self(SigningKey::from_bytes(&bytes)))
    }

    /// Bytes of the private key.
    pub fn as_bytes(&self) -> &[u8; SECRET_KEY_LENGTH] {
        self.0.as_bytes()
    }

    /// Returns the public key belonging to this private key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.verifying_key())
    }

    /// Sign the provided bytes.
    pub fn sign(&self, bytes: &[u8]) -> Signature {
        Signature(self.0.sign(bytes))
    }
}

impl Default for PrivateKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print secret key material.
        f.debug_tuple("PrivateKey").field(&"***").finish()
    }
}

/// Public ed25519 key used for identifying and verifying signatures of authors.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    /// Create a `PublicKey` from its raw bytes representation.
    pub fn from_bytes(bytes: &[u8; PUBLIC_KEY_LEN]) -> Result<Self, IdentityError> {
        Ok(Self(VerifyingKey::from_bytes(bytes)?))
    }

    /// Bytes of the public key.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        self.0.as_bytes()
    }

    /// Convert the public key to a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// Verify a signature over the given bytes with this public key.
    pub fn verify(&self, bytes: &[u8], signature: &Signature) -> bool {
        self.0.verify(bytes, &signature.0).is_ok()
    }
}

impl TryFrom<&[u8]> for PublicKey {
    type Error = IdentityError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let checked: [u8; PUBLIC_KEY_LEN] = value
            .try_into()
            .map_err(|_| IdentityError::InvalidLength(value.len(), PUBLIC_KEY_LEN))?;
        Self::from_bytes(&checked)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PublicKey").field(&self.to_hex()).finish()
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_hex(self.as_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = deserialize_hex(deserializer)?;

        bytes
            .as_slice()
            .try_into()
            .map_err(|err: IdentityError| serde::de::Error::custom(err.to_string()))
    }
}

/// Ed25519 signature.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature(ed25519_dalek::Signature);

impl Signature {
    /// Bytes of the signature.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        self.0.to_bytes()
    }
}

impl TryFrom<&[u8]> for Signature {
    type Error = IdentityError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let checked: [u8; SIGNATURE_LEN] = value
            .try_into()
            .map_err(|_| IdentityError::InvalidLength(value.len(), SIGNATURE_LEN))?;
        Ok(Self(ed25519_dalek::Signature::from_bytes(&checked)))
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signature")
            .field(&hex::encode(self.to_bytes()))
            .finish()
    }
}

impl Serialize for Signature {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_hex(&self.to_bytes(), serializer)
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let bytes = deserialize_hex(deserializer)?;

        bytes
            .as_slice()
            .try_into()
            .map_err(|err: IdentityError| serde::de::Error::custom(err.to_string()))
    }
}

/// Cryptographically verifiable principal of one running device.
///
/// The id of an identity is the hex-encoded public key it was derived from, it is signed with the
/// matching private key. An identity naming any other id never verifies. Identities are
/// content-addressed: the hash of their CBOR encoding is what log entries refer to when naming
/// their signer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub public_key: PublicKey,
    pub signature: Signature,
}

impl Identity {
    /// Derive the device identity of a private key.
    pub fn new(private_key: &PrivateKey) -> Self {
        let public_key = private_key.public_key();
        let id = public_key.to_hex();
        let signature = private_key.sign(id.as_bytes());
        Self {
            id,
            public_key,
            signature,
        }
    }

    /// Returns `true` if the id is the identity's own public key and carries a valid signature of
    /// that key.
    pub fn verify(&self) -> bool {
        self.id == self.public_key.to_hex()
            && self.public_key.verify(self.id.as_bytes(), &self.signature)
    }

    /// CBOR encoding of this identity.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode_cbor(self)
            // All fields are plain byte strings and text, encoding only fails on a critical IO
            // error of the in-memory writer.
            .expect("CBOR encoder failed due to a critical IO error")
    }

    /// Content hash of this identity.
    pub fn hash(&self) -> Hash {
        Hash::new(self.to_bytes())
    }
}

/// Error types for keys, signatures and identities.
#[derive(Error, Debug)]
pub enum IdentityError {
    /// Key or signature has an invalid number of bytes.
    #[error("invalid length {0} bytes, expected {1} bytes")]
    InvalidLength(usize, usize),

    /// Handle errors from `ed25519` crate.
    #[error(transparent)]
    Ed25519(#[from] ed25519_dalek::SignatureError),
}
