// SPDX-License-Identifier: MIT OR Apache-2.0

//! Content addresses of blobs: log entries, identities and manifests are all stored under the
//! BLAKE3 digest of their CBOR bytes.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::serde::{deserialize_hex, serialize_hex};

const DIGEST_LEN: usize = blake3::OUT_LEN;

/// BLAKE3 digest, ordered by its raw bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; DIGEST_LEN]);

impl Hash {
    pub fn new(buf: impl AsRef<[u8]>) -> Self {
        Self(*blake3::hash(buf.as_ref()).as_bytes())
    }

    fn from_digest(digest: &[u8]) -> Result<Self, HashError> {
        let bytes = digest
            .try_into()
            .map_err(|_| HashError::InvalidLength(digest.len()))?;
        Ok(Self(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Leading four bytes as hex, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl FromStr for Hash {
    type Err = HashError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::from_digest(&hex::decode(value)?)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short())
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serialize_hex(&self.0, serializer)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let digest = deserialize_hex(deserializer)?;
        Self::from_digest(&digest).map_err(serde::de::Error::custom)
    }
}

#[derive(Error, Debug)]
pub enum HashError {
    #[error("digest has {0} bytes, expected 32")]
    InvalidLength(usize),

    #[error(transparent)]
    InvalidHex(#[from] hex::FromHexError),
}
