// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::{Hash, HashError};

/// Address of a replicated log.
///
/// Addresses have the two-part shape `<kind>/<root>` where `kind` names the type of the genesis
/// object and `root` is the hex-encoded content hash of that object. Every node derives the same
/// address from the same genesis object, which makes addresses resolvable across the network.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address {
    kind: String,
    root: Hash,
}

impl Address {
    pub fn new(kind: &str, root: Hash) -> Result<Self, AddressError> {
        if kind.is_empty() {
            return Err(AddressError::EmptyKind);
        }

        if kind.contains('/') {
            return Err(AddressError::InvalidKind(kind.to_string()));
        }

        Ok(Self {
            kind: kind.to_string(),
            root,
        })
    }

    /// Type of the genesis object this address was derived from.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Content hash of the genesis object.
    pub fn root(&self) -> Hash {
        self.root
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.root)
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (kind, root) = value
            .split_once('/')
            .ok_or_else(|| AddressError::Malformed(value.to_string()))?;
        Self::new(kind, root.parse()?)
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        value
            .parse()
            .map_err(|err: AddressError| serde::de::Error::custom(err.to_string()))
    }
}

#[derive(Error, Debug)]
pub enum AddressError {
    #[error("address '{0}' does not have the shape <kind>/<hash>")]
    Malformed(String),

    #[error("address kind can't be empty")]
    EmptyKind,

    #[error("address kind '{0}' can't contain '/'")]
    InvalidKind(String),

    #[error("invalid root hash in address: {0}")]
    InvalidRoot(#[from] HashError),
}
