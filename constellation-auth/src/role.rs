// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Literal of the member role as it appears in grant payloads.
pub const MEMBER: &str = "MEMBER";

/// Literal of the moderator role as it appears in grant payloads.
pub const MODERATOR: &str = "MODERATOR";

/// Role of an identity or account in an access controller.
///
/// Roles are totally ordered, a moderator has all capabilities of a member and may additionally
/// grant roles to others.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Member,
    Moderator,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Member => MEMBER,
            Role::Moderator => MODERATOR,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = RoleError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            MEMBER => Ok(Role::Member),
            MODERATOR => Ok(Role::Moderator),
            _ => Err(RoleError::Unknown(value.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum RoleError {
    #[error("unknown role literal \"{0}\"")]
    Unknown(String),
}
