// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decentralised access control over replicated, append-only logs.
//!
//! Every access controller owns one log of signed grants. An entry grants a role (`MEMBER` or
//! `MODERATOR`) to a device identity or to another access controller acting as an account. Only
//! moderators may append, and the genesis writer named in the controller's [`Manifest`] is a
//! moderator from the start.
//!
//! Roles only ever escalate, there is no revocation. Entries may arrive in any order: when a
//! signer is not yet known as moderator, the [`AccessController`] walks the entry's causal
//! ancestors to establish its authority and fails closed when ancestors are missing.
//!
//! [`Constellation`] bundles the store, identity provider, reference-counted log handles and all
//! controllers of one node.
mod config;
mod controller;
mod engine;
mod identity;
mod manifest;
mod membership;
mod role;
#[cfg(test)]
mod test_utils;

pub use config::{Config, DEFAULT_EVENT_CAPACITY, DEFAULT_MAX_ACCOUNT_DEPTH};
pub use controller::{AccessController, ValidationError};
pub use engine::{Constellation, ConstellationError};
pub use identity::{Identities, IdentityProvider};
pub use manifest::{ACCESS_CONTROLLER_TYPE, Manifest, ManifestError};
pub use membership::{AccountMembershipIndex, MembershipEvent};
pub use role::{MEMBER, MODERATOR, Role, RoleError};
