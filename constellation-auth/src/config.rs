// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration of access controllers.
use serde::{Deserialize, Serialize};

/// Default number of account levels followed when resolving roles.
pub const DEFAULT_MAX_ACCOUNT_DEPTH: usize = 1;

/// Default number of buffered membership notifications per controller.
pub const DEFAULT_EVENT_CAPACITY: usize = 128;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// How many levels of nested accounts are followed when resolving the role of a device.
    ///
    /// With the default of one level a device is recognized through an account which was granted
    /// a role directly, accounts of accounts are not followed.
    pub max_account_depth: usize,

    /// Upper bound of ancestor entries collected during one authority walk. If not set, the walk
    /// follows all reachable ancestors.
    pub max_walk_entries: Option<usize>,

    /// Capacity of the membership notification channel of every controller.
    pub event_capacity: usize,
}

impl Config {
    pub fn max_account_depth(mut self, depth: usize) -> Self {
        self.max_account_depth = depth;
        self
    }

    pub fn max_walk_entries(mut self, entries: usize) -> Self {
        self.max_walk_entries = Some(entries);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_account_depth: DEFAULT_MAX_ACCOUNT_DEPTH,
            max_walk_entries: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}
