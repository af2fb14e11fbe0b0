// SPDX-License-Identifier: MIT OR Apache-2.0

//! Data types shared by every layer of the constellation stack: BLAKE3 hashes, ed25519 keys and
//! device identities, two-part log addresses and the signed, hash-linked entries which make up
//! replicated authorization logs.
//!
//! Everything which gets stored is encoded as CBOR and content-addressed by the hash of its
//! encoding.
pub mod address;
pub mod cbor;
pub mod entry;
pub mod hash;
pub mod identity;
mod serde;

pub use address::{Address, AddressError};
pub use entry::{Entry, Op, Payload};
pub use hash::{Hash, HashError};
pub use identity::{Identity, IdentityError, PrivateKey, PublicKey, Signature};
