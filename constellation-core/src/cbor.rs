// SPDX-License-Identifier: MIT OR Apache-2.0

//! CBOR bytes of everything which gets hashed and stored.
//!
//! Unknown fields are dropped when decoding, re-encoding such a value changes its content
//! address.
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub fn encode_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, EncodeError> {
    let mut bytes = Vec::new();
    ciborium::into_writer(value, &mut bytes).map_err(|err| EncodeError(err.to_string()))?;
    Ok(bytes)
}

pub fn decode_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, DecodeError> {
    ciborium::from_reader(bytes).map_err(|err| match err {
        ciborium::de::Error::Syntax(offset) => DecodeError::Syntax(offset),
        err => DecodeError::Mismatch(err.to_string()),
    })
}

#[derive(Debug, Error)]
#[error("failed encoding CBOR: {0}")]
pub struct EncodeError(String);

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid CBOR at byte {0}")]
    Syntax(usize),

    /// Well-formed CBOR of an unexpected shape.
    #[error("unexpected CBOR value: {0}")]
    Mismatch(String),
}
