// SPDX-License-Identifier: MIT OR Apache-2.0

//! Byte encoding shared by hashes, keys and signatures: hex strings for human-readable formats
//! like JSON, raw byte strings for CBOR.
use serde::de::Error as _;
use serde::{Deserialize, Serialize};
use serde_bytes::{ByteBuf, Bytes};

pub fn serialize_hex<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    if serializer.is_human_readable() {
        serializer.serialize_str(&hex::encode(value))
    } else {
        Bytes::new(value).serialize(serializer)
    }
}

pub fn deserialize_hex<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    if deserializer.is_human_readable() {
        let value = String::deserialize(deserializer)?;
        hex::decode(value).map_err(D::Error::custom)
    } else {
        Ok(ByteBuf::deserialize(deserializer)?.into_vec())
    }
}
