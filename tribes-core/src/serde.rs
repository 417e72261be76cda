// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use serde_bytes::{ByteBuf as SerdeByteBuf, Bytes as SerdeBytes};

/// Serialize bytes into a hex string for human readable encodings (JSON), or as raw bytes
/// otherwise (CBOR).
pub(crate) fn serialize_hex<S>(value: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    if serializer.is_human_readable() {
        hex::serde::serialize(value, serializer)
    } else {
        SerdeBytes::new(value).serialize(serializer)
    }
}

/// Counterpart of [`serialize_hex`].
pub(crate) fn deserialize_hex<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    if deserializer.is_human_readable() {
        hex::serde::deserialize(deserializer)
    } else {
        let bytes = <SerdeByteBuf>::deserialize(deserializer)?;
        Ok(bytes.into_vec())
    }
}

/// Deserialize into a fixed-size byte array, failing with a descriptive message on any other
/// length.
pub(crate) fn deserialize_fixed<'de, D, const N: usize>(
    deserializer: D,
    what: &'static str,
) -> Result<[u8; N], D::Error>
where
    D: serde::Deserializer<'de>,
{
    let bytes = deserialize_hex(deserializer)?;
    let len = bytes.len();
    bytes.try_into().map_err(|_| {
        serde::de::Error::custom(format!("invalid {what} length {len} bytes, expected {N}"))
    })
}
