//! Codec - the textual wire format for definitions and results.
//!
//! Everything that crosses the backing store is JSON: enum members are
//! written by name and timestamps as RFC 3339 with an explicit offset, so a
//! payload decodes identically in any process. Nothing executable or
//! binary is ever stored.

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("decode {what}: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Serialize `value` to its stored text form. `what` names the value in errors.
pub fn encode<T: Serialize>(what: &'static str, value: &T) -> Result<String, CodecError> {
    serde_json::to_string(value).map_err(|source| CodecError::Encode { what, source })
}

pub fn decode<T: DeserializeOwned>(what: &'static str, text: &str) -> Result<T, CodecError> {
    serde_json::from_str(text).map_err(|source| CodecError::Decode { what, source })
}
