//! Transport wire format: JSON, then percent-encoded.
//!
//! The unreserved set matches `encodeURIComponent`, so payloads interoperate
//! with publishers written against the same convention.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CodecError;

/// Everything except `A-Z a-z 0-9 - _ . ! ~ * ' ( )` is escaped.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub fn encode<T: Serialize>(payload: &T) -> Result<String, CodecError> {
    let json = serde_json::to_string(payload)?;
    Ok(utf8_percent_encode(&json, COMPONENT).to_string())
}

pub fn decode<T: DeserializeOwned>(raw: &str) -> Result<T, CodecError> {
    let json = percent_decode_str(raw)
        .decode_utf8()
        .map_err(|e| CodecError::Utf8(e.to_string()))?;
    Ok(serde_json::from_str(&json)?)
}
