//! Values crossing the sandbox boundary.
//!
//! Two policies exist. Data is always *copied*: the producing side serializes
//! it to JSON text and the consuming side parses a fresh value, so no object
//! is ever shared between host and sandbox. The only thing passed by
//! *reference* is a host delegate, which the sandbox sees as an opaque call
//! handle (see [`crate::sandbox::DelegateRef`]).

use std::collections::BTreeMap;

use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PlugletError, Result};

/// Plain response record produced by the fetch delegate and consumed by the
/// in-sandbox `fetch` shim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub data: Value,
}

impl FetchResponse {
    /// Build a response; `ok` follows the 2xx convention.
    pub fn new(
        status: u16,
        status_text: impl Into<String>,
        headers: BTreeMap<String, String>,
        data: Value,
    ) -> Self {
        Self {
            ok: (200..300).contains(&status),
            status,
            status_text: status_text.into(),
            headers,
            data,
        }
    }

    /// A 200 response with no headers, handy for stub delegates.
    pub fn ok_json(data: Value) -> Self {
        Self::new(200, "OK", BTreeMap::new(), data)
    }
}

/// Flatten a header map into lowercase names. Repeated headers are joined
/// with `", "`; values that are not visible ASCII are decoded lossily.
pub fn headers_to_map(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = match value.to_str() {
            Ok(v) => v.to_string(),
            Err(_) => String::from_utf8_lossy(value.as_bytes()).into_owned(),
        };
        map.entry(name.as_str().to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    map
}

/// Interpret a response body: JSON when it parses, otherwise a string.
pub fn body_to_data(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(value) => value,
        Err(_) => Value::String(String::from_utf8_lossy(body).into_owned()),
    }
}

/// Copy a host value into the sandbox representation (JSON text).
pub fn copy_in<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| PlugletError::Marshal(e.to_string()))
}

/// Copy a serialized sandbox value out into an owned host value.
pub fn copy_out(json: &str, max_bytes: usize) -> Result<Value> {
    if json.len() > max_bytes {
        return Err(PlugletError::OutputTooLarge {
            size: json.len(),
            max: max_bytes,
        });
    }
    serde_json::from_str(json).map_err(|e| PlugletError::Marshal(e.to_string()))
}
