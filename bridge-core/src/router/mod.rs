//! RouterOS REST client and the small helpers every caller shares.

pub mod rest;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use rest::RestClient;

use crate::traits::{Method, RouterApi};
use crate::{Error, Result};
use serde_json::{Map, Value};
use std::time::Duration;

/// Timeout for ordinary management calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(15_000);

/// One object of a RouterOS listing (`/disk`, `/file`, ...).
pub type Record = Map<String, Value>;

/// Issues a call with [`DEFAULT_TIMEOUT`].
pub async fn send(
    api: &dyn RouterApi,
    method: Method,
    path: &str,
    body: Option<&Value>,
) -> Result<String> {
    api.request(method, path, body, DEFAULT_TIMEOUT).await
}

/// GETs `path` and parses the JSON array of objects RouterOS returns for listings.
pub async fn get_list(api: &dyn RouterApi, path: &str) -> Result<Vec<Record>> {
    let body = send(api, Method::Get, path, None).await?;
    parse_list(&body)
}

pub fn parse_list(body: &str) -> Result<Vec<Record>> {
    match serde_json::from_str::<Value>(body)? {
        Value::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| match item {
                Value::Object(map) => Some(map),
                _ => None,
            })
            .collect()),
        other => Err(Error::UnexpectedResponse(format!(
            "expected a JSON array, got {}",
            truncate(&other.to_string(), 120)
        ))),
    }
}

/// `<collection>/<key>` with `key` percent-encoded as one path segment.
pub fn item_path(collection: &str, key: &str) -> String {
    format!("{}/{}", collection, urlencoding::encode(key))
}

/// String field of a record, `""` when absent or not a string.
pub fn field<'a>(record: &'a Record, key: &str) -> &'a str {
    record.get(key).and_then(Value::as_str).unwrap_or("")
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
