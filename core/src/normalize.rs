//! Endpoint normalization: concrete URLs to parameterized keys.
//!
//! `host.example/chart/14281440/medications?x=1` becomes the key
//! `host.example/chart/{id}/medications` with parameters `{x: "1"}`.
//! Normalizing an already-normalized key returns it unchanged.

use std::collections::BTreeMap;

use url::Url;

pub const ID_PLACEHOLDER: &str = "{id}";
pub const UUID_PLACEHOLDER: &str = "{uuid}";

/// Result of normalizing one URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedEndpoint {
    /// `host[:port]/path` with variable segments replaced, or just the path
    /// for path-only input.
    pub key: String,
    /// Query parameters. The last value wins for repeated names.
    pub params: BTreeMap<String, String>,
}

impl NormalizedEndpoint {
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.params.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot normalize {url:?}: {reason}")]
pub struct NormalizeError {
    pub url: String,
    pub reason: String,
}

/// Base used to parse path-only URLs; never appears in a key.
const RELATIVE_BASE: &str = "https://relative.invalid/";

pub fn normalize(raw: &str) -> Result<NormalizedEndpoint, NormalizeError> {
    let raw = raw.trim();
    let fail = |reason: String| NormalizeError {
        url: raw.to_string(),
        reason,
    };
    if raw.is_empty() {
        return Err(fail("empty url".to_string()));
    }

    let path_only = raw.starts_with('/') && !raw.starts_with("//");
    let attempt = if path_only {
        Url::parse(RELATIVE_BASE).and_then(|base| base.join(raw))
    } else if raw.starts_with("//") {
        Url::parse(&format!("https:{raw}"))
    } else if raw.contains("://") {
        Url::parse(raw)
    } else {
        Url::parse(&format!("https://{raw}"))
    };
    let parsed = attempt.map_err(|e| fail(e.to_string()))?;

    let mut key = String::new();
    if !path_only {
        let host = parsed
            .host_str()
            .ok_or_else(|| fail("url has no host".to_string()))?;
        key.push_str(&host.to_ascii_lowercase());
        // Keys re-parse as https, so only 443 may be left implicit.
        if let Some(port) = parsed.port_or_known_default().filter(|p| *p != 443) {
            key.push(':');
            key.push_str(&port.to_string());
        }
    }

    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|segs| segs.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    if segments.is_empty() {
        key.push('/');
    }
    for segment in segments {
        key.push('/');
        key.push_str(&normalize_segment(segment));
    }

    let params = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    Ok(NormalizedEndpoint { key, params })
}

fn normalize_segment(encoded: &str) -> String {
    let decoded = urlencoding::decode(encoded)
        .map(std::borrow::Cow::into_owned)
        .unwrap_or_else(|_| encoded.to_string());

    if decoded == ID_PLACEHOLDER || decoded == UUID_PLACEHOLDER {
        decoded
    } else if decoded.bytes().all(|b| b.is_ascii_digit()) {
        ID_PLACEHOLDER.to_string()
    } else if is_uuid(&decoded) {
        UUID_PLACEHOLDER.to_string()
    } else {
        encoded.to_string()
    }
}

/// 8-4-4-4-12 hex groups.
fn is_uuid(segment: &str) -> bool {
    let bytes = segment.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    bytes.iter().enumerate().all(|(i, b)| match i {
        8 | 13 | 18 | 23 => *b == b'-',
        _ => b.is_ascii_hexdigit(),
    })
}
