//! Canonical request signatures.

use std::fmt;
use std::hash::{Hash, Hasher};

use reqwest::Method;
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

use crate::graphql;

/// Normalized identity of a request: method, URL with sorted query pairs,
/// and a canonical rendering of the body.
///
/// Two requests that GitHub would answer identically produce equal
/// signatures even when query parameters, JSON keys or GraphQL whitespace
/// are ordered differently.
#[derive(Clone)]
pub struct RequestSignature {
    canonical: String,
    digest: [u8; 32],
}

impl RequestSignature {
    /// Builds the signature of a request.
    pub fn new(method: &Method, url: &Url, body: Option<&[u8]>) -> Self {
        let mut canonical = format!("{} {}", method.as_str().to_ascii_uppercase(), canonical_url(url));
        if let Some(body) = body.filter(|b| !b.is_empty()) {
            canonical.push(' ');
            canonical.push_str(&canonical_body(body));
        }
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&Sha256::digest(canonical.as_bytes()));
        Self { canonical, digest }
    }

    /// The same request made on behalf of a caller that needs `scopes`.
    ///
    /// Scope order does not matter. Without scopes the signature is unchanged.
    pub fn scoped(&self, scopes: &[String]) -> Self {
        if scopes.is_empty() {
            return self.clone();
        }
        let mut sorted: Vec<&str> = scopes.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        sorted.dedup();
        let canonical = format!("{} scopes={}", self.canonical, sorted.join(","));
        let mut digest = [0u8; 32];
        digest.copy_from_slice(&Sha256::digest(canonical.as_bytes()));
        Self { canonical, digest }
    }

    /// Canonical text form.
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// Hex SHA-256 of the canonical form.
    pub fn hash_hex(&self) -> String {
        hex::encode(self.digest)
    }

    pub(crate) fn shard(&self, shards: usize) -> usize {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.digest[..8]);
        (u64::from_le_bytes(prefix) % shards.max(1) as u64) as usize
    }
}

impl PartialEq for RequestSignature {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest && self.canonical == other.canonical
    }
}

impl Eq for RequestSignature {}

impl Hash for RequestSignature {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.digest.hash(state);
    }
}

impl fmt::Display for RequestSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl fmt::Debug for RequestSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("RequestSignature").field(&self.canonical).finish()
    }
}

fn canonical_url(url: &Url) -> String {
    let mut out = format!(
        "{}://{}",
        url.scheme(),
        url.host_str().unwrap_or_default().to_ascii_lowercase()
    );
    if let Some(port) = url.port() {
        out.push_str(&format!(":{}", port));
    }
    out.push_str(url.path());

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if !pairs.is_empty() {
        pairs.sort();
        out.push('?');
        let encoded = serde_urlencoded::to_string(&pairs).unwrap_or_default();
        out.push_str(&encoded);
    }
    out
}

fn canonical_body(body: &[u8]) -> String {
    let value: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => return format!("sha256:{}", hex::encode(Sha256::digest(body))),
    };

    if let Some(query) = value.get("query").and_then(Value::as_str) {
        let document = graphql::parse(query)
            .map(|doc| graphql::print(&doc))
            .unwrap_or_else(|_| query.split_whitespace().collect::<Vec<_>>().join(" "));
        let variables = value
            .get("variables")
            .filter(|v| !v.is_null())
            .map(canonical_json)
            .unwrap_or_else(|| "{}".to_string());
        let operation = value
            .get("operationName")
            .and_then(Value::as_str)
            .unwrap_or_default();
        return format!("graphql:{}|{}|{}", operation, document, variables);
    }
    canonical_json(&value)
}

/// JSON with object keys sorted at every level.
fn canonical_json(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_query_order_is_normalized() {
        let a = RequestSignature::new(
            &Method::GET,
            &url("https://api.github.com/repos/o/r/issues?state=open&per_page=30"),
            None,
        );
        let b = RequestSignature::new(
            &Method::GET,
            &url("https://API.github.com/repos/o/r/issues?per_page=30&state=open"),
            None,
        );
        assert_eq!(a, b);
        assert_eq!(a.hash_hex(), b.hash_hex());
    }

    #[test]
    fn test_method_and_path_matter() {
        let get = RequestSignature::new(&Method::GET, &url("https://api.github.com/repos/o/r"), None);
        let head = RequestSignature::new(&Method::HEAD, &url("https://api.github.com/repos/o/r"), None);
        let other = RequestSignature::new(&Method::GET, &url("https://api.github.com/repos/o/s"), None);
        assert_ne!(get, head);
        assert_ne!(get, other);
    }

    #[test]
    fn test_graphql_bodies_are_normalized() {
        let endpoint = url("https://api.github.com/graphql");
        let a = br#"{"query":"query($o: String!) { repository(owner: $o, name: \"r\") { id } }","variables":{"o":"x","n":1}}"#;
        let b = br#"{"variables":{"n":1,"o":"x"},"query":"query ($o: String!) {\n  repository(owner: $o, name: \"r\") {\n    id\n  }\n}"}"#;
        let c = br#"{"query":"query($o: String!) { repository(owner: $o, name: \"r\") { id } }","variables":{"o":"y","n":1}}"#;

        let sa = RequestSignature::new(&Method::POST, &endpoint, Some(a));
        let sb = RequestSignature::new(&Method::POST, &endpoint, Some(b));
        let sc = RequestSignature::new(&Method::POST, &endpoint, Some(c));
        assert_eq!(sa, sb);
        assert_ne!(sa, sc);
    }

    #[test]
    fn test_scopes_separate_signatures_regardless_of_order() {
        let base = RequestSignature::new(&Method::GET, &url("https://api.github.com/orgs/o/members"), None);
        let ab = base.scoped(&["read:org".to_string(), "repo".to_string()]);
        let ba = base.scoped(&["repo".to_string(), "read:org".to_string()]);
        assert_eq!(ab, ba);
        assert_ne!(ab, base);
        assert_eq!(base.scoped(&[]), base);
    }

    #[test]
    fn test_shard_is_stable() {
        let sig = RequestSignature::new(&Method::GET, &url("https://api.github.com/user"), None);
        assert_eq!(sig.shard(16), sig.clone().shard(16));
        assert!(sig.shard(16) < 16);
    }

    #[test]
    fn test_canonical_json_sorts_nested_keys() {
        let value = serde_json::json!({"b": {"y": 1, "x": [ {"d": 1, "c": 2} ]}, "a": null});
        assert_eq!(canonical_json(&value), r#"{"a":null,"b":{"x":[{"c":2,"d":1}],"y":1}}"#);
    }
}
