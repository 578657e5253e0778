use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// One whitelist admission, scoped to a session and a tool + params signature.
#[derive(Debug, Clone)]
pub struct WhitelistEntry {
    pub session_id: String,
    pub tool: String,
    pub signature: String,
    pub created_at: DateTime<Utc>,
}

/// In-session cache of approved (tool, params) pairs. A hit auto-approves
/// future identical requests without prompting.
#[derive(Default)]
pub struct Whitelist {
    entries: RwLock<HashMap<String, WhitelistEntry>>,
}

impl Whitelist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the exact tool + params was already approved in this session.
    pub fn allowed(
        &self,
        session_id: &str,
        tool: &str,
        params: &serde_json::Map<String, Value>,
    ) -> bool {
        let key = key_for(session_id, tool, params);
        self.entries.read().contains_key(&key)
    }

    /// Record an admission; idempotent.
    pub fn add(
        &self,
        session_id: &str,
        tool: &str,
        params: &serde_json::Map<String, Value>,
        now: DateTime<Utc>,
    ) -> WhitelistEntry {
        let key = key_for(session_id, tool, params);
        let entry = WhitelistEntry {
            session_id: session_id.to_string(),
            tool: tool.to_string(),
            signature: key.clone(),
            created_at: now,
        };
        self.entries.write().entry(key).or_insert(entry.clone());
        entry
    }

    /// Copy-on-read snapshot of all entries.
    pub fn snapshot(&self) -> Vec<WhitelistEntry> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

fn key_for(session_id: &str, tool: &str, params: &serde_json::Map<String, Value>) -> String {
    format!("{session_id}|{tool}|{}", hash_params(params))
}

/// Deterministic signature over params: map keys are visited in sorted
/// order, recursively, so the hash is invariant under key reordering and
/// stable across processes.
pub fn hash_params(params: &serde_json::Map<String, Value>) -> String {
    if params.is_empty() {
        return "empty".to_string();
    }
    let mut buf = Vec::new();
    encode_value(&mut buf, &Value::Object(params.clone()));
    let digest = Sha256::digest(&buf);
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn encode_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            buf.push(b'{');
            for k in keys {
                buf.extend_from_slice(k.as_bytes());
                buf.push(b':');
                encode_value(buf, &map[k]);
                buf.push(b';');
            }
            buf.push(b'}');
        }
        Value::Array(items) => {
            buf.push(b'[');
            for item in items {
                encode_value(buf, item);
                buf.push(b',');
            }
            buf.push(b']');
        }
        Value::String(s) => buf.extend_from_slice(s.as_bytes()),
        Value::Number(n) => buf.extend_from_slice(n.to_string().as_bytes()),
        Value::Bool(b) => buf.extend_from_slice(if *b { b"true" } else { b"false" }),
        Value::Null => buf.extend_from_slice(b"null"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(v: Value) -> serde_json::Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn hash_is_key_order_invariant() {
        let a = obj(json!({"a": 1, "b": {"x": [1, 2], "y": "z"}}));
        let mut b = serde_json::Map::new();
        b.insert("b".into(), json!({"y": "z", "x": [1, 2]}));
        b.insert("a".into(), json!(1));
        assert_eq!(hash_params(&a), hash_params(&b));
    }

    #[test]
    fn hash_distinguishes_values() {
        let a = obj(json!({"a": 1}));
        let b = obj(json!({"a": 2}));
        assert_ne!(hash_params(&a), hash_params(&b));
    }

    #[test]
    fn empty_params_have_fixed_signature() {
        assert_eq!(hash_params(&serde_json::Map::new()), "empty");
    }

    #[test]
    fn whitelist_roundtrip() {
        let wl = Whitelist::new();
        let params = obj(json!({"k": 1}));
        assert!(!wl.allowed("s", "tool", &params));
        wl.add("s", "tool", &params, chrono::Utc::now());
        assert!(wl.allowed("s", "tool", &params));
        // Different session or tool misses.
        assert!(!wl.allowed("s2", "tool", &params));
        assert!(!wl.allowed("s", "tool2", &params));
        assert_eq!(wl.len(), 1);
    }
}
