//! Reference deterministic application: a string key-value store.
//!
//! Used by the demo binary and the tests to prove the session layer works
//! end to end. Commands and queries are whitespace-separated UTF-8 text.
//!
//! | Operation | Kind | Result |
//! |---|---|---|
//! | `SET key value` | command | previous value (empty if none) |
//! | `DEL key` | command | `1` if removed, `0` otherwise |
//! | `INCR key` | command | new value |
//! | `GET key` | query | value (empty if none) |
//! | `LEN` | query | number of keys |

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::session::{Application, ApplyContext};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvStore {
    entries: BTreeMap<String, String>,
    /// Commands applied so far, duplicates excluded by the session layer.
    applied: u64,
}

impl KvStore {
    pub fn new() -> Self {
        KvStore::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn applied(&self) -> u64 {
        self.applied
    }

    fn execute(&mut self, operation: &str) -> String {
        let mut parts = operation.split_whitespace();
        match (parts.next(), parts.next(), parts.next()) {
            (Some("SET"), Some(key), Some(value)) => self
                .entries
                .insert(key.to_owned(), value.to_owned())
                .unwrap_or_default(),
            (Some("DEL"), Some(key), None) => {
                let removed = self.entries.remove(key).is_some();
                if removed { "1".to_owned() } else { "0".to_owned() }
            }
            (Some("INCR"), Some(key), None) => {
                let entry = self.entries.entry(key.to_owned()).or_default();
                let current = if entry.is_empty() { Ok(0) } else { entry.parse::<i64>() };
                match current {
                    Ok(n) => {
                        *entry = n.saturating_add(1).to_string();
                        entry.clone()
                    }
                    Err(_) => "ERR not an integer".to_owned(),
                }
            }
            _ => format!("ERR unknown command: {}", operation),
        }
    }
}

impl Application for KvStore {
    fn apply(&mut self, _ctx: &ApplyContext, operation: &[u8]) -> Vec<u8> {
        self.applied += 1;
        match std::str::from_utf8(operation) {
            Ok(text) => self.execute(text).into_bytes(),
            Err(_) => b"ERR operation is not UTF-8".to_vec(),
        }
    }

    fn query(&self, query: &[u8]) -> Vec<u8> {
        let Ok(text) = std::str::from_utf8(query) else {
            return b"ERR query is not UTF-8".to_vec();
        };
        let mut parts = text.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some("GET"), Some(key)) => self.get(key).unwrap_or_default().as_bytes().to_vec(),
            (Some("LEN"), None) => self.entries.len().to_string().into_bytes(),
            _ => format!("ERR unknown query: {}", text).into_bytes(),
        }
    }

    fn snapshot(&self) -> Result<Vec<u8>, String> {
        bincode::serialize(self).map_err(|e| e.to_string())
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<(), String> {
        *self = bincode::deserialize(snapshot).map_err(|e| e.to_string())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::SessionId;

    fn ctx() -> ApplyContext {
        ApplyContext::new(1, 0, SessionId::new(1))
    }

    #[test]
    fn test_set_get_del() {
        let mut kv = KvStore::new();
        assert_eq!(kv.apply(&ctx(), b"SET a 1"), b"");
        assert_eq!(kv.apply(&ctx(), b"SET a 2"), b"1");
        assert_eq!(kv.query(b"GET a"), b"2");
        assert_eq!(kv.apply(&ctx(), b"DEL a"), b"1");
        assert_eq!(kv.apply(&ctx(), b"DEL a"), b"0");
        assert_eq!(kv.query(b"LEN"), b"0");
        assert_eq!(kv.applied(), 4);
    }

    #[test]
    fn test_incr() {
        let mut kv = KvStore::new();
        assert_eq!(kv.apply(&ctx(), b"INCR n"), b"1");
        assert_eq!(kv.apply(&ctx(), b"INCR n"), b"2");
        kv.apply(&ctx(), b"SET s x");
        assert_eq!(kv.apply(&ctx(), b"INCR s"), b"ERR not an integer");
    }

    #[test]
    fn test_snapshot_restore() {
        let mut kv = KvStore::new();
        kv.apply(&ctx(), b"SET k v");
        let snapshot = kv.snapshot().unwrap();

        let mut restored = KvStore::new();
        restored.restore(&snapshot).unwrap();
        assert_eq!(restored, kv);
    }
}
