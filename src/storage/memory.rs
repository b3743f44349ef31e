use super::engine::KvBackend;
use super::pattern::glob_matches;
use crate::core::{Result, RunStateError};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
enum Entry {
    List(Vec<String>),
    Hash(BTreeMap<String, String>),
}

/// Process-local key-value backend
///
/// Lists and hashes live in one keyspace, like Redis: using a list key as a
/// hash (or the reverse) is a backend error, and emptied entries disappear.
pub struct InMemoryKv {
    entries: RwLock<HashMap<String, Entry>>,
    /// Simulated outage switch
    available: AtomicBool,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle availability; while unavailable every call fails with a
    /// transient backend error
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of keys currently stored
    pub async fn key_count(&self) -> usize {
        self.entries.read().await.len()
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RunStateError::Backend("backend unavailable".to_string()))
        }
    }
}

impl Default for InMemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

fn wrong_type(key: &str) -> RunStateError {
    RunStateError::Backend(format!(
        "WRONGTYPE operation against key '{key}' holding the wrong kind of value"
    ))
}

/// Resolve Redis-style inclusive range bounds against a list length
fn normalize_range(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    let len = len as i64;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

    if len == 0 || start > stop || start >= len {
        return None;
    }

    Some((start as usize, stop as usize))
}

#[async_trait]
impl KvBackend for InMemoryKv {
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        self.ensure_available()?;
        let entries = self.entries.read().await;

        match entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::List(list)) => Ok(normalize_range(list.len(), start, stop)
                .map(|(from, to)| list[from..=to].to_vec())
                .unwrap_or_default()),
            Some(Entry::Hash(_)) => Err(wrong_type(key)),
        }
    }

    async fn rpush(&self, key: &str, values: &[String]) -> Result<usize> {
        self.ensure_available()?;
        let mut entries = self.entries.write().await;

        if values.is_empty() {
            return match entries.get(key) {
                None => Ok(0),
                Some(Entry::List(list)) => Ok(list.len()),
                Some(Entry::Hash(_)) => Err(wrong_type(key)),
            };
        }

        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(Vec::new()));
        match entry {
            Entry::List(list) => {
                list.extend(values.iter().cloned());
                Ok(list.len())
            }
            Entry::Hash(_) => Err(wrong_type(key)),
        }
    }

    async fn rpush_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        self.ensure_available()?;
        let mut entries = self.entries.write().await;

        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(Vec::new()));
        match entry {
            Entry::List(list) => {
                if list.iter().any(|existing| existing == value) {
                    return Ok(false);
                }
                list.push(value.to_string());
                Ok(true)
            }
            Entry::Hash(_) => Err(wrong_type(key)),
        }
    }

    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<usize> {
        self.ensure_available()?;
        let mut entries = self.entries.write().await;

        let list = match entries.get_mut(key) {
            None => return Ok(0),
            Some(Entry::List(list)) => list,
            Some(Entry::Hash(_)) => return Err(wrong_type(key)),
        };

        let limit = if count == 0 {
            usize::MAX
        } else {
            count.unsigned_abs() as usize
        };
        let mut removed = 0;

        if count >= 0 {
            list.retain(|item| {
                if removed < limit && item == value {
                    removed += 1;
                    false
                } else {
                    true
                }
            });
        } else {
            let mut index = list.len();
            while index > 0 && removed < limit {
                index -= 1;
                if list[index] == value {
                    list.remove(index);
                    removed += 1;
                }
            }
        }

        if list.is_empty() {
            entries.remove(key);
        }

        Ok(removed)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool> {
        self.ensure_available()?;
        let mut entries = self.entries.write().await;

        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Hash(BTreeMap::new()));
        match entry {
            Entry::Hash(hash) => Ok(hash.insert(field.to_string(), value.to_string()).is_none()),
            Entry::List(_) => Err(wrong_type(key)),
        }
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.ensure_available()?;
        let entries = self.entries.read().await;

        match entries.get(key) {
            None => Ok(None),
            Some(Entry::Hash(hash)) => Ok(hash.get(field).cloned()),
            Some(Entry::List(_)) => Err(wrong_type(key)),
        }
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<usize> {
        self.ensure_available()?;
        let mut entries = self.entries.write().await;

        let hash = match entries.get_mut(key) {
            None => return Ok(0),
            Some(Entry::Hash(hash)) => hash,
            Some(Entry::List(_)) => return Err(wrong_type(key)),
        };

        let removed = fields
            .iter()
            .filter(|field| hash.remove(field.as_str()).is_some())
            .count();

        if hash.is_empty() {
            entries.remove(key);
        }

        Ok(removed)
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.ensure_available()?;
        let entries = self.entries.read().await;

        let mut matched = Vec::new();
        for key in entries.keys() {
            if glob_matches(key, pattern)? {
                matched.push(key.clone());
            }
        }
        matched.sort();
        Ok(matched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[tokio::test]
    async fn test_list_roundtrip_and_ranges() {
        let kv = InMemoryKv::new();
        kv.rpush("l", &strings(&["a", "b", "c", "d"])).await.unwrap();

        assert_eq!(kv.lrange("l", 0, -1).await.unwrap(), strings(&["a", "b", "c", "d"]));
        assert_eq!(kv.lrange("l", 1, 2).await.unwrap(), strings(&["b", "c"]));
        assert_eq!(kv.lrange("l", -2, -1).await.unwrap(), strings(&["c", "d"]));
        assert_eq!(kv.lrange("l", 5, 10).await.unwrap(), Vec::<String>::new());
        assert_eq!(kv.lrange("missing", 0, -1).await.unwrap(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn test_lrem_counts() {
        let kv = InMemoryKv::new();
        kv.rpush("l", &strings(&["x", "a", "x", "b", "x"])).await.unwrap();

        assert_eq!(kv.lrem("l", 1, "x").await.unwrap(), 1);
        assert_eq!(kv.lrange("l", 0, -1).await.unwrap(), strings(&["a", "x", "b", "x"]));

        assert_eq!(kv.lrem("l", -1, "x").await.unwrap(), 1);
        assert_eq!(kv.lrange("l", 0, -1).await.unwrap(), strings(&["a", "x", "b"]));

        assert_eq!(kv.lrem("l", 0, "x").await.unwrap(), 1);
        assert_eq!(kv.lrem("l", 0, "a").await.unwrap(), 1);
        assert_eq!(kv.lrem("l", 0, "b").await.unwrap(), 1);
        assert_eq!(kv.key_count().await, 0);
    }

    #[tokio::test]
    async fn test_rpush_if_absent() {
        let kv = InMemoryKv::new();
        assert!(kv.rpush_if_absent("l", "run-1").await.unwrap());
        assert!(!kv.rpush_if_absent("l", "run-1").await.unwrap());
        assert!(kv.rpush_if_absent("l", "run-2").await.unwrap());
        assert_eq!(kv.lrange("l", 0, -1).await.unwrap(), strings(&["run-1", "run-2"]));
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let kv = InMemoryKv::new();
        assert!(kv.hset("h", "run-1", "general").await.unwrap());
        assert!(!kv.hset("h", "run-1", "random").await.unwrap());
        assert_eq!(kv.hget("h", "run-1").await.unwrap(), Some("random".to_string()));
        assert_eq!(kv.hget("h", "run-2").await.unwrap(), None);

        assert_eq!(kv.hdel("h", &strings(&["run-1", "run-2"])).await.unwrap(), 1);
        assert_eq!(kv.key_count().await, 0);
    }

    #[tokio::test]
    async fn test_wrong_type_is_backend_error() {
        let kv = InMemoryKv::new();
        kv.rpush("l", &strings(&["a"])).await.unwrap();
        let err = kv.hget("l", "a").await.unwrap_err();
        assert!(matches!(err, RunStateError::Backend(_)));
    }

    #[tokio::test]
    async fn test_keys_pattern() {
        let kv = InMemoryKv::new();
        kv.rpush("p:tag:stream:a", &strings(&["r1"])).await.unwrap();
        kv.rpush("p:tag:stream:b", &strings(&["r2"])).await.unwrap();
        kv.rpush("p:tag:channel", &strings(&["r1"])).await.unwrap();

        assert_eq!(
            kv.keys("p:tag:stream:*").await.unwrap(),
            strings(&["p:tag:stream:a", "p:tag:stream:b"])
        );
    }

    #[tokio::test]
    async fn test_unavailable_backend() {
        let kv = InMemoryKv::new();
        kv.set_available(false);
        let err = kv.lrange("l", 0, -1).await.unwrap_err();
        assert!(err.is_transient());

        kv.set_available(true);
        assert!(kv.lrange("l", 0, -1).await.is_ok());
    }
}
