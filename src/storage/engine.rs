use crate::core::Result;
use async_trait::async_trait;

/// Key-value backend trait - allows pluggable storage backends
///
/// The surface mirrors the handful of Redis commands the tag index needs:
/// ordered lists, hashes and key enumeration. Any Redis-compatible client
/// can implement it directly.
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Read list elements between `start` and `stop` (inclusive, negative
    /// indices count from the tail)
    async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;

    /// Append values to the tail of a list, returning the new length
    async fn rpush(&self, key: &str, values: &[String]) -> Result<usize>;

    /// Append `value` only if the list does not already contain it.
    /// The check and the append happen atomically.
    async fn rpush_if_absent(&self, key: &str, value: &str) -> Result<bool>;

    /// Remove occurrences of `value`: all of them for `count == 0`, the first
    /// `count` from the head for positive counts, from the tail for negative
    async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<usize>;

    /// Set a hash field, returning true when the field is new
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<bool>;

    /// Read a hash field
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Delete hash fields, returning how many existed
    async fn hdel(&self, key: &str, fields: &[String]) -> Result<usize>;

    /// Enumerate keys matching a glob pattern (`*`, `?`, `[...]`)
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;
}
