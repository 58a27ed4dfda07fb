//! Key-value backend port
//!
//! The operation set of a Redis-style server: strings with optional expiry,
//! hashes, score-ordered sets, lists and fire-and-forget publish. Each
//! operation is atomic on its own key; [`KvStore`](super::KvStore) builds the
//! store contract out of them.

use std::time::Duration;

use async_trait::async_trait;

use super::error::KvResult;

#[async_trait]
pub trait KvBackend: Send + Sync {
    // Strings
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    /// Write `value`, replacing any previous value and expiry
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()>;

    /// Write `value` only if the key is absent or expired
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<bool>;

    /// Reset the expiry of `key` only if it still holds `expected`
    async fn compare_and_expire(&self, key: &str, expected: &str, ttl: Duration)
        -> KvResult<bool>;

    /// Delete `key` only if it still holds `expected`
    async fn compare_and_delete(&self, key: &str, expected: &str) -> KvResult<bool>;

    /// Delete a key of any kind; returns whether it existed
    async fn delete(&self, key: &str) -> KvResult<bool>;

    // Hashes
    async fn hset(&self, key: &str, field: &str, value: &str) -> KvResult<()>;

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>>;

    async fn hdel(&self, key: &str, field: &str) -> KvResult<bool>;

    /// Every field and value, ordered by field
    async fn hgetall(&self, key: &str) -> KvResult<Vec<(String, String)>>;

    // Sorted sets
    /// Insert `member` or move it to `score`
    async fn zadd(&self, key: &str, member: &str, score: i64) -> KvResult<()>;

    async fn zrem(&self, key: &str, member: &str) -> KvResult<bool>;

    /// Up to `limit` members with `score <= max`, lowest score first, ties
    /// by member
    async fn zrange_by_score(
        &self,
        key: &str,
        max: i64,
        limit: usize,
    ) -> KvResult<Vec<(String, i64)>>;

    // Lists
    /// Prepend `value`; returns the new length
    async fn lpush(&self, key: &str, value: &str) -> KvResult<usize>;

    /// Up to `count` elements starting at `start`, head first
    async fn lrange(&self, key: &str, start: usize, count: usize) -> KvResult<Vec<String>>;

    /// Keep only the first `len` elements
    async fn ltrim(&self, key: &str, len: usize) -> KvResult<()>;

    /// Remove every occurrence of `value`; returns how many were removed
    async fn lrem(&self, key: &str, value: &str) -> KvResult<usize>;

    // Pub/sub
    /// Broadcast `message` on `channel`; returns the number of receivers
    async fn publish(&self, channel: &str, message: &str) -> KvResult<usize>;
}
