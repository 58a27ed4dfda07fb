//! In-process key-value backend
//!
//! Sharded map of typed entries. Expiry is evaluated lazily against the
//! injected clock, so tests drive TTLs with a [`MockClock`] instead of
//! sleeping; [`MemoryBackend::purge_expired`] reclaims dead keys.
//!
//! [`MockClock`]: cadence_common::MockClock

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use cadence_common::{Clock, SystemClock};
use cadence_domain::constants::EVENT_CHANNEL_CAPACITY;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use tokio::sync::broadcast;

use super::backend::KvBackend;
use super::error::{KvError, KvResult};

type Hash = BTreeMap<String, String>;
type List = VecDeque<String>;

/// Member scores plus a `(score, member)` index for range reads
#[derive(Debug, Clone, Default)]
struct SortedSet {
    scores: HashMap<String, i64>,
    ordered: BTreeSet<(i64, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: i64) {
        if let Some(previous) = self.scores.insert(member.to_string(), score) {
            self.ordered.remove(&(previous, member.to_string()));
        }
        self.ordered.insert((score, member.to_string()));
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => self.ordered.remove(&(score, member.to_string())),
            None => false,
        }
    }

    fn range_to(&self, max: i64, limit: usize) -> Vec<(String, i64)> {
        self.ordered
            .iter()
            .take_while(|(score, _)| *score <= max)
            .take(limit)
            .map(|(score, member)| (member.clone(), *score))
            .collect()
    }

    fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(Hash),
    SortedSet(SortedSet),
    List(List),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, expires_at: Option<Instant>) -> Self {
        Self { value, expires_at }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }

    fn holds(&self, expected: &str) -> bool {
        matches!(&self.value, Value::Str(current) if current == expected)
    }
}

/// Typed view of a collection value
trait Collection: Default {
    const KIND: &'static str;

    fn wrap(self) -> Value;
    fn view(value: &Value) -> Option<&Self>;
    fn view_mut(value: &mut Value) -> Option<&mut Self>;
    fn is_empty(&self) -> bool;
}

macro_rules! collection {
    ($ty:ty, $variant:ident, $kind:literal) => {
        impl Collection for $ty {
            const KIND: &'static str = $kind;

            fn wrap(self) -> Value {
                Value::$variant(self)
            }

            fn view(value: &Value) -> Option<&Self> {
                match value {
                    Value::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            fn view_mut(value: &mut Value) -> Option<&mut Self> {
                match value {
                    Value::$variant(inner) => Some(inner),
                    _ => None,
                }
            }

            fn is_empty(&self) -> bool {
                <$ty>::is_empty(self)
            }
        }
    };
}

collection!(Hash, Hash, "hash");
collection!(SortedSet, SortedSet, "sorted set");
collection!(List, List, "list");

fn wrong_type(key: &str, expected: &'static str) -> KvError {
    KvError::WrongType { key: key.to_string(), expected }
}

/// [`KvBackend`] kept in process memory
#[derive(Clone)]
pub struct MemoryBackend {
    entries: Arc<DashMap<String, Entry>>,
    clock: Arc<dyn Clock>,
    messages: broadcast::Sender<(String, String)>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl MemoryBackend {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (messages, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { entries: Arc::new(DashMap::new()), clock, messages }
    }

    /// Receive every `(channel, message)` published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<(String, String)> {
        self.messages.subscribe()
    }

    /// Drop expired keys; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Live keys
    pub fn key_count(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|entry| entry.is_live(now)).count()
    }

    fn deadline(&self, ttl: Option<Duration>) -> Option<Instant> {
        ttl.map(|ttl| self.clock.now() + ttl)
    }

    fn read<C: Collection, T: Default>(
        &self,
        key: &str,
        read: impl FnOnce(&C) -> T,
    ) -> KvResult<T> {
        let now = self.clock.now();
        match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => {
                C::view(&entry.value).map(read).ok_or_else(|| wrong_type(key, C::KIND))
            }
            _ => Ok(T::default()),
        }
    }

    /// Mutate the collection under `key`, creating it if needed and
    /// deleting it once empty
    fn update<C: Collection, T>(&self, key: &str, write: impl FnOnce(&mut C) -> T) -> KvResult<T> {
        let now = self.clock.now();
        let (result, emptied) = {
            let mut entry = self
                .entries
                .entry(key.to_string())
                .or_insert_with(|| Entry::new(C::default().wrap(), None));
            if !entry.is_live(now) {
                *entry = Entry::new(C::default().wrap(), None);
            }
            let collection = C::view_mut(&mut entry.value).ok_or_else(|| wrong_type(key, C::KIND))?;
            let result = write(collection);
            (result, collection.is_empty())
        };
        if emptied {
            self.entries.remove_if(key, |_, entry| C::view(&entry.value).is_some_and(C::is_empty));
        }
        Ok(result)
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let now = self.clock.now();
        match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => match &entry.value {
                Value::Str(value) => Ok(Some(value.clone())),
                _ => Err(wrong_type(key, "string")),
            },
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let entry = Entry::new(Value::Str(value.to_string()), self.deadline(ttl));
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<bool> {
        let now = self.clock.now();
        let entry = Entry::new(Value::Str(value.to_string()), self.deadline(ttl));
        match self.entries.entry(key.to_string()) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().is_live(now) {
                    return Ok(false);
                }
                occupied.insert(entry);
                Ok(true)
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(entry);
                Ok(true)
            }
        }
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> KvResult<bool> {
        let now = self.clock.now();
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.is_live(now) && entry.holds(expected) => {
                entry.expires_at = Some(now + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> KvResult<bool> {
        let now = self.clock.now();
        let removed =
            self.entries.remove_if(key, |_, entry| entry.is_live(now) && entry.holds(expected));
        Ok(removed.is_some())
    }

    async fn delete(&self, key: &str) -> KvResult<bool> {
        let now = self.clock.now();
        Ok(self.entries.remove(key).is_some_and(|(_, entry)| entry.is_live(now)))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> KvResult<()> {
        self.update(key, |hash: &mut Hash| {
            hash.insert(field.to_string(), value.to_string());
        })
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        self.read(key, |hash: &Hash| hash.get(field).cloned())
    }

    async fn hdel(&self, key: &str, field: &str) -> KvResult<bool> {
        if !self.entries.contains_key(key) {
            return Ok(false);
        }
        self.update(key, |hash: &mut Hash| hash.remove(field).is_some())
    }

    async fn hgetall(&self, key: &str) -> KvResult<Vec<(String, String)>> {
        self.read(key, |hash: &Hash| hash.iter().map(|(f, v)| (f.clone(), v.clone())).collect())
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> KvResult<()> {
        self.update(key, |set: &mut SortedSet| set.insert(member, score))
    }

    async fn zrem(&self, key: &str, member: &str) -> KvResult<bool> {
        if !self.entries.contains_key(key) {
            return Ok(false);
        }
        self.update(key, |set: &mut SortedSet| set.remove(member))
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        max: i64,
        limit: usize,
    ) -> KvResult<Vec<(String, i64)>> {
        self.read(key, |set: &SortedSet| set.range_to(max, limit))
    }

    async fn lpush(&self, key: &str, value: &str) -> KvResult<usize> {
        self.update(key, |list: &mut List| {
            list.push_front(value.to_string());
            list.len()
        })
    }

    async fn lrange(&self, key: &str, start: usize, count: usize) -> KvResult<Vec<String>> {
        self.read(key, |list: &List| list.iter().skip(start).take(count).cloned().collect())
    }

    async fn ltrim(&self, key: &str, len: usize) -> KvResult<()> {
        if !self.entries.contains_key(key) {
            return Ok(());
        }
        self.update(key, |list: &mut List| list.truncate(len))
    }

    async fn lrem(&self, key: &str, value: &str) -> KvResult<usize> {
        if !self.entries.contains_key(key) {
            return Ok(0);
        }
        self.update(key, |list: &mut List| {
            let before = list.len();
            list.retain(|item| item != value);
            before - list.len()
        })
    }

    async fn publish(&self, channel: &str, message: &str) -> KvResult<usize> {
        Ok(self.messages.send((channel.to_string(), message.to_string())).unwrap_or(0))
    }
}
