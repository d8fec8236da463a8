use crate::clock::Clock;
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("kv connection failed: {0}")]
    Connection(String),
    #[error("kv command failed: {0}")]
    Command(String),
}

const SCAN_COUNT: usize = 200;

/// Fast shared store used for rate-limit counters, violations and blocks.
/// Every write carries a TTL; expiry is the store's job.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Atomically increments `key` and (re)sets its TTL, returning the new count.
    async fn incr_with_ttl(&self, key: &str, ttl_secs: u64) -> Result<u64, KvError>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError>;
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn exists(&self, key: &str) -> Result<bool, KvError>;
    async fn delete(&self, keys: &[String]) -> Result<(), KvError>;
    async fn add_to_set(&self, key: &str, member: &str, ttl_secs: u64) -> Result<(), KvError>;
    async fn set_members(&self, key: &str) -> Result<Vec<String>, KvError>;
    /// Remaining lifetime in seconds; `None` when the key is missing or
    /// never expires.
    async fn ttl(&self, key: &str) -> Result<Option<u64>, KvError>;
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError>;
}

#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn open(url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(url).map_err(|err| KvError::Connection(err.to_string()))?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<MultiplexedConnection, KvError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| KvError::Connection(err.to_string()))
    }
}

fn command_error(err: redis::RedisError) -> KvError {
    KvError::Command(err.to_string())
}

#[async_trait]
impl KvStore for RedisStore {
    async fn incr_with_ttl(&self, key: &str, ttl_secs: u64) -> Result<u64, KvError> {
        let mut conn = self.conn().await?;
        let (count,): (u64,) = redis::pipe()
            .atomic()
            .incr(key, 1u64)
            .expire(key, ttl_secs as i64)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(command_error)?;
        Ok(count)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        conn.set_ex::<_, _, ()>(key, value, ttl_secs)
            .await
            .map_err(command_error)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn().await?;
        conn.get(key).await.map_err(command_error)
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn().await?;
        conn.exists(key).await.map_err(command_error)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), KvError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(keys.to_vec()).await.map_err(command_error)
    }

    async fn add_to_set(&self, key: &str, member: &str, ttl_secs: u64) -> Result<(), KvError> {
        let mut conn = self.conn().await?;
        redis::pipe()
            .atomic()
            .sadd(key, member)
            .ignore()
            .expire(key, ttl_secs as i64)
            .ignore()
            .query_async::<()>(&mut conn)
            .await
            .map_err(command_error)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn().await?;
        conn.smembers(key).await.map_err(command_error)
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, KvError> {
        let mut conn = self.conn().await?;
        let ttl: i64 = conn.ttl(key).await.map_err(command_error)?;
        Ok(ttl_reply(ttl))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn().await?;
        let pattern = format!("{prefix}*");
        let mut keys = BTreeSet::new();
        let mut cursor = 0u64;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(&mut conn)
                .await
                .map_err(command_error)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once.
        Ok(keys.into_iter().collect())
    }
}

/// Redis answers -2 for a missing key and -1 for a key without expiry.
fn ttl_reply(raw: i64) -> Option<u64> {
    u64::try_from(raw).ok()
}

#[derive(Debug, Clone)]
enum Slot {
    Text(String),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at_ms: u64,
}

/// In-process store with the same TTL semantics as Redis, driven by a
/// [`Clock`]. Used by tests and by the server when `REDIS_URL` is unset.
#[derive(Clone)]
pub struct MemoryKv {
    clock: Arc<dyn Clock>,
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    available: Arc<AtomicBool>,
}

impl MemoryKv {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Arc::new(Mutex::new(HashMap::new())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulates an outage: every command fails until switched back on.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), KvError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(KvError::Connection("memory store marked unavailable".into()))
        }
    }

    fn deadline(&self, ttl_secs: u64) -> u64 {
        self.clock
            .now_millis()
            .saturating_add(ttl_secs.saturating_mul(1000))
    }

    fn purge_expired(&self, entries: &mut HashMap<String, Entry>) {
        let now = self.clock.now_millis();
        entries.retain(|_, entry| entry.expires_at_ms > now);
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn incr_with_ttl(&self, key: &str, ttl_secs: u64) -> Result<u64, KvError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        self.purge_expired(&mut entries);
        let current = match entries.get(key).map(|entry| &entry.slot) {
            Some(Slot::Text(value)) => value
                .parse::<u64>()
                .map_err(|_| KvError::Command(format!("value at `{key}` is not an integer")))?,
            Some(Slot::Set(_)) => {
                return Err(KvError::Command(format!("value at `{key}` is a set")));
            }
            None => 0,
        };
        let next = current + 1;
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Text(next.to_string()),
                expires_at_ms: self.deadline(ttl_secs),
            },
        );
        Ok(next)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), KvError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                slot: Slot::Text(value.to_string()),
                expires_at_ms: self.deadline(ttl_secs),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        self.purge_expired(&mut entries);
        match entries.get(key).map(|entry| &entry.slot) {
            Some(Slot::Text(value)) => Ok(Some(value.clone())),
            Some(Slot::Set(_)) => Err(KvError::Command(format!("value at `{key}` is a set"))),
            None => Ok(None),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, KvError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        self.purge_expired(&mut entries);
        Ok(entries.contains_key(key))
    }

    async fn delete(&self, keys: &[String]) -> Result<(), KvError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        for key in keys {
            entries.remove(key);
        }
        Ok(())
    }

    async fn add_to_set(&self, key: &str, member: &str, ttl_secs: u64) -> Result<(), KvError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        self.purge_expired(&mut entries);
        let expires_at_ms = self.deadline(ttl_secs);
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Set(BTreeSet::new()),
            expires_at_ms,
        });
        match &mut entry.slot {
            Slot::Set(members) => {
                members.insert(member.to_string());
            }
            Slot::Text(_) => {
                return Err(KvError::Command(format!("value at `{key}` is not a set")));
            }
        }
        entry.expires_at_ms = expires_at_ms;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, KvError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        self.purge_expired(&mut entries);
        match entries.get(key).map(|entry| &entry.slot) {
            Some(Slot::Set(members)) => Ok(members.iter().cloned().collect()),
            Some(Slot::Text(_)) => Err(KvError::Command(format!("value at `{key}` is not a set"))),
            None => Ok(Vec::new()),
        }
    }

    async fn ttl(&self, key: &str) -> Result<Option<u64>, KvError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        self.purge_expired(&mut entries);
        let now = self.clock.now_millis();
        Ok(entries
            .get(key)
            .map(|entry| (entry.expires_at_ms - now).div_ceil(1000)))
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        self.purge_expired(&mut entries);
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (MemoryKv, ManualClock) {
        let clock = ManualClock::default();
        (MemoryKv::new(Arc::new(clock.clone())), clock)
    }

    #[test]
    fn negative_ttl_replies_mean_no_deadline() {
        assert_eq!(ttl_reply(-2), None);
        assert_eq!(ttl_reply(-1), None);
        assert_eq!(ttl_reply(0), Some(0));
        assert_eq!(ttl_reply(42), Some(42));
    }

    #[tokio::test]
    async fn counters_expire_with_their_ttl() {
        let (kv, clock) = store();
        assert_eq!(kv.incr_with_ttl("c", 10).await.unwrap(), 1);
        assert_eq!(kv.incr_with_ttl("c", 10).await.unwrap(), 2);
        clock.advance_secs(10);
        assert!(!kv.exists("c").await.unwrap());
        assert_eq!(kv.incr_with_ttl("c", 10).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_increments_are_all_counted() {
        let (kv, _clock) = store();
        let mut handles = Vec::new();
        for _ in 0..25 {
            let kv = kv.clone();
            handles.push(tokio::spawn(async move {
                kv.incr_with_ttl("shared", 60).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(kv.get("shared").await.unwrap().as_deref(), Some("25"));
    }

    #[tokio::test]
    async fn ttl_rounds_up_to_whole_seconds() {
        let (kv, clock) = store();
        kv.set_with_ttl("k", "v", 5).await.unwrap();
        clock.advance_millis(1_500);
        assert_eq!(kv.ttl("k").await.unwrap(), Some(4));
        assert_eq!(kv.ttl("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn sets_collect_members_and_prefix_scan_is_sorted() {
        let (kv, _clock) = store();
        kv.add_to_set("s:a", "/x", 60).await.unwrap();
        kv.add_to_set("s:a", "/y", 60).await.unwrap();
        kv.add_to_set("s:a", "/x", 60).await.unwrap();
        kv.set_with_ttl("s:b", "1", 60).await.unwrap();
        assert_eq!(kv.set_members("s:a").await.unwrap(), vec!["/x", "/y"]);
        assert_eq!(kv.keys_with_prefix("s:").await.unwrap(), vec!["s:a", "s:b"]);
    }

    #[tokio::test]
    async fn unavailable_store_errors() {
        let (kv, _clock) = store();
        kv.set_available(false);
        assert!(matches!(
            kv.incr_with_ttl("c", 1).await,
            Err(KvError::Connection(_))
        ));
    }
}
