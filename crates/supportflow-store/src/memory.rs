//! In-memory `KvStore` for tests and single-process deployments
//!
//! TTLs use `tokio::time::Instant`, so tests driving the clock with
//! `tokio::time::pause` see deterministic expiry.

use crate::kv::KvStore;
use dashmap::DashMap;
use std::time::Duration;
use supportflow_core::Result;
use tokio::time::Instant;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

struct LockEntry {
    holder: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryStore {
    strings: DashMap<String, Entry>,
    lists: DashMap<String, Vec<String>>,
    locks: DashMap<String, LockEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            strings: DashMap::new(),
            lists: DashMap::new(),
            locks: DashMap::new(),
        }
    }
}

fn range_bounds(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let clamp = |i: isize| -> isize {
        if i < 0 {
            len as isize + i
        } else {
            i
        }
    };
    let start = clamp(start).max(0);
    let stop = clamp(stop).min(len as isize - 1);
    if len == 0 || start > stop {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait::async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(entry) = self.strings.get(key) {
            if !entry.expired() {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.strings.remove_if(key, |_, e| e.expired());
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.strings.remove(key);
        self.lists.remove(key);
        Ok(())
    }

    async fn incr_ex(&self, key: &str, ttl: Duration) -> Result<i64> {
        let mut entry = self.strings.entry(key.to_string()).or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: Some(Instant::now() + ttl),
        });
        if entry.expired() {
            entry.value = "0".to_string();
            entry.expires_at = Some(Instant::now() + ttl);
        }
        let next = entry.value.parse::<i64>().unwrap_or(0) + 1;
        entry.value = next.to_string();
        Ok(next)
    }

    async fn list_push_unique(&self, key: &str, value: &str) -> Result<bool> {
        let mut list = self.lists.entry(key.to_string()).or_default();
        if list.iter().any(|v| v == value) {
            return Ok(false);
        }
        list.push(value.to_string());
        Ok(true)
    }

    async fn list_range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let list = match self.lists.get(key) {
            Some(l) => l,
            None => return Ok(Vec::new()),
        };
        Ok(match range_bounds(list.len(), start, stop) {
            Some((a, b)) => list[a..=b].to_vec(),
            None => Vec::new(),
        })
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<bool> {
        let mut list = match self.lists.get_mut(key) {
            Some(l) => l,
            None => return Ok(false),
        };
        match list.iter().position(|v| v == value) {
            Some(index) => {
                list.remove(index);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_len(&self, key: &str) -> Result<usize> {
        Ok(self.lists.get(key).map(|l| l.len()).unwrap_or(0))
    }

    async fn lock_acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        use dashmap::mapref::entry::Entry;

        let now = Instant::now();
        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let lock = occupied.get_mut();
                if lock.expires_at <= now || lock.holder == holder {
                    lock.holder = holder.to_string();
                    lock.expires_at = now + ttl;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LockEntry {
                    holder: holder.to_string(),
                    expires_at: now + ttl,
                });
                Ok(true)
            }
        }
    }

    async fn lock_renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        match self.locks.get_mut(key) {
            Some(mut lock) if lock.holder == holder && lock.expires_at > now => {
                lock.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn lock_release(&self, key: &str, holder: &str) -> Result<bool> {
        Ok(self
            .locks
            .remove_if(key, |_, lock| lock.holder == holder)
            .is_some())
    }
}
