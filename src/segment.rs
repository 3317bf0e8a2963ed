use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

use tokio::time::Instant;

use crate::entry::CacheEntry;

pub(crate) enum Lookup<V> {
    Hit(V),
    Expired,
    Miss,
}

/// A named, bounded partition of the cache.
///
/// Holds at most `max_size` entries. Inserting a new key into a full segment first evicts the entry with the oldest
/// last access; entries never accessed after insertion are ordered by insertion.
pub struct Segment<V> {
    name:     String,
    max_size: usize,
    entries:  HashMap<String, CacheEntry<V>>,
    next_seq: u64,
}

impl<V> Segment<V>
where
    V: Clone,
{
    pub(crate) fn new(name: &str, max_size: usize) -> Self {
        Self {
            name:     name.to_string(),
            // A zero-sized segment would never hold the value it was just asked to store.
            max_size: max_size.max(1),
            entries:  HashMap::new(),
            next_seq: 0,
        }
    }

    #[inline]
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Expired entries are removed as a side effect.
    pub(crate) fn lookup(&mut self, key: &str, now: Instant) -> Lookup<V> {
        let expired = match self.entries.get(key) {
            None => return Lookup::Miss,
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            self.entries.remove(key);
            return Lookup::Expired;
        }

        let seq = self.next_seq();
        match self.entries.get_mut(key) {
            Some(entry) => Lookup::Hit(entry.touch(now, seq).clone()),
            None => Lookup::Miss,
        }
    }

    /// Returns the key evicted to make room, if any.
    pub(crate) fn insert(&mut self, key: String, data: V, ttl: Duration, priority: i32, now: Instant) -> Option<String> {
        let evicted = if !self.entries.contains_key(&key) && self.entries.len() >= self.max_size {
            self.evict_lru()
        }
        else {
            None
        };

        let seq = self.next_seq();
        self.entries.insert(key, CacheEntry::new(data, ttl, priority, now, seq));
        evicted
    }

    fn evict_lru(&mut self) -> Option<String> {
        let victim = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.recency())
            .map(|(key, _)| key.clone())?;
        self.entries.remove(&victim);
        Some(victim)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn entry(&self, key: &str) -> Option<&CacheEntry<V>> {
        self.entries.get(key)
    }
}

impl<V> Debug for Segment<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("name", &self.name)
            .field("max_size", &self.max_size)
            .field("len", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    fn hit(lookup: Lookup<i32>) -> Option<i32> {
        match lookup {
            Lookup::Hit(v) => Some(v),
            _ => None,
        }
    }

    #[test]
    fn overwrite_does_not_evict() {
        let now = Instant::now();
        let mut seg = Segment::new("news", 2);
        assert_eq!(seg.insert("a".into(), 1, TTL, 0, now), None);
        assert_eq!(seg.insert("b".into(), 2, TTL, 0, now), None);
        assert_eq!(seg.insert("a".into(), 3, TTL, 0, now), None);
        assert_eq!(seg.len(), 2);
        assert_eq!(hit(seg.lookup("a", now)), Some(3));
    }

    #[test]
    fn evicts_least_recently_accessed() {
        let now = Instant::now();
        let mut seg = Segment::new("news", 2);
        seg.insert("a".into(), 1, TTL, 0, now);
        seg.insert("b".into(), 2, TTL, 0, now);
        assert_eq!(hit(seg.lookup("a", now)), Some(1));

        assert_eq!(seg.insert("c".into(), 3, TTL, 0, now), Some("b".to_string()));
        assert!(seg.contains_key("a"));
        assert!(seg.contains_key("c"));
        assert!(!seg.contains_key("b"));
    }

    #[test]
    fn untouched_entries_evicted_in_insertion_order() {
        let now = Instant::now();
        let mut seg = Segment::new("users", 3);
        for (i, key) in ["x", "y", "z"].iter().enumerate() {
            seg.insert(key.to_string(), i as i32, TTL, 0, now);
        }
        assert_eq!(seg.insert("w".into(), 9, TTL, 0, now), Some("x".to_string()));
        assert_eq!(seg.insert("v".into(), 9, TTL, 0, now), Some("y".to_string()));
    }

    #[test]
    fn expired_entry_is_removed_on_lookup() {
        let now = Instant::now();
        let mut seg = Segment::new("news", 4);
        seg.insert("a".into(), 1, Duration::from_millis(100), 0, now);

        assert!(matches!(seg.lookup("a", now + Duration::from_millis(100)), Lookup::Hit(1)));
        assert!(matches!(seg.lookup("a", now + Duration::from_millis(101)), Lookup::Expired));
        assert!(seg.is_empty());
        assert!(matches!(seg.lookup("a", now + Duration::from_millis(102)), Lookup::Miss));
    }

    #[test]
    fn access_bookkeeping() {
        let now = Instant::now();
        let later = now + Duration::from_secs(1);
        let mut seg = Segment::new("news", 4);
        seg.insert("a".into(), 1, TTL, 7, now);
        seg.lookup("a", now);
        seg.lookup("a", later);

        let entry = seg.entry("a").unwrap();
        assert_eq!(entry.access_count(), 2);
        assert_eq!(entry.last_access_at(), later);
        assert_eq!(entry.created_at(), now);
        assert_eq!(entry.priority(), 7);
    }

    #[test]
    fn zero_max_size_still_holds_one_entry() {
        let now = Instant::now();
        let mut seg = Segment::new("tiny", 0);
        seg.insert("a".into(), 1, TTL, 0, now);
        assert_eq!(seg.insert("b".into(), 2, TTL, 0, now), Some("a".to_string()));
        assert_eq!(seg.len(), 1);
    }
}
