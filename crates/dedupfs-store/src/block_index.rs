//! Two-level block index from partial fingerprints to candidate locations.
//!
//! A key is split into a bucket selector (high bits) and a low part. Each
//! bucket is a short vector sorted by low part, so lookups are a hash probe
//! plus a binary search and small buckets carry no per-entry node overhead.

use std::collections::HashMap;

/// Sorted-bucket multi-map from `u64` keys to values.
#[derive(Debug, Clone)]
pub struct BucketIndex<V> {
    low_bits: u32,
    buckets: HashMap<u64, Vec<(u32, V)>>,
    len: usize,
}

impl<V> BucketIndex<V> {
    /// Create an index whose buckets hold keys differing in the low
    /// `low_bits` bits (clamped to 1..=32).
    pub fn new(low_bits: u32) -> Self {
        Self {
            low_bits: low_bits.clamp(1, 32),
            buckets: HashMap::new(),
            len: 0,
        }
    }

    fn split(&self, key: u64) -> (u64, u32) {
        let high = key >> self.low_bits;
        let low = (key & ((1u64 << self.low_bits) - 1)) as u32;
        (high, low)
    }

    fn join(&self, high: u64, low: u32) -> u64 {
        (high << self.low_bits) | low as u64
    }

    /// Insert after any entries with the same key.
    pub fn insert(&mut self, key: u64, value: V) {
        let (high, low) = self.split(key);
        let bucket = self.buckets.entry(high).or_default();
        let pos = bucket.partition_point(|(l, _)| *l <= low);
        bucket.insert(pos, (low, value));
        self.len += 1;
    }

    /// First value stored under `key`.
    pub fn find(&self, key: u64) -> Option<&V> {
        self.candidates(key).next()
    }

    /// All values stored under `key`, in insertion order.
    pub fn candidates(&self, key: u64) -> impl Iterator<Item = &V> + '_ {
        let (high, low) = self.split(key);
        let entries: &[(u32, V)] = self.buckets.get(&high).map(Vec::as_slice).unwrap_or(&[]);
        let start = entries.partition_point(|(l, _)| *l < low);
        entries[start..]
            .iter()
            .take_while(move |(l, _)| *l == low)
            .map(|(_, v)| v)
    }

    /// Remove every entry for which `keep` returns false.
    pub fn retain(&mut self, mut keep: impl FnMut(&V) -> bool) {
        let mut removed = 0;
        self.buckets.retain(|_, bucket| {
            let before = bucket.len();
            bucket.retain(|(_, v)| keep(v));
            removed += before - bucket.len();
            !bucket.is_empty()
        });
        self.len -= removed;
    }

    /// All entries ordered by key.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &V)> + '_ {
        let mut highs: Vec<u64> = self.buckets.keys().copied().collect();
        highs.sort_unstable();
        highs.into_iter().flat_map(move |high| {
            self.buckets[&high]
                .iter()
                .map(move |(low, v)| (self.join(high, *low), v))
        })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the index holds nothing.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of non-empty buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Size of the fullest bucket.
    pub fn max_bucket_len(&self) -> usize {
        self.buckets.values().map(Vec::len).max().unwrap_or(0)
    }
}
