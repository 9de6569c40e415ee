use std::collections::{BTreeMap, VecDeque};

use crate::{queue::ordering::LATENCY_BUCKET_COUNT, types::SlotIndex};

/// One scheduling candidate as seen by the sorter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortEntry {
    pub index: SlotIndex,
    pub bucket: usize,
    pub order_key: u32,
    pub depth: i32,
}

/// Yields candidates by latency bucket, then descending scheduling order,
/// then ascending depth. Each stage is sorted only when the caller reaches
/// it, so a packet that fills early never pays for a full sort.
pub struct IncrementalSorter {
    latency_buckets: Vec<Vec<SortEntry>>,
    current_bucket: usize,
    ordering_buckets: BTreeMap<u32, Vec<SortEntry>>,
    live: VecDeque<SlotIndex>,
}

impl IncrementalSorter {
    pub fn new(entries: impl IntoIterator<Item = SortEntry>) -> Self {
        let mut latency_buckets = vec![Vec::new(); LATENCY_BUCKET_COUNT];
        for entry in entries {
            let bucket = entry.bucket.min(LATENCY_BUCKET_COUNT - 1);
            latency_buckets[bucket].push(entry);
        }
        Self {
            latency_buckets,
            current_bucket: 0,
            ordering_buckets: BTreeMap::new(),
            live: VecDeque::new(),
        }
    }
}

impl Iterator for IncrementalSorter {
    type Item = SlotIndex;

    fn next(&mut self) -> Option<Self::Item> {
        while self.live.is_empty() {
            if let Some((_, mut entries)) = self.ordering_buckets.pop_last() {
                // stable, so equal depths keep queue order
                entries.sort_by_key(|entry| entry.depth);
                self.live.extend(entries.iter().map(|entry| entry.index));
                continue;
            }

            if self.current_bucket >= self.latency_buckets.len() {
                return None;
            }
            let bucket = std::mem::take(&mut self.latency_buckets[self.current_bucket]);
            self.current_bucket += 1;
            for entry in bucket {
                self.ordering_buckets
                    .entry(entry.order_key)
                    .or_default()
                    .push(entry);
            }
        }
        self.live.pop_front()
    }
}
