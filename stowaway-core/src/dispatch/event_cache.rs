//! In-memory queue with disk spill

use std::collections::VecDeque;
use std::sync::Mutex;

use super::disk_cache::EventDiskCache;
use super::record::Record;

/// Pending records: an in-memory FIFO backed by an [`EventDiskCache`].
///
/// Restored disk records are always older than queued ones and go in ahead
/// of them. The queue lock and the disk cache lock are never held together.
#[derive(Debug)]
pub struct EventCache {
    queue: Mutex<VecDeque<Record>>,
    disk: EventDiskCache,
}

impl EventCache {
    pub fn new(disk: EventDiskCache) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            disk,
        }
    }

    /// Append a record to the memory tail
    pub fn add(&self, record: Record) {
        self.queue.lock().unwrap().push_back(record);
    }

    /// Whether both the memory queue and the disk cache are empty
    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty() && self.disk.is_empty()
    }

    /// Reconcile memory and disk with the current connectivity.
    ///
    /// Online, cached records are restored ahead of the queue. Offline, the
    /// queue is spilled to disk. Returns whether there is something to send.
    pub fn update_state(&self, online: bool) -> bool {
        if online {
            let restored = self.disk.uncache();
            if !restored.is_empty() {
                tracing::debug!(records = restored.len(), "Restored records from disk");
            }
            let mut queue = self.queue.lock().unwrap();
            for record in restored.into_iter().rev() {
                queue.push_front(record);
            }
            !queue.is_empty()
        } else {
            let spilled: Vec<Record> = self.queue.lock().unwrap().drain(..).collect();
            if !spilled.is_empty() {
                tracing::debug!(records = spilled.len(), "Offline, spilling queue to disk");
                self.disk.cache(&spilled);
            }
            false
        }
    }

    /// Remove every in-memory record, oldest first
    pub fn drain(&self) -> Vec<Record> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    /// Put records back at the front, keeping their order
    pub fn requeue(&self, records: impl IntoIterator<Item = Record>) {
        let records: Vec<Record> = records.into_iter().collect();
        let mut queue = self.queue.lock().unwrap();
        for record in records.into_iter().rev() {
            queue.push_front(record);
        }
    }

    /// Discard the memory queue and every disk container
    pub fn clear(&self) {
        self.queue.lock().unwrap().clear();
        self.disk.clear();
    }

    /// Number of records in memory
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn disk(&self) -> &EventDiskCache {
        &self.disk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::CacheAge;
    use tempfile::TempDir;

    fn cache(dir: &TempDir) -> EventCache {
        EventCache::new(EventDiskCache::open(dir.path(), CacheAge::Unlimited, 0))
    }

    fn payloads(records: &[Record]) -> Vec<&str> {
        records.iter().map(Record::payload).collect()
    }

    #[test]
    fn test_drain_is_fifo() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache.add(Record::new("?a=1"));
        cache.add(Record::new("?a=2"));

        assert_eq!(cache.len(), 2);
        assert_eq!(payloads(&cache.drain()), vec!["?a=1", "?a=2"]);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_requeue_goes_to_front_in_order() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache.add(Record::new("?new=1"));
        cache.requeue(vec![Record::new("?old=1"), Record::new("?old=2")]);

        assert_eq!(payloads(&cache.drain()), vec!["?old=1", "?old=2", "?new=1"]);
    }

    #[test]
    fn test_offline_spills_queue_to_disk() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        for i in 0..3 {
            cache.add(Record::new(format!("?n={}", i)));
        }

        assert!(!cache.update_state(false));
        assert_eq!(cache.len(), 0);
        assert!(!cache.is_empty());
        assert_eq!(cache.disk().container_count(), 1);
    }

    #[test]
    fn test_online_restores_disk_ahead_of_queue() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        for i in 0..3 {
            cache.add(Record::new(format!("?old={}", i)));
        }
        cache.update_state(false);
        cache.add(Record::new("?new=0"));

        assert!(cache.update_state(true));
        assert_eq!(cache.disk().container_count(), 0);
        assert_eq!(
            payloads(&cache.drain()),
            vec!["?old=0", "?old=1", "?old=2", "?new=0"]
        );
    }

    #[test]
    fn test_update_state_reports_nothing_to_send() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        assert!(!cache.update_state(true));
        assert!(!cache.update_state(false));
        assert_eq!(cache.disk().container_count(), 0);
    }

    #[test]
    fn test_clear_empties_memory_and_disk() {
        let dir = TempDir::new().unwrap();
        let cache = cache(&dir);
        cache.add(Record::new("?a=1"));
        cache.update_state(false);
        cache.add(Record::new("?a=2"));

        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.len(), 0);
    }
}
