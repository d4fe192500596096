//! Bounded in-memory machine snapshot caches.
//!
//! Both caches hold owned clones. Callers receive fresh clones; nothing handed
//! out aliases a cached machine.

use std::collections::BTreeMap;

use crate::kernel::traits::Machine;

/// Map from a position key to a machine snapshot. Lowest key evicted first.
pub struct MachineCache {
    entries: BTreeMap<u64, Box<dyn Machine>>,
    capacity: usize,
}

impl MachineCache {
    pub fn new(capacity: usize) -> Self {
        MachineCache {
            entries: BTreeMap::new(),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<u64> {
        self.entries.keys().copied().collect()
    }

    /// Store a snapshot, replacing any at the same key.
    pub fn insert(&mut self, key: u64, machine: Box<dyn Machine>) {
        if self.capacity == 0 {
            return;
        }
        self.entries.insert(key, machine);
        while self.entries.len() > self.capacity {
            self.entries.pop_first();
        }
    }

    pub fn get(&self, key: u64) -> Option<Box<dyn Machine>> {
        self.entries.get(&key).map(|machine| machine.boxed_clone())
    }

    /// Nearest snapshot at or below `key`.
    pub fn get_at_or_before(&self, key: u64) -> Option<(u64, Box<dyn Machine>)> {
        self.entries
            .range(..=key)
            .next_back()
            .map(|(k, machine)| (*k, machine.boxed_clone()))
    }

    /// Drop snapshots that have read (processed or queued) more than
    /// `message_count` messages.
    pub fn invalidate_beyond_messages(&mut self, message_count: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, machine| machine.next_message_index() <= message_count);
        before - self.entries.len()
    }
}

/// Recent machines keyed by gas, spaced at least `interval` apart.
///
/// Cached gas never decreases between invalidations: a snapshot older than
/// the newest cached one is refused, so out-of-order historical queries do
/// not churn the entries near the head.
pub struct RecentMachineCache {
    cache: MachineCache,
    interval: u64,
    last_cached_gas: Option<u64>,
}

impl RecentMachineCache {
    pub fn new(capacity: usize, interval: u64) -> Self {
        RecentMachineCache {
            cache: MachineCache::new(capacity),
            interval,
            last_cached_gas: None,
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn last_cached_gas(&self) -> Option<u64> {
        self.last_cached_gas
    }

    /// Cache a clone of `machine` if it is far enough past the newest entry.
    /// Returns true if it was stored.
    pub fn offer(&mut self, machine: &dyn Machine) -> bool {
        let gas = machine.gas_used();
        if let Some(last) = self.last_cached_gas {
            if gas < last.saturating_add(self.interval) {
                return false;
            }
        }
        self.cache.insert(gas, machine.boxed_clone());
        self.last_cached_gas = Some(gas);
        true
    }

    pub fn get_at_or_before(&self, gas: u64) -> Option<(u64, Box<dyn Machine>)> {
        self.cache.get_at_or_before(gas)
    }

    /// Drop snapshots past `message_count` messages and rewind the
    /// monotonic floor to the newest survivor.
    pub fn invalidate_beyond_messages(&mut self, message_count: u64) -> usize {
        let removed = self.cache.invalidate_beyond_messages(message_count);
        self.last_cached_gas = self.cache.keys().last().copied();
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::messages::MachineMessage;
    use crate::kernel::reference::ReferenceMachine;
    use crate::kernel::traits::RunBudget;

    fn machine_after(count: u64) -> Box<dyn Machine> {
        let mut machine = ReferenceMachine::new();
        let messages = (0..count)
            .map(|seq| MachineMessage {
                sequence_number: seq,
                accumulator: [seq as u8; 32],
                block_number: 1,
                timestamp: 1,
                data: vec![seq as u8],
            })
            .collect();
        machine.deliver_messages(messages).unwrap();
        machine.step(&RunBudget::unlimited()).unwrap();
        Box::new(machine)
    }

    #[test]
    fn test_evicts_lowest_key() {
        let mut cache = MachineCache::new(2);
        cache.insert(10, machine_after(1));
        cache.insert(20, machine_after(2));
        cache.insert(30, machine_after(3));
        assert_eq!(cache.keys(), vec![20, 30]);
        assert!(cache.get(10).is_none());
    }

    #[test]
    fn test_lookup_at_or_before() {
        let mut cache = MachineCache::new(4);
        cache.insert(10, machine_after(1));
        cache.insert(30, machine_after(3));
        let (key, machine) = cache.get_at_or_before(25).unwrap();
        assert_eq!(key, 10);
        assert_eq!(machine.fully_processed_inbox().count, 1);
        assert!(cache.get_at_or_before(5).is_none());
    }

    #[test]
    fn test_invalidation_by_messages() {
        let mut cache = MachineCache::new(4);
        cache.insert(1, machine_after(1));
        cache.insert(2, machine_after(2));
        cache.insert(3, machine_after(3));
        assert_eq!(cache.invalidate_beyond_messages(1), 2);
        assert_eq!(cache.keys(), vec![1]);
    }

    #[test]
    fn test_recent_cache_refuses_older_gas() {
        let mut recent = RecentMachineCache::new(4, 0);
        let newer = machine_after(3);
        let older = machine_after(1);
        assert!(recent.offer(newer.as_ref()));
        assert!(!recent.offer(older.as_ref()));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent.last_cached_gas(), Some(newer.gas_used()));
    }

    #[test]
    fn test_recent_cache_spacing_and_rewind() {
        let one = machine_after(1);
        let two = machine_after(2);
        let interval = two.gas_used() - one.gas_used() + 1;
        let mut recent = RecentMachineCache::new(4, interval);

        assert!(recent.offer(one.as_ref()));
        assert!(!recent.offer(two.as_ref()));
        assert!(recent.offer(machine_after(3).as_ref()));

        assert_eq!(recent.invalidate_beyond_messages(2), 1);
        assert_eq!(recent.last_cached_gas(), Some(one.gas_used()));
    }

    #[test]
    fn test_clone_is_independent() {
        let mut cache = MachineCache::new(1);
        cache.insert(5, machine_after(1));
        let mut taken = cache.get(5).unwrap();
        taken
            .deliver_messages(vec![MachineMessage {
                sequence_number: 1,
                accumulator: [9; 32],
                block_number: 1,
                timestamp: 1,
                data: vec![1],
            }])
            .unwrap();
        taken.step(&RunBudget::unlimited()).unwrap();
        assert_eq!(cache.get(5).unwrap().fully_processed_inbox().count, 1);
    }
}
