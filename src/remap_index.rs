//! Remap index (C3): concurrent map from main-device sector to spare-device
//! location. Open-addressed, resizing by load factor, readers wait-free on a
//! stable snapshot, writers exclusive.

use std::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapEntry {
    pub main_sector: u64,
    pub spare_sector: u64,
    pub length_sectors: u32,
    pub created_ns: u64,
    pub error_count: u32,
    pub flags: u32,
}

const INITIAL_BUCKETS: usize = 64;
const GROW_LOAD_FACTOR_PCT: usize = 150;
const SHRINK_LOAD_FACTOR_PCT: usize = 50;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
    Empty,
    Occupied(RemapEntry),
    Tombstone,
}

struct TableInner {
    buckets: Vec<Slot>,
    count: usize,
}

impl TableInner {
    fn new(capacity: usize) -> Self {
        TableInner {
            buckets: vec![Slot::Empty; capacity.max(INITIAL_BUCKETS)],
            count: 0,
        }
    }

    fn hash(main_sector: u64, buckets_len: usize) -> usize {
        // A simple integer mixer (splitmix64 finalizer), fast and well-distributed
        // for the sequential-ish sector numbers this table sees.
        let mut x = main_sector;
        x ^= x >> 30;
        x = x.wrapping_mul(0xbf58476d1ce4e5b9);
        x ^= x >> 27;
        x = x.wrapping_mul(0x94d049bb133111eb);
        x ^= x >> 31;
        (x as usize) % buckets_len
    }

    fn load_factor_pct(&self) -> usize {
        self.count * 100 / self.buckets.len()
    }

    fn find_slot(&self, main_sector: u64) -> Option<usize> {
        let len = self.buckets.len();
        let mut idx = Self::hash(main_sector, len);
        for _ in 0..len {
            match &self.buckets[idx] {
                Slot::Empty => return None,
                Slot::Occupied(e) if e.main_sector == main_sector => return Some(idx),
                _ => {}
            }
            idx = (idx + 1) % len;
        }
        None
    }

    fn insert_into(buckets: &mut [Slot], entry: RemapEntry) -> bool {
        let len = buckets.len();
        let mut idx = Self::hash(entry.main_sector, len);
        for _ in 0..len {
            match &buckets[idx] {
                Slot::Occupied(e) if e.main_sector == entry.main_sector => return false,
                Slot::Empty | Slot::Tombstone => {
                    buckets[idx] = Slot::Occupied(entry);
                    return true;
                }
                _ => {}
            }
            idx = (idx + 1) % len;
        }
        false
    }

    fn resize(&mut self, new_capacity: usize) {
        let new_capacity = new_capacity.max(INITIAL_BUCKETS);
        let mut new_buckets = vec![Slot::Empty; new_capacity];
        for slot in &self.buckets {
            if let Slot::Occupied(entry) = slot {
                Self::insert_into(&mut new_buckets, *entry);
            }
        }
        self.buckets = new_buckets;
    }
}

/// Keys entries by their aligned allocation-unit boundary so that a lookup
/// for any sector inside a remapped unit resolves to the entry covering that
/// whole unit, not just an exact match on the unit's first sector. Every
/// entry inserted must already be aligned to `unit_sectors` and span exactly
/// one unit (P2: "lookup(s) for any main ≤ s < main+len returns that entry").
pub struct RemapIndex {
    inner: RwLock<TableInner>,
    unit_sectors: u64,
}

impl RemapIndex {
    pub fn new(unit_sectors: u64) -> Self {
        RemapIndex {
            inner: RwLock::new(TableInner::new(INITIAL_BUCKETS)),
            unit_sectors: unit_sectors.max(1),
        }
    }

    fn align(&self, sector: u64) -> u64 {
        (sector / self.unit_sectors) * self.unit_sectors
    }

    /// Returns the entry whose allocation unit contains `sector`, i.e. the
    /// entry with `main_sector <= sector < main_sector + unit_sectors`.
    pub fn lookup(&self, sector: u64) -> Option<RemapEntry> {
        let key = self.align(sector);
        let inner = self.inner.read().unwrap();
        inner.find_slot(key).map(|idx| match inner.buckets[idx] {
            Slot::Occupied(e) => e,
            _ => unreachable!(),
        })
    }

    /// Insert a new entry. `entry.main_sector` must already be aligned to
    /// this index's allocation unit grid. Returns `false` (without error) if
    /// an entry for this unit already exists — callers use this to detect
    /// the "another handler already remapped this sector" race (§4.6/§4.2 P7).
    pub fn insert(&self, entry: RemapEntry) -> bool {
        debug_assert_eq!(
            entry.main_sector % self.unit_sectors,
            0,
            "remap entries must be aligned to the allocation unit grid"
        );
        let mut inner = self.inner.write().unwrap();
        if inner.find_slot(entry.main_sector).is_some() {
            return false;
        }
        if !TableInner::insert_into(&mut inner.buckets, entry) {
            // Table was full despite load factor bookkeeping; grow and retry.
            let new_cap = inner.buckets.len() * 2;
            inner.resize(new_cap);
            TableInner::insert_into(&mut inner.buckets, entry);
        }
        inner.count += 1;
        if inner.load_factor_pct() > GROW_LOAD_FACTOR_PCT {
            let new_cap = inner.buckets.len() * 2;
            inner.resize(new_cap);
        }
        true
    }

    /// Remove an entry. Not exposed publicly — the remap table is append-only
    /// for a device instance's lifetime — but kept and tested as the tested
    /// primitive a future admin-removal feature would call (§9 Open Question).
    #[allow(dead_code)]
    pub(crate) fn remove(&self, sector: u64) -> bool {
        let key = self.align(sector);
        let mut inner = self.inner.write().unwrap();
        let idx = match inner.find_slot(key) {
            Some(idx) => idx,
            None => return false,
        };
        inner.buckets[idx] = Slot::Tombstone;
        inner.count -= 1;
        if inner.load_factor_pct() < SHRINK_LOAD_FACTOR_PCT && inner.buckets.len() > INITIAL_BUCKETS {
            let new_cap = inner.buckets.len() / 2;
            inner.resize(new_cap);
        }
        true
    }

    /// Snapshot of every entry, in unspecified order, suitable for persistence.
    pub fn iter(&self) -> Vec<RemapEntry> {
        let inner = self.inner.read().unwrap();
        inner
            .buckets
            .iter()
            .filter_map(|s| match s {
                Slot::Occupied(e) => Some(*e),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn entry(main: u64, spare: u64) -> RemapEntry {
        RemapEntry {
            main_sector: main,
            spare_sector: spare,
            length_sectors: 8,
            created_ns: 0,
            error_count: 0,
            flags: 0,
        }
    }

    #[test]
    fn lookup_after_insert() {
        let idx = RemapIndex::new(1);
        assert!(idx.insert(entry(100, 5000)));
        let found = idx.lookup(100).unwrap();
        assert_eq!(found.spare_sector, 5000);
        assert!(idx.lookup(200).is_none());
    }

    #[test]
    fn duplicate_insert_rejected() {
        let idx = RemapIndex::new(1);
        assert!(idx.insert(entry(100, 5000)));
        assert!(!idx.insert(entry(100, 6000)));
        assert_eq!(idx.lookup(100).unwrap().spare_sector, 5000);
    }

    #[test]
    fn resize_preserves_all_entries() {
        let idx = RemapIndex::new(1);
        for i in 0..500u64 {
            assert!(idx.insert(entry(i, i * 8)));
        }
        assert_eq!(idx.len(), 500);
        let seen: HashSet<u64> = idx.iter().into_iter().map(|e| e.main_sector).collect();
        for i in 0..500u64 {
            assert!(seen.contains(&i));
        }
    }

    #[test]
    fn remove_then_shrink_path_exercised() {
        let idx = RemapIndex::new(1);
        for i in 0..200u64 {
            idx.insert(entry(i, i * 8));
        }
        for i in 0..190u64 {
            assert!(idx.remove(i));
        }
        assert_eq!(idx.len(), 10);
        for i in 190..200u64 {
            assert!(idx.lookup(i).is_some());
        }
    }

    #[test]
    fn concurrent_inserts_on_same_sector_produce_one_entry() {
        let idx = Arc::new(RemapIndex::new(8));
        let mut handles = Vec::new();
        for spare in 0..8u64 {
            let idx = Arc::clone(&idx);
            handles.push(thread::spawn(move || idx.insert(entry(75000, spare * 8))));
        }
        let successes = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
        assert_eq!(successes, 1);
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn lookup_on_interior_sector_returns_covering_entry() {
        // P2: a lookup anywhere inside [main, main+unit) must resolve to the
        // entry covering that unit, not just an exact match on its start.
        let idx = RemapIndex::new(8);
        assert!(idx.insert(entry(50000, 0)));
        for s in 50000..50008u64 {
            let found = idx.lookup(s).expect("interior sector must hit the covering entry");
            assert_eq!(found.main_sector, 50000);
        }
        assert!(idx.lookup(49999).is_none());
        assert!(idx.lookup(50008).is_none());
    }
}
