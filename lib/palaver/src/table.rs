use crate::net::frame::Nickname;
use std::sync::{Mutex, MutexGuard};

/// Buckets covered by one section lock.
const BUCKETS_PER_SECTION: usize = 64;

/// The classic PJW string hash, over the name bytes up to the terminator.
pub fn hash_pjw(key: &[u8]) -> u32 {
    const ONE_EIGHTH: u32 = 4;
    const THREE_QUARTERS: u32 = 24;
    const HIGH_BITS: u32 = !(!0u32 >> ONE_EIGHTH);

    let mut hash: u32 = 0;
    for &byte in key {
        hash = (hash << ONE_EIGHTH).wrapping_add(u32::from(byte));
        let high = hash & HIGH_BITS;
        if high != 0 {
            hash = (hash ^ (high >> THREE_QUARTERS)) & !HIGH_BITS;
        }
    }
    hash
}

struct Entry<V> {
    key: Nickname,
    value: V,
}

/// Buckets owned by one section: bucket `b` of the table lives in section
/// `b % nsections` at inner index `b / nsections`.
struct Section<V> {
    buckets: Vec<Vec<Entry<V>>>,
}

/// Open-chaining hash table from nickname to `V`, divided into
/// `max(1, nbuckets / 64)` independently locked sections.
///
/// All access goes through guards: `section` locks the single section
/// covering a key's bucket, `lock_all` acquires every section in index
/// order (deadlock-free by consistent ordering), and `for_each_locked`
/// walks the table one section at a time — consistent per bucket, not
/// snapshot-consistent across the table.
pub struct SectionTable<V> {
    nbuckets: usize,
    nsections: usize,
    sections: Vec<Mutex<Section<V>>>,
}

impl<V> SectionTable<V> {
    pub fn new(nbuckets: usize) -> SectionTable<V> {
        assert!(nbuckets > 0, "table must have at least one bucket");

        let nsections = (nbuckets / BUCKETS_PER_SECTION).max(1);
        let sections = (0..nsections)
            .map(|section_id| {
                let owned = (nbuckets - section_id + nsections - 1) / nsections;
                Mutex::new(Section {
                    buckets: (0..owned).map(|_| Vec::new()).collect(),
                })
            })
            .collect();

        SectionTable {
            nbuckets,
            nsections,
            sections,
        }
    }

    #[inline]
    pub fn nbuckets(&self) -> usize {
        self.nbuckets
    }

    #[inline]
    pub fn nsections(&self) -> usize {
        self.nsections
    }

    #[inline]
    fn bucket_of(&self, key: &Nickname) -> usize {
        hash_pjw(key.name_bytes()) as usize % self.nbuckets
    }

    /// Locks the section covering `key`'s bucket.
    pub fn section(&self, key: &Nickname) -> SectionGuard<V> {
        let section_id = self.bucket_of(key) % self.nsections;
        SectionGuard {
            section: self.sections[section_id].lock().expect("table section poisoned"),
            section_id,
            nbuckets: self.nbuckets,
            nsections: self.nsections,
        }
    }

    /// Locks every section, in index order.
    pub fn lock_all(&self) -> AllSectionsGuard<V> {
        AllSectionsGuard {
            sections: self
                .sections
                .iter()
                .map(|section| section.lock().expect("table section poisoned"))
                .collect(),
        }
    }

    /// Visits every entry, holding one section lock at a time. Entries added
    /// or removed in sections not currently held are not observed.
    pub fn for_each_locked<F: FnMut(&Nickname, &V)>(&self, mut visit: F) {
        for section in &self.sections {
            let section = section.lock().expect("table section poisoned");
            for bucket in &section.buckets {
                for entry in bucket {
                    visit(&entry.key, &entry.value);
                }
            }
        }
    }
}

/// Lock on the single section covering one key's bucket. All lookups and
/// mutations through the guard must use keys hashing into the held section.
pub struct SectionGuard<'a, V> {
    section: MutexGuard<'a, Section<V>>,
    section_id: usize,
    nbuckets: usize,
    nsections: usize,
}

impl<'a, V> SectionGuard<'a, V> {
    #[inline]
    fn chain_index(&self, key: &Nickname) -> usize {
        let bucket = hash_pjw(key.name_bytes()) as usize % self.nbuckets;
        debug_assert_eq!(bucket % self.nsections, self.section_id);
        bucket / self.nsections
    }

    pub fn find(&self, key: &Nickname) -> Option<&V> {
        self.section.buckets[self.chain_index(key)]
            .iter()
            .find(|entry| entry.key == *key)
            .map(|entry| &entry.value)
    }

    pub fn find_mut(&mut self, key: &Nickname) -> Option<&mut V> {
        let chain = self.chain_index(key);
        self.section.buckets[chain]
            .iter_mut()
            .find(|entry| entry.key == *key)
            .map(|entry| &mut entry.value)
    }

    /// Inserts at the head of the bucket chain. Returns the value back if
    /// the key is already present.
    pub fn insert(&mut self, key: Nickname, value: V) -> Result<(), V> {
        let chain = self.chain_index(&key);
        let bucket = &mut self.section.buckets[chain];

        if bucket.iter().any(|entry| entry.key == key) {
            return Err(value);
        }

        bucket.insert(0, Entry { key, value });
        Ok(())
    }

    /// Removes an entry, handing its value (and thus its destructor) to the
    /// caller. Returns `None` if the key is absent.
    pub fn remove(&mut self, key: &Nickname) -> Option<V> {
        let chain = self.chain_index(key);
        let bucket = &mut self.section.buckets[chain];

        let position = bucket.iter().position(|entry| entry.key == *key)?;
        Some(bucket.remove(position).value)
    }
}

/// Whole-table lock; every section is held until the guard drops.
pub struct AllSectionsGuard<'a, V> {
    sections: Vec<MutexGuard<'a, Section<V>>>,
}

impl<'a, V> AllSectionsGuard<'a, V> {
    /// Total number of entries, observed atomically.
    pub fn len(&self) -> usize {
        self.sections
            .iter()
            .flat_map(|section| section.buckets.iter())
            .map(|bucket| bucket.len())
            .sum()
    }

    pub fn for_each<F: FnMut(&Nickname, &V)>(&self, mut visit: F) {
        for section in &self.sections {
            for bucket in &section.buckets {
                for entry in bucket {
                    visit(&entry.key, &entry.value);
                }
            }
        }
    }
}
