//! Per-range version tracking
//!
//! Every backup range keeps the newest known version of each of its chunks.
//! Chunks created by the range's owner get mostly consecutive local IDs and
//! live in a dense array window; everything else (migrated chunks, IDs
//! outside the window) goes to an open-addressing hash table. A chunk is
//! resolved through exactly one of the two: the window is anchored once and
//! never moves. Changes are recorded until the owner persists them in the
//! range's version log.

use chunklog_common::{ChunkId, NodeId, Version};

/// Hash table load factor in percent before it grows
const MAX_LOAD_PERCENT: usize = 90;

/// Dense version window over `[lowest, lowest + capacity)`
#[derive(Debug)]
pub struct VersionsArray {
    capacity: usize,
    /// Packed versions biased by one, 0 = unknown; allocated on first use
    slots: Vec<u64>,
    count: usize,
}

impl VersionsArray {
    /// Create an empty window of the given capacity
    #[must_use]
    pub const fn new(capacity: usize) -> Self {
        Self {
            capacity,
            slots: Vec::new(),
            count: 0,
        }
    }

    /// Window capacity
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of stored versions
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    /// Whether the window is empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Slot of a local ID, if it falls into the window
    #[must_use]
    pub fn slot(&self, local_id: u64, lowest: u64) -> Option<usize> {
        let offset = usize::try_from(local_id.checked_sub(lowest)?).ok()?;
        (offset < self.capacity).then_some(offset)
    }

    fn get(&self, slot: usize) -> Version {
        match self.slots.get(slot) {
            Some(&stored) if stored != 0 => Version::unpack(stored - 1),
            _ => Version::UNKNOWN,
        }
    }

    fn put(&mut self, slot: usize, version: Version) {
        if self.slots.is_empty() {
            self.slots = vec![0; self.capacity];
        }
        if self.slots[slot] == 0 {
            self.count += 1;
        }
        self.slots[slot] = version.pack() + 1;
    }

    /// Stored versions with their slots
    fn iter(&self) -> impl Iterator<Item = (usize, Version)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, stored)| **stored != 0)
            .map(|(slot, stored)| (slot, Version::unpack(stored - 1)))
    }

    fn clear(&mut self) {
        self.slots = Vec::new();
        self.count = 0;
    }
}

/// Open-addressing hash table from chunk ID to version
///
/// Keys are stored biased by one so that 0 marks a free slot; collisions
/// are resolved by linear probing.
#[derive(Debug)]
pub struct VersionsHashTable {
    keys: Vec<u64>,
    values: Vec<u64>,
    count: usize,
    initial_capacity: usize,
}

impl VersionsHashTable {
    /// Create a table pre-sized for `capacity` entries
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let slots = (capacity * 100 / MAX_LOAD_PERCENT + 1).max(16);
        Self {
            keys: vec![0; slots],
            values: vec![0; slots],
            count: 0,
            initial_capacity: capacity,
        }
    }

    /// Number of stored versions
    #[must_use]
    pub const fn len(&self) -> usize {
        self.count
    }

    /// Whether the table is empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Number of slots
    #[must_use]
    pub fn slots(&self) -> usize {
        self.keys.len()
    }

    fn hash(key: u64) -> u64 {
        // Murmur3 finalizer
        let mut h = key;
        h ^= h >> 33;
        h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
        h ^= h >> 33;
        h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
        h ^ (h >> 33)
    }

    /// Slot holding `key`, or the free slot where it would go
    fn find(&self, key: u64) -> usize {
        let len = self.keys.len();
        let mut idx = (Self::hash(key) % len as u64) as usize;
        loop {
            let stored = self.keys[idx];
            if stored == 0 || stored == key {
                return idx;
            }
            idx = (idx + 1) % len;
        }
    }

    /// Version of a chunk, [`Version::UNKNOWN`] if absent
    #[must_use]
    pub fn get(&self, chunk_id: ChunkId) -> Version {
        let key = chunk_id.raw().wrapping_add(1);
        let idx = self.find(key);
        if self.keys[idx] == key {
            Version::unpack(self.values[idx])
        } else {
            Version::UNKNOWN
        }
    }

    /// Store the version of a chunk
    pub fn put(&mut self, chunk_id: ChunkId, version: Version) {
        let key = chunk_id.raw().wrapping_add(1);
        let idx = self.find(key);
        self.values[idx] = version.pack();
        if self.keys[idx] == 0 {
            self.keys[idx] = key;
            self.count += 1;
            if self.count * 100 >= self.keys.len() * MAX_LOAD_PERCENT {
                self.grow();
            }
        }
    }

    fn grow(&mut self) {
        let new_len = self.keys.len() * 2 + 1;
        let old_keys = std::mem::replace(&mut self.keys, vec![0; new_len]);
        let old_values = std::mem::replace(&mut self.values, vec![0; new_len]);
        for (key, value) in old_keys.into_iter().zip(old_values) {
            if key != 0 {
                let idx = self.find(key);
                self.keys[idx] = key;
                self.values[idx] = value;
            }
        }
    }

    /// Stored versions
    fn iter(&self) -> impl Iterator<Item = (ChunkId, Version)> + '_ {
        self.keys
            .iter()
            .zip(&self.values)
            .filter(|(key, _)| **key != 0)
            .map(|(key, value)| (ChunkId::from_raw(key - 1), Version::unpack(*value)))
    }

    /// Remove all entries and shrink back to the initial size
    pub fn clear(&mut self) {
        *self = Self::new(self.initial_capacity);
    }
}

/// Versions of one backup range
#[derive(Debug)]
pub struct VersionStore {
    /// Creator whose chunks may use the dense window; `None` for migration ranges
    window_creator: Option<NodeId>,
    lowest: Option<u64>,
    array: VersionsArray,
    table: VersionsHashTable,
    /// Versions stored since the last [`Self::clear_changes`]
    changes: Vec<(ChunkId, Version)>,
}

impl VersionStore {
    /// Create a store; `window_creator` is the range's original owner, or
    /// `None` for a migration range
    #[must_use]
    pub fn new(window_creator: Option<NodeId>, array_capacity: usize, table_capacity: usize) -> Self {
        Self {
            window_creator,
            lowest: None,
            array: VersionsArray::new(array_capacity),
            table: VersionsHashTable::new(table_capacity),
            changes: Vec::new(),
        }
    }

    /// Lowest local ID of the dense window, once anchored
    #[must_use]
    pub const fn lowest_local_id(&self) -> Option<u64> {
        self.lowest
    }

    /// Number of chunks with a known version
    #[must_use]
    pub const fn len(&self) -> usize {
        self.array.len() + self.table.len()
    }

    /// Whether no version is known
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn window_slot(&self, chunk_id: ChunkId, lowest: u64) -> Option<usize> {
        if self.window_creator != Some(chunk_id.creator()) {
            return None;
        }
        self.array.slot(chunk_id.local_id(), lowest)
    }

    /// Version from the hash table only
    #[must_use]
    pub fn get(&self, chunk_id: ChunkId) -> Version {
        self.table.get(chunk_id)
    }

    /// Version with the window anchored at `lowest`: the array when the
    /// local ID falls into it, the hash table otherwise
    #[must_use]
    pub fn get_windowed(&self, chunk_id: ChunkId, lowest: u64) -> Version {
        match self.window_slot(chunk_id, lowest) {
            Some(slot) => self.array.get(slot),
            None => self.table.get(chunk_id),
        }
    }

    /// Current version of a chunk, routed through the anchored window
    #[must_use]
    pub fn current(&self, chunk_id: ChunkId) -> Version {
        match self.lowest {
            Some(lowest) => self.get_windowed(chunk_id, lowest),
            None => self.table.get(chunk_id),
        }
    }

    /// Anchor the window around the first eligible chunk
    fn anchor(&mut self, chunk_id: ChunkId) {
        if self.lowest.is_none()
            && self.window_creator == Some(chunk_id.creator())
            && self.array.capacity() > 0
        {
            let lowest = chunk_id.local_id().saturating_sub(self.array.capacity() as u64 / 2);
            self.lowest = Some(lowest);
        }
    }

    /// Store the version of a chunk, replacing the known one
    pub fn put(&mut self, chunk_id: ChunkId, version: Version) {
        self.anchor(chunk_id);
        match self.lowest.and_then(|lowest| self.window_slot(chunk_id, lowest)) {
            Some(slot) => self.array.put(slot, version),
            None => self.table.put(chunk_id, version),
        }
        if version.is_known() {
            self.changes.push((chunk_id, version));
        }
    }

    /// Store `version` unless a newer one is known; returns the stored version
    pub fn put_max(&mut self, chunk_id: ChunkId, version: Version) -> Version {
        let current = self.current(chunk_id);
        if current.is_newer_than(version) {
            current
        } else {
            self.put(chunk_id, version);
            version
        }
    }

    /// Assign and record the next version of a chunk
    pub fn next_version(&mut self, chunk_id: ChunkId) -> Version {
        let current = self.current(chunk_id);
        let next = if current.is_known() {
            current.next()
        } else {
            Version::first(current.epoch)
        };
        self.put(chunk_id, next);
        next
    }

    /// Versions stored since the changes were last cleared, oldest first
    #[must_use]
    pub fn changes(&self) -> &[(ChunkId, Version)] {
        &self.changes
    }

    pub fn clear_changes(&mut self) {
        self.changes.clear();
    }

    /// Every known version
    #[must_use]
    pub fn snapshot(&self) -> Vec<(ChunkId, Version)> {
        let mut all = Vec::with_capacity(self.len());
        if let (Some(lowest), Some(creator)) = (self.lowest, self.window_creator) {
            all.extend(
                self.array
                    .iter()
                    .map(|(slot, version)| (ChunkId::new(creator, lowest + slot as u64), version)),
            );
        }
        all.extend(self.table.iter());
        all.retain(|(_, version)| version.is_known());
        all
    }

    /// Forget all versions
    pub fn clear(&mut self) {
        self.lowest = None;
        self.array.clear();
        self.table.clear();
        self.changes.clear();
    }
}
