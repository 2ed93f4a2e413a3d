//! Open-Addressed Hash Index
//!
//! Maps a 32-bit key hash to the chunk position of the entry holding that
//! key. Linear probing over a power-of-two slot array; removals leave a
//! DELETED marker so probe chains stay intact. The slot array is sized
//! once (two slots per entry) and never grows; when DELETED markers pile up
//! the index is rebuilt in place.
//!
//! Slot encoding (u64):
//!
//! ```text
//! 0                  empty
//! 1                  deleted
//! tag << 32 | pos+2  occupied (tag = key hash, pos = chunk index)
//! ```

const EMPTY: u64 = 0;
const DELETED: u64 = 1;
const POS_BIAS: u64 = 2;

pub struct HashIndex {
    slots: Box<[u64]>,
    mask: usize,
    live: usize,
    deleted: usize,
}

impl HashIndex {
    /// Index sized for up to `max_entries` live keys
    pub fn with_capacity(max_entries: usize) -> Self {
        let slot_count = (max_entries.max(1) * 2).next_power_of_two().max(8);
        debug_assert!(
            slot_count <= u32::MAX as usize,
            "Precondition: slot count must fit the 32-bit hash tag"
        );
        HashIndex {
            slots: vec![EMPTY; slot_count].into_boxed_slice(),
            mask: slot_count - 1,
            live: 0,
            deleted: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Find the slot whose position satisfies `is_match`.
    /// Returns (slot index, chunk position).
    pub fn find(&self, tag: u32, mut is_match: impl FnMut(u32) -> bool) -> Option<(usize, u32)> {
        if self.slots.is_empty() {
            return None;
        }
        let mut slot = tag as usize & self.mask;
        for _ in 0..self.slots.len() {
            match self.slots[slot] {
                EMPTY => return None,
                DELETED => {}
                value => {
                    if (value >> 32) as u32 == tag {
                        let pos = decode_pos(value);
                        if is_match(pos) {
                            return Some((slot, pos));
                        }
                    }
                }
            }
            slot = (slot + 1) & self.mask;
        }
        None
    }

    /// Insert a key known to be absent. Returns the slot used, or None if
    /// every slot is occupied.
    pub fn insert(&mut self, tag: u32, pos: u32) -> Option<usize> {
        if self.slots.is_empty() {
            return None;
        }
        let mut slot = tag as usize & self.mask;
        for _ in 0..self.slots.len() {
            match self.slots[slot] {
                EMPTY => {
                    self.slots[slot] = encode(tag, pos);
                    self.live += 1;
                    return Some(slot);
                }
                DELETED => {
                    self.slots[slot] = encode(tag, pos);
                    self.live += 1;
                    self.deleted -= 1;
                    return Some(slot);
                }
                _ => {}
            }
            slot = (slot + 1) & self.mask;
        }
        None
    }

    /// Point an occupied slot at a new chunk position
    pub fn relocate(&mut self, slot: usize, pos: u32) {
        let value = self.slots[slot];
        debug_assert!(value > DELETED, "Precondition: slot {} must be occupied", slot);
        self.slots[slot] = encode((value >> 32) as u32, pos);
    }

    pub fn remove(&mut self, slot: usize) {
        debug_assert!(
            self.slots[slot] > DELETED,
            "Precondition: slot {} must be occupied",
            slot
        );
        let next = (slot + 1) & self.mask;
        if self.slots[next] == EMPTY {
            // End of a probe chain: no marker needed
            self.slots[slot] = EMPTY;
        } else {
            self.slots[slot] = DELETED;
            self.deleted += 1;
        }
        self.live -= 1;
    }

    /// True when DELETED markers exceed a quarter of the slots
    pub fn needs_rebuild(&self) -> bool {
        self.deleted * 4 > self.slots.len()
    }

    /// Re-insert every live slot into the same allocation, clearing markers
    pub fn rebuild(&mut self) {
        let live_slots: Vec<u64> = self.slots.iter().copied().filter(|v| *v > DELETED).collect();
        debug_assert_eq!(live_slots.len(), self.live, "Invariant: live count must match slots");

        self.slots.fill(EMPTY);
        self.live = 0;
        self.deleted = 0;
        for value in live_slots {
            let inserted = self.insert((value >> 32) as u32, decode_pos(value));
            debug_assert!(inserted.is_some(), "Rebuild cannot run out of slots");
        }
    }

    /// (slot, chunk position) of every live slot
    pub fn occupied(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, v)| **v > DELETED)
            .map(|(slot, v)| (slot, decode_pos(*v)))
    }

    pub fn clear(&mut self) {
        self.slots.fill(EMPTY);
        self.live = 0;
        self.deleted = 0;
    }

    pub fn release(&mut self) {
        self.slots = Box::new([]);
        self.mask = 0;
        self.live = 0;
        self.deleted = 0;
    }
}

fn encode(tag: u32, pos: u32) -> u64 {
    ((tag as u64) << 32) | (pos as u64 + POS_BIAS)
}

fn decode_pos(value: u64) -> u32 {
    ((value & 0xFFFF_FFFF) - POS_BIAS) as u32
}

impl std::fmt::Debug for HashIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashIndex")
            .field("slots", &self.slots.len())
            .field("live", &self.live)
            .field("deleted", &self.deleted)
            .finish()
    }
}
