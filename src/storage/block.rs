// Copyright 2025 Cowtable Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Block-organized tuple storage
//!
//! A table's tuples live in fixed-capacity blocks. Block addresses are
//! allocated monotonically and never reused; ascending address order is the
//! canonical scan order. Scanners hold `TupleAddress` values plus their own
//! boundary bookkeeping, never pointers into the store, so relocation and
//! block reclamation cannot dangle a scan position.
//!
//! # Lock Design
//!
//! A single RwLock guards blocks, counters and the free set, in the style of
//! the arena it replaces: one lock acquisition per operation, no ordering
//! hazards. The execution model is single-threaded cooperative, the lock
//! expresses the aliasing seam between the mutation path and long-lived
//! scanners holding `Arc<BlockStore>`.
//!
//! # Compaction
//!
//! `compact` relocates live tuples from the highest-addressed blocks into
//! free slots of strictly lower-addressed blocks and frees emptied blocks.
//! Relocation only ever moves a tuple to a lower address, so an ascending
//! scan can never meet the same tuple twice; a relocation that crosses a
//! scanner's boundary is reported through [`RelocationObserver`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Weak;

use parking_lot::RwLock;

use crate::core::{Error, Result, Row};

/// Stable address of a block; ascending order is scan order
pub type BlockAddress = u64;

/// Address of a tuple slot: block-major ordering matches scan order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TupleAddress {
    /// Owning block
    pub block: BlockAddress,
    /// Slot within the block
    pub slot: usize,
}

impl TupleAddress {
    /// Create a tuple address
    #[inline]
    pub fn new(block: BlockAddress, slot: usize) -> Self {
        Self { block, slot }
    }
}

/// Per-slot lifecycle state
///
/// A single tagged state instead of independent active/dirty bits, so the
/// invalid combinations cannot be represented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No tuple
    Empty,
    /// Active and clean: eligible for snapshot export
    Live,
    /// Active but mutated (or inserted) while an activated snapshot had not
    /// yet scanned past it; the COW cursor skips it
    Dirty,
    /// Logically deleted, bytes retained until the owning undo token is
    /// released
    PendingDelete,
}

impl SlotState {
    /// Live or Dirty: the tuple occupies a logical row
    #[inline]
    pub fn is_active(&self) -> bool {
        matches!(self, SlotState::Live | SlotState::Dirty)
    }

    /// Slot holds tuple bytes (everything but Empty)
    #[inline]
    pub fn is_occupied(&self) -> bool {
        !matches!(self, SlotState::Empty)
    }
}

/// Observer for tuples relocated by compaction
///
/// Invoked synchronously within the compaction call, after the store's write
/// lock is released, once per relocated tuple. Implementations must not
/// mutate the store from inside the callback; buffer and act on the next
/// scan step instead.
pub trait RelocationObserver: Send + Sync {
    /// A tuple moved from `old` to `new`; `row` is its current value
    fn on_relocate(&self, old: TupleAddress, new: TupleAddress, row: &Row);
}

struct Slot {
    state: SlotState,
    row: Option<Row>,
}

struct Block {
    slots: Vec<Slot>,
    /// Live + Dirty
    active: usize,
    /// Non-empty slots
    occupied: usize,
}

impl Block {
    fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                state: SlotState::Empty,
                row: None,
            });
        }
        Self {
            slots,
            active: 0,
            occupied: 0,
        }
    }

    fn first_free_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| !s.state.is_occupied())
    }

    fn first_live_slot(&self) -> Option<usize> {
        self.slots
            .iter()
            .position(|s| s.state == SlotState::Live)
    }

    fn has_space(&self) -> bool {
        self.occupied < self.slots.len()
    }
}

struct StoreInner {
    blocks: BTreeMap<BlockAddress, Block>,
    /// Blocks with at least one free slot, in address order
    free: BTreeSet<BlockAddress>,
    next_address: BlockAddress,
    block_capacity: usize,
    active: usize,
    dirty: usize,
}

impl StoreInner {
    fn adjust_counts(&mut self, block: BlockAddress, old: SlotState, new: SlotState) {
        let b = self.blocks.get_mut(&block).expect("block exists");
        if old.is_active() {
            b.active -= 1;
            self.active -= 1;
        }
        if new.is_active() {
            b.active += 1;
            self.active += 1;
        }
        if old.is_occupied() && !new.is_occupied() {
            b.occupied -= 1;
        }
        if !old.is_occupied() && new.is_occupied() {
            b.occupied += 1;
        }
        if old == SlotState::Dirty {
            self.dirty -= 1;
        }
        if new == SlotState::Dirty {
            self.dirty += 1;
        }
        if b.has_space() {
            self.free.insert(block);
        } else {
            self.free.remove(&block);
        }
    }
}

/// Fixed-capacity block collection shared between a table's mutation path
/// and its scanners
pub struct BlockStore {
    inner: RwLock<StoreInner>,
    observers: RwLock<Vec<Weak<dyn RelocationObserver>>>,
}

impl BlockStore {
    /// Create a store whose blocks hold `block_capacity` tuple slots each
    pub fn new(block_capacity: usize) -> Self {
        assert!(block_capacity > 0, "block capacity must be positive");
        Self {
            inner: RwLock::new(StoreInner {
                blocks: BTreeMap::new(),
                free: BTreeSet::new(),
                next_address: 1,
                block_capacity,
                active: 0,
                dirty: 0,
            }),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Tuple slots per block
    pub fn block_capacity(&self) -> usize {
        self.inner.read().block_capacity
    }

    /// Register a relocation observer; dropped observers are pruned lazily
    pub fn register_observer(&self, observer: Weak<dyn RelocationObserver>) {
        self.observers.write().push(observer);
    }

    /// Insert a row as `Live`, reusing the lowest-addressed free slot
    pub fn insert(&self, row: Row) -> TupleAddress {
        let mut inner = self.inner.write();
        let block_addr = match inner.free.iter().next().copied() {
            Some(addr) => addr,
            None => {
                let addr = inner.next_address;
                inner.next_address += 1;
                let capacity = inner.block_capacity;
                inner.blocks.insert(addr, Block::new(capacity));
                inner.free.insert(addr);
                addr
            }
        };
        let block = inner.blocks.get_mut(&block_addr).expect("free block exists");
        let slot = block
            .first_free_slot()
            .expect("free set only holds blocks with space");
        block.slots[slot] = Slot {
            state: SlotState::Live,
            row: Some(row),
        };
        inner.adjust_counts(block_addr, SlotState::Empty, SlotState::Live);
        TupleAddress::new(block_addr, slot)
    }

    /// Current state of a slot; `Empty` if the block no longer exists
    pub fn state(&self, addr: TupleAddress) -> SlotState {
        let inner = self.inner.read();
        inner
            .blocks
            .get(&addr.block)
            .and_then(|b| b.slots.get(addr.slot))
            .map(|s| s.state)
            .unwrap_or(SlotState::Empty)
    }

    /// Row bytes at a slot, if the slot is occupied (O(1) clone)
    pub fn row(&self, addr: TupleAddress) -> Option<Row> {
        let inner = self.inner.read();
        inner
            .blocks
            .get(&addr.block)
            .and_then(|b| b.slots.get(addr.slot))
            .and_then(|s| s.row.clone())
    }

    /// State and row of a slot in a single lock acquisition
    pub fn read_slot(&self, addr: TupleAddress) -> (SlotState, Option<Row>) {
        let inner = self.inner.read();
        match inner
            .blocks
            .get(&addr.block)
            .and_then(|b| b.slots.get(addr.slot))
        {
            Some(slot) => (slot.state, slot.row.clone()),
            None => (SlotState::Empty, None),
        }
    }

    /// Transition an occupied slot to a new occupied state
    ///
    /// Returns the previous state. Clearing a slot goes through
    /// [`BlockStore::clear_slot`] instead.
    pub fn set_state(&self, addr: TupleAddress, new: SlotState) -> Result<SlotState> {
        debug_assert!(new.is_occupied(), "use clear_slot to empty a slot");
        let mut inner = self.inner.write();
        let slot = inner
            .blocks
            .get_mut(&addr.block)
            .and_then(|b| b.slots.get_mut(addr.slot))
            .ok_or_else(|| Error::tuple_not_found(addr.block, addr.slot))?;
        let old = slot.state;
        if !old.is_occupied() {
            return Err(Error::tuple_not_found(addr.block, addr.slot));
        }
        slot.state = new;
        inner.adjust_counts(addr.block, old, new);
        Ok(old)
    }

    /// Replace the row bytes at an occupied slot, returning the old row
    pub fn replace_row(&self, addr: TupleAddress, row: Row) -> Result<Row> {
        let mut inner = self.inner.write();
        let slot = inner
            .blocks
            .get_mut(&addr.block)
            .and_then(|b| b.slots.get_mut(addr.slot))
            .ok_or_else(|| Error::tuple_not_found(addr.block, addr.slot))?;
        if !slot.state.is_occupied() {
            return Err(Error::tuple_not_found(addr.block, addr.slot));
        }
        let old = slot.row.replace(row).ok_or_else(|| {
            Error::internal(format!(
                "occupied slot {}:{} has no row",
                addr.block, addr.slot
            ))
        })?;
        Ok(old)
    }

    /// Empty a slot, returning its previous state and row
    ///
    /// The freed block stays allocated; compaction reclaims fully empty
    /// blocks.
    pub fn clear_slot(&self, addr: TupleAddress) -> Result<(SlotState, Row)> {
        let mut inner = self.inner.write();
        let slot = inner
            .blocks
            .get_mut(&addr.block)
            .and_then(|b| b.slots.get_mut(addr.slot))
            .ok_or_else(|| Error::tuple_not_found(addr.block, addr.slot))?;
        let old = slot.state;
        if !old.is_occupied() {
            return Err(Error::tuple_not_found(addr.block, addr.slot));
        }
        let row = slot.row.take().ok_or_else(|| {
            Error::internal(format!(
                "occupied slot {}:{} has no row",
                addr.block, addr.slot
            ))
        })?;
        slot.state = SlotState::Empty;
        inner.adjust_counts(addr.block, old, SlotState::Empty);
        Ok((old, row))
    }

    /// Number of active (Live + Dirty) tuples
    pub fn active_count(&self) -> usize {
        self.inner.read().active
    }

    /// Number of Dirty tuples; zero once a snapshot has completed
    pub fn dirty_count(&self) -> usize {
        self.inner.read().dirty
    }

    /// Number of allocated blocks
    pub fn block_count(&self) -> usize {
        self.inner.read().blocks.len()
    }

    /// Addresses of blocks containing at least one active tuple, ascending
    ///
    /// This is the pending-snapshot set captured at stream activation.
    pub fn addresses_with_active(&self) -> Vec<BlockAddress> {
        let inner = self.inner.read();
        inner
            .blocks
            .iter()
            .filter(|(_, b)| b.active > 0)
            .map(|(&addr, _)| addr)
            .collect()
    }

    /// Next `Live` tuple in `block` at or after `from_slot`
    ///
    /// Dirty and PendingDelete slots are skipped; that is the COW cursor's
    /// view of a pending block.
    pub fn next_live_in_block(
        &self,
        block: BlockAddress,
        from_slot: usize,
    ) -> Option<(usize, Row)> {
        let inner = self.inner.read();
        let b = inner.blocks.get(&block)?;
        for slot in from_slot..b.slots.len() {
            if b.slots[slot].state == SlotState::Live {
                let row = b.slots[slot].row.clone().expect("live slot has a row");
                return Some((slot, row));
            }
        }
        None
    }

    /// Transition every `Dirty` slot in `block` back to `Live`
    ///
    /// Called when the COW cursor finishes a block: the dirty mark only
    /// means "skip during this snapshot pass" and expires with the pass.
    pub fn clean_block(&self, block: BlockAddress) -> usize {
        let mut inner = self.inner.write();
        let Some(b) = inner.blocks.get_mut(&block) else {
            return 0;
        };
        let mut cleaned = 0;
        for slot in b.slots.iter_mut() {
            if slot.state == SlotState::Dirty {
                slot.state = SlotState::Live;
                cleaned += 1;
            }
        }
        inner.dirty -= cleaned;
        cleaned
    }

    /// Next active tuple strictly after `boundary` in address order
    pub fn next_active_after(
        &self,
        boundary: Option<TupleAddress>,
    ) -> Option<(TupleAddress, Row)> {
        let inner = self.inner.read();
        let (start_block, start_slot) = match boundary {
            Some(b) => (b.block, b.slot + 1),
            None => (0, 0),
        };
        for (&addr, block) in inner.blocks.range(start_block..) {
            let from = if addr == start_block { start_slot } else { 0 };
            for slot in from..block.slots.len() {
                if block.slots[slot].state.is_active() {
                    let row = block.slots[slot]
                        .row
                        .clone()
                        .expect("active slot has a row");
                    return Some((TupleAddress::new(addr, slot), row));
                }
            }
        }
        None
    }

    /// All active tuples in address order
    pub fn scan_active(&self) -> Vec<(TupleAddress, Row)> {
        let inner = self.inner.read();
        let mut out = Vec::with_capacity(inner.active);
        for (&addr, block) in inner.blocks.iter() {
            for (slot, s) in block.slots.iter().enumerate() {
                if s.state.is_active() {
                    let row = s.row.clone().expect("active slot has a row");
                    out.push((TupleAddress::new(addr, slot), row));
                }
            }
        }
        out
    }

    /// Relocate live tuples downward and reclaim empty blocks
    ///
    /// Blocks in `skip` (an active snapshot's pending set) are left alone,
    /// both as sources and as targets. Only `Live` tuples move; Dirty and
    /// PendingDelete slots are pinned by snapshot or undo bookkeeping that
    /// addresses them. Returns the number of relocations performed.
    pub fn compact(&self, skip: &BTreeSet<BlockAddress>) -> usize {
        let mut relocations: Vec<(TupleAddress, TupleAddress, Row)> = Vec::new();
        {
            let mut inner = self.inner.write();
            let sources: Vec<BlockAddress> = inner
                .blocks
                .keys()
                .rev()
                .copied()
                .filter(|addr| !skip.contains(addr))
                .collect();
            for src in sources {
                loop {
                    let Some(src_slot) = inner
                        .blocks
                        .get(&src)
                        .and_then(|b| b.first_live_slot())
                    else {
                        break;
                    };
                    let Some(dst) = inner
                        .free
                        .range(..src)
                        .copied()
                        .find(|addr| !skip.contains(addr))
                    else {
                        break;
                    };
                    let Some(dst_slot) =
                        inner.blocks.get(&dst).and_then(|b| b.first_free_slot())
                    else {
                        // Stale free-set entry; drop it and retry.
                        inner.free.remove(&dst);
                        continue;
                    };

                    let row = {
                        let block = inner.blocks.get_mut(&src).expect("source block exists");
                        let slot = &mut block.slots[src_slot];
                        slot.state = SlotState::Empty;
                        slot.row.take().expect("live slot has a row")
                    };
                    inner.adjust_counts(src, SlotState::Live, SlotState::Empty);
                    {
                        let block = inner.blocks.get_mut(&dst).expect("target block exists");
                        block.slots[dst_slot] = Slot {
                            state: SlotState::Live,
                            row: Some(row.clone()),
                        };
                    }
                    inner.adjust_counts(dst, SlotState::Empty, SlotState::Live);
                    relocations.push((
                        TupleAddress::new(src, src_slot),
                        TupleAddress::new(dst, dst_slot),
                        row,
                    ));
                }
                let unoccupied = inner
                    .blocks
                    .get(&src)
                    .is_some_and(|b| b.occupied == 0);
                if unoccupied {
                    inner.blocks.remove(&src);
                    inner.free.remove(&src);
                }
            }
        }

        if !relocations.is_empty() {
            let mut observers = self.observers.write();
            observers.retain(|w| w.strong_count() > 0);
            for observer in observers.iter().filter_map(|w| w.upgrade()) {
                for (old, new, row) in &relocations {
                    observer.on_relocate(*old, *new, row);
                }
            }
        }
        relocations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;

    fn row(v: i64) -> Row {
        Row::from_values(vec![Value::Integer(v)])
    }

    #[test]
    fn test_insert_fills_lowest_block_first() {
        let store = BlockStore::new(2);
        let a = store.insert(row(1));
        let b = store.insert(row(2));
        let c = store.insert(row(3));
        assert_eq!(a.block, b.block);
        assert_ne!(a.block, c.block);
        assert_eq!(store.active_count(), 3);
        assert_eq!(store.block_count(), 2);

        // Clearing a slot makes its block the preferred insert target again.
        store.clear_slot(a).unwrap();
        let d = store.insert(row(4));
        assert_eq!(d, a);
    }

    #[test]
    fn test_state_transitions_track_counts() {
        let store = BlockStore::new(4);
        let addr = store.insert(row(1));
        assert_eq!(store.dirty_count(), 0);

        let old = store.set_state(addr, SlotState::Dirty).unwrap();
        assert_eq!(old, SlotState::Live);
        assert_eq!(store.dirty_count(), 1);
        assert_eq!(store.active_count(), 1);

        store.set_state(addr, SlotState::PendingDelete).unwrap();
        assert_eq!(store.dirty_count(), 0);
        assert_eq!(store.active_count(), 0);

        let (state, r) = store.clear_slot(addr).unwrap();
        assert_eq!(state, SlotState::PendingDelete);
        assert_eq!(r, row(1));
        assert_eq!(store.state(addr), SlotState::Empty);
    }

    #[test]
    fn test_slot_errors() {
        let store = BlockStore::new(4);
        let addr = store.insert(row(1));
        store.clear_slot(addr).unwrap();
        assert!(store.clear_slot(addr).is_err());
        assert!(store.set_state(addr, SlotState::Live).is_err());
        assert!(store
            .replace_row(TupleAddress::new(99, 0), row(2))
            .is_err());
    }

    #[test]
    fn test_next_active_after_walks_in_order() {
        let store = BlockStore::new(2);
        let mut addrs = Vec::new();
        for i in 0..5 {
            addrs.push(store.insert(row(i)));
        }
        store.clear_slot(addrs[1]).unwrap();

        let mut boundary = None;
        let mut seen = Vec::new();
        while let Some((addr, r)) = store.next_active_after(boundary) {
            boundary = Some(addr);
            seen.push(r.get(0).unwrap().as_integer().unwrap());
        }
        assert_eq!(seen, vec![0, 2, 3, 4]);
    }

    #[test]
    fn test_addresses_with_active() {
        let store = BlockStore::new(2);
        let a = store.insert(row(1));
        let _b = store.insert(row(2));
        let c = store.insert(row(3));
        assert_eq!(store.addresses_with_active().len(), 2);

        store.clear_slot(c).unwrap();
        assert_eq!(store.addresses_with_active().len(), 1);
        store.clear_slot(a).unwrap();
        assert_eq!(store.addresses_with_active().len(), 1);
    }

    #[test]
    fn test_compact_moves_down_and_reclaims() {
        let store = BlockStore::new(2);
        let mut addrs = Vec::new();
        for i in 0..6 {
            addrs.push(store.insert(row(i)));
        }
        // Punch holes in the low blocks.
        store.clear_slot(addrs[0]).unwrap();
        store.clear_slot(addrs[2]).unwrap();
        assert_eq!(store.block_count(), 3);

        let moved = store.compact(&BTreeSet::new());
        assert_eq!(moved, 2);
        assert_eq!(store.active_count(), 4);
        assert_eq!(store.block_count(), 2);

        // Every relocation went to a lower address.
        let survivors: Vec<i64> = store
            .scan_active()
            .into_iter()
            .map(|(_, r)| r.get(0).unwrap().as_integer().unwrap())
            .collect();
        let mut sorted = survivors.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![1, 3, 4, 5]);
    }

    #[test]
    fn test_compact_skips_pending_blocks() {
        let store = BlockStore::new(2);
        let mut addrs = Vec::new();
        for i in 0..6 {
            addrs.push(store.insert(row(i)));
        }
        store.clear_slot(addrs[0]).unwrap();

        // Protect the highest block: nothing may leave it.
        let mut skip = BTreeSet::new();
        skip.insert(addrs[5].block);
        let moved = store.compact(&skip);
        assert_eq!(moved, 1);
        assert_eq!(store.state(addrs[4]), SlotState::Live);
        assert_eq!(store.state(addrs[5]), SlotState::Live);
    }

    struct Recorder {
        moves: parking_lot::Mutex<Vec<(TupleAddress, TupleAddress, i64)>>,
    }

    impl RelocationObserver for Recorder {
        fn on_relocate(&self, old: TupleAddress, new: TupleAddress, row: &Row) {
            self.moves.lock().push((
                old,
                new,
                row.get(0).unwrap().as_integer().unwrap(),
            ));
        }
    }

    #[test]
    fn test_compact_notifies_observers() {
        let store = BlockStore::new(2);
        let mut addrs = Vec::new();
        for i in 0..4 {
            addrs.push(store.insert(row(i)));
        }
        store.clear_slot(addrs[0]).unwrap();

        let recorder = std::sync::Arc::new(Recorder {
            moves: parking_lot::Mutex::new(Vec::new()),
        });
        store.register_observer(std::sync::Arc::downgrade(&recorder)
            as Weak<dyn RelocationObserver>);

        store.compact(&BTreeSet::new());
        let moves = recorder.moves.lock();
        assert_eq!(moves.len(), 1);
        let (old, new, value) = moves[0];
        assert!(new < old);
        assert_eq!(value, 2);
    }
}
