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

//! Elastic scanner
//!
//! A long-lived, compaction-tolerant materialized scan used to feed index
//! builds during elastic rebalancing. Unlike the COW cursor it freezes
//! nothing: it walks active tuples in address order behind a moving
//! boundary, sharing the table with concurrent mutation and compaction.
//!
//! Compaction only relocates tuples downward, so the one hazard is a tuple
//! jumping from ahead of the boundary to at-or-behind it, where the scan
//! would never reach it. The scanner observes relocations and queues such
//! tuples as strays, delivered ahead of the positional walk. A tuple
//! relocated within the unscanned region is simply found at its new
//! address; one relocated within the scanned region was already delivered.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::core::Row;
use crate::storage::block::{BlockStore, RelocationObserver, TupleAddress};

struct ScanState {
    /// Last address delivered positionally; everything at or below it has
    /// been scanned
    boundary: Option<TupleAddress>,
    /// Rows relocated across the boundary, owed to the scan
    strays: VecDeque<Row>,
}

/// Compaction-tolerant scan over a table's active tuples
pub struct ElasticScanner {
    store: Arc<BlockStore>,
    state: Mutex<ScanState>,
}

impl ElasticScanner {
    /// Create a scanner over `store` and register it for relocations
    pub(crate) fn new(store: Arc<BlockStore>) -> Arc<Self> {
        let scanner = Arc::new(Self {
            store: Arc::clone(&store),
            state: Mutex::new(ScanState {
                boundary: None,
                strays: VecDeque::new(),
            }),
        });
        store.register_observer(
            Arc::downgrade(&scanner) as Weak<dyn RelocationObserver>
        );
        scanner
    }

    /// Next tuple owed to the scan
    ///
    /// Strays drain first, then the positional walk advances. Returns
    /// `None` when no active tuple remains ahead of the boundary; the
    /// scanner stays usable, later inserts ahead of the boundary will be
    /// delivered by subsequent calls.
    pub fn next(&self) -> Option<Row> {
        let mut state = self.state.lock();
        if let Some(row) = state.strays.pop_front() {
            return Some(row);
        }
        let (addr, row) = self.store.next_active_after(state.boundary)?;
        state.boundary = Some(addr);
        Some(row)
    }

    /// Current scan boundary
    pub fn boundary(&self) -> Option<TupleAddress> {
        self.state.lock().boundary
    }

    /// Strays queued and not yet delivered
    pub fn stray_count(&self) -> usize {
        self.state.lock().strays.len()
    }
}

impl RelocationObserver for ElasticScanner {
    fn on_relocate(&self, old: TupleAddress, new: TupleAddress, row: &Row) {
        let mut state = self.state.lock();
        let Some(boundary) = state.boundary else {
            // Nothing scanned yet; the tuple stays ahead of the walk.
            return;
        };
        if old > boundary && new <= boundary {
            state.strays.push_back(row.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Value;
    use std::collections::BTreeSet;

    fn row(v: i64) -> Row {
        Row::from_values(vec![Value::Integer(v)])
    }

    fn value_of(r: &Row) -> i64 {
        r.get(0).unwrap().as_integer().unwrap()
    }

    #[test]
    fn test_scan_in_address_order() {
        let store = Arc::new(BlockStore::new(2));
        for i in 0..6 {
            store.insert(row(i));
        }
        let scanner = ElasticScanner::new(Arc::clone(&store));
        let mut seen = Vec::new();
        while let Some(r) = scanner.next() {
            seen.push(value_of(&r));
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
        assert!(scanner.next().is_none());

        // A late insert ahead of the boundary is still delivered.
        let addr = store.insert(row(6));
        assert!(addr > scanner.boundary().unwrap());
        assert_eq!(value_of(&scanner.next().unwrap()), 6);
    }

    #[test]
    fn test_relocation_across_boundary_is_strayed() {
        let store = Arc::new(BlockStore::new(2));
        let addrs: Vec<TupleAddress> = (0..6).map(|i| store.insert(row(i))).collect();
        let scanner = ElasticScanner::new(Arc::clone(&store));

        // Scan the first three tuples, then punch holes behind the boundary.
        for _ in 0..3 {
            scanner.next().unwrap();
        }
        store.clear_slot(addrs[0]).unwrap();
        store.clear_slot(addrs[1]).unwrap();

        // Compaction pulls the tail tuples into the scanned region.
        let moved = store.compact(&BTreeSet::new());
        assert!(moved > 0);
        assert_eq!(scanner.stray_count(), moved);

        let mut rest = Vec::new();
        while let Some(r) = scanner.next() {
            rest.push(value_of(&r));
        }
        rest.sort_unstable();
        // 0 and 1 were deleted after being scanned; 3, 4, 5 arrive exactly
        // once, as strays or positionally.
        assert_eq!(rest, vec![3, 4, 5]);
    }

    #[test]
    fn test_relocation_ahead_of_boundary_not_strayed() {
        let store = Arc::new(BlockStore::new(2));
        let addrs: Vec<TupleAddress> = (0..6).map(|i| store.insert(row(i))).collect();
        let scanner = ElasticScanner::new(Arc::clone(&store));
        scanner.next().unwrap();

        // Free a slot ahead of the boundary; the relocation stays in the
        // unscanned region.
        store.clear_slot(addrs[2]).unwrap();
        store.compact(&BTreeSet::new());
        assert_eq!(scanner.stray_count(), 0);

        let mut rest = Vec::new();
        while let Some(r) = scanner.next() {
            rest.push(value_of(&r));
        }
        rest.sort_unstable();
        assert_eq!(rest, vec![1, 3, 4, 5]);
    }

    #[test]
    fn test_dropped_scanner_stops_observing() {
        let store = Arc::new(BlockStore::new(2));
        let addrs: Vec<TupleAddress> = (0..4).map(|i| store.insert(row(i))).collect();
        let scanner = ElasticScanner::new(Arc::clone(&store));
        scanner.next().unwrap();
        drop(scanner);

        store.clear_slot(addrs[0]).unwrap();
        // Must not panic on the dead observer.
        store.compact(&BTreeSet::new());
    }
}
