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

//! Transactional undo log
//!
//! Mutations register compensation records grouped into quanta, one quantum
//! per undo token. Tokens are assigned in non-decreasing order by the
//! transaction layer. `rollback_to(token)` pops every quantum with a token
//! at or above it, yielding actions newest-first; `release_to(token)` drains
//! every quantum at or below it, yielding actions oldest-first so deferred
//! physical work (clearing pending-delete slots) runs in commit order.
//!
//! The log is a pure record: it never touches the block store. The table
//! interprets the returned actions, because undoing a mutation during an
//! active snapshot also involves the snapshot's pre-image queue.

use crate::core::Row;
use crate::storage::block::TupleAddress;
use crate::storage::cow::PreImageId;

/// Undo token assigned by the transaction layer; non-decreasing
pub type UndoToken = u64;

/// Compensation record for one mutation
#[derive(Debug, Clone)]
pub enum UndoAction {
    /// An insert to undo: clear the slot
    Insert { addr: TupleAddress },
    /// A delete to undo: the slot still holds the bytes as PendingDelete.
    /// `was_dirty` records the state before the delete; `preimage` is set
    /// when the delete queued a snapshot pre-image.
    Delete {
        addr: TupleAddress,
        was_dirty: bool,
        preimage: Option<PreImageId>,
    },
    /// An update to undo: put `old_row` back. `preimage` as for Delete.
    Update {
        addr: TupleAddress,
        old_row: Row,
        preimage: Option<PreImageId>,
    },
}

struct UndoQuantum {
    token: UndoToken,
    actions: Vec<UndoAction>,
}

/// Stack of undo quanta
pub struct UndoLog {
    quanta: Vec<UndoQuantum>,
}

impl UndoLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self { quanta: Vec::new() }
    }

    /// True when no quantum holds any action
    pub fn is_empty(&self) -> bool {
        self.quanta.is_empty()
    }

    /// Number of open quanta
    pub fn quantum_count(&self) -> usize {
        self.quanta.len()
    }

    /// Register an action under `token`
    ///
    /// Opens a new quantum when `token` is above the current top; appends
    /// when it matches. A token below the top would break the stack
    /// discipline and panics in debug builds.
    pub fn register(&mut self, token: UndoToken, action: UndoAction) {
        match self.quanta.last_mut() {
            Some(top) if top.token == token => top.actions.push(action),
            top => {
                debug_assert!(
                    top.as_ref().map_or(true, |t| t.token < token),
                    "undo tokens must be non-decreasing"
                );
                self.quanta.push(UndoQuantum {
                    token,
                    actions: vec![action],
                });
            }
        }
    }

    /// Pop every quantum with a token at or above `token`
    ///
    /// Actions come back newest-first, the order compensation must apply in.
    pub fn rollback_to(&mut self, token: UndoToken) -> Vec<UndoAction> {
        let mut actions = Vec::new();
        while self
            .quanta
            .last()
            .is_some_and(|q| q.token >= token)
        {
            let quantum = self.quanta.pop().expect("checked non-empty");
            actions.extend(quantum.actions.into_iter().rev());
        }
        actions
    }

    /// Drain every quantum with a token at or below `token`, oldest-first
    ///
    /// The caller performs the deferred physical work these actions carry.
    pub fn release_to(&mut self, token: UndoToken) -> Vec<UndoAction> {
        let keep = self
            .quanta
            .iter()
            .position(|q| q.token > token)
            .unwrap_or(self.quanta.len());
        let mut actions = Vec::new();
        for quantum in self.quanta.drain(..keep) {
            actions.extend(quantum.actions);
        }
        actions
    }
}

impl Default for UndoLog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(block: u64, slot: usize) -> UndoAction {
        UndoAction::Insert {
            addr: TupleAddress::new(block, slot),
        }
    }

    fn addr_of(action: &UndoAction) -> TupleAddress {
        match action {
            UndoAction::Insert { addr }
            | UndoAction::Delete { addr, .. }
            | UndoAction::Update { addr, .. } => *addr,
        }
    }

    #[test]
    fn test_rollback_newest_first() {
        let mut log = UndoLog::new();
        log.register(1, insert(1, 0));
        log.register(1, insert(1, 1));
        log.register(2, insert(2, 0));
        assert_eq!(log.quantum_count(), 2);

        let actions = log.rollback_to(1);
        let order: Vec<TupleAddress> = actions.iter().map(addr_of).collect();
        assert_eq!(
            order,
            vec![
                TupleAddress::new(2, 0),
                TupleAddress::new(1, 1),
                TupleAddress::new(1, 0),
            ]
        );
        assert!(log.is_empty());
    }

    #[test]
    fn test_partial_rollback_keeps_older_quanta() {
        let mut log = UndoLog::new();
        log.register(1, insert(1, 0));
        log.register(2, insert(2, 0));
        log.register(3, insert(3, 0));

        let actions = log.rollback_to(2);
        assert_eq!(actions.len(), 2);
        assert_eq!(log.quantum_count(), 1);
        assert!(!log.is_empty());
    }

    #[test]
    fn test_release_oldest_first() {
        let mut log = UndoLog::new();
        log.register(1, insert(1, 0));
        log.register(2, insert(2, 0));
        log.register(3, insert(3, 0));

        let actions = log.release_to(2);
        let order: Vec<TupleAddress> = actions.iter().map(addr_of).collect();
        assert_eq!(
            order,
            vec![TupleAddress::new(1, 0), TupleAddress::new(2, 0)]
        );
        assert_eq!(log.quantum_count(), 1);

        let rest = log.release_to(3);
        assert_eq!(rest.len(), 1);
        assert!(log.is_empty());
    }

    #[test]
    fn test_release_of_unknown_token_is_empty() {
        let mut log = UndoLog::new();
        log.register(5, insert(1, 0));
        assert!(log.release_to(4).is_empty());
        assert_eq!(log.quantum_count(), 1);
    }
}
