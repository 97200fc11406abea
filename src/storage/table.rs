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

//! Table facade
//!
//! [`Table`] owns the block store and coordinates the three concerns that
//! must agree on every mutation: the snapshot context (pre-image
//! preservation), the undo log (transactional compensation) and compaction
//! (which both of the others constrain).
//!
//! The execution model is single-threaded cooperative: mutations, stream
//! pulls and scanner steps interleave at call granularity, never inside a
//! call.

use std::sync::Arc;

use crate::core::{Error, Result, Row, Value};
use crate::storage::block::{BlockStore, SlotState, TupleAddress};
use crate::storage::config::{StreamConfig, StreamKind};
use crate::storage::cow::CowContext;
use crate::storage::elastic::ElasticScanner;
use crate::storage::output::{DefaultTupleSerializer, TupleOutputStreamProcessor, TupleSerializer};
use crate::storage::undo::{UndoAction, UndoLog, UndoToken};

/// A block-organized table with snapshot streaming, undo and compaction
pub struct Table {
    store: Arc<BlockStore>,
    snapshot: Option<CowContext>,
    undo: UndoLog,
    undo_token: Option<UndoToken>,
}

impl Table {
    /// Create an empty table with `block_capacity` tuple slots per block
    pub fn new(block_capacity: usize) -> Self {
        Self {
            store: Arc::new(BlockStore::new(block_capacity)),
            snapshot: None,
            undo: UndoLog::new(),
            undo_token: None,
        }
    }

    /// Number of active rows
    pub fn active_count(&self) -> usize {
        self.store.active_count()
    }

    /// Number of allocated blocks
    pub fn block_count(&self) -> usize {
        self.store.block_count()
    }

    /// Number of rows carrying a snapshot dirty mark
    pub fn dirty_count(&self) -> usize {
        self.store.dirty_count()
    }

    /// All active rows in address order
    pub fn scan(&self) -> Vec<(TupleAddress, Row)> {
        self.store.scan_active()
    }

    /// Row at `addr`, if the slot is occupied
    pub fn row(&self, addr: TupleAddress) -> Option<Row> {
        self.store.row(addr)
    }

    /// First active row whose `column` equals `value`
    ///
    /// Linear scan; this subsystem carries no indexes. Callers that mutate
    /// across compaction re-find tuples this way instead of holding
    /// addresses.
    pub fn find(&self, column: usize, value: &Value) -> Option<TupleAddress> {
        self.store
            .scan_active()
            .into_iter()
            .find(|(_, row)| row.get(column) == Some(value))
            .map(|(addr, _)| addr)
    }

    // =========================================================================
    // Undo coordination
    // =========================================================================

    /// Set the undo token mutations register under; `None` makes mutations
    /// take effect physically at once
    pub fn set_undo_token(&mut self, token: Option<UndoToken>) {
        self.undo_token = token;
    }

    /// Current undo token
    pub fn undo_token(&self) -> Option<UndoToken> {
        self.undo_token
    }

    /// Undo every quantum with a token at or above `token`
    pub fn rollback(&mut self, token: UndoToken) -> Result<()> {
        let actions = self.undo.rollback_to(token);
        for action in actions {
            self.apply_rollback(action)?;
        }
        Ok(())
    }

    /// Commit every quantum with a token at or below `token`
    ///
    /// Deletes deferred by those quanta become physical here.
    pub fn release(&mut self, token: UndoToken) -> Result<()> {
        let actions = self.undo.release_to(token);
        for action in actions {
            if let UndoAction::Delete { addr, .. } = action {
                let (state, _) = self.store.clear_slot(addr)?;
                debug_assert_eq!(state, SlotState::PendingDelete);
            }
        }
        Ok(())
    }

    fn apply_rollback(&mut self, action: UndoAction) -> Result<()> {
        match action {
            UndoAction::Insert { addr } => {
                self.store.clear_slot(addr)?;
            }
            UndoAction::Delete {
                addr,
                was_dirty,
                preimage,
            } => {
                // Withdrawing the pre-image means the cursor will deliver
                // the restored slot itself; an emitted pre-image means the
                // row was already delivered, so the slot comes back dirty.
                let withdrawn = match (preimage, self.snapshot.as_mut()) {
                    (Some(id), Some(ctx)) => ctx.withdraw(id),
                    _ => false,
                };
                let emitted = preimage.is_some() && !withdrawn;
                // A dirty restore only applies where the cursor can still
                // reach the slot; past the cursor or in a retired block the
                // mark would outlive its block's cleanup.
                let pending = self
                    .snapshot
                    .as_ref()
                    .map_or(false, |ctx| ctx.is_tuple_pending(addr));
                let restore = if pending && (was_dirty || emitted) {
                    SlotState::Dirty
                } else {
                    SlotState::Live
                };
                self.store.set_state(addr, restore)?;
            }
            UndoAction::Update {
                addr,
                old_row,
                preimage,
            } => {
                self.store.replace_row(addr, old_row)?;
                if let Some(id) = preimage {
                    let withdrawn = self
                        .snapshot
                        .as_mut()
                        .map_or(false, |ctx| ctx.withdraw(id));
                    if withdrawn || self.snapshot.is_none() {
                        self.store.set_state(addr, SlotState::Live)?;
                    }
                    // Emitted during an active snapshot: stays dirty.
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Mutation path
    // =========================================================================

    /// Insert a row
    ///
    /// A row born inside an activated stream's unscanned region is marked
    /// dirty so the cursor skips it: only activation-time rows are exported.
    pub fn insert(&mut self, row: Row) -> Result<TupleAddress> {
        let addr = self.store.insert(row);
        if let Some(ctx) = &self.snapshot {
            if ctx.is_tuple_pending(addr) {
                self.store.set_state(addr, SlotState::Dirty)?;
            }
        }
        if let Some(token) = self.undo_token {
            self.undo.register(token, UndoAction::Insert { addr });
        }
        Ok(addr)
    }

    /// Delete the active row at `addr`
    ///
    /// If the row is still owed to an activated stream its pre-image is
    /// preserved first. With an undo token set the slot is retained as
    /// pending-delete until release; otherwise it is cleared at once.
    pub fn delete(&mut self, addr: TupleAddress) -> Result<()> {
        let (state, row) = self.store.read_slot(addr);
        if !state.is_active() {
            return Err(Error::tuple_not_found(addr.block, addr.slot));
        }
        let mut preimage = None;
        if let Some(ctx) = &mut self.snapshot {
            if state == SlotState::Live && ctx.is_tuple_pending(addr) {
                let row = row
                    .clone()
                    .ok_or_else(|| Error::internal("active slot has no row"))?;
                preimage = Some(ctx.preserve(row));
            }
        }
        match self.undo_token {
            Some(token) => {
                self.store.set_state(addr, SlotState::PendingDelete)?;
                self.undo.register(
                    token,
                    UndoAction::Delete {
                        addr,
                        was_dirty: state == SlotState::Dirty,
                        preimage,
                    },
                );
            }
            None => {
                self.store.clear_slot(addr)?;
            }
        }
        Ok(())
    }

    /// Replace the active row at `addr`, returning the old row
    pub fn update(&mut self, addr: TupleAddress, row: Row) -> Result<Row> {
        let (state, old) = self.store.read_slot(addr);
        if !state.is_active() {
            return Err(Error::tuple_not_found(addr.block, addr.slot));
        }
        let old = old.ok_or_else(|| Error::internal("active slot has no row"))?;
        let mut preimage = None;
        if let Some(ctx) = &mut self.snapshot {
            if state == SlotState::Live && ctx.is_tuple_pending(addr) {
                preimage = Some(ctx.preserve(old.clone()));
                self.store.set_state(addr, SlotState::Dirty)?;
            }
        }
        self.store.replace_row(addr, row)?;
        if let Some(token) = self.undo_token {
            self.undo.register(
                token,
                UndoAction::Update {
                    addr,
                    old_row: old.clone(),
                    preimage,
                },
            );
        }
        Ok(old)
    }

    // =========================================================================
    // Snapshot streaming
    // =========================================================================

    /// True while a snapshot stream is activated and incomplete
    pub fn is_stream_active(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Rows the active stream still owes, if one is active
    pub fn stream_remaining(&self) -> Option<i64> {
        self.snapshot.as_ref().map(|ctx| ctx.remaining())
    }

    /// Activate a snapshot stream from an encoded config payload
    ///
    /// Returns `true` when a stream was already active, in which case the
    /// call is a no-op; activation is idempotent, not an error. Requires a
    /// quiesced undo log: rolling back a quantum opened before activation
    /// could resurrect rows the activation-time count never included.
    pub fn activate_stream(&mut self, kind: StreamKind, payload: &[u8]) -> Result<bool> {
        let config = StreamConfig::decode(payload)?;
        self.activate_stream_with(kind, config, Box::new(DefaultTupleSerializer))
    }

    /// Activate a snapshot stream with a decoded config and serializer
    pub fn activate_stream_with(
        &mut self,
        kind: StreamKind,
        config: StreamConfig,
        serializer: Box<dyn TupleSerializer>,
    ) -> Result<bool> {
        if self.snapshot.is_some() {
            return Ok(true);
        }
        if !self.undo.is_empty() {
            return Err(Error::ActivationBlocked);
        }
        self.snapshot = Some(CowContext::new(kind, config, serializer, &self.store));
        Ok(false)
    }

    /// Discard the active stream without completing it
    ///
    /// Pending-block bookkeeping is dropped and lingering dirty marks are
    /// cleaned, so compaction and a later activation see an ordinary table.
    /// Rows already emitted are not recalled. Returns `false` when no
    /// stream was active.
    pub fn cancel_stream(&mut self) -> bool {
        let Some(ctx) = self.snapshot.take() else {
            return false;
        };
        // Dirty marks live only in blocks still owed to the stream; the
        // cursor cleans each block as it retires it.
        for &block in ctx.pending_blocks() {
            self.store.clean_block(block);
        }
        debug_assert_eq!(self.store.dirty_count(), 0);
        true
    }

    /// Pull the next run of rows into `outputs`
    ///
    /// Returns the rows still owed; zero means the stream just completed
    /// and has been deactivated. The destination count must match the
    /// activation config on every call.
    pub fn stream_more(&mut self, outputs: &mut TupleOutputStreamProcessor) -> Result<i64> {
        let ctx = self.snapshot.as_mut().ok_or(Error::StreamNotActive)?;
        let remaining = ctx.stream_more(&self.store, outputs)?;
        if remaining == 0 {
            self.snapshot = None;
            debug_assert_eq!(self.store.dirty_count(), 0);
        }
        Ok(remaining)
    }

    // =========================================================================
    // Scanning and compaction
    // =========================================================================

    /// Create a compaction-tolerant scanner over this table
    pub fn elastic_scanner(&self) -> Arc<ElasticScanner> {
        ElasticScanner::new(Arc::clone(&self.store))
    }

    /// Relocate live rows downward and reclaim empty blocks
    ///
    /// Requires a quiesced undo log: undo records address slots and would
    /// dangle across relocation. Blocks an active stream still owes are
    /// left in place. Returns the number of rows moved.
    pub fn force_compaction(&mut self) -> Result<usize> {
        if !self.undo.is_empty() {
            return Err(Error::CompactionBlocked);
        }
        let moved = match &self.snapshot {
            Some(ctx) => self.store.compact(ctx.pending_blocks()),
            None => self.store.compact(&Default::default()),
        };
        Ok(moved)
    }
}
