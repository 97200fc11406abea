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

//! Copy-on-write snapshot context
//!
//! Activation freezes the set of blocks holding active tuples and counts the
//! rows owed to the stream. From then on the table's mutation path consults
//! the context before touching any tuple the cursor has not reached: deletes
//! and updates of such clean tuples first preserve an O(1)-clone pre-image
//! in the context's queue, so every activation-time row is emitted exactly
//! once regardless of interleaved mutation.
//!
//! The cursor walks pending blocks in address order, emitting `Live` slots
//! and skipping `Dirty` ones (already preserved, or born after activation).
//! When a block is exhausted it leaves the pending set and its dirty marks
//! expire. Streaming is pull-based and resumable: each `stream_more` call
//! fills fresh destination buffers and yields when a row does not fit,
//! without advancing past the rejected row.

use std::collections::{BTreeSet, VecDeque};

use rustc_hash::FxHashSet;

use crate::core::{Error, Result, Row};
use crate::storage::block::{BlockAddress, BlockStore, TupleAddress};
use crate::storage::config::{StreamConfig, StreamKind};
use crate::storage::output::{RowWriteResult, TupleOutputStreamProcessor, TupleSerializer};

/// Identifier of a preserved pre-image, in preservation order
pub type PreImageId = u64;

enum NextRow {
    Preserved(PreImageId, Row),
    Stored(TupleAddress, Row),
}

/// State of one activated snapshot stream
pub struct CowContext {
    kind: StreamKind,
    config: StreamConfig,
    serializer: Box<dyn TupleSerializer>,
    /// Blocks still owing rows to the stream; frozen at activation, shrinks
    /// as the cursor exhausts blocks
    pending: BTreeSet<BlockAddress>,
    /// Last address the cursor emitted or passed
    cursor: Option<TupleAddress>,
    /// Pre-images preserved by the mutation path, emitted ahead of the scan
    preserved: VecDeque<(PreImageId, Row)>,
    /// Ids still owed; withdrawal removes the id and the queue entry is
    /// discarded lazily when it reaches the front
    queued: FxHashSet<PreImageId>,
    next_preimage: PreImageId,
    /// Activation-time active rows not yet processed
    remaining: i64,
}

impl CowContext {
    /// Freeze the pending set and row count for a new stream
    pub(crate) fn new(
        kind: StreamKind,
        config: StreamConfig,
        serializer: Box<dyn TupleSerializer>,
        store: &BlockStore,
    ) -> Self {
        debug_assert_eq!(store.dirty_count(), 0, "previous snapshot left dirty marks");
        let pending: BTreeSet<BlockAddress> = store.addresses_with_active().into_iter().collect();
        let remaining = store.active_count() as i64;
        Self {
            kind,
            config,
            serializer,
            pending,
            cursor: None,
            preserved: VecDeque::new(),
            queued: FxHashSet::default(),
            next_preimage: 0,
            remaining,
        }
    }

    /// What this stream was activated for
    #[inline]
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Activation-time rows not yet processed
    #[inline]
    pub fn remaining(&self) -> i64 {
        self.remaining
    }

    /// Destinations every `stream_more` call must supply
    #[inline]
    pub fn destination_count(&self) -> usize {
        self.config.destination_count()
    }

    /// Pre-images currently owed
    #[inline]
    pub fn preserved_count(&self) -> usize {
        self.queued.len()
    }

    /// Blocks the cursor has not finished; compaction must leave these alone
    pub(crate) fn pending_blocks(&self) -> &BTreeSet<BlockAddress> {
        &self.pending
    }

    /// True if the stream still owes the tuple at `addr`
    ///
    /// A tuple is owed when its block is still pending and the cursor has
    /// not passed it. The mutation path preserves a pre-image before
    /// touching such a tuple.
    pub(crate) fn is_tuple_pending(&self, addr: TupleAddress) -> bool {
        self.pending.contains(&addr.block) && self.cursor.map_or(true, |c| addr > c)
    }

    /// Queue a pre-image for emission ahead of the cursor
    pub(crate) fn preserve(&mut self, row: Row) -> PreImageId {
        let id = self.next_preimage;
        self.next_preimage += 1;
        self.preserved.push_back((id, row));
        self.queued.insert(id);
        id
    }

    /// Withdraw a still-queued pre-image; false if it was already emitted
    ///
    /// Rollback of the preserving mutation calls this: a withdrawn row goes
    /// back to `Live` (the cursor will reach it), an emitted one stays
    /// `Dirty` so it is not delivered twice. The queue entry itself is
    /// dropped when it reaches the front.
    pub(crate) fn withdraw(&mut self, id: PreImageId) -> bool {
        self.queued.remove(&id)
    }

    /// Next row owed to the stream, without consuming it
    ///
    /// Pre-images drain first. Exhausted blocks are retired here even when
    /// the subsequent write is rejected; retiring only expires bookkeeping,
    /// it never consumes a row.
    fn next_row(&mut self, store: &BlockStore) -> Option<NextRow> {
        while let Some((id, row)) = self.preserved.front() {
            if self.queued.contains(id) {
                return Some(NextRow::Preserved(*id, row.clone()));
            }
            // Withdrawn by rollback; its slot is live again.
            self.preserved.pop_front();
        }
        loop {
            let block = match self.cursor {
                Some(c) if self.pending.contains(&c.block) => c.block,
                Some(c) => *self.pending.range(c.block..).next()?,
                None => *self.pending.iter().next()?,
            };
            let from = match self.cursor {
                Some(c) if c.block == block => c.slot + 1,
                _ => 0,
            };
            if let Some((slot, row)) = store.next_live_in_block(block, from) {
                return Some(NextRow::Stored(TupleAddress::new(block, slot), row));
            }
            self.pending.remove(&block);
            store.clean_block(block);
            self.cursor = Some(TupleAddress::new(block, usize::MAX));
        }
    }

    /// Consume a row the destinations accepted
    fn advance(
        &mut self,
        store: &BlockStore,
        next: NextRow,
        destinations: usize,
    ) -> Result<()> {
        match next {
            NextRow::Preserved(id, _) => {
                let popped = self.preserved.pop_front();
                debug_assert!(matches!(popped, Some((i, _)) if i == id));
                self.queued.remove(&id);
            }
            NextRow::Stored(addr, _) => {
                self.cursor = Some(addr);
                if self.config.delete_after_stream && destinations > 0 {
                    store.clear_slot(addr)?;
                }
            }
        }
        self.remaining -= 1;
        Ok(())
    }

    /// Fill the destination buffers with the next run of rows
    ///
    /// Returns the number of rows still owed; zero means the stream is
    /// complete and this context can be dropped. A row is fetched, offered,
    /// and only then consumed, so a rejection yields with the row still
    /// owed, and a final row that exactly fills a buffer completes the
    /// stream in the same call.
    pub(crate) fn stream_more(
        &mut self,
        store: &BlockStore,
        outputs: &mut TupleOutputStreamProcessor,
    ) -> Result<i64> {
        if outputs.len() != self.destination_count() {
            return Err(Error::DestinationCountMismatch {
                expected: self.destination_count(),
                got: outputs.len(),
            });
        }
        outputs.begin_segments();
        loop {
            let Some(next) = self.next_row(store) else {
                outputs.finalize_segments();
                debug_assert_eq!(self.remaining, 0, "pending rows exhausted early");
                debug_assert!(self.queued.is_empty());
                return Ok(0);
            };
            let row = match &next {
                NextRow::Preserved(_, r) => r,
                NextRow::Stored(_, r) => r,
            };
            match outputs.write_row(self.serializer.as_ref(), row, &self.config.predicates)? {
                RowWriteResult::Written { destinations } => {
                    self.advance(store, next, destinations)?;
                }
                RowWriteResult::BufferFull => {
                    outputs.finalize_segments();
                    return Ok(self.remaining);
                }
            }
        }
    }
}
