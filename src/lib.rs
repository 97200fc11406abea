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

//! # Cowtable
//!
//! Copy-on-write snapshot streaming for an in-memory, block-organized row
//! store. A snapshot stream exports exactly the rows that were active at
//! activation, exactly once, while inserts, updates, deletes, transactional
//! rollback and compaction keep running against the same table. One scan
//! can feed several differently-filtered destinations, which is the
//! building block for both durability snapshots and elastic rebalancing.
//!
//! The moving parts:
//!
//! - [`Table`] - the facade: mutations, undo tokens, stream activation
//! - [`TupleOutputStreamProcessor`] - per-call destination buffers
//! - [`ElasticScanner`] - a long-lived, compaction-tolerant scan
//!
//! ## Example
//!
//! ```
//! use cowtable::{decode_segment, DefaultTupleSerializer, Row, StreamKind,
//!                Table, TupleOutputStreamProcessor, Value};
//!
//! let mut table = Table::new(64);
//! for i in 0..10 {
//!     table.insert(Row::from_values(vec![Value::Integer(i)]))?;
//! }
//!
//! // Activate with an empty payload: one unfiltered destination.
//! table.activate_stream(StreamKind::Snapshot, &[])?;
//!
//! // Mutations after activation do not change what the stream delivers.
//! table.insert(Row::from_values(vec![Value::Integer(99)]))?;
//!
//! let mut exported = 0;
//! loop {
//!     let mut outputs = TupleOutputStreamProcessor::single(0, 1024);
//!     let remaining = table.stream_more(&mut outputs)?;
//!     let (_, rows) = decode_segment(&DefaultTupleSerializer, outputs.at(0).data())?;
//!     exported += rows.len();
//!     if remaining == 0 {
//!         break;
//!     }
//! }
//! assert_eq!(exported, 10);
//! # Ok::<(), cowtable::Error>(())
//! ```

pub mod core;
pub mod storage;

pub use crate::core::{Error, Result, Row, Value};
pub use crate::storage::{
    decode_segment, BlockAddress, BlockStore, ConstBoolExpr, CowContext, DefaultTupleSerializer,
    ElasticScanner, Expression, HashBinExpr, PreImageId, RangeExpr, RelocationObserver,
    RowWriteResult, SlotState, StreamConfig, StreamKind, Table, TupleAddress, TupleOutputStream,
    TupleOutputStreamProcessor, TupleSerializer, UndoAction, UndoLog, UndoToken,
};
