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

//! Storage engine: block store, snapshot streaming, elastic scan
//!
//! Layering, bottom up:
//!
//! - [`block`] - block-organized tuple slots with relocating compaction
//! - [`expression`] - per-tuple selectors for stream destinations
//! - [`output`] - serialization and the tuple output multiplexer
//! - [`config`] - stream activation payload codec
//! - [`undo`] - transactional compensation records
//! - [`cow`] - the copy-on-write snapshot context
//! - [`elastic`] - the compaction-tolerant scanner
//! - [`table`] - the facade coordinating all of the above

pub mod block;
pub mod config;
pub mod cow;
pub mod elastic;
pub mod expression;
pub mod output;
pub mod table;
pub mod undo;

pub use block::{BlockAddress, BlockStore, RelocationObserver, SlotState, TupleAddress};
pub use config::{StreamConfig, StreamKind};
pub use cow::{CowContext, PreImageId};
pub use elastic::ElasticScanner;
pub use expression::{parse_predicate, ConstBoolExpr, Expression, HashBinExpr, RangeExpr};
pub use output::{
    decode_segment, DefaultTupleSerializer, RowWriteResult, TupleOutputStream,
    TupleOutputStreamProcessor, TupleSerializer, SEGMENT_HEADER_SIZE,
};
pub use table::Table;
pub use undo::{UndoAction, UndoLog, UndoToken};
