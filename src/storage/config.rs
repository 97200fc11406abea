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

//! Stream activation configuration
//!
//! A snapshot stream is activated with an opaque byte payload carried over
//! the control plane. The codec here is self-describing:
//!
//! `[delete_after:1][predicate_count:4][pred...]` where each predicate is
//! `[length:4][utf8 text]`, integers big-endian. Predicate text follows the
//! grammar in [`crate::storage::expression::parse_predicate`]. An empty
//! payload (or zero predicates) means one unfiltered destination.
//!
//! The number of predicates fixes the destination count for every
//! subsequent `stream_more` call on that stream.

use crate::core::{Error, Result};
use crate::storage::expression::{parse_predicate, Expression};

/// What a snapshot stream is for
///
/// Plain snapshots and rebalance streams share the same machinery; the kind
/// is recorded so operators can tell them apart in stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Durability snapshot: export every activation-time row once
    Snapshot,
    /// Elastic rebalance: export rows matching range predicates, usually
    /// with `delete_after_stream` set
    Rebalance,
}

/// Decoded stream activation config
pub struct StreamConfig {
    /// Delete emitted live rows accepted by at least one destination once
    /// they have been streamed
    pub delete_after_stream: bool,
    /// Per-destination selectors, index-aligned with the destination set;
    /// `None` is an unfiltered pass-through
    pub predicates: Vec<Option<Box<dyn Expression>>>,
}

impl StreamConfig {
    /// One unfiltered destination, no delete-after
    pub fn unfiltered() -> Self {
        Self {
            delete_after_stream: false,
            predicates: vec![None],
        }
    }

    /// Build a config from predicate texts
    pub fn from_predicates(
        delete_after_stream: bool,
        texts: &[&str],
    ) -> Result<Self> {
        if texts.is_empty() {
            let mut config = Self::unfiltered();
            config.delete_after_stream = delete_after_stream;
            return Ok(config);
        }
        let mut predicates = Vec::with_capacity(texts.len());
        for text in texts {
            predicates.push(Some(parse_predicate(text)?));
        }
        Ok(Self {
            delete_after_stream,
            predicates,
        })
    }

    /// Number of destinations this stream will fan out to
    pub fn destination_count(&self) -> usize {
        self.predicates.len()
    }

    /// Decode an activation payload
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.is_empty() {
            return Ok(Self::unfiltered());
        }
        if data.len() < 5 {
            return Err(Error::invalid_config("payload shorter than header"));
        }
        let delete_after_stream = match data[0] {
            0 => false,
            1 => true,
            other => {
                return Err(Error::invalid_config(format!(
                    "bad delete-after flag {}",
                    other
                )))
            }
        };
        let count = u32::from_be_bytes(data[1..5].try_into().expect("4 bytes")) as usize;
        if count == 0 {
            let mut config = Self::unfiltered();
            config.delete_after_stream = delete_after_stream;
            return Ok(config);
        }
        let mut pos = 5;
        let mut predicates = Vec::with_capacity(count);
        for _ in 0..count {
            if pos + 4 > data.len() {
                return Err(Error::invalid_config("truncated predicate length"));
            }
            let len =
                u32::from_be_bytes(data[pos..pos + 4].try_into().expect("4 bytes")) as usize;
            pos += 4;
            if pos + len > data.len() {
                return Err(Error::invalid_config("truncated predicate text"));
            }
            let text = std::str::from_utf8(&data[pos..pos + len])
                .map_err(|_| Error::invalid_config("predicate is not utf8"))?;
            pos += len;
            predicates.push(Some(parse_predicate(text)?));
        }
        if pos != data.len() {
            return Err(Error::invalid_config("trailing bytes after predicates"));
        }
        Ok(Self {
            delete_after_stream,
            predicates,
        })
    }

    /// Encode an activation payload from predicate texts
    pub fn encode(delete_after_stream: bool, texts: &[&str]) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(delete_after_stream as u8);
        out.extend_from_slice(&(texts.len() as u32).to_be_bytes());
        for text in texts {
            out.extend_from_slice(&(text.len() as u32).to_be_bytes());
            out.extend_from_slice(text.as_bytes());
        }
        out
    }
}
