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

//! Selector expressions for Cowtable
//!
//! Destinations in the tuple output multiplexer are filtered by per-tuple
//! boolean predicates. This module provides the expression seam plus the
//! selector shapes streaming actually uses:
//!
//! - [`ConstBoolExpr`] - constant true/false (pass-through / skipped partition)
//! - [`HashBinExpr`] - hash-modulus partition membership
//! - [`RangeExpr`] - half-open integer range membership
//!
//! Columns are addressed by index. This subsystem has no catalog; resolving
//! names to indices is the plan layer's job.

use std::fmt::Debug;

use crate::core::{Error, Result, Row, Value};

/// Boolean predicate evaluated per tuple
///
/// Selectors must be side-effect-free: the multiplexer may evaluate a
/// destination's selector for a row it ultimately does not write.
pub trait Expression: Send + Sync + Debug {
    /// Evaluate the expression against a row
    fn evaluate(&self, row: &Row) -> Result<bool>;
}

fn integer_column(row: &Row, column: usize) -> Result<i64> {
    let value = row.get(column).ok_or(Error::ColumnIndexOutOfBounds {
        index: column,
        width: row.len(),
    })?;
    match value {
        Value::Integer(i) => Ok(*i),
        _ => Err(Error::NonIntegerColumn(column)),
    }
}

/// Constant boolean expression
#[derive(Debug, Clone, Copy)]
pub struct ConstBoolExpr(pub bool);

impl Expression for ConstBoolExpr {
    fn evaluate(&self, _row: &Row) -> Result<bool> {
        Ok(self.0)
    }
}

/// Hash-modulus partition membership: `(row[column] mod bins) == bin`
///
/// Uses euclidean modulus so negative values land in a real bin. A `bin`
/// outside `0..bins` matches nothing, which is how a skipped partition is
/// expressed.
#[derive(Debug, Clone, Copy)]
pub struct HashBinExpr {
    column: usize,
    bins: i64,
    bin: i64,
}

impl HashBinExpr {
    /// Create a hash-bin selector over `bins` partitions
    pub fn new(column: usize, bins: i64, bin: i64) -> Result<Self> {
        if bins <= 0 {
            return Err(Error::InvalidPredicate(format!(
                "hash bins must be positive, got {}",
                bins
            )));
        }
        Ok(Self { column, bins, bin })
    }
}

impl Expression for HashBinExpr {
    fn evaluate(&self, row: &Row) -> Result<bool> {
        let value = integer_column(row, self.column)?;
        Ok(value.rem_euclid(self.bins) == self.bin)
    }
}

/// Half-open integer range membership: `low <= row[column] < high`
///
/// Either bound may be unbounded. Used for range-partitioned export during
/// rebalancing.
#[derive(Debug, Clone, Copy)]
pub struct RangeExpr {
    column: usize,
    low: Option<i64>,
    high: Option<i64>,
}

impl RangeExpr {
    /// Create a range selector; `None` means unbounded on that side
    pub fn new(column: usize, low: Option<i64>, high: Option<i64>) -> Self {
        Self { column, low, high }
    }
}

impl Expression for RangeExpr {
    fn evaluate(&self, row: &Row) -> Result<bool> {
        let value = integer_column(row, self.column)?;
        if let Some(low) = self.low {
            if value < low {
                return Ok(false);
            }
        }
        if let Some(high) = self.high {
            if value >= high {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Parse a selector from its text form
///
/// Grammar (see the stream config codec):
/// - `all` - matches everything
/// - `none` - matches nothing
/// - `hash:<col>:<bins>:<bin>`
/// - `range:<col>:<low>:<high>` with `*` for an unbounded side
pub fn parse_predicate(text: &str) -> Result<Box<dyn Expression>> {
    let invalid = || Error::InvalidPredicate(text.to_string());
    match text {
        "all" => return Ok(Box::new(ConstBoolExpr(true))),
        "none" => return Ok(Box::new(ConstBoolExpr(false))),
        _ => {}
    }
    let parts: Vec<&str> = text.split(':').collect();
    match parts.as_slice() {
        ["hash", col, bins, bin] => {
            let column: usize = col.parse().map_err(|_| invalid())?;
            let bins: i64 = bins.parse().map_err(|_| invalid())?;
            let bin: i64 = bin.parse().map_err(|_| invalid())?;
            Ok(Box::new(HashBinExpr::new(column, bins, bin)?))
        }
        ["range", col, low, high] => {
            let column: usize = col.parse().map_err(|_| invalid())?;
            let low = match *low {
                "*" => None,
                s => Some(s.parse().map_err(|_| invalid())?),
            };
            let high = match *high {
                "*" => None,
                s => Some(s.parse().map_err(|_| invalid())?),
            };
            Ok(Box::new(RangeExpr::new(column, low, high)))
        }
        _ => Err(invalid()),
    }
}
