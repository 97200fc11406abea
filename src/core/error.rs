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

//! Error types for Cowtable
//!
//! This module defines all error types used throughout the storage engine.

use thiserror::Error;

/// Result type alias for Cowtable operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Cowtable storage operations
///
/// Usage errors (a caller can resize/retry) and internal defects are kept
/// as distinct variants so callers can tell them apart.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    // =========================================================================
    // Stream errors
    // =========================================================================
    /// streamMore was called without an activated snapshot stream
    #[error("no snapshot stream is active")]
    StreamNotActive,

    /// The destination set handed to streamMore does not match the activation config
    #[error("destination count mismatch, expected {expected}, got {got}")]
    DestinationCountMismatch { expected: usize, got: usize },

    /// A destination buffer cannot hold even a single serialized row
    #[error("destination buffer too small, row needs {needed} bytes, capacity {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },

    /// Stream activation config could not be decoded
    #[error("invalid stream config: {0}")]
    InvalidStreamConfig(String),

    /// A partition predicate string could not be parsed
    #[error("invalid predicate '{0}'")]
    InvalidPredicate(String),

    // =========================================================================
    // Tuple errors
    // =========================================================================
    /// No active tuple at the given address
    #[error("no active tuple at block {block} slot {slot}")]
    TupleNotFound { block: u64, slot: usize },

    /// Expression referenced a column the row does not have
    #[error("column index {index} out of bounds for row of {width} columns")]
    ColumnIndexOutOfBounds { index: usize, width: usize },

    /// Expression evaluated against a non-comparable value
    #[error("expression expects an integer in column {0}")]
    NonIntegerColumn(usize),

    // =========================================================================
    // Undo coordination errors
    // =========================================================================
    /// Compaction would relocate tuples that undo records still address
    #[error("compaction requires a quiesced undo log")]
    CompactionBlocked,

    /// Stream activation with unresolved undo quanta: a later rollback
    /// could resurrect rows the activation-time count never included
    #[error("stream activation requires a quiesced undo log")]
    ActivationBlocked,

    // =========================================================================
    // Other errors
    // =========================================================================
    /// Internal error for unexpected conditions
    #[error("{message}")]
    Internal { message: String },
}

impl Error {
    /// Create a new TupleNotFound error
    pub fn tuple_not_found(block: u64, slot: usize) -> Self {
        Error::TupleNotFound { block, slot }
    }

    /// Create a new InvalidStreamConfig error
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Error::InvalidStreamConfig(message.into())
    }

    /// Create a new Internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal {
            message: message.into(),
        }
    }

    /// Check if this is a usage error the caller can correct and retry
    pub fn is_usage_error(&self) -> bool {
        matches!(
            self,
            Error::StreamNotActive
                | Error::DestinationCountMismatch { .. }
                | Error::BufferTooSmall { .. }
                | Error::InvalidStreamConfig(_)
                | Error::InvalidPredicate(_)
        )
    }
}
