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

//! Row type for Cowtable - an immutable collection of column values
//!
//! Rows are backed by `Arc<[Value]>` so `clone()` is O(1). COW pre-image
//! preservation and stray-tuple buffering both rely on this: preserving a
//! row never deep-copies its payload.

use std::ops::Index;
use std::sync::Arc;

use super::value::Value;

/// A row of column values with O(1) clone
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Arc<[Value]>,
}

impl Row {
    /// Create a row from a vector of values
    #[inline]
    pub fn from_values(values: Vec<Value>) -> Self {
        Self {
            values: Arc::from(values.into_boxed_slice()),
        }
    }

    /// Get a value by column index
    #[inline]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Number of columns
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the row has no columns
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// All values as a slice
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Iterate over the values
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, Value> {
        self.values.iter()
    }

    /// Build a copy of this row with one column replaced
    ///
    /// Rows are immutable; updates construct the replacement row up front.
    pub fn with_value(&self, index: usize, value: Value) -> Row {
        let mut values: Vec<Value> = self.values.to_vec();
        if index < values.len() {
            values[index] = value;
        }
        Row::from_values(values)
    }
}

impl Index<usize> for Row {
    type Output = Value;

    #[inline]
    fn index(&self, index: usize) -> &Value {
        &self.values[index]
    }
}

impl FromIterator<Value> for Row {
    fn from_iter<T: IntoIterator<Item = Value>>(iter: T) -> Self {
        Row::from_values(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_access() {
        let row = Row::from_values(vec![Value::Integer(1), Value::text("a")]);
        assert_eq!(row.len(), 2);
        assert!(!row.is_empty());
        assert_eq!(row.get(0), Some(&Value::Integer(1)));
        assert_eq!(row.get(2), None);
        assert_eq!(row[1], Value::text("a"));
    }

    #[test]
    fn test_row_clone_is_shallow() {
        let row = Row::from_values(vec![Value::text("payload")]);
        let copy = row.clone();
        assert!(Arc::ptr_eq(&row.values, &copy.values));
        assert_eq!(row, copy);
    }

    #[test]
    fn test_with_value() {
        let row = Row::from_values(vec![Value::Integer(1), Value::Integer(2)]);
        let updated = row.with_value(1, Value::Integer(99));
        assert_eq!(updated.get(1), Some(&Value::Integer(99)));
        // Original untouched.
        assert_eq!(row.get(1), Some(&Value::Integer(2)));
    }
}
