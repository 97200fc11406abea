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

//! Column value type for Cowtable
//!
//! Values are kept deliberately small: this subsystem moves rows around and
//! serializes them, it does not interpret them beyond the integer comparisons
//! the partition selectors need.

use std::fmt;
use std::sync::Arc;

use super::error::{Error, Result};

/// A single column value
///
/// `Text` uses `Arc<str>` so cloning a value (and therefore a row) never
/// copies string payloads.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(Arc<str>),
}

impl Value {
    /// Convenience constructor for text values
    #[inline]
    pub fn text(s: impl AsRef<str>) -> Self {
        Value::Text(Arc::from(s.as_ref()))
    }

    /// Returns the integer payload, if this is an integer value
    #[inline]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Type tag used by the wire encoding
    #[inline]
    pub fn tag(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Integer(_) => 1,
            Value::Float(_) => 2,
            Value::Text(_) => 3,
        }
    }

    /// Number of bytes `serialize_into` will append
    pub fn serialized_size(&self) -> usize {
        1 + match self {
            Value::Null => 0,
            Value::Integer(_) | Value::Float(_) => 8,
            Value::Text(s) => 4 + s.len(),
        }
    }

    /// Append the tagged big-endian encoding of this value
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.push(self.tag());
        match self {
            Value::Null => {}
            Value::Integer(i) => buf.extend_from_slice(&i.to_be_bytes()),
            Value::Float(f) => buf.extend_from_slice(&f.to_bits().to_be_bytes()),
            Value::Text(s) => {
                buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
                buf.extend_from_slice(s.as_bytes());
            }
        }
    }

    /// Decode one value starting at `*pos`, advancing `*pos` past it
    pub fn deserialize(data: &[u8], pos: &mut usize) -> Result<Value> {
        let tag = *data
            .get(*pos)
            .ok_or_else(|| Error::internal("truncated value: missing tag"))?;
        *pos += 1;
        match tag {
            0 => Ok(Value::Null),
            1 => {
                let bytes = read_fixed::<8>(data, pos)?;
                Ok(Value::Integer(i64::from_be_bytes(bytes)))
            }
            2 => {
                let bytes = read_fixed::<8>(data, pos)?;
                Ok(Value::Float(f64::from_bits(u64::from_be_bytes(bytes))))
            }
            3 => {
                let len = u32::from_be_bytes(read_fixed::<4>(data, pos)?) as usize;
                if *pos + len > data.len() {
                    return Err(Error::internal("truncated value: missing text payload"));
                }
                let s = std::str::from_utf8(&data[*pos..*pos + len])
                    .map_err(|e| Error::internal(format!("invalid text payload: {}", e)))?;
                *pos += len;
                Ok(Value::text(s))
            }
            other => Err(Error::internal(format!("unknown value tag {}", other))),
        }
    }
}

fn read_fixed<const N: usize>(data: &[u8], pos: &mut usize) -> Result<[u8; N]> {
    if *pos + N > data.len() {
        return Err(Error::internal("truncated value payload"));
    }
    let bytes = data[*pos..*pos + N]
        .try_into()
        .map_err(|_| Error::internal("truncated value payload"))?;
    *pos += N;
    Ok(bytes)
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}
