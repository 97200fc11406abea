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

//! Tuple output multiplexer
//!
//! Splits one serialized row stream across one or more capacity-bounded
//! destination buffers, each guarded by an optional selector. The COW
//! iterator scans the table once and produces N differently-filtered
//! streams, which is what lets a rebalance feed several target partitions
//! from a single pass.
//!
//! # Wire format
//!
//! Per destination segment: `[partition_id:4][row_count:4][rows...]`, each
//! row `[length:4][row bytes]`, all integers big-endian. The row count is
//! back-patched when the segment is finalized (buffer full or end of scan),
//! so a consumer walks length-prefixed rows until `row_count` rows are
//! consumed.

use smallvec::SmallVec;

use crate::core::{Error, Result, Row, Value};
use crate::storage::expression::Expression;

/// Bytes of the per-segment header: partition id + row count
pub const SEGMENT_HEADER_SIZE: usize = 8;

/// Row-to-bytes seam
///
/// Supplied at stream activation; the streaming machinery itself never
/// interprets row bytes.
pub trait TupleSerializer: Send + Sync {
    /// Exact number of bytes `serialize` will append for `row`
    fn serialized_size(&self, row: &Row) -> usize;

    /// Append the encoding of `row`
    fn serialize(&self, row: &Row, out: &mut Vec<u8>);

    /// Decode one row from its encoding
    fn deserialize(&self, data: &[u8]) -> Result<Row>;
}

/// Tagged big-endian value encoding with a leading u16 column count
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTupleSerializer;

impl TupleSerializer for DefaultTupleSerializer {
    fn serialized_size(&self, row: &Row) -> usize {
        2 + row.iter().map(Value::serialized_size).sum::<usize>()
    }

    fn serialize(&self, row: &Row, out: &mut Vec<u8>) {
        out.extend_from_slice(&(row.len() as u16).to_be_bytes());
        for value in row.iter() {
            value.serialize_into(out);
        }
    }

    fn deserialize(&self, data: &[u8]) -> Result<Row> {
        if data.len() < 2 {
            return Err(Error::internal("truncated row: missing column count"));
        }
        let count = u16::from_be_bytes([data[0], data[1]]) as usize;
        let mut pos = 2;
        let mut values = Vec::with_capacity(count);
        for _ in 0..count {
            values.push(Value::deserialize(data, &mut pos)?);
        }
        if pos != data.len() {
            return Err(Error::internal("trailing bytes after row"));
        }
        Ok(Row::from_values(values))
    }
}

/// One capacity-bounded destination buffer
pub struct TupleOutputStream {
    partition_id: u32,
    capacity: usize,
    buf: Vec<u8>,
    row_count: u32,
    open: bool,
}

impl TupleOutputStream {
    /// Create a destination that will accept at most `capacity` bytes
    pub fn new(partition_id: u32, capacity: usize) -> Self {
        Self {
            partition_id,
            capacity,
            buf: Vec::new(),
            row_count: 0,
            open: false,
        }
    }

    /// Bytes written so far (header included once the segment has begun)
    #[inline]
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Rows appended to the current segment
    #[inline]
    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    /// Destination partition identifier
    #[inline]
    pub fn partition_id(&self) -> u32 {
        self.partition_id
    }

    /// Segment bytes
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    /// Write the segment header; a no-op if the segment is already open
    fn begin_segment(&mut self) {
        if self.open {
            return;
        }
        self.buf.extend_from_slice(&self.partition_id.to_be_bytes());
        self.buf.extend_from_slice(&0u32.to_be_bytes());
        self.open = true;
    }

    /// Room left for row bytes
    fn room(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    fn append_row(&mut self, row_bytes: &[u8]) {
        debug_assert!(self.open, "segment not begun");
        debug_assert!(4 + row_bytes.len() <= self.room(), "row admission checked");
        self.buf
            .extend_from_slice(&(row_bytes.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(row_bytes);
        self.row_count += 1;
    }

    /// Back-patch the row count
    fn finalize_segment(&mut self) {
        if self.open {
            self.buf[4..8].copy_from_slice(&self.row_count.to_be_bytes());
        }
    }
}

/// Outcome of offering one row to the multiplexer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowWriteResult {
    /// Appended to every matching destination; `destinations` may be zero
    /// when no selector matched
    Written { destinations: usize },
    /// Some matching destination lacked room; nothing was written anywhere,
    /// the caller retries the same row next call
    BufferFull,
}

/// Ordered set of destinations fed by one scan
///
/// Destination order is index-aligned with the activation config's
/// predicates: predicate `i` guards destination `i`. A `None` predicate is
/// an unfiltered pass-through.
pub struct TupleOutputStreamProcessor {
    streams: Vec<TupleOutputStream>,
}

impl TupleOutputStreamProcessor {
    /// Create an empty processor
    pub fn new() -> Self {
        Self {
            streams: Vec::new(),
        }
    }

    /// Convenience: a single unfiltered destination
    pub fn single(partition_id: u32, capacity: usize) -> Self {
        let mut p = Self::new();
        p.add(TupleOutputStream::new(partition_id, capacity));
        p
    }

    /// Append a destination
    pub fn add(&mut self, stream: TupleOutputStream) {
        self.streams.push(stream);
    }

    /// Number of destinations
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    /// Returns true if no destinations are configured
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Destination by index
    pub fn at(&self, index: usize) -> &TupleOutputStream {
        &self.streams[index]
    }

    /// Iterate destinations in order
    pub fn iter(&self) -> std::slice::Iter<'_, TupleOutputStream> {
        self.streams.iter()
    }

    /// Open every destination's segment
    pub(crate) fn begin_segments(&mut self) {
        for stream in &mut self.streams {
            stream.begin_segment();
        }
    }

    /// Back-patch every destination's row count
    pub(crate) fn finalize_segments(&mut self) {
        for stream in &mut self.streams {
            stream.finalize_segment();
        }
    }

    /// Offer one row to every destination whose selector matches
    ///
    /// The row is appended to all matching destinations or to none: if any
    /// matching destination lacks room the whole row is rejected so the
    /// caller can retry from the same cursor position with fresh buffers.
    /// A row that cannot fit even in an empty destination is a usage error.
    pub(crate) fn write_row(
        &mut self,
        serializer: &dyn TupleSerializer,
        row: &Row,
        predicates: &[Option<Box<dyn Expression>>],
    ) -> Result<RowWriteResult> {
        debug_assert_eq!(self.streams.len(), predicates.len().max(1));

        let mut matching: SmallVec<[usize; 8]> = SmallVec::new();
        if predicates.is_empty() {
            matching.extend(0..self.streams.len());
        } else {
            for (i, predicate) in predicates.iter().enumerate() {
                let matches = match predicate {
                    Some(p) => p.evaluate(row)?,
                    None => true,
                };
                if matches {
                    matching.push(i);
                }
            }
        }
        if matching.is_empty() {
            return Ok(RowWriteResult::Written { destinations: 0 });
        }

        let row_size = serializer.serialized_size(row);
        let needed = 4 + row_size;
        for &i in &matching {
            let stream = &self.streams[i];
            if needed > stream.room() {
                if stream.row_count == 0 {
                    // Even an otherwise empty buffer cannot take this row.
                    return Err(Error::BufferTooSmall {
                        needed: SEGMENT_HEADER_SIZE + needed,
                        capacity: stream.capacity,
                    });
                }
                return Ok(RowWriteResult::BufferFull);
            }
        }

        let mut scratch = Vec::with_capacity(row_size);
        serializer.serialize(row, &mut scratch);
        debug_assert_eq!(scratch.len(), row_size);
        for &i in &matching {
            self.streams[i].append_row(&scratch);
        }
        Ok(RowWriteResult::Written {
            destinations: matching.len(),
        })
    }
}

impl Default for TupleOutputStreamProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode a finalized segment into its partition id and rows
///
/// Walks length-prefixed rows until `row_count` rows are consumed, exactly
/// as an export consumer would.
pub fn decode_segment(
    serializer: &dyn TupleSerializer,
    data: &[u8],
) -> Result<(u32, Vec<Row>)> {
    if data.is_empty() {
        return Ok((0, Vec::new()));
    }
    if data.len() < SEGMENT_HEADER_SIZE {
        return Err(Error::internal("truncated segment header"));
    }
    let partition_id = u32::from_be_bytes(data[0..4].try_into().expect("4 bytes"));
    let row_count = u32::from_be_bytes(data[4..8].try_into().expect("4 bytes")) as usize;
    let mut pos = SEGMENT_HEADER_SIZE;
    let mut rows = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        if pos + 4 > data.len() {
            return Err(Error::internal("truncated row length"));
        }
        let len = u32::from_be_bytes(data[pos..pos + 4].try_into().expect("4 bytes")) as usize;
        pos += 4;
        if pos + len > data.len() {
            return Err(Error::internal("truncated row bytes"));
        }
        rows.push(serializer.deserialize(&data[pos..pos + len])?);
        pos += len;
    }
    Ok((partition_id, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::expression::{ConstBoolExpr, HashBinExpr};

    fn row(key: i64, payload: i64) -> Row {
        Row::from_values(vec![Value::Integer(key), Value::Integer(payload)])
    }

    fn row_size(r: &Row) -> usize {
        DefaultTupleSerializer.serialized_size(r)
    }

    #[test]
    fn test_serializer_round_trip() {
        let serializer = DefaultTupleSerializer;
        let r = Row::from_values(vec![
            Value::Integer(7),
            Value::text("alpha"),
            Value::Null,
            Value::Float(1.5),
        ]);
        let mut buf = Vec::new();
        serializer.serialize(&r, &mut buf);
        assert_eq!(buf.len(), serializer.serialized_size(&r));
        assert_eq!(serializer.deserialize(&buf).unwrap(), r);
    }

    #[test]
    fn test_single_destination_segment() {
        let serializer = DefaultTupleSerializer;
        let mut outputs = TupleOutputStreamProcessor::single(3, 4096);
        outputs.begin_segments();
        for i in 0..5 {
            let result = outputs.write_row(&serializer, &row(i, i * 10), &[]).unwrap();
            assert_eq!(result, RowWriteResult::Written { destinations: 1 });
        }
        outputs.finalize_segments();

        let stream = outputs.at(0);
        assert_eq!(stream.row_count(), 5);
        let (partition_id, rows) = decode_segment(&serializer, stream.data()).unwrap();
        assert_eq!(partition_id, 3);
        assert_eq!(rows.len(), 5);
        assert_eq!(rows[4], row(4, 40));
    }

    #[test]
    fn test_whole_row_admission() {
        let serializer = DefaultTupleSerializer;
        let r = row(1, 2);
        // Room for header plus exactly two rows.
        let capacity = SEGMENT_HEADER_SIZE + 2 * (4 + row_size(&r));
        let mut outputs = TupleOutputStreamProcessor::single(0, capacity);
        outputs.begin_segments();

        assert!(matches!(
            outputs.write_row(&serializer, &r, &[]).unwrap(),
            RowWriteResult::Written { .. }
        ));
        assert!(matches!(
            outputs.write_row(&serializer, &r, &[]).unwrap(),
            RowWriteResult::Written { .. }
        ));
        // Third row is rejected whole; nothing partial was appended.
        let position = outputs.at(0).position();
        assert_eq!(
            outputs.write_row(&serializer, &r, &[]).unwrap(),
            RowWriteResult::BufferFull
        );
        assert_eq!(outputs.at(0).position(), position);
    }

    #[test]
    fn test_buffer_too_small_is_usage_error() {
        let serializer = DefaultTupleSerializer;
        let mut outputs = TupleOutputStreamProcessor::single(0, SEGMENT_HEADER_SIZE + 3);
        outputs.begin_segments();
        let err = outputs.write_row(&serializer, &row(1, 2), &[]).unwrap_err();
        assert!(matches!(err, Error::BufferTooSmall { .. }));
        assert!(err.is_usage_error());
    }

    #[test]
    fn test_predicate_routing() {
        let serializer = DefaultTupleSerializer;
        let mut outputs = TupleOutputStreamProcessor::new();
        outputs.add(TupleOutputStream::new(0, 4096));
        outputs.add(TupleOutputStream::new(1, 4096));
        outputs.add(TupleOutputStream::new(2, 4096));
        outputs.begin_segments();

        let predicates: Vec<Option<Box<dyn Expression>>> = vec![
            Some(Box::new(HashBinExpr::new(0, 2, 0).unwrap())),
            Some(Box::new(HashBinExpr::new(0, 2, 1).unwrap())),
            Some(Box::new(ConstBoolExpr(false))),
        ];
        for i in 0..10 {
            let result = outputs
                .write_row(&serializer, &row(i, 0), &predicates)
                .unwrap();
            assert_eq!(result, RowWriteResult::Written { destinations: 1 });
        }
        outputs.finalize_segments();

        assert_eq!(outputs.at(0).row_count(), 5);
        assert_eq!(outputs.at(1).row_count(), 5);
        assert_eq!(outputs.at(2).row_count(), 0);

        let (_, evens) = decode_segment(&serializer, outputs.at(0).data()).unwrap();
        assert!(evens
            .iter()
            .all(|r| r.get(0).unwrap().as_integer().unwrap() % 2 == 0));
    }

    #[test]
    fn test_no_match_writes_nothing() {
        let serializer = DefaultTupleSerializer;
        let mut outputs = TupleOutputStreamProcessor::single(0, 4096);
        outputs.begin_segments();
        let predicates: Vec<Option<Box<dyn Expression>>> =
            vec![Some(Box::new(ConstBoolExpr(false)))];
        let result = outputs
            .write_row(&serializer, &row(1, 2), &predicates)
            .unwrap();
        assert_eq!(result, RowWriteResult::Written { destinations: 0 });
        assert_eq!(outputs.at(0).row_count(), 0);
    }

    #[test]
    fn test_decode_empty_segment() {
        let serializer = DefaultTupleSerializer;
        let (partition_id, rows) = decode_segment(&serializer, &[]).unwrap();
        assert_eq!(partition_id, 0);
        assert!(rows.is_empty());
    }
}
