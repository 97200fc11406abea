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

//! One scan feeding several hash-partitioned destinations
//!
//! Rebalance-style streaming: rows fan out to the destination whose hash
//! bin they land in, a bin with no destination is simply not exported, and
//! `delete_after_stream` removes exported rows from the table.

use std::collections::BTreeSet;

use rand::{thread_rng, Rng};

use cowtable::{
    decode_segment, DefaultTupleSerializer, Row, StreamConfig, StreamKind, Table,
    TupleOutputStream, TupleOutputStreamProcessor, Value,
};

const BINS: i64 = 4;
/// Bin 3 has no destination: its partition is not moving.
const DESTINATIONS: usize = 3;

fn row(key: i64) -> Row {
    Row::from_values(vec![Value::Integer(key), Value::Integer(key * 7)])
}

fn key_of(r: &Row) -> i64 {
    r.get(0).unwrap().as_integer().unwrap()
}

fn payload() -> Vec<u8> {
    StreamConfig::encode(true, &["hash:0:4:0", "hash:0:4:1", "hash:0:4:2"])
}

#[test]
fn test_multi_stream_partitioned_export() {
    let mut rng = thread_rng();
    let mut table = Table::new(16);
    for key in 0..400 {
        table.insert(row(key)).unwrap();
    }

    // Activation-time membership of each bin.
    let mut expected: Vec<BTreeSet<i64>> = vec![BTreeSet::new(); BINS as usize];
    for key in 0..400 {
        expected[(key % BINS) as usize].insert(key);
    }

    assert!(!table
        .activate_stream(StreamKind::Rebalance, &payload())
        .unwrap());

    let mut per_destination: Vec<Vec<i64>> = vec![Vec::new(); DESTINATIONS];
    let mut deleted: BTreeSet<i64> = BTreeSet::new();
    let mut inserted: BTreeSet<i64> = BTreeSet::new();
    let mut next_key = 10_000i64;
    loop {
        let mut outputs = TupleOutputStreamProcessor::new();
        for i in 0..DESTINATIONS {
            outputs.add(TupleOutputStream::new(i as u32, 512));
        }
        let remaining = table.stream_more(&mut outputs).unwrap();
        for (i, stream) in outputs.iter().enumerate() {
            let (partition_id, rows) =
                decode_segment(&DefaultTupleSerializer, stream.data()).unwrap();
            assert_eq!(partition_id, i as u32);
            per_destination[i].extend(rows.iter().map(key_of));
        }
        if remaining == 0 {
            break;
        }

        // Keep the table moving underneath the stream.
        let active = table.scan();
        if !active.is_empty() {
            let (addr, r) = &active[rng.gen_range(0..active.len())];
            deleted.insert(key_of(r));
            table.delete(*addr).unwrap();
        }
        next_key += 1;
        inserted.insert(next_key);
        table.insert(row(next_key)).unwrap();
    }

    // Every destination received exactly its bin's activation rows, once.
    for (bin, keys) in per_destination.iter().enumerate() {
        let unique: BTreeSet<i64> = keys.iter().copied().collect();
        assert_eq!(keys.len(), unique.len(), "bin {} saw a duplicate", bin);
        assert_eq!(unique, expected[bin], "bin {} mismatch", bin);
    }

    // Exported rows were deleted after streaming; the unmoved bin and the
    // late inserts stay, minus whatever the random deletes took.
    let survivors: BTreeSet<i64> = table.scan().iter().map(|(_, r)| key_of(r)).collect();
    let mut expected_survivors: BTreeSet<i64> = expected[3]
        .iter()
        .copied()
        .chain(inserted.iter().copied())
        .collect();
    for key in &deleted {
        expected_survivors.remove(key);
    }
    assert_eq!(survivors, expected_survivors);
    assert_eq!(table.dirty_count(), 0);
}

#[test]
fn test_destination_count_enforced_per_call() {
    let mut table = Table::new(8);
    for key in 0..20 {
        table.insert(row(key)).unwrap();
    }
    table
        .activate_stream(StreamKind::Rebalance, &payload())
        .unwrap();

    // Wrong arity is a usage error and consumes nothing.
    let mut wrong = TupleOutputStreamProcessor::single(0, 4096);
    assert!(table.stream_more(&mut wrong).is_err());
    assert_eq!(table.stream_remaining(), Some(20));

    let mut outputs = TupleOutputStreamProcessor::new();
    for i in 0..DESTINATIONS {
        outputs.add(TupleOutputStream::new(i as u32, 4096));
    }
    assert_eq!(table.stream_more(&mut outputs).unwrap(), 0);
}

#[test]
fn test_skipped_bin_rows_are_not_deleted() {
    let mut table = Table::new(8);
    for key in 0..40 {
        table.insert(row(key)).unwrap();
    }
    table
        .activate_stream(StreamKind::Rebalance, &payload())
        .unwrap();

    let mut outputs = TupleOutputStreamProcessor::new();
    for i in 0..DESTINATIONS {
        outputs.add(TupleOutputStream::new(i as u32, 8192));
    }
    assert_eq!(table.stream_more(&mut outputs).unwrap(), 0);

    let survivors: BTreeSet<i64> = table.scan().iter().map(|(_, r)| key_of(r)).collect();
    assert_eq!(survivors, (0..40).filter(|k| k % BINS == 3).collect());
}
