// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Row and datum model for the aggregation executor.
//!
//! Responsibilities:
//! - Owned `Datum` values with NULL, scalar, container and expanded-object
//!   variants, plus ordering, equality and seeded hashing over them.
//! - The minimal row codec used for spill tape records: a compact
//!   length-prefixed encoding that is stable within one process lifetime but
//!   is never persisted across runs.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use crate::common::error::{ExecError, ExecResult};
use crate::runtime::arena::ArenaId;

/// One value of one column, or an aggregate transition state.
#[derive(Clone, Debug)]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Datum>),
    /// Read-write expanded object owned by a grouping-set arena. Cloning the
    /// datum shares the handle; flattening materializes a `List`.
    Expanded(ExpandedHandle),
}

pub type Row = Vec<Datum>;

/// Coarse type tags used by function descriptors for compatibility checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatumType {
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    List,
    /// Opaque in-memory transition representation. Values of this type can
    /// only leave the executor through a serialize function.
    Opaque,
}

impl DatumType {
    /// Whether a non-NULL datum is acceptable where this type is expected.
    pub fn accepts(&self, datum: &Datum) -> bool {
        match (self, datum) {
            (_, Datum::Null) => true,
            (DatumType::Opaque, _) => true,
            (DatumType::Bool, Datum::Bool(_)) => true,
            (DatumType::Int, Datum::Int(_)) => true,
            (DatumType::Float, Datum::Float(_)) => true,
            (DatumType::Text, Datum::Text(_)) => true,
            (DatumType::Bytes, Datum::Bytes(_)) => true,
            (DatumType::List, Datum::List(_) | Datum::Expanded(_)) => true,
            _ => false,
        }
    }

}

static NEXT_EXPANDED_ID: AtomicU64 = AtomicU64::new(1);

/// In-memory read-write representation of a container value, owned by one
/// arena. Transition functions may mutate it in place; adopting it without a
/// copy requires that it already belongs to the current grouping-set arena.
#[derive(Debug)]
pub struct ExpandedObject {
    id: u64,
    owner: ArenaId,
    values: Mutex<Vec<Datum>>,
}

pub type ExpandedHandle = Arc<ExpandedObject>;

impl ExpandedObject {
    pub fn new_in(owner: ArenaId) -> ExpandedHandle {
        Arc::new(Self {
            id: NEXT_EXPANDED_ID.fetch_add(1, AtomicOrdering::Relaxed),
            owner,
            values: Mutex::new(Vec::new()),
        })
    }

    pub fn owner(&self) -> ArenaId {
        self.owner
    }

    pub fn push(&self, value: Datum) {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(value);
    }

    pub fn len(&self) -> usize {
        self.values.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Materialize the current contents as a flat list value.
    pub fn flatten(&self) -> Vec<Datum> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Datum {
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Datum::Null => "null",
            Datum::Bool(_) => "bool",
            Datum::Int(_) => "int",
            Datum::Float(_) => "float",
            Datum::Text(_) => "text",
            Datum::Bytes(_) => "bytes",
            Datum::List(_) => "list",
            Datum::Expanded(_) => "expanded",
        }
    }

    /// Heap bytes held by the value, for arena accounting. Inline scalars
    /// report zero; the fixed per-state overhead is accounted separately.
    pub fn heap_size(&self) -> usize {
        match self {
            Datum::Null | Datum::Bool(_) | Datum::Int(_) | Datum::Float(_) => 0,
            Datum::Text(s) => s.len(),
            Datum::Bytes(b) => b.len(),
            Datum::List(items) => items
                .iter()
                .map(|d| d.heap_size() + std::mem::size_of::<Datum>())
                .sum(),
            Datum::Expanded(obj) => obj
                .flatten()
                .iter()
                .map(|d| d.heap_size() + std::mem::size_of::<Datum>())
                .sum(),
        }
    }

    /// Two datums are the same expanded object (pointer identity).
    pub fn same_expanded(&self, other: &Datum) -> bool {
        match (self, other) {
            (Datum::Expanded(a), Datum::Expanded(b)) => a.id == b.id,
            _ => false,
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Datum::Null => 0,
            Datum::Bool(_) => 1,
            Datum::Int(_) => 2,
            Datum::Float(_) => 3,
            Datum::Text(_) => 4,
            Datum::Bytes(_) => 5,
            Datum::List(_) | Datum::Expanded(_) => 6,
        }
    }
}

/// Structural equality, with NULL equal to NULL. This is grouping/matching
/// equality, not SQL `=`; use `datum_eq` for the latter.
impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        match (self.is_null(), other.is_null()) {
            (true, true) => true,
            (false, false) => datum_cmp(self, other) == Ordering::Equal,
            _ => false,
        }
    }
}

/// SQL-style equality: NULL never equals anything, including NULL.
pub fn datum_eq(a: &Datum, b: &Datum) -> bool {
    if a.is_null() || b.is_null() {
        return false;
    }
    datum_cmp(a, b) == Ordering::Equal
}

/// Total order over datums. NULLs sort before everything here; callers that
/// need NULLS LAST invert the placement themselves (see the sorter).
pub fn datum_cmp(a: &Datum, b: &Datum) -> Ordering {
    match (a, b) {
        (Datum::Null, Datum::Null) => Ordering::Equal,
        (Datum::Bool(x), Datum::Bool(y)) => x.cmp(y),
        (Datum::Int(x), Datum::Int(y)) => x.cmp(y),
        // -0.0 and 0.0 fall in one group; NaNs compare equal to each other
        (Datum::Float(x), Datum::Float(y)) if *x == *y => Ordering::Equal,
        (Datum::Float(x), Datum::Float(y)) => x.total_cmp(y),
        (Datum::Text(x), Datum::Text(y)) => x.cmp(y),
        (Datum::Bytes(x), Datum::Bytes(y)) => x.cmp(y),
        (Datum::List(x), Datum::List(y)) => cmp_lists(x, y),
        (Datum::List(x), Datum::Expanded(y)) => cmp_lists(x, &y.flatten()),
        (Datum::Expanded(x), Datum::List(y)) => cmp_lists(&x.flatten(), y),
        (Datum::Expanded(x), Datum::Expanded(y)) => cmp_lists(&x.flatten(), &y.flatten()),
        _ => a.type_rank().cmp(&b.type_rank()),
    }
}

fn cmp_lists(a: &[Datum], b: &[Datum]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = datum_cmp(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// Rows match on a column prefix when every listed column is pairwise equal,
/// treating NULLs as matching NULLs (grouping semantics, not SQL equality).
pub fn rows_match_on(columns: &[usize], a: &Row, b: &Row) -> bool {
    columns.iter().all(|&col| {
        let (x, y) = (&a[col], &b[col]);
        match (x.is_null(), y.is_null()) {
            (true, true) => true,
            (false, false) => datum_cmp(x, y) == Ordering::Equal,
            _ => false,
        }
    })
}

const HASH_GOLDEN: u64 = 0x9e3779b97f4a7c15;

fn mix_u64(value: u64) -> u64 {
    let mut v = value;
    v ^= v >> 30;
    v = v.wrapping_mul(0xbf58476d1ce4e5b9);
    v ^= v >> 27;
    v = v.wrapping_mul(0x94d049bb133111eb);
    v ^ (v >> 31)
}

fn combine_hash(acc: u64, value_hash: u64) -> u64 {
    acc ^ value_hash
        .wrapping_add(HASH_GOLDEN)
        .wrapping_add(acc << 6)
        .wrapping_add(acc >> 2)
}

fn hash_u64_with_seed(seed: u64, value: u64) -> u64 {
    mix_u64(seed ^ value)
}

fn hash_bytes_with_seed(seed: u64, bytes: &[u8]) -> u64 {
    let mut hash = seed ^ 0xcbf29ce484222325;
    for byte in bytes {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

fn hash_null_with_seed(seed: u64) -> u64 {
    hash_u64_with_seed(seed, HASH_GOLDEN)
}

fn canonical_f64_bits(value: f64) -> u64 {
    if value.is_nan() {
        f64::NAN.to_bits()
    } else if value == 0.0 {
        0
    } else {
        value.to_bits()
    }
}

pub fn hash_datum(seed: u64, datum: &Datum) -> u64 {
    match datum {
        Datum::Null => hash_null_with_seed(seed),
        Datum::Bool(v) => hash_u64_with_seed(seed, *v as u64),
        Datum::Int(v) => hash_u64_with_seed(seed, *v as u64),
        Datum::Float(v) => hash_u64_with_seed(seed, canonical_f64_bits(*v)),
        Datum::Text(v) => hash_bytes_with_seed(seed, v.as_bytes()),
        Datum::Bytes(v) => hash_bytes_with_seed(seed, v),
        Datum::List(items) => hash_datum_list(seed, items),
        Datum::Expanded(obj) => hash_datum_list(seed, &obj.flatten()),
    }
}

fn hash_datum_list(seed: u64, items: &[Datum]) -> u64 {
    let mut acc = hash_u64_with_seed(seed, items.len() as u64);
    for item in items {
        acc = combine_hash(acc, hash_datum(seed, item));
    }
    acc
}

/// 32-bit grouping hash over the listed key columns. The spill partition
/// scheme consumes these bits from the top, so the full row hash must stay
/// 32 bits wide.
pub fn hash_row_columns(seed: u64, row: &Row, columns: &[usize]) -> u32 {
    let mut acc = seed;
    for &col in columns {
        acc = combine_hash(acc, hash_datum(seed, &row[col]));
    }
    ((acc >> 32) ^ acc) as u32
}

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_TEXT: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_LIST: u8 = 6;

/// Encode a row into the minimal on-tape representation.
pub fn encode_row(row: &Row, out: &mut Vec<u8>) -> ExecResult<()> {
    let ncols = u16::try_from(row.len())
        .map_err(|_| ExecError::internal(format!("row too wide to spill: {} columns", row.len())))?;
    out.extend_from_slice(&ncols.to_le_bytes());
    for datum in row {
        encode_datum(datum, out)?;
    }
    Ok(())
}

fn encode_datum(datum: &Datum, out: &mut Vec<u8>) -> ExecResult<()> {
    match datum {
        Datum::Null => out.push(TAG_NULL),
        Datum::Bool(v) => {
            out.push(TAG_BOOL);
            out.push(*v as u8);
        }
        Datum::Int(v) => {
            out.push(TAG_INT);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Datum::Float(v) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&v.to_bits().to_le_bytes());
        }
        Datum::Text(v) => {
            out.push(TAG_TEXT);
            encode_len(v.len(), out)?;
            out.extend_from_slice(v.as_bytes());
        }
        Datum::Bytes(v) => {
            out.push(TAG_BYTES);
            encode_len(v.len(), out)?;
            out.extend_from_slice(v);
        }
        Datum::List(items) => {
            out.push(TAG_LIST);
            encode_len(items.len(), out)?;
            for item in items {
                encode_datum(item, out)?;
            }
        }
        Datum::Expanded(_) => {
            return Err(ExecError::internal(
                "expanded object cannot be written to a spill tape",
            ));
        }
    }
    Ok(())
}

fn encode_len(len: usize, out: &mut Vec<u8>) -> ExecResult<()> {
    let len = u32::try_from(len)
        .map_err(|_| ExecError::internal("value too large to spill"))?;
    out.extend_from_slice(&len.to_le_bytes());
    Ok(())
}

/// Decode a row previously produced by `encode_row`.
pub fn decode_row(bytes: &[u8]) -> ExecResult<Row> {
    let mut cursor = Cursor { bytes, pos: 0 };
    let ncols = cursor.take_u16()? as usize;
    let mut row = Vec::with_capacity(ncols);
    for _ in 0..ncols {
        row.push(decode_datum(&mut cursor)?);
    }
    if cursor.pos != bytes.len() {
        return Err(ExecError::io("trailing bytes after spilled row"));
    }
    Ok(row)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> ExecResult<&'a [u8]> {
        if self.pos + n > self.bytes.len() {
            return Err(ExecError::io("truncated spilled row"));
        }
        let out = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn take_u8(&mut self) -> ExecResult<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> ExecResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn take_u32(&mut self) -> ExecResult<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn take_u64(&mut self) -> ExecResult<u64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }
}

fn decode_datum(cursor: &mut Cursor<'_>) -> ExecResult<Datum> {
    let tag = cursor.take_u8()?;
    let datum = match tag {
        TAG_NULL => Datum::Null,
        TAG_BOOL => Datum::Bool(cursor.take_u8()? != 0),
        TAG_INT => Datum::Int(cursor.take_u64()? as i64),
        TAG_FLOAT => Datum::Float(f64::from_bits(cursor.take_u64()?)),
        TAG_TEXT => {
            let len = cursor.take_u32()? as usize;
            let bytes = cursor.take(len)?;
            let text = std::str::from_utf8(bytes)
                .map_err(|e| ExecError::io(format!("spilled text is not utf-8: {e}")))?;
            Datum::Text(text.to_string())
        }
        TAG_BYTES => {
            let len = cursor.take_u32()? as usize;
            Datum::Bytes(cursor.take(len)?.to_vec())
        }
        TAG_LIST => {
            let len = cursor.take_u32()? as usize;
            let mut items = Vec::with_capacity(len);
            for _ in 0..len {
                items.push(decode_datum(cursor)?);
            }
            Datum::List(items)
        }
        other => {
            return Err(ExecError::io(format!(
                "unknown datum tag {other} in spilled row"
            )));
        }
    };
    Ok(datum)
}
