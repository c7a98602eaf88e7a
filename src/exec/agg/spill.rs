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
//! Partitioned overflow for hashed aggregation.
//!
//! When a hash table stops accepting new groups, rows for absent groups are
//! appended to one of several tape partitions selected by the next unused
//! bits of the grouping hash. After input drains, each non-empty partition
//! becomes a batch: the driver rebuilds a table for the batch's grouping set
//! and replays the tape, possibly spilling again into child partitions that
//! consume yet more hash bits. Progress is monotone until the 32-bit hash is
//! exhausted, at which point a batch must complete in memory.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::common::error::{ExecError, ExecResult};
use crate::exec::row::{Row, decode_row, encode_row};
use crate::exec::spill::tape::{TAPE_BUFFER_BYTES, TapePool};

pub const HASH_PARTITION_FACTOR: f64 = 1.5;
pub const HASH_MIN_PARTITIONS: usize = 4;
pub const HASH_MAX_PARTITIONS: usize = 256;

pub type SharedTapePool = Arc<Mutex<TapePool>>;

fn lock_pool(pool: &SharedTapePool) -> std::sync::MutexGuard<'_, TapePool> {
    pool.lock().unwrap_or_else(|e| e.into_inner())
}

/// Number of partitions for an overflow episode: enough that each partition
/// is likely to fit in memory on replay, but never so many that the open
/// partition buffers eat more than a quarter of the budget.
pub fn choose_num_partitions(input_groups: u64, entry_size: f64, work_mem: usize) -> usize {
    let partition_limit = (work_mem / 4 / TAPE_BUFFER_BYTES).max(1);

    // pessimistically assume every input tuple opens a new group
    let mem_needed = HASH_PARTITION_FACTOR * input_groups as f64 * entry_size;
    let mut npartitions = 1 + (mem_needed / work_mem.max(1) as f64) as usize;

    if npartitions > partition_limit {
        npartitions = partition_limit;
    }
    npartitions.clamp(HASH_MIN_PARTITIONS, HASH_MAX_PARTITIONS)
}

fn log2_ceil(n: usize) -> u32 {
    (n.max(1) as u64).next_power_of_two().trailing_zeros()
}

/// Open partitions of one overflow episode for one grouping set.
#[derive(Debug)]
pub struct SpillPartitionSet {
    pool: SharedTapePool,
    partition_bits: u32,
    tapes: Vec<usize>,
    ntuples: Vec<u64>,
}

impl SpillPartitionSet {
    /// Carve `npartitions` fresh tapes out of the shared pool. `input_bits`
    /// is how many hash bits the parent partitioning already consumed; the
    /// partition count shrinks if fewer than `partition_bits` remain.
    pub fn new(
        pool: SharedTapePool,
        input_bits: u32,
        input_groups: u64,
        entry_size: f64,
        work_mem: usize,
    ) -> ExecResult<Self> {
        let npartitions = choose_num_partitions(input_groups, entry_size, work_mem);
        let mut partition_bits = log2_ceil(npartitions);
        if partition_bits + input_bits >= 32 {
            partition_bits = 32u32.saturating_sub(input_bits);
        }
        let npartitions = 1usize << partition_bits;

        let first_tape = lock_pool(&pool).extend(npartitions)?;
        let tapes = (first_tape..first_tape + npartitions).collect();
        Ok(Self {
            pool,
            partition_bits,
            tapes,
            ntuples: vec![0; npartitions],
        })
    }

    pub fn npartitions(&self) -> usize {
        self.tapes.len()
    }

    pub fn partition_bits(&self) -> u32 {
        self.partition_bits
    }

    /// Append one overflow row. Returns the bytes written, which the caller
    /// may or may not add to its disk telemetry (first-generation spills
    /// count, recursive re-spills reuse the parent pool and do not).
    pub fn write_row(&mut self, input_bits: u32, hash: u32, row: &Row) -> ExecResult<u64> {
        let partition = if self.partition_bits == 0 {
            0
        } else {
            (hash.wrapping_shl(input_bits) >> (32 - self.partition_bits)) as usize
        };
        self.ntuples[partition] += 1;

        let mut payload = Vec::new();
        encode_row(row, &mut payload)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| ExecError::internal("spilled row exceeds record size limit"))?;

        let tape = self.tapes[partition];
        let mut pool = lock_pool(&self.pool);
        pool.write(tape, &hash.to_le_bytes())?;
        pool.write(tape, &len.to_le_bytes())?;
        pool.write(tape, &payload)?;
        Ok(8 + payload.len() as u64)
    }

    /// Rewind every non-empty partition and queue it as a batch.
    pub fn finish(
        self,
        setno: usize,
        input_bits: u32,
        batches: &mut VecDeque<SpillBatch>,
    ) -> ExecResult<usize> {
        let mut queued = 0;
        for (idx, &tape) in self.tapes.iter().enumerate() {
            if self.ntuples[idx] == 0 {
                continue;
            }
            lock_pool(&self.pool).rewind_for_read(tape)?;
            batches.push_back(SpillBatch {
                pool: Arc::clone(&self.pool),
                input_tape: tape,
                input_bits: self.partition_bits + input_bits,
                input_tuples: self.ntuples[idx],
                setno,
                spill: None,
            });
            queued += 1;
        }
        Ok(queued)
    }
}

/// One partition's worth of spilled rows awaiting replay. A batch belongs to
/// exactly one grouping set; a replay that overflows again fills
/// `spill` with child partitions sharing the same tape pool.
#[derive(Debug)]
pub struct SpillBatch {
    pub pool: SharedTapePool,
    pub input_tape: usize,
    /// Hash bits consumed by all ancestors including this batch's partition.
    pub input_bits: u32,
    pub input_tuples: u64,
    pub setno: usize,
    pub spill: Option<SpillPartitionSet>,
}

impl SpillBatch {
    /// Next spilled record, or `None` at end of tape. A partial record is an
    /// IO error.
    pub fn read_next(&mut self) -> ExecResult<Option<(u32, Row)>> {
        let mut pool = lock_pool(&self.pool);

        let mut hash_buf = [0u8; 4];
        let n = pool.read(self.input_tape, &mut hash_buf)?;
        if n == 0 {
            return Ok(None);
        }
        if n != 4 {
            return Err(ExecError::io("short read of tuple hash on spill tape"));
        }
        let hash = u32::from_le_bytes(hash_buf);

        let mut len_buf = [0u8; 4];
        if pool.read(self.input_tape, &mut len_buf)? != 4 {
            return Err(ExecError::io("short read of tuple length on spill tape"));
        }
        let len = u32::from_le_bytes(len_buf) as usize;

        let mut payload = vec![0u8; len];
        if pool.read(self.input_tape, &mut payload)? != len {
            return Err(ExecError::io("short read of tuple body on spill tape"));
        }
        drop(pool);

        Ok(Some((hash, decode_row(&payload)?)))
    }
}
