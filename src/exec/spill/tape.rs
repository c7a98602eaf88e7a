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
//! Logical tape pool for spilled aggregation overflow.
//!
//! A pool is a set of numbered append-only byte streams backed by temp files
//! in the configured spill directory. Each tape is written once, rewound,
//! then read back sequentially; the pool can be extended with more tapes when
//! a batch re-spills. Files are removed when the pool is dropped.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::common::error::{ExecError, ExecResult};

/// Per-tape buffer size. Also the unit the spill planner uses to bound the
/// memory held by open partition buffers.
pub const TAPE_BUFFER_BYTES: usize = 8192;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, PartialEq, Eq)]
enum TapeState {
    Writing,
    Reading,
}

#[derive(Debug)]
struct Tape {
    path: PathBuf,
    file: File,
    state: TapeState,
    write_buf: Vec<u8>,
    read_buf: Vec<u8>,
    read_pos: usize,
    bytes_written: u64,
}

impl Tape {
    fn create(dir: &Path, pool_id: u64, tape_no: usize) -> ExecResult<Self> {
        let filename = format!(
            "spill_{:x}_{:x}_{:x}.tape",
            std::process::id(),
            pool_id,
            tape_no
        );
        let path = dir.join(filename);
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                ExecError::io(format!("create spill file {} failed: {e}", path.display()))
            })?;
        Ok(Self {
            path,
            file,
            state: TapeState::Writing,
            write_buf: Vec::with_capacity(TAPE_BUFFER_BYTES),
            read_buf: Vec::new(),
            read_pos: 0,
            bytes_written: 0,
        })
    }

    fn write(&mut self, bytes: &[u8]) -> ExecResult<()> {
        if self.state != TapeState::Writing {
            return Err(ExecError::internal("write to spill tape after rewind"));
        }
        self.write_buf.extend_from_slice(bytes);
        self.bytes_written += bytes.len() as u64;
        if self.write_buf.len() >= TAPE_BUFFER_BYTES {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> ExecResult<()> {
        if !self.write_buf.is_empty() {
            self.file
                .write_all(&self.write_buf)
                .map_err(|e| ExecError::io(format!("write spill tape failed: {e}")))?;
            self.write_buf.clear();
        }
        Ok(())
    }

    fn rewind_for_read(&mut self) -> ExecResult<()> {
        self.flush()?;
        self.file
            .seek(SeekFrom::Start(0))
            .map_err(|e| ExecError::io(format!("rewind spill tape failed: {e}")))?;
        self.state = TapeState::Reading;
        self.read_buf.clear();
        self.read_pos = 0;
        Ok(())
    }

    fn read(&mut self, out: &mut [u8]) -> ExecResult<usize> {
        if self.state != TapeState::Reading {
            return Err(ExecError::internal("read from spill tape before rewind"));
        }
        let mut copied = 0;
        while copied < out.len() {
            if self.read_pos == self.read_buf.len() {
                self.read_buf.resize(TAPE_BUFFER_BYTES, 0);
                let n = self
                    .file
                    .read(&mut self.read_buf)
                    .map_err(|e| ExecError::io(format!("read spill tape failed: {e}")))?;
                self.read_buf.truncate(n);
                self.read_pos = 0;
                if n == 0 {
                    break;
                }
            }
            let available = self.read_buf.len() - self.read_pos;
            let take = available.min(out.len() - copied);
            out[copied..copied + take]
                .copy_from_slice(&self.read_buf[self.read_pos..self.read_pos + take]);
            self.read_pos += take;
            copied += take;
        }
        Ok(copied)
    }
}

#[derive(Debug)]
pub struct TapePool {
    dir: PathBuf,
    pool_id: u64,
    tapes: Vec<Tape>,
}

impl TapePool {
    pub fn create(dir: &Path, ntapes: usize) -> ExecResult<Self> {
        let pool_id = NEXT_POOL_ID.fetch_add(1, Ordering::AcqRel);
        let mut pool = Self {
            dir: dir.to_path_buf(),
            pool_id,
            tapes: Vec::with_capacity(ntapes),
        };
        pool.extend(ntapes)?;
        Ok(pool)
    }

    /// Add `extra` tapes, returning the index of the first new one.
    pub fn extend(&mut self, extra: usize) -> ExecResult<usize> {
        let first = self.tapes.len();
        for tape_no in first..first + extra {
            self.tapes.push(Tape::create(&self.dir, self.pool_id, tape_no)?);
        }
        Ok(first)
    }

    pub fn ntapes(&self) -> usize {
        self.tapes.len()
    }

    pub fn write(&mut self, tape: usize, bytes: &[u8]) -> ExecResult<()> {
        self.tape_mut(tape)?.write(bytes)
    }

    pub fn rewind_for_read(&mut self, tape: usize) -> ExecResult<()> {
        self.tape_mut(tape)?.rewind_for_read()
    }

    /// Read up to `out.len()` bytes; returns the count actually read, zero
    /// only at end of tape.
    pub fn read(&mut self, tape: usize, out: &mut [u8]) -> ExecResult<usize> {
        self.tape_mut(tape)?.read(out)
    }

    pub fn tape_bytes_written(&self, tape: usize) -> u64 {
        self.tapes.get(tape).map(|t| t.bytes_written).unwrap_or(0)
    }

    fn tape_mut(&mut self, tape: usize) -> ExecResult<&mut Tape> {
        let ntapes = self.tapes.len();
        self.tapes
            .get_mut(tape)
            .ok_or_else(|| ExecError::internal(format!("spill tape {tape} out of range ({ntapes})")))
    }
}

impl Drop for TapePool {
    fn drop(&mut self) {
        for tape in &self.tapes {
            let _ = std::fs::remove_file(&tape.path);
        }
    }
}
