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
//! Hash table mapping grouping keys to per-group transition states.
//!
//! Entries are stored in a flat vector; the raw table maps hashes to entry
//! indices, which keeps iteration stable and cheap while no inserts occur.
//! Once the driver's memory watermark trips, the table flips to lookup-only
//! mode: rows whose group is absent return `None` and are routed to spill.

use std::sync::Arc;

use hashbrown::raw::RawTable;

use crate::exec::agg::descriptor::GroupTransState;
use crate::exec::row::Row;
use crate::runtime::arena::Arena;

#[derive(Clone, Copy, Debug)]
struct KeyEntry {
    group_id: usize,
    hash: u32,
}

/// One distinct grouping key and its transition states, `trans_no`-ordered.
#[derive(Debug)]
pub struct GroupEntry {
    pub hash: u32,
    /// Representative key values, in grouping-set column order.
    pub key: Row,
    pub states: Vec<GroupTransState>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GroupLookup {
    pub group_id: usize,
    pub is_new: bool,
}

pub struct GroupTable {
    table: RawTable<KeyEntry>,
    entries: Vec<GroupEntry>,
    arena: Arc<Arena>,
    lookup_only: bool,
}

impl std::fmt::Debug for GroupTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupTable")
            .field("ngroups", &self.entries.len())
            .field("lookup_only", &self.lookup_only)
            .finish()
    }
}

/// Lowest power of two above the group estimate, capped so the bucket array
/// itself cannot blow the memory budget.
pub fn choose_num_buckets(ngroups: u64, memory: usize, entry_size: usize) -> usize {
    let max_nbuckets = (memory / entry_size.max(1)).max(2);
    let mut nbuckets: usize = 2;
    while (nbuckets as u64) < ngroups && nbuckets < max_nbuckets {
        nbuckets <<= 1;
    }
    if nbuckets > max_nbuckets && nbuckets > 2 {
        nbuckets >>= 1;
    }
    nbuckets
}

impl GroupTable {
    pub fn new(
        est_groups: u64,
        memory: usize,
        entry_size: usize,
        arena: Arc<Arena>,
    ) -> Self {
        let nbuckets = choose_num_buckets(est_groups.max(1), memory, entry_size);
        let table = RawTable::with_capacity(nbuckets);
        arena.adopt(nbuckets * std::mem::size_of::<KeyEntry>());
        Self {
            table,
            entries: Vec::new(),
            arena,
            lookup_only: false,
        }
    }

    /// Stop creating new groups; lookups for absent keys return `None`.
    pub fn set_lookup_only(&mut self) {
        self.lookup_only = true;
    }

    pub fn is_lookup_only(&self) -> bool {
        self.lookup_only
    }

    pub fn ngroups(&self) -> usize {
        self.entries.len()
    }

    /// Find the group of `input` projected onto `key_columns`, inserting a
    /// fresh entry unless the table is in lookup-only mode. `make_states`
    /// runs only on insert.
    pub fn lookup_or_insert(
        &mut self,
        input: &Row,
        key_columns: &[usize],
        hash: u32,
        make_states: impl FnOnce() -> Vec<GroupTransState>,
    ) -> Option<GroupLookup> {
        let entries = &self.entries;
        let found = self.table.get(hash as u64, |candidate| {
            candidate.hash == hash
                && keys_match(&entries[candidate.group_id].key, input, key_columns)
        });
        if let Some(entry) = found {
            return Some(GroupLookup {
                group_id: entry.group_id,
                is_new: false,
            });
        }
        if self.lookup_only {
            return None;
        }

        let key: Row = key_columns.iter().map(|&col| input[col].clone()).collect();
        let states = make_states();
        let group_id = self.entries.len();

        // state heap values were already adopted when they were initialized
        let mut entry_bytes = std::mem::size_of::<GroupEntry>()
            + std::mem::size_of::<KeyEntry>()
            + states.len() * std::mem::size_of::<GroupTransState>();
        for datum in &key {
            entry_bytes += datum.heap_size() + std::mem::size_of_val(datum);
        }
        self.arena.adopt(entry_bytes);

        self.entries.push(GroupEntry { hash, key, states });
        self.table
            .insert(hash as u64, KeyEntry { group_id, hash }, |e| e.hash as u64);
        Some(GroupLookup {
            group_id,
            is_new: true,
        })
    }

    pub fn entry(&self, group_id: usize) -> &GroupEntry {
        &self.entries[group_id]
    }

    pub fn states_mut(&mut self, group_id: usize) -> &mut Vec<GroupTransState> {
        &mut self.entries[group_id].states
    }
}

/// The stored representative key against the projected input columns,
/// NULL matching NULL.
fn keys_match(key: &Row, input: &Row, key_columns: &[usize]) -> bool {
    key.len() == key_columns.len()
        && key_columns
            .iter()
            .zip(key.iter())
            .all(|(&col, stored)| stored == &input[col])
}
