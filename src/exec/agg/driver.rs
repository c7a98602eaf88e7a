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
//! Pull-based aggregation driver.
//!
//! Responsibilities:
//! - Routes execution to the plain/sorted direct path, the hashed
//!   fill/drain/refill protocol, or their mixed composition, one output row
//!   per `next()` call.
//! - Detects group boundaries over presorted input, resetting exactly the
//!   grouping sets whose prefix changed, and projects one row per grouping
//!   set at each boundary, finest first.
//! - Enforces the hashed-strategy memory watermark: once tripped, tables go
//!   lookup-only and overflow rows spill to hash-partitioned tapes that are
//!   replayed batch by batch, recursively.
//!
//! Key exported interfaces:
//! - Types: `AggDriver`, `ExecEnv`, `AggMetrics`.
//! - Traits: `RowSource`.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::common::config;
use crate::common::error::{ExecError, ExecResult};
use crate::exec::agg::descriptor::{AggDesc, GroupTransState, TransDesc, init_group_states, init_trans_state};
use crate::exec::agg::functions::FunctionRegistry;
use crate::exec::agg::invoke::{
    SorterSlot, advance_transition, build_sorter_slot, deserialize_input, drain_ordered,
    filter_passes, finalize_aggregate, finalize_partial,
};
use crate::exec::agg::phase::PhaseMachine;
use crate::exec::agg::plan::{AggPlan, AggStrategy};
use crate::exec::agg::share::build_descriptors;
use crate::exec::agg::spill::{SharedTapePool, SpillBatch, SpillPartitionSet};
use crate::exec::row::{Datum, Row, hash_row_columns};
use crate::exec::sorter::{MemSorterFactory, SorterFactory};
use crate::exec::spill::tape::{TAPE_BUFFER_BYTES, TapePool};
use crate::runtime::arena::Arena;
use crate::runtime::cancel::CancelToken;
use crate::runtime::mem_tracker::MemTracker;

/// Open-partition buffer memory reserved out of the budget when spilling is
/// possible.
const HASH_PARTITION_MEM: usize = 4 * TAPE_BUFFER_BYTES;

/// Grouping hashes must agree between the initial fill and every recursive
/// replay, so the seed is a per-process constant.
const HASH_SEED: u64 = 0x7d28_22f1;

/// The stream of input rows the driver aggregates over.
pub trait RowSource {
    fn next(&mut self) -> ExecResult<Option<Row>>;

    /// Restart the stream from the beginning.
    fn rescan(&mut self) -> ExecResult<()>;

    /// True when a rescan is guaranteed to produce the same rows, letting a
    /// fully-built hash table be re-read instead of rebuilt.
    fn output_stable_across_rescan(&self) -> bool {
        false
    }
}

/// Execution environment for one driver instance.
#[derive(Clone)]
pub struct ExecEnv {
    /// Byte budget shared by all concurrent hash tables.
    pub work_mem: usize,
    /// Disable the memory/group caps: never spill.
    pub hashagg_mem_overflow: bool,
    pub spill_dir: PathBuf,
    pub cancel: CancelToken,
    pub sorter_factory: Arc<dyn SorterFactory>,
    pub registry: Arc<FunctionRegistry>,
}

impl std::fmt::Debug for ExecEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecEnv")
            .field("work_mem", &self.work_mem)
            .field("hashagg_mem_overflow", &self.hashagg_mem_overflow)
            .field("spill_dir", &self.spill_dir)
            .finish()
    }
}

impl ExecEnv {
    pub fn from_config(registry: Arc<FunctionRegistry>) -> Self {
        Self {
            work_mem: config::work_mem_bytes(),
            hashagg_mem_overflow: config::hashagg_mem_overflow(),
            spill_dir: config::spill_dir(),
            cancel: CancelToken::new(),
            sorter_factory: Arc::new(MemSorterFactory),
            registry,
        }
    }

    pub fn with_work_mem(mut self, work_mem: usize) -> Self {
        self.work_mem = work_mem;
        self
    }

    pub fn with_spill_dir(mut self, dir: PathBuf) -> Self {
        self.spill_dir = dir;
        self
    }

    pub fn with_mem_overflow(mut self, overflow: bool) -> Self {
        self.hashagg_mem_overflow = overflow;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Execution counters, kept across rescans.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AggMetrics {
    /// Peak logical bytes held by hash entries.
    pub hash_mem_peak: i64,
    /// Bytes written by first-generation spills; recursive re-spills reuse
    /// the parent batch's tape pool and are not re-counted.
    pub hash_disk_used: u64,
    /// Spill batches queued over the driver's lifetime.
    pub hash_batches_used: u64,
    pub hash_spilled: bool,
}

/// Hashed grouping set: its key columns, planner estimate, table and drain
/// cursor.
#[derive(Debug)]
struct PerHashSet {
    columns: Vec<usize>,
    num_groups: u64,
    table: Option<crate::exec::agg::group_table::GroupTable>,
    iter_pos: usize,
}

pub struct AggDriver {
    plan: AggPlan,
    env: ExecEnv,
    child: Box<dyn RowSource>,
    phases: PhaseMachine,
    aggs: Arc<[AggDesc]>,
    transes: Arc<[TransDesc]>,
    grouping_sets_mode: bool,

    // arenas: one per sorted grouping set, one for all hash tables, one per
    // input tuple; all report into one tracker
    mem_tracker: Arc<MemTracker>,
    aggcontexts: Vec<Arc<Arena>>,
    hash_arena: Arc<Arena>,
    tuple_arena: Arc<Arena>,

    // direct (plain/sorted) path
    pergroups: Vec<Vec<GroupTransState>>,
    trans_sorters: Vec<Vec<Option<SorterSlot>>>,
    grp_first_row: Option<Row>,
    rep_row: Option<Row>,
    projected_set: i64,
    input_done: bool,
    agg_done: bool,

    // hashed path
    perhash: Vec<PerHashSet>,
    hash_pergroup: Vec<Option<usize>>,
    table_filled: bool,
    current_hash_set: usize,
    hashentrysize: f64,
    hash_mem_limit: usize,
    hash_ngroups_limit: u64,
    hash_ngroups_current: u64,
    hash_no_new_groups: bool,
    /// The batch being replayed has consumed all 32 hash bits; further
    /// partitioning cannot make progress, so it must complete in memory.
    batch_must_fit: bool,
    hash_spills: Option<Vec<Option<SpillPartitionSet>>>,
    spill_pools: Vec<SharedTapePool>,
    batches: VecDeque<SpillBatch>,

    metrics: AggMetrics,
    ended: bool,
}

impl std::fmt::Debug for AggDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggDriver")
            .field("strategy", &self.plan.strategy)
            .field("phases", &self.phases)
            .field("agg_done", &self.agg_done)
            .field("metrics", &self.metrics)
            .finish()
    }
}

impl AggDriver {
    pub fn init(plan: AggPlan, env: ExecEnv, child: Box<dyn RowSource>) -> ExecResult<Self> {
        validate_plan_shape(&plan)?;
        let (aggs, transes) = build_descriptors(&plan, &env.registry)?;
        let aggs: Arc<[AggDesc]> = aggs.into();
        let transes: Arc<[TransDesc]> = transes.into();
        let phases = PhaseMachine::build(&plan, Arc::clone(&env.sorter_factory))?;

        let max_sorted_sets = plan
            .sorted_phases
            .iter()
            .map(|p| p.grouping_sets.len())
            .max()
            .unwrap_or(0);
        let total_sets = plan.hashed_sets.len()
            + plan
                .sorted_phases
                .iter()
                .map(|p| p.grouping_sets.len())
                .sum::<usize>();

        let mem_tracker = MemTracker::new_root("aggregation");
        let aggcontexts: Vec<Arc<Arena>> = (0..max_sorted_sets.max(1))
            .map(|setno| {
                Arena::with_tracker(
                    format!("grouping set {setno}"),
                    MemTracker::new_child(format!("grouping set {setno}"), &mem_tracker),
                )
            })
            .collect();
        let hash_arena = Arena::with_tracker(
            "hash tables",
            MemTracker::new_child("hash tables", &mem_tracker),
        );
        let tuple_arena = Arena::with_tracker(
            "per tuple",
            MemTracker::new_child("per tuple", &mem_tracker),
        );

        let pergroups = (0..max_sorted_sets.max(1))
            .map(|setno| init_group_states(&transes, &aggcontexts[setno]))
            .collect();
        let trans_sorters = transes
            .iter()
            .map(|_| (0..max_sorted_sets.max(1)).map(|_| None).collect())
            .collect();

        let use_hashing = !plan.hashed_sets.is_empty();
        let hashentrysize = base_entry_size(&transes);
        let hash_mem_limit = if env.hashagg_mem_overflow {
            usize::MAX
        } else if env.work_mem > HASH_PARTITION_MEM * 2 {
            env.work_mem - HASH_PARTITION_MEM
        } else {
            env.work_mem
        };
        let hash_ngroups_limit = if env.hashagg_mem_overflow {
            u64::MAX
        } else if hash_mem_limit as f64 > hashentrysize {
            (hash_mem_limit as f64 / hashentrysize) as u64
        } else {
            1
        };

        let perhash = plan
            .hashed_sets
            .iter()
            .map(|set| PerHashSet {
                columns: set.columns.clone(),
                num_groups: set.num_groups,
                table: None,
                iter_pos: 0,
            })
            .collect();

        let mut driver = Self {
            grouping_sets_mode: total_sets > 1,
            hash_pergroup: vec![None; plan.hashed_sets.len()],
            plan,
            env,
            child,
            phases,
            aggs,
            transes,
            mem_tracker,
            aggcontexts,
            hash_arena,
            tuple_arena,
            pergroups,
            trans_sorters,
            grp_first_row: None,
            rep_row: None,
            projected_set: -1,
            input_done: false,
            agg_done: false,
            perhash,
            table_filled: false,
            current_hash_set: 0,
            hashentrysize,
            hash_mem_limit,
            hash_ngroups_limit,
            hash_ngroups_current: 0,
            hash_no_new_groups: false,
            batch_must_fit: false,
            hash_spills: None,
            spill_pools: Vec::new(),
            batches: VecDeque::new(),
            metrics: AggMetrics::default(),
            ended: false,
        };
        if use_hashing {
            driver.rebuild_hash_tables(None, 0)?;
        }
        Ok(driver)
    }

    pub fn metrics(&self) -> AggMetrics {
        self.metrics
    }

    /// Root of the driver's logical memory accounting hierarchy.
    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    /// Pull the next output row.
    pub fn next(&mut self) -> ExecResult<Option<Row>> {
        self.env.cancel.check()?;
        if self.agg_done || self.ended {
            return Ok(None);
        }
        match self.phases.current_phase().strategy {
            AggStrategy::Hashed => {
                if !self.table_filled {
                    self.fill_hash_table()?;
                }
                self.retrieve_hash_table()
            }
            AggStrategy::Plain | AggStrategy::Sorted => self.retrieve_direct(),
            AggStrategy::Mixed => Err(ExecError::internal("phase cannot be mixed")),
        }
    }

    /// Restart execution from the beginning of the child stream. A fully
    /// built, never-spilled pure-hash table over a stable child only rewinds
    /// its iteration.
    pub fn rescan(&mut self) -> ExecResult<()> {
        if self.ended {
            return Err(ExecError::internal("driver already shut down"));
        }
        if self.plan.strategy == AggStrategy::Hashed
            && self.table_filled
            && !self.metrics.hash_spilled
            && self.child.output_stable_across_rescan()
        {
            self.current_hash_set = 0;
            for set in &mut self.perhash {
                set.iter_pos = 0;
            }
            self.agg_done = false;
            return Ok(());
        }

        self.release_spill_state();
        self.phases.release_sorters();
        for arena in &self.aggcontexts {
            arena.reset();
        }
        self.tuple_arena.reset();
        for sorters in &mut self.trans_sorters {
            for slot in sorters.iter_mut() {
                *slot = None;
            }
        }
        let transes = Arc::clone(&self.transes);
        for (setno, states) in self.pergroups.iter_mut().enumerate() {
            *states = init_group_states(&transes, &self.aggcontexts[setno]);
        }
        self.grp_first_row = None;
        self.rep_row = None;
        self.projected_set = -1;
        self.input_done = false;
        self.agg_done = false;
        self.table_filled = false;
        self.current_hash_set = 0;
        if !self.plan.hashed_sets.is_empty() {
            self.rebuild_hash_tables(None, 0)?;
        } else {
            self.hash_arena.reset();
        }
        let first = if self.plan.strategy == AggStrategy::Hashed {
            0
        } else {
            1
        };
        self.phases.initialize_phase(first)?;
        self.child.rescan()
    }

    /// Release every resource held by the driver. Further `next()` calls
    /// return end-of-stream.
    pub fn end(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.agg_done = true;
        self.release_spill_state();
        self.phases.release_sorters();
        for set in &mut self.perhash {
            set.table = None;
        }
        for sorters in &mut self.trans_sorters {
            for slot in sorters.iter_mut() {
                *slot = None;
            }
        }
        for arena in &self.aggcontexts {
            arena.reset();
        }
        self.hash_arena.reset();
        self.tuple_arena.reset();
    }

    // ---- direct (plain/sorted) path -----------------------------------

    fn retrieve_direct(&mut self) -> ExecResult<Option<Row>> {
        loop {
            if self.agg_done {
                return Ok(None);
            }
            let num_sets = self.phases.current_phase().grouping_sets.len();

            let num_reset = if self.projected_set >= 0 && (self.projected_set as usize) < num_sets
            {
                self.projected_set as usize + 1
            } else {
                num_sets
            };
            for setno in 0..num_reset.min(self.aggcontexts.len()) {
                self.aggcontexts[setno].reset();
            }

            // out of input and out of grouping sets: next phase, hash drain
            // (mixed), or done
            if self.input_done && self.projected_set >= num_sets as i64 - 1 {
                if self.phases.current_index() < self.phases.num_phases() - 1 {
                    let next = self.phases.current_index() + 1;
                    self.phases.initialize_phase(next)?;
                    self.input_done = false;
                    self.projected_set = -1;
                    continue;
                } else if self.plan.strategy == AggStrategy::Mixed {
                    self.phases.initialize_phase(0)?;
                    self.table_filled = true;
                    self.current_hash_set = 0;
                    for set in &mut self.perhash {
                        set.iter_pos = 0;
                    }
                    return self.retrieve_hash_table();
                } else {
                    self.agg_done = true;
                    return Ok(None);
                }
            }

            let next_set_size = if self.projected_set >= 0
                && (self.projected_set as usize) < num_sets - 1
            {
                self.phases.current_phase().gset_lengths[self.projected_set as usize + 1]
            } else {
                0
            };

            // a subgroup of the current group remains: project the next
            // coarser grouping set without consuming input
            let boundary_crossed = self.input_done
                || (self.phases.current_phase().strategy != AggStrategy::Plain
                    && self.projected_set != -1
                    && (self.projected_set as usize) < num_sets - 1
                    && next_set_size > 0
                    && !self.pending_row_matches_prefix(next_set_size));
            if boundary_crossed {
                self.projected_set += 1;
            } else {
                self.projected_set = 0;

                if self.grp_first_row.is_none() {
                    match self.fetch_row()? {
                        Some(row) => self.grp_first_row = Some(row),
                        None => {
                            if self.grouping_sets_mode {
                                // no input at all: only size-0 grouping sets
                                // still project
                                self.input_done = true;
                                let lengths =
                                    self.phases.current_phase().gset_lengths.clone();
                                let mut setno = self.projected_set as usize;
                                while setno < num_sets && lengths[setno] > 0 {
                                    setno += 1;
                                }
                                self.projected_set = setno as i64;
                                if setno >= num_sets {
                                    continue;
                                }
                            } else {
                                self.agg_done = true;
                                if self.phases.current_phase().strategy != AggStrategy::Plain {
                                    return Ok(None);
                                }
                            }
                        }
                    }
                }

                self.initialize_aggregates(num_reset)?;

                if let Some(first) = self.grp_first_row.take() {
                    self.rep_row = Some(first.clone());
                    let mut current = first;
                    loop {
                        // during phase 1 of a mixed aggregation the hash
                        // tables fill alongside the sorted pass
                        let mixed_fill = self.plan.strategy == AggStrategy::Mixed
                            && self.phases.current_index() == 1;
                        if mixed_fill {
                            self.lookup_hash_entries(&current)?;
                        }
                        self.advance_aggregates(&current, true, mixed_fill)?;
                        self.tuple_arena.reset();

                        match self.fetch_row()? {
                            None => {
                                if mixed_fill {
                                    self.finish_initial_spills()?;
                                }
                                if self.grouping_sets_mode {
                                    self.input_done = true;
                                } else {
                                    self.agg_done = true;
                                }
                                break;
                            }
                            Some(next_row) => {
                                if self.phases.current_phase().strategy != AggStrategy::Plain {
                                    let primary =
                                        &self.phases.current_phase().grouping_sets[0];
                                    let rep = self.rep_row.as_ref().ok_or_else(|| {
                                        ExecError::internal("group has no representative row")
                                    })?;
                                    if !crate::exec::row::rows_match_on(primary, &next_row, rep)
                                    {
                                        self.grp_first_row = Some(next_row);
                                        break;
                                    }
                                }
                                current = next_row;
                            }
                        }
                    }
                } else {
                    // no input: project over freshly initialized states
                    self.rep_row = None;
                }
            }

            let setno = self.projected_set as usize;
            let row = self.project_direct(setno)?;
            return Ok(Some(row));
        }
    }

    fn fetch_row(&mut self) -> ExecResult<Option<Row>> {
        self.phases
            .fetch_input_tuple(self.child.as_mut(), &self.env.cancel)
    }

    /// Does the pending row still belong to the group prefix of length
    /// `prefix_len`? Compared against the current group's first row.
    fn pending_row_matches_prefix(&self, prefix_len: usize) -> bool {
        let (Some(pending), Some(rep)) = (self.grp_first_row.as_ref(), self.rep_row.as_ref())
        else {
            return true;
        };
        let primary = &self.phases.current_phase().grouping_sets[0];
        crate::exec::row::rows_match_on(&primary[..prefix_len], pending, rep)
    }

    /// (Re)initialize transition states and per-aggregate sorters for the
    /// first `num_reset` grouping sets of the current phase.
    fn initialize_aggregates(&mut self, num_reset: usize) -> ExecResult<()> {
        let num_sets = self.phases.current_phase().grouping_sets.len();
        let num_reset = if num_reset == 0 {
            num_sets
        } else {
            num_reset.min(num_sets)
        };
        let transes = Arc::clone(&self.transes);
        for setno in 0..num_reset {
            for (trans_no, trans) in transes.iter().enumerate() {
                self.pergroups[setno][trans_no] =
                    init_trans_state(trans, &self.aggcontexts[setno]);
                if trans.has_sort() {
                    self.trans_sorters[trans_no][setno] =
                        build_sorter_slot(trans, &self.env.sorter_factory);
                }
            }
        }
        Ok(())
    }

    /// Run one input row through every transition state it contributes to:
    /// the current phase's grouping sets (`use_sorted`) and/or the hash
    /// entries most recently looked up (`use_hashed`).
    fn advance_aggregates(
        &mut self,
        row: &Row,
        use_sorted: bool,
        use_hashed: bool,
    ) -> ExecResult<()> {
        let transes = Arc::clone(&self.transes);
        let num_sets = if use_sorted {
            self.phases.current_phase().grouping_sets.len()
        } else {
            0
        };

        for (trans_no, trans) in transes.iter().enumerate() {
            if !filter_passes(trans, row) {
                continue;
            }
            let mut args: Vec<Datum> = trans.args.iter().map(|expr| expr.eval(row)).collect();
            if trans.combining {
                let partial = if args.is_empty() {
                    Datum::Null
                } else {
                    args.remove(0)
                };
                args = vec![deserialize_input(
                    trans,
                    partial,
                    &self.tuple_arena,
                    &self.tuple_arena,
                )?];
            }

            if trans.has_sort() {
                if use_sorted {
                    for setno in 0..num_sets {
                        let slot = self.trans_sorters[trans_no][setno]
                            .as_mut()
                            .ok_or_else(|| {
                                ExecError::internal("per-aggregate sorter was not initialized")
                            })?;
                        crate::exec::agg::invoke::put_sorter_input(trans, slot, args.clone())?;
                    }
                }
                continue;
            }

            if use_sorted {
                for setno in 0..num_sets {
                    advance_transition(
                        trans,
                        &mut self.pergroups[setno][trans_no],
                        args.clone(),
                        &self.aggcontexts[setno],
                        &self.tuple_arena,
                    )?;
                }
            }
            if use_hashed {
                for setno in 0..self.perhash.len() {
                    let Some(group_id) = self.hash_pergroup[setno] else {
                        continue;
                    };
                    let table = self.perhash[setno].table.as_mut().ok_or_else(|| {
                        ExecError::internal("hash table missing for grouping set")
                    })?;
                    advance_transition(
                        trans,
                        &mut table.states_mut(group_id)[trans_no],
                        args.clone(),
                        &self.hash_arena,
                        &self.tuple_arena,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Finalize and project one output row for grouping set `setno` of the
    /// current sorted phase.
    fn project_direct(&mut self, setno: usize) -> ExecResult<Row> {
        // drain DISTINCT/ORDER BY buffers into the states first
        let transes = Arc::clone(&self.transes);
        if !self.plan.split.combining() {
            for (trans_no, trans) in transes.iter().enumerate() {
                if !trans.has_sort() {
                    continue;
                }
                if let Some(mut slot) = self.trans_sorters[trans_no][setno].take() {
                    drain_ordered(
                        trans,
                        &mut slot,
                        &mut self.pergroups[setno][trans_no],
                        &self.aggcontexts[setno],
                        &self.tuple_arena,
                        &self.env.cancel,
                    )?;
                }
            }
        }

        let empty_rep;
        let rep = match self.rep_row.as_ref() {
            Some(rep) => rep,
            None => {
                empty_rep = vec![Datum::Null; self.plan.input_width];
                &empty_rep
            }
        };
        let grouped = self.phases.current_phase().grouping_sets[setno].clone();
        project_output(
            &self.aggs,
            &self.transes,
            &self.pergroups[setno],
            rep,
            &grouped,
            self.plan.input_width,
            self.plan.split.skip_final(),
            &self.aggcontexts[setno],
            &self.tuple_arena,
        )
    }

    // ---- hashed path --------------------------------------------------

    /// Drop all hash tables and rebuild: every hashed set initially, or just
    /// one set when replaying a spill batch.
    fn rebuild_hash_tables(
        &mut self,
        only_set: Option<usize>,
        ngroups_estimate: u64,
    ) -> ExecResult<()> {
        for set in &mut self.perhash {
            set.table = None;
            set.iter_pos = 0;
        }
        self.hash_arena.reset();
        self.hash_ngroups_current = 0;
        self.hash_no_new_groups = false;

        let ntables = if only_set.is_some() {
            1
        } else {
            self.perhash.len().max(1)
        };
        let memory = self.env.work_mem / ntables;
        let entry_size = self.hashentrysize.max(1.0) as usize;
        for setno in 0..self.perhash.len() {
            if let Some(only) = only_set {
                if only != setno {
                    continue;
                }
            }
            let estimate = if ngroups_estimate > 0 {
                ngroups_estimate
            } else {
                self.perhash[setno].num_groups
            };
            self.perhash[setno].table = Some(crate::exec::agg::group_table::GroupTable::new(
                estimate,
                memory,
                entry_size,
                Arc::clone(&self.hash_arena),
            ));
        }
        Ok(())
    }

    /// Hashed prologue: drain the entire child, building tables and spilling
    /// overflow, then switch to enumeration.
    fn fill_hash_table(&mut self) -> ExecResult<()> {
        loop {
            let Some(row) = self.fetch_row()? else {
                break;
            };
            self.lookup_hash_entries(&row)?;
            self.advance_aggregates(&row, false, true)?;
            self.tuple_arena.reset();
        }
        self.finish_initial_spills()?;
        self.table_filled = true;
        self.current_hash_set = 0;
        for set in &mut self.perhash {
            set.iter_pos = 0;
        }
        Ok(())
    }

    /// Find or create the hash entry of `row` in every hashed grouping set,
    /// leaving per-set group ids in `hash_pergroup`. A `None` slot means the
    /// row was spilled for that set.
    fn lookup_hash_entries(&mut self, row: &Row) -> ExecResult<()> {
        let transes = Arc::clone(&self.transes);
        let hash_arena = Arc::clone(&self.hash_arena);
        for setno in 0..self.perhash.len() {
            let hash = hash_row_columns(HASH_SEED, row, &self.perhash[setno].columns);
            let lookup = {
                let set = &mut self.perhash[setno];
                let columns = set.columns.clone();
                let table = set
                    .table
                    .as_mut()
                    .ok_or_else(|| ExecError::internal("hash table missing for grouping set"))?;
                table.lookup_or_insert(row, &columns, hash, || {
                    init_group_states(&transes, &hash_arena)
                })
            };
            match lookup {
                Some(lookup) => {
                    if lookup.is_new {
                        self.note_new_hash_group();
                    }
                    self.hash_pergroup[setno] = Some(lookup.group_id);
                }
                None => {
                    self.hash_pergroup[setno] = None;
                    self.spill_input_row(setno, hash, row)?;
                }
            }
        }
        Ok(())
    }

    /// Memory watermark check after a fresh hash entry. Tripping it flips
    /// every table into lookup-only mode for the rest of this pass.
    fn note_new_hash_group(&mut self) {
        self.hash_ngroups_current += 1;
        let mem = self.hash_arena.allocated_bytes();
        if mem > self.metrics.hash_mem_peak {
            self.metrics.hash_mem_peak = mem;
        }
        if self.env.hashagg_mem_overflow || self.batch_must_fit || self.hash_no_new_groups {
            return;
        }
        if mem as u64 > self.hash_mem_limit as u64
            || self.hash_ngroups_current > self.hash_ngroups_limit
        {
            self.hash_no_new_groups = true;
            for set in &mut self.perhash {
                if let Some(table) = set.table.as_mut() {
                    table.set_lookup_only();
                }
            }
            if !self.metrics.hash_spilled {
                self.metrics.hash_spilled = true;
            }
            debug!(
                groups = self.hash_ngroups_current,
                mem_bytes = mem,
                "hash aggregation exceeded its memory budget, spilling new groups"
            );
        }
    }

    /// Route an input row whose group is not in memory to the grouping set's
    /// spill partitions, creating them on first use.
    fn spill_input_row(&mut self, setno: usize, hash: u32, row: &Row) -> ExecResult<()> {
        let nsets = self.perhash.len();
        if self.hash_spills.is_none() {
            self.hash_spills = Some((0..nsets).map(|_| None).collect());
        }
        let spills = self.hash_spills.as_mut().ok_or_else(|| {
            ExecError::internal("spill state missing while routing overflow")
        })?;
        if spills[setno].is_none() {
            let pool: SharedTapePool = Arc::new(Mutex::new(TapePool::create(
                &self.env.spill_dir,
                0,
            )?));
            self.spill_pools.push(Arc::clone(&pool));
            let spill = SpillPartitionSet::new(
                pool,
                0,
                self.perhash[setno].num_groups.max(1),
                self.hashentrysize,
                self.env.work_mem,
            )?;
            debug!(
                setno,
                partitions = spill.npartitions(),
                "initialized spill partitions for grouping set"
            );
            spills[setno] = Some(spill);
        }
        let spill = spills[setno].as_mut().ok_or_else(|| {
            ExecError::internal("spill partitions missing for grouping set")
        })?;
        let written = spill.write_row(0, hash, row)?;
        self.metrics.hash_disk_used += written;
        Ok(())
    }

    /// Turn this pass's spill partitions into queued batches.
    fn finish_initial_spills(&mut self) -> ExecResult<()> {
        let Some(spills) = self.hash_spills.take() else {
            return Ok(());
        };
        if self.hash_ngroups_current > 0 {
            self.hashentrysize =
                self.hash_arena.allocated_bytes() as f64 / self.hash_ngroups_current as f64;
        }
        for (setno, spill) in spills.into_iter().enumerate() {
            if let Some(spill) = spill {
                let queued = spill.finish(setno, 0, &mut self.batches)?;
                self.metrics.hash_batches_used += queued as u64;
            }
        }
        Ok(())
    }

    /// Enumerate in-memory groups; when they run dry, replay one spill batch
    /// and continue. Ends only when no batches remain.
    fn retrieve_hash_table(&mut self) -> ExecResult<Option<Row>> {
        loop {
            if let Some(row) = self.retrieve_hash_in_memory()? {
                return Ok(Some(row));
            }
            if !self.refill_hash_table()? {
                self.agg_done = true;
                return Ok(None);
            }
        }
    }

    fn retrieve_hash_in_memory(&mut self) -> ExecResult<Option<Row>> {
        loop {
            self.env.cancel.check()?;
            if self.current_hash_set >= self.perhash.len() {
                return Ok(None);
            }
            let setno = self.current_hash_set;
            let (pos, exhausted) = {
                let set = &self.perhash[setno];
                match set.table.as_ref() {
                    None => (0, true),
                    Some(table) => (set.iter_pos, set.iter_pos >= table.ngroups()),
                }
            };
            if exhausted {
                self.current_hash_set += 1;
                continue;
            }
            self.perhash[setno].iter_pos += 1;

            let set = &self.perhash[setno];
            let table = set
                .table
                .as_ref()
                .ok_or_else(|| ExecError::internal("hash table missing during drain"))?;
            let entry = table.entry(pos);

            let mut rep = vec![Datum::Null; self.plan.input_width];
            for (idx, &col) in set.columns.iter().enumerate() {
                rep[col] = entry.key[idx].clone();
            }
            let row = project_output(
                &self.aggs,
                &self.transes,
                &entry.states,
                &rep,
                &set.columns,
                self.plan.input_width,
                self.plan.split.skip_final(),
                &self.hash_arena,
                &self.tuple_arena,
            )?;
            return Ok(Some(row));
        }
    }

    /// Rebuild one table for the next spill batch's grouping set and replay
    /// its tape; rows that still do not fit spill into child batches on the
    /// same tape pool.
    fn refill_hash_table(&mut self) -> ExecResult<bool> {
        let Some(mut batch) = self.batches.pop_front() else {
            return Ok(false);
        };
        debug!(
            setno = batch.setno,
            tuples = batch.input_tuples,
            bits = batch.input_bits,
            remaining = self.batches.len(),
            "replaying spill batch"
        );

        for slot in &mut self.hash_pergroup {
            *slot = None;
        }
        self.rebuild_hash_tables(Some(batch.setno), batch.input_tuples)?;
        // with all 32 hash bits consumed, re-partitioning cannot separate
        // these tuples any further
        self.batch_must_fit = batch.input_bits >= 32;

        let transes = Arc::clone(&self.transes);
        let hash_arena = Arc::clone(&self.hash_arena);
        loop {
            self.env.cancel.check()?;
            let Some((hash, row)) = batch.read_next()? else {
                break;
            };

            let lookup = {
                let set = &mut self.perhash[batch.setno];
                let columns = set.columns.clone();
                let table = set
                    .table
                    .as_mut()
                    .ok_or_else(|| ExecError::internal("hash table missing for batch replay"))?;
                table.lookup_or_insert(&row, &columns, hash, || {
                    init_group_states(&transes, &hash_arena)
                })
            };
            match lookup {
                Some(lookup) => {
                    if lookup.is_new {
                        self.note_new_hash_group();
                    }
                    self.hash_pergroup[batch.setno] = Some(lookup.group_id);
                }
                None => {
                    self.hash_pergroup[batch.setno] = None;
                    if batch.spill.is_none() {
                        // estimate the batch's groups as its tuple count;
                        // overestimating is the safe direction here
                        batch.spill = Some(SpillPartitionSet::new(
                            Arc::clone(&batch.pool),
                            batch.input_bits,
                            batch.input_tuples,
                            self.hashentrysize,
                            self.env.work_mem,
                        )?);
                    }
                    let spill = batch.spill.as_mut().ok_or_else(|| {
                        ExecError::internal("spill partitions missing for batch replay")
                    })?;
                    // the shared tape pool grows in place; re-spilled bytes
                    // are not added to disk telemetry
                    spill.write_row(batch.input_bits, hash, &row)?;
                }
            }

            self.advance_aggregates(&row, false, true)?;
            self.tuple_arena.reset();
        }

        if self.hash_ngroups_current > 0 {
            self.hashentrysize =
                self.hash_arena.allocated_bytes() as f64 / self.hash_ngroups_current as f64;
        }
        if let Some(spill) = batch.spill.take() {
            let queued = spill.finish(batch.setno, batch.input_bits, &mut self.batches)?;
            self.metrics.hash_batches_used += queued as u64;
        }

        self.current_hash_set = 0;
        for set in &mut self.perhash {
            set.iter_pos = 0;
        }
        Ok(true)
    }

    fn release_spill_state(&mut self) {
        self.hash_spills = None;
        self.batches.clear();
        // dropping the pools unlinks their tape files
        self.spill_pools.clear();
        self.hash_no_new_groups = false;
        self.batch_must_fit = false;
        self.hash_ngroups_current = 0;
    }
}

impl Drop for AggDriver {
    fn drop(&mut self) {
        self.end();
    }
}

fn validate_plan_shape(plan: &AggPlan) -> ExecResult<()> {
    match plan.strategy {
        AggStrategy::Plain => {
            if !plan.hashed_sets.is_empty()
                || plan.sorted_phases.len() != 1
                || plan.sorted_phases[0]
                    .grouping_sets
                    .iter()
                    .any(|s| !s.columns.is_empty())
            {
                return Err(ExecError::internal(
                    "plain aggregation takes exactly one phase with empty grouping sets",
                ));
            }
        }
        AggStrategy::Sorted => {
            if !plan.hashed_sets.is_empty() || plan.sorted_phases.is_empty() {
                return Err(ExecError::internal(
                    "sorted aggregation takes sorted phases and no hashed sets",
                ));
            }
        }
        AggStrategy::Hashed => {
            if plan.hashed_sets.is_empty() || !plan.sorted_phases.is_empty() {
                return Err(ExecError::internal(
                    "hashed aggregation takes hashed sets and no sorted phases",
                ));
            }
        }
        AggStrategy::Mixed => {
            if plan.hashed_sets.is_empty() || plan.sorted_phases.is_empty() {
                return Err(ExecError::internal(
                    "mixed aggregation needs both hashed sets and sorted phases",
                ));
            }
        }
    }
    if plan.aggs.is_empty() && plan.hashed_sets.is_empty() && plan.sorted_phases.is_empty() {
        return Err(ExecError::internal("aggregation node aggregates nothing"));
    }
    Ok(())
}

/// Fixed per-entry footprint: table entry, states, plus each transition's
/// declared growth hint.
fn base_entry_size(transes: &[TransDesc]) -> f64 {
    let fixed = std::mem::size_of::<crate::exec::agg::group_table::GroupEntry>()
        + transes.len() * std::mem::size_of::<GroupTransState>()
        + 16;
    let hinted: usize = transes.iter().map(|t| t.trans_space).sum();
    (fixed + hinted) as f64
}

/// Build one output row: grouped columns (NULL where the current grouping
/// set does not include them) followed by one result per aggregate call.
#[allow(clippy::too_many_arguments)]
fn project_output(
    aggs: &[AggDesc],
    transes: &[TransDesc],
    states: &[GroupTransState],
    rep_row: &Row,
    grouped_columns: &[usize],
    input_width: usize,
    skip_final: bool,
    set_arena: &Arc<Arena>,
    tuple_arena: &Arc<Arena>,
) -> ExecResult<Row> {
    let mut out = Vec::with_capacity(input_width + aggs.len());
    for col in 0..input_width {
        if grouped_columns.contains(&col) {
            out.push(rep_row.get(col).cloned().unwrap_or(Datum::Null));
        } else {
            out.push(Datum::Null);
        }
    }
    for agg in aggs {
        if let Some(src) = agg.shared_result_of {
            let value = out[input_width + src].clone();
            out.push(value);
            continue;
        }
        let trans = &transes[agg.trans_no];
        let state = &states[agg.trans_no];
        let value = if skip_final {
            finalize_partial(trans, state, set_arena, tuple_arena)?
        } else {
            finalize_aggregate(agg, trans, state, rep_row, set_arena, tuple_arena)?
        };
        out.push(value);
    }
    Ok(out)
}

/// In-memory child for tests and embedding.
#[derive(Clone, Debug, Default)]
pub struct VecRowSource {
    rows: Vec<Row>,
    cursor: usize,
    stable: bool,
}

impl VecRowSource {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows,
            cursor: 0,
            stable: true,
        }
    }
}

impl RowSource for VecRowSource {
    fn next(&mut self) -> ExecResult<Option<Row>> {
        let row = self.rows.get(self.cursor).cloned();
        if row.is_some() {
            self.cursor += 1;
        }
        Ok(row)
    }

    fn rescan(&mut self) -> ExecResult<()> {
        self.cursor = 0;
        Ok(())
    }

    fn output_stable_across_rescan(&self) -> bool {
        self.stable
    }
}
