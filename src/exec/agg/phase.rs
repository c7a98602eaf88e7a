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
//! Multi-phase state machine for grouping-set execution.
//!
//! Phase 0 always denotes hashed grouping sets (empty for purely sorted
//! plans); phases 1..N each process a family of grouping sets under one
//! sort order. Between sorted phases the machine juggles two sorters: rows
//! yielded by a non-terminal phase are duplicated into the next phase's
//! output sorter, which is promoted to the next input sorter (and actually
//! sorted) on the phase transition.

use std::sync::Arc;

use crate::common::error::{ExecError, ExecResult};
use crate::exec::agg::driver::RowSource;
use crate::exec::agg::plan::{AggPlan, AggStrategy};
use crate::exec::row::Row;
use crate::exec::sorter::{RowSorter, SortSpec, SorterFactory};
use crate::runtime::cancel::CancelToken;

/// One execution phase: which grouping sets it evaluates and under what
/// input order.
#[derive(Clone, Debug)]
pub struct ExecPhase {
    pub strategy: AggStrategy,
    /// Grouping-set column lists, most specific first.
    pub grouping_sets: Vec<Vec<usize>>,
    pub gset_lengths: Vec<usize>,
    /// Planner estimates, parallel to `grouping_sets`.
    pub num_groups: Vec<u64>,
    /// Sort this phase's input needs; `None` when the input already arrives
    /// correctly ordered.
    pub sort_order: Option<Vec<SortSpec>>,
}

pub struct PhaseMachine {
    phases: Vec<ExecPhase>,
    current: usize,
    sort_in: Option<Box<dyn RowSorter>>,
    sort_out: Option<Box<dyn RowSorter>>,
    factory: Arc<dyn SorterFactory>,
}

impl std::fmt::Debug for PhaseMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhaseMachine")
            .field("num_phases", &self.phases.len())
            .field("current", &self.current)
            .field("sort_in", &self.sort_in.is_some())
            .field("sort_out", &self.sort_out.is_some())
            .finish()
    }
}

impl PhaseMachine {
    pub fn build(plan: &AggPlan, factory: Arc<dyn SorterFactory>) -> ExecResult<Self> {
        let mut phases = Vec::with_capacity(1 + plan.sorted_phases.len());

        for set in &plan.hashed_sets {
            if set.columns.is_empty() {
                return Err(ExecError::internal(
                    "hashed grouping set must have at least one column",
                ));
            }
        }
        phases.push(ExecPhase {
            strategy: AggStrategy::Hashed,
            grouping_sets: plan.hashed_sets.iter().map(|s| s.columns.clone()).collect(),
            gset_lengths: plan.hashed_sets.iter().map(|s| s.columns.len()).collect(),
            num_groups: plan.hashed_sets.iter().map(|s| s.num_groups).collect(),
            sort_order: None,
        });

        for phase_plan in &plan.sorted_phases {
            if phase_plan.grouping_sets.is_empty() {
                return Err(ExecError::internal("sorted phase has no grouping sets"));
            }
            // every set must be a prefix of the phase's most specific set,
            // listed longest first, so boundary checks reduce to prefix
            // lengths
            let primary = &phase_plan.grouping_sets[0].columns;
            let mut prev_len = usize::MAX;
            for set in &phase_plan.grouping_sets {
                if set.columns.len() > prev_len {
                    return Err(ExecError::internal(
                        "grouping sets of a phase must be listed most specific first",
                    ));
                }
                prev_len = set.columns.len();
                if set.columns[..] != primary[..set.columns.len()] {
                    return Err(ExecError::internal(
                        "grouping sets of a phase must share a sort prefix",
                    ));
                }
            }
            let strategy = if plan.strategy == AggStrategy::Plain {
                AggStrategy::Plain
            } else {
                AggStrategy::Sorted
            };
            phases.push(ExecPhase {
                strategy,
                grouping_sets: phase_plan
                    .grouping_sets
                    .iter()
                    .map(|s| s.columns.clone())
                    .collect(),
                gset_lengths: phase_plan
                    .grouping_sets
                    .iter()
                    .map(|s| s.columns.len())
                    .collect(),
                num_groups: phase_plan
                    .grouping_sets
                    .iter()
                    .map(|s| s.num_groups)
                    .collect(),
                sort_order: phase_plan.sort_order.clone(),
            });
        }

        let mut machine = Self {
            phases,
            current: 0,
            sort_in: None,
            sort_out: None,
            factory,
        };
        let first = if plan.strategy == AggStrategy::Hashed {
            0
        } else {
            1
        };
        machine.initialize_phase(first)?;
        Ok(machine)
    }

    pub fn num_phases(&self) -> usize {
        self.phases.len()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_phase(&self) -> &ExecPhase {
        &self.phases[self.current]
    }

    pub fn phase(&self, idx: usize) -> &ExecPhase {
        &self.phases[idx]
    }

    /// Switch to `newphase`, which must be 0 or 1 (reset) or the next phase
    /// in sequence. The previous output sorter becomes the new input sorter
    /// and is sorted now; a fresh output sorter is built when yet another
    /// sorted phase follows.
    pub fn initialize_phase(&mut self, newphase: usize) -> ExecResult<()> {
        if newphase > 1 && newphase != self.current + 1 {
            return Err(ExecError::internal(format!(
                "phase transition from {} to {newphase} is not adjacent",
                self.current
            )));
        }
        if newphase >= self.phases.len() {
            return Err(ExecError::internal(format!(
                "phase {newphase} out of range ({})",
                self.phases.len()
            )));
        }

        // done with whatever input sorter was in use
        if let Some(mut sorter) = self.sort_in.take() {
            sorter.end();
        }

        if newphase <= 1 {
            if let Some(mut sorter) = self.sort_out.take() {
                sorter.end();
            }
        } else {
            let mut promoted = self.sort_out.take().ok_or_else(|| {
                ExecError::internal("no staged sorter feeding the next sorted phase")
            })?;
            promoted.perform_sort()?;
            self.sort_in = Some(promoted);
        }

        if newphase > 0 && newphase < self.phases.len() - 1 {
            let next_order = self.phases[newphase + 1]
                .sort_order
                .clone()
                .ok_or_else(|| {
                    ExecError::internal("sorted phase after the first must declare a sort order")
                })?;
            self.sort_out = Some(self.factory.new_row_sorter(next_order));
        }

        self.current = newphase;
        Ok(())
    }

    /// Pull one row from the previous phase's sorter or the child, copying
    /// it into the next phase's sorter as a side effect.
    pub fn fetch_input_tuple(
        &mut self,
        child: &mut dyn RowSource,
        cancel: &CancelToken,
    ) -> ExecResult<Option<Row>> {
        cancel.check()?;
        let row = match self.sort_in.as_mut() {
            Some(sorter) => sorter.next()?,
            None => child.next()?,
        };
        if let (Some(row), Some(out)) = (&row, self.sort_out.as_mut()) {
            out.put(row.clone())?;
        }
        Ok(row)
    }

    /// Drop both sorters, e.g. on rescan.
    pub fn release_sorters(&mut self) {
        if let Some(mut sorter) = self.sort_in.take() {
            sorter.end();
        }
        if let Some(mut sorter) = self.sort_out.take() {
            sorter.end();
        }
    }
}
