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
//! Plan-level description of one aggregation node, as handed to the driver
//! by the planner. The driver decodes this into runtime descriptors.

use crate::exec::row::{Datum, Row};
use crate::exec::sorter::SortSpec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggStrategy {
    /// Single group over the whole input.
    Plain,
    /// Input arrives grouped by the grouping columns.
    Sorted,
    /// Hash table per grouping set.
    Hashed,
    /// Sorted phases first, hashed grouping sets filled alongside phase 1.
    Mixed,
}

/// Which part of the transition/finalize pipeline this node performs,
/// enabling partial aggregation across plan boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitMode {
    /// Transition and finalize in one pass.
    Full,
    /// Transition only; output is the (serialized) transition state.
    Partial,
    /// Combine upstream partial states, then finalize.
    Combine,
    /// Combine upstream partial states, output re-serialized state.
    CombinePartial,
}

impl SplitMode {
    /// The transition step consumes upstream partial states via the combine
    /// function instead of raw input rows.
    pub fn combining(&self) -> bool {
        matches!(self, SplitMode::Combine | SplitMode::CombinePartial)
    }

    /// The final function is skipped and the transition state is emitted.
    pub fn skip_final(&self) -> bool {
        matches!(self, SplitMode::Partial | SplitMode::CombinePartial)
    }
}

/// Argument expression of an aggregate call. Expression compilation proper
/// is an external concern; the executor only needs column references and
/// constants. A nested aggregate node is representable so that init can
/// reject it explicitly.
#[derive(Clone, Debug, PartialEq)]
pub enum ArgExpr {
    Column(usize),
    Const(Datum),
    Aggregate(Box<AggCall>),
}

impl ArgExpr {
    /// Evaluate against one input row. Nested aggregates are rejected at
    /// driver init and cannot reach this point.
    pub fn eval(&self, row: &Row) -> Datum {
        match self {
            ArgExpr::Column(idx) => row.get(*idx).cloned().unwrap_or(Datum::Null),
            ArgExpr::Const(value) => value.clone(),
            ArgExpr::Aggregate(_) => Datum::Null,
        }
    }

    pub fn contains_aggregate(&self) -> bool {
        matches!(self, ArgExpr::Aggregate(_))
    }
}

/// One aggregate call site in the node's target list.
#[derive(Clone, Debug, PartialEq)]
pub struct AggCall {
    /// Aggregate definition looked up in the function registry.
    pub agg_oid: u32,
    /// Aggregated arguments, evaluated per input row.
    pub args: Vec<ArgExpr>,
    /// Direct arguments of an ordered-set aggregate, evaluated at finalize.
    pub direct_args: Vec<ArgExpr>,
    /// Per-aggregate ordering over `args` positions.
    pub order_by: Vec<SortSpec>,
    pub distinct: bool,
    /// Row filter; the aggregate only sees rows where this yields true.
    pub filter: Option<ArgExpr>,
    pub input_collation: u32,
    pub result_collation: u32,
    pub variadic: bool,
    /// The argument expressions contain volatile functions; disables
    /// aggregate-level sharing.
    pub volatile: bool,
}

impl AggCall {
    pub fn new(agg_oid: u32, args: Vec<ArgExpr>) -> Self {
        Self {
            agg_oid,
            args,
            direct_args: Vec::new(),
            order_by: Vec::new(),
            distinct: false,
            filter: None,
            input_collation: 0,
            result_collation: 0,
            variadic: false,
            volatile: false,
        }
    }

    pub fn with_distinct(mut self) -> Self {
        self.distinct = true;
        // DISTINCT implies ordering over all aggregated arguments
        if self.order_by.is_empty() {
            self.order_by = (0..self.args.len()).map(SortSpec::asc).collect();
        }
        self
    }

    pub fn with_order_by(mut self, order_by: Vec<SortSpec>) -> Self {
        self.order_by = order_by;
        self
    }

    pub fn with_filter(mut self, filter: ArgExpr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn has_sort(&self) -> bool {
        self.distinct || !self.order_by.is_empty()
    }
}

/// One grouping set and the planner's group-count estimate for it.
#[derive(Clone, Debug, PartialEq)]
pub struct GroupingSetPlan {
    pub columns: Vec<usize>,
    pub num_groups: u64,
}

impl GroupingSetPlan {
    pub fn new(columns: Vec<usize>, num_groups: u64) -> Self {
        Self {
            columns,
            num_groups,
        }
    }
}

/// A family of grouping sets sharing one sort prefix, processed in a single
/// pass over input sorted by `sort_order`. Sets are listed most specific
/// (longest) first.
#[derive(Clone, Debug)]
pub struct SortedPhasePlan {
    pub grouping_sets: Vec<GroupingSetPlan>,
    /// Sort required before this phase runs. `None` means the input already
    /// arrives in the right order (first sorted phase over presorted input,
    /// or plain aggregation).
    pub sort_order: Option<Vec<SortSpec>>,
}

/// The aggregation node as decoded from the planner.
#[derive(Clone, Debug)]
pub struct AggPlan {
    pub strategy: AggStrategy,
    /// Number of columns in child rows.
    pub input_width: usize,
    /// Grouping sets processed by hashing (phase 0).
    pub hashed_sets: Vec<GroupingSetPlan>,
    /// Sorted phases 1..N.
    pub sorted_phases: Vec<SortedPhasePlan>,
    pub aggs: Vec<AggCall>,
    pub split: SplitMode,
}

impl AggPlan {
    /// Plain aggregation: one group, no grouping columns.
    pub fn plain(input_width: usize, aggs: Vec<AggCall>) -> Self {
        Self {
            strategy: AggStrategy::Plain,
            input_width,
            hashed_sets: Vec::new(),
            sorted_phases: vec![SortedPhasePlan {
                grouping_sets: vec![GroupingSetPlan::new(Vec::new(), 1)],
                sort_order: None,
            }],
            aggs,
            split: SplitMode::Full,
        }
    }

    /// Sorted aggregation over presorted input with one grouping set.
    pub fn sorted(input_width: usize, group_columns: Vec<usize>, aggs: Vec<AggCall>) -> Self {
        Self {
            strategy: AggStrategy::Sorted,
            input_width,
            hashed_sets: Vec::new(),
            sorted_phases: vec![SortedPhasePlan {
                grouping_sets: vec![GroupingSetPlan::new(group_columns, 0)],
                sort_order: None,
            }],
            aggs,
            split: SplitMode::Full,
        }
    }

    /// Hashed aggregation with one grouping set.
    pub fn hashed(
        input_width: usize,
        group_columns: Vec<usize>,
        num_groups: u64,
        aggs: Vec<AggCall>,
    ) -> Self {
        Self {
            strategy: AggStrategy::Hashed,
            input_width,
            hashed_sets: vec![GroupingSetPlan::new(group_columns, num_groups)],
            sorted_phases: Vec::new(),
            aggs,
            split: SplitMode::Full,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_implies_order_over_args() {
        let call = AggCall::new(1, vec![ArgExpr::Column(0), ArgExpr::Column(1)]).with_distinct();
        assert!(call.has_sort());
        assert_eq!(call.order_by.len(), 2);
        assert_eq!(call.order_by[0].column, 0);
    }

    #[test]
    fn split_mode_flags() {
        assert!(!SplitMode::Full.skip_final());
        assert!(SplitMode::Partial.skip_final());
        assert!(!SplitMode::Partial.combining());
        assert!(SplitMode::Combine.combining());
        assert!(SplitMode::CombinePartial.skip_final());
        assert!(SplitMode::CombinePartial.combining());
    }

    #[test]
    fn arg_expr_eval() {
        let row = vec![Datum::Int(10), Datum::Text("k".into())];
        assert_eq!(ArgExpr::Column(0).eval(&row), Datum::Int(10));
        assert_eq!(ArgExpr::Column(9).eval(&row), Datum::Null);
        assert_eq!(ArgExpr::Const(Datum::Bool(true)).eval(&row), Datum::Bool(true));
    }
}
