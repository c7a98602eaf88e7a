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
//! Runtime descriptors the driver works against: one `TransDesc` per unique
//! transition state, one `AggDesc` per aggregate call site, and the
//! per-group state cell both point at.

use std::sync::Arc;

use crate::exec::agg::functions::{AggFunctionDef, FunctionHandle};
use crate::exec::agg::plan::{AggCall, ArgExpr};
use crate::exec::row::{Datum, DatumType};
use crate::exec::sorter::SortSpec;
use crate::runtime::arena::Arena;

/// Static description of one transition state: the function that advances
/// it, optional serialize/deserialize support, and the inputs it consumes.
/// Multiple aggregate calls may share one of these (see the share pass).
#[derive(Clone, Debug)]
pub struct TransDesc {
    /// Aggregate the state was first created for; reported through the
    /// support API as the call node of shared states.
    pub first_call: AggCall,
    pub trans_fn: Arc<FunctionHandle>,
    pub serial_fn: Option<Arc<FunctionHandle>>,
    pub deserial_fn: Option<Arc<FunctionHandle>>,
    /// The transition function is really the aggregate's combine function;
    /// inputs are upstream partial states.
    pub combining: bool,
    pub args: Vec<ArgExpr>,
    pub filter: Option<ArgExpr>,
    pub order_by: Vec<SortSpec>,
    pub distinct: bool,
    pub input_collation: u32,
    pub variadic: bool,
    pub init_value: Datum,
    pub trans_type: Option<DatumType>,
    pub trans_internal: bool,
    /// Number of arguments the strictness check applies to.
    pub num_trans_inputs: usize,
    /// Planner hint for per-group growth, used in hash entry sizing.
    pub trans_space: usize,
    /// Set when more than one call site reads this state.
    pub shared: bool,
}

impl TransDesc {
    pub fn has_sort(&self) -> bool {
        self.distinct || !self.order_by.is_empty()
    }
}

/// One aggregate call site bound to its transition state and finalization.
#[derive(Clone, Debug)]
pub struct AggDesc {
    pub call: AggCall,
    pub def: Arc<AggFunctionDef>,
    /// Index into the driver's transition state array.
    pub trans_no: usize,
    pub final_fn: Option<Arc<FunctionHandle>>,
    /// This call is identical to an earlier one; its result is copied from
    /// that aggregate instead of being finalized again.
    pub shared_result_of: Option<usize>,
}

/// Transition state for one (grouping set, transition, group) combination.
///
/// `no_trans_value` is set while a strict transition function with a NULL
/// initial value is still waiting for the first non-NULL input to adopt.
#[derive(Clone, Debug)]
pub struct GroupTransState {
    pub value: Datum,
    pub no_trans_value: bool,
}

impl GroupTransState {
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }
}

/// (Re)initialize one transition state at group start, accounting any
/// initial heap value to the grouping-set arena.
pub fn init_trans_state(trans: &TransDesc, arena: &Arc<Arena>) -> GroupTransState {
    let value = trans.init_value.clone();
    arena.adopt(value.heap_size());
    let is_null = value.is_null();
    GroupTransState {
        value,
        no_trans_value: is_null,
    }
}

/// Per-group states for every transition, in `trans_no` order.
pub fn init_group_states(transes: &[TransDesc], arena: &Arc<Arena>) -> Vec<GroupTransState> {
    transes
        .iter()
        .map(|trans| init_trans_state(trans, arena))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::agg::functions::{FunctionRegistry, builtin};
    use crate::exec::agg::plan::AggPlan;
    use crate::exec::agg::share::build_descriptors;

    fn transes_for(aggs: Vec<AggCall>) -> Vec<TransDesc> {
        let registry = FunctionRegistry::builtin();
        let plan = AggPlan::plain(1, aggs);
        let (_aggs, transes) = build_descriptors(&plan, &registry).unwrap();
        transes
    }

    #[test]
    fn null_init_sets_no_trans_value() {
        let transes = transes_for(vec![AggCall::new(
            builtin::AGG_MIN,
            vec![ArgExpr::Column(0)],
        )]);
        let arena = Arena::new("set");
        let state = init_trans_state(&transes[0], &arena);
        assert!(state.is_null());
        assert!(state.no_trans_value);
    }

    #[test]
    fn non_null_init_is_adopted_into_arena() {
        let transes = transes_for(vec![AggCall::new(
            builtin::AGG_AVG_INT,
            vec![ArgExpr::Column(0)],
        )]);
        let arena = Arena::new("set");
        let state = init_trans_state(&transes[0], &arena);
        assert!(!state.is_null());
        assert!(!state.no_trans_value);
        assert!(arena.allocated_bytes() > 0);
    }
}
