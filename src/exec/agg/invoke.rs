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
//! Transition and finalization mechanics for one state cell.
//!
//! Everything here operates on a single `GroupTransState`: strict-function
//! short circuits, first-value adoption for NULL initial states, adopting or
//! copying by-reference results into the grouping-set arena, the
//! DISTINCT/ORDER BY buffer-and-drain path, and the finalize /
//! partial-serialize / combine variants. The driver decides *which* states a
//! row touches; this module decides *how* each one is touched.

use std::sync::Arc;

use crate::common::error::ExecResult;
use crate::exec::agg::context::AggCallContext;
use crate::exec::agg::descriptor::{AggDesc, GroupTransState, TransDesc};
use crate::exec::row::{Datum, Row};
use crate::exec::sorter::{DatumSorter, RowSorter, SortSpec, SorterFactory, compare_rows};
use crate::runtime::arena::Arena;
use crate::runtime::cancel::CancelToken;

/// Move a returned value into the grouping-set arena. A read-write expanded
/// object already owned by this arena is adopted in place; one owned by any
/// other arena is copied out into a flat value.
fn adopt_result(value: Datum, arena: &Arc<Arena>) -> Datum {
    match value {
        Datum::Expanded(handle) if handle.owner() == arena.id() => Datum::Expanded(handle),
        Datum::Expanded(handle) => Datum::List(handle.flatten()),
        other => other,
    }
}

/// Flatten expanded handles out of a value leaving the executor, so output
/// rows never reference arena-owned storage.
pub fn flatten_datum(value: Datum) -> Datum {
    match value {
        Datum::Expanded(handle) => Datum::List(handle.flatten()),
        Datum::List(items) => Datum::List(items.into_iter().map(flatten_datum).collect()),
        other => other,
    }
}

/// Advance one transition state with one row's evaluated arguments (state
/// slot excluded). In combining mode the single argument is the upstream
/// partial state and the function is the aggregate's combine function.
pub fn advance_transition(
    trans: &TransDesc,
    state: &mut GroupTransState,
    mut args: Vec<Datum>,
    set_arena: &Arc<Arena>,
    temp_arena: &Arc<Arena>,
) -> ExecResult<()> {
    if trans.trans_fn.strict {
        let checked = trans.num_trans_inputs.min(args.len());
        if args[..checked].iter().any(Datum::is_null) {
            // keep the prior state
            return Ok(());
        }
        if state.no_trans_value {
            // first non-NULL input becomes the initial state verbatim;
            // descriptor construction verified the types agree
            let first = args.swap_remove(0);
            set_arena.adopt(first.heap_size());
            state.value = adopt_result(first, set_arena);
            state.no_trans_value = false;
            return Ok(());
        }
        if state.is_null() {
            // a strict function returned NULL earlier; it stays NULL
            return Ok(());
        }
    }

    let old_heap = state.value.heap_size();
    let prior = std::mem::replace(&mut state.value, Datum::Null);
    let mut call_args = Vec::with_capacity(args.len() + 1);
    call_args.push(prior);
    call_args.append(&mut args);

    let mut ctx = AggCallContext::new(
        set_arena,
        temp_arena,
        Some(&trans.first_call),
        trans.shared,
    );
    let new_value = trans.trans_fn.call(&mut ctx, call_args)?;
    let new_value = adopt_result(new_value, set_arena);

    set_arena.forget(old_heap);
    set_arena.adopt(new_value.heap_size());
    state.value = new_value;
    state.no_trans_value = false;
    Ok(())
}

/// Convert one upstream partial input for the combine path. Strict
/// deserialize functions pass NULL through untouched.
pub fn deserialize_input(
    trans: &TransDesc,
    value: Datum,
    set_arena: &Arc<Arena>,
    temp_arena: &Arc<Arena>,
) -> ExecResult<Datum> {
    let Some(deserial_fn) = trans.deserial_fn.as_ref() else {
        return Ok(value);
    };
    if deserial_fn.strict && value.is_null() {
        return Ok(Datum::Null);
    }
    let mut ctx = AggCallContext::new(
        set_arena,
        temp_arena,
        Some(&trans.first_call),
        trans.shared,
    );
    deserial_fn.call(&mut ctx, vec![value])
}

/// Per-aggregate sort buffer: by-datum for single-argument aggregates,
/// by-row otherwise.
pub enum SorterSlot {
    Single(Box<dyn DatumSorter>),
    Multi(Box<dyn RowSorter>),
}

impl std::fmt::Debug for SorterSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SorterSlot::Single(_) => f.write_str("SorterSlot::Single"),
            SorterSlot::Multi(_) => f.write_str("SorterSlot::Multi"),
        }
    }
}

/// Fresh sort buffer for a DISTINCT/ORDER BY aggregate, `None` for plain
/// transitions.
pub fn build_sorter_slot(
    trans: &TransDesc,
    factory: &Arc<dyn SorterFactory>,
) -> Option<SorterSlot> {
    if !trans.has_sort() {
        return None;
    }
    if trans.args.len() == 1 {
        let spec = trans.order_by.first().copied().unwrap_or(SortSpec::asc(0));
        Some(SorterSlot::Single(
            factory.new_datum_sorter(spec.descending, spec.nulls_first),
        ))
    } else {
        Some(SorterSlot::Multi(
            factory.new_row_sorter(trans.order_by.clone()),
        ))
    }
}

/// Buffer one row's arguments. NULL inputs that a strict transition function
/// would ignore are not buffered at all.
pub fn put_sorter_input(
    trans: &TransDesc,
    slot: &mut SorterSlot,
    args: Vec<Datum>,
) -> ExecResult<()> {
    if trans.trans_fn.strict {
        let checked = trans.num_trans_inputs.min(args.len());
        if args[..checked].iter().any(Datum::is_null) {
            return Ok(());
        }
    }
    match slot {
        SorterSlot::Single(sorter) => {
            let mut args = args;
            sorter.put(args.swap_remove(0))
        }
        SorterSlot::Multi(sorter) => sorter.put(args),
    }
}

/// Drain a DISTINCT/ORDER BY buffer at group end, feeding the transition in
/// sorted order and collapsing adjacent duplicates when DISTINCT.
pub fn drain_ordered(
    trans: &TransDesc,
    slot: &mut SorterSlot,
    state: &mut GroupTransState,
    set_arena: &Arc<Arena>,
    temp_arena: &Arc<Arena>,
    cancel: &CancelToken,
) -> ExecResult<()> {
    match slot {
        SorterSlot::Single(sorter) => {
            sorter.perform_sort()?;
            let mut prev: Option<Datum> = None;
            while let Some(value) = sorter.next()? {
                cancel.check()?;
                if trans.distinct {
                    if let Some(prev) = prev.as_ref() {
                        // grouping equality: adjacent NULLs collapse too
                        if prev == &value {
                            continue;
                        }
                    }
                }
                advance_transition(trans, state, vec![value.clone()], set_arena, temp_arena)?;
                if trans.distinct {
                    prev = Some(value);
                }
            }
            sorter.end();
        }
        SorterSlot::Multi(sorter) => {
            sorter.perform_sort()?;
            let mut prev: Option<Row> = None;
            while let Some(row) = sorter.next()? {
                cancel.check()?;
                if trans.distinct {
                    if let Some(prev) = prev.as_ref() {
                        if compare_rows(&trans.order_by, prev, &row) == std::cmp::Ordering::Equal {
                            continue;
                        }
                    }
                }
                advance_transition(trans, state, row.clone(), set_arena, temp_arena)?;
                if trans.distinct {
                    prev = Some(row);
                }
            }
            sorter.end();
        }
    }
    Ok(())
}

/// Produce the output value of a full aggregate: evaluate direct arguments
/// into slots 1.., pass the transition value read-only as slot 0, pad unused
/// final-function arguments with NULL, and honor final-function strictness.
pub fn finalize_aggregate(
    agg: &AggDesc,
    trans: &TransDesc,
    state: &GroupTransState,
    rep_row: &Row,
    set_arena: &Arc<Arena>,
    temp_arena: &Arc<Arena>,
) -> ExecResult<Datum> {
    let direct: Vec<Datum> = agg
        .call
        .direct_args
        .iter()
        .map(|expr| expr.eval(rep_row))
        .collect();

    let Some(final_fn) = agg.final_fn.as_ref() else {
        return Ok(flatten_datum(state.value.clone()));
    };

    let mut anynull = state.is_null();
    let mut args = Vec::with_capacity(agg.def.final_num_args.max(1 + direct.len()));
    args.push(state.value.clone());
    for datum in direct {
        anynull |= datum.is_null();
        args.push(datum);
    }
    while args.len() < agg.def.final_num_args {
        args.push(Datum::Null);
        anynull = true;
    }

    if final_fn.strict && anynull {
        return Ok(Datum::Null);
    }

    let mut ctx = AggCallContext::new(set_arena, temp_arena, Some(&agg.call), trans.shared);
    let result = final_fn.call(&mut ctx, args)?;
    Ok(flatten_datum(result))
}

/// Produce the output of a partial aggregate: the raw transition value, or
/// its serialized form when a serialize function is configured.
pub fn finalize_partial(
    trans: &TransDesc,
    state: &GroupTransState,
    set_arena: &Arc<Arena>,
    temp_arena: &Arc<Arena>,
) -> ExecResult<Datum> {
    let Some(serial_fn) = trans.serial_fn.as_ref() else {
        return Ok(flatten_datum(state.value.clone()));
    };
    if serial_fn.strict && state.is_null() {
        return Ok(Datum::Null);
    }
    let mut ctx = AggCallContext::new(
        set_arena,
        temp_arena,
        Some(&trans.first_call),
        trans.shared,
    );
    let result = serial_fn.call(&mut ctx, vec![state.value.clone()])?;
    Ok(flatten_datum(result))
}

/// Evaluate an aggregate's FILTER clause for one row.
pub fn filter_passes(trans: &TransDesc, row: &Row) -> bool {
    match trans.filter.as_ref() {
        None => true,
        Some(expr) => matches!(expr.eval(row), Datum::Bool(true)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::agg::functions::{FunctionRegistry, builtin};
    use crate::exec::agg::plan::{AggCall, AggPlan, ArgExpr};
    use crate::exec::agg::share::build_descriptors;
    use crate::exec::sorter::MemSorterFactory;

    fn setup(call: AggCall) -> (Vec<AggDesc>, Vec<TransDesc>) {
        let registry = FunctionRegistry::builtin();
        let plan = AggPlan::plain(2, vec![call]);
        build_descriptors(&plan, &registry).unwrap()
    }

    fn arenas() -> (Arc<Arena>, Arc<Arena>) {
        (Arena::new("set"), Arena::new("tuple"))
    }

    #[test]
    fn strict_null_init_adopts_first_non_null() {
        let (_aggs, transes) =
            setup(AggCall::new(builtin::AGG_MIN, vec![ArgExpr::Column(0)]));
        let trans = &transes[0];
        let (set_arena, temp_arena) = arenas();
        let mut state = crate::exec::agg::descriptor::init_trans_state(trans, &set_arena);

        advance_transition(trans, &mut state, vec![Datum::Null], &set_arena, &temp_arena).unwrap();
        assert!(state.no_trans_value);

        advance_transition(trans, &mut state, vec![Datum::Int(5)], &set_arena, &temp_arena)
            .unwrap();
        assert_eq!(state.value, Datum::Int(5));
        assert!(!state.no_trans_value);

        advance_transition(trans, &mut state, vec![Datum::Int(3)], &set_arena, &temp_arena)
            .unwrap();
        advance_transition(trans, &mut state, vec![Datum::Null], &set_arena, &temp_arena).unwrap();
        advance_transition(trans, &mut state, vec![Datum::Int(7)], &set_arena, &temp_arena)
            .unwrap();
        assert_eq!(state.value, Datum::Int(3));
    }

    #[test]
    fn poisoned_null_state_stays_null() {
        // a strict function that returns NULL once keeps returning NULL
        let mut registry = FunctionRegistry::builtin();
        let mut def = registry.aggregate(builtin::AGG_SUM_INT).unwrap().as_ref().clone();
        def.oid = 800;
        def.init_value = Datum::Int(0);
        def.trans_oid = 801;
        registry.register_function(crate::exec::agg::functions::FunctionHandle::new(
            801,
            "null_once",
            true,
            Arc::new(|_ctx, _args| Ok(Datum::Null)),
        ));
        registry.register_aggregate(def);
        let plan = AggPlan::plain(1, vec![AggCall::new(800, vec![ArgExpr::Column(0)])]);
        let (_aggs, transes) = build_descriptors(&plan, &registry).unwrap();
        let (set_arena, temp_arena) = arenas();
        let mut state = crate::exec::agg::descriptor::init_trans_state(&transes[0], &set_arena);

        advance_transition(&transes[0], &mut state, vec![Datum::Int(1)], &set_arena, &temp_arena)
            .unwrap();
        assert!(state.is_null());
        advance_transition(&transes[0], &mut state, vec![Datum::Int(2)], &set_arena, &temp_arena)
            .unwrap();
        assert!(state.is_null());
    }

    #[test]
    fn distinct_single_collapses_adjacent_duplicates() {
        let (_aggs, transes) = setup(
            AggCall::new(builtin::AGG_SUM_INT, vec![ArgExpr::Column(0)]).with_distinct(),
        );
        let trans = &transes[0];
        let factory: Arc<dyn SorterFactory> = Arc::new(MemSorterFactory);
        let mut slot = build_sorter_slot(trans, &factory).unwrap();
        let (set_arena, temp_arena) = arenas();
        let mut state = crate::exec::agg::descriptor::init_trans_state(trans, &set_arena);

        for v in [1i64, 1, 2, 2, 3] {
            put_sorter_input(trans, &mut slot, vec![Datum::Int(v)]).unwrap();
        }
        drain_ordered(
            trans,
            &mut slot,
            &mut state,
            &set_arena,
            &temp_arena,
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(state.value, Datum::Int(6));
    }

    #[test]
    fn ordered_multi_arg_feeds_in_sort_order() {
        // two-argument collect ordered by the second argument descending
        let mut call = AggCall::new(
            builtin::AGG_ARRAY_COLLECT,
            vec![ArgExpr::Column(0), ArgExpr::Column(1)],
        );
        call.order_by = vec![SortSpec {
            column: 1,
            descending: true,
            nulls_first: false,
        }];
        let (_aggs, transes) = setup(call);
        let trans = &transes[0];
        let factory: Arc<dyn SorterFactory> = Arc::new(MemSorterFactory);
        let mut slot = build_sorter_slot(trans, &factory).unwrap();
        assert!(matches!(slot, SorterSlot::Multi(_)));
        let (set_arena, temp_arena) = arenas();
        let mut state = crate::exec::agg::descriptor::init_trans_state(trans, &set_arena);

        put_sorter_input(trans, &mut slot, vec![Datum::Text("lo".into()), Datum::Int(1)]).unwrap();
        put_sorter_input(trans, &mut slot, vec![Datum::Text("hi".into()), Datum::Int(9)]).unwrap();
        drain_ordered(
            trans,
            &mut slot,
            &mut state,
            &set_arena,
            &temp_arena,
            &CancelToken::new(),
        )
        .unwrap();
        // the collect transition saw the ninth-ranked row first
        let flat = flatten_datum(state.value.clone());
        assert_eq!(
            flat,
            Datum::List(vec![Datum::Text("hi".into()), Datum::Text("lo".into())])
        );
    }

    #[test]
    fn expanded_state_is_adopted_in_place() {
        let (_aggs, transes) = setup(AggCall::new(
            builtin::AGG_ARRAY_COLLECT,
            vec![ArgExpr::Column(0)],
        ));
        let trans = &transes[0];
        let (set_arena, temp_arena) = arenas();
        let mut state = crate::exec::agg::descriptor::init_trans_state(trans, &set_arena);

        advance_transition(trans, &mut state, vec![Datum::Int(1)], &set_arena, &temp_arena)
            .unwrap();
        let first_handle = match &state.value {
            Datum::Expanded(h) => Arc::as_ptr(h),
            other => panic!("expected expanded state, got {}", other.type_name()),
        };
        advance_transition(trans, &mut state, vec![Datum::Int(2)], &set_arena, &temp_arena)
            .unwrap();
        match &state.value {
            Datum::Expanded(h) => assert_eq!(Arc::as_ptr(h), first_handle),
            other => panic!("expected expanded state, got {}", other.type_name()),
        }
    }

    #[test]
    fn finalize_pads_and_respects_strictness() {
        let (aggs, transes) = setup(AggCall::new(builtin::AGG_AVG_INT, vec![ArgExpr::Column(0)]));
        let (set_arena, temp_arena) = arenas();
        let mut state = crate::exec::agg::descriptor::init_trans_state(&transes[0], &set_arena);
        for v in [10i64, 20] {
            advance_transition(&transes[0], &mut state, vec![Datum::Int(v)], &set_arena, &temp_arena)
                .unwrap();
        }
        let out = finalize_aggregate(&aggs[0], &transes[0], &state, &vec![], &set_arena, &temp_arena)
            .unwrap();
        assert_eq!(out, Datum::Float(15.0));
    }

    #[test]
    fn partial_output_serializes_when_configured() {
        let registry = FunctionRegistry::builtin();
        let mut plan = AggPlan::plain(
            1,
            vec![AggCall::new(builtin::AGG_AVG_INT, vec![ArgExpr::Column(0)])],
        );
        plan.split = crate::exec::agg::plan::SplitMode::Partial;
        let (_aggs, transes) = build_descriptors(&plan, &registry).unwrap();
        let (set_arena, temp_arena) = arenas();
        let mut state = crate::exec::agg::descriptor::init_trans_state(&transes[0], &set_arena);
        advance_transition(&transes[0], &mut state, vec![Datum::Int(4)], &set_arena, &temp_arena)
            .unwrap();
        let out = finalize_partial(&transes[0], &state, &set_arena, &temp_arena).unwrap();
        assert!(matches!(out, Datum::Bytes(_)));
    }

    #[test]
    fn combine_path_merges_partial_states() {
        let registry = FunctionRegistry::builtin();
        let mut plan = AggPlan::plain(
            1,
            vec![AggCall::new(builtin::AGG_AVG_INT, vec![ArgExpr::Column(0)])],
        );
        plan.split = crate::exec::agg::plan::SplitMode::Combine;
        let (aggs, transes) = build_descriptors(&plan, &registry).unwrap();
        let trans = &transes[0];
        assert!(trans.combining);
        let (set_arena, temp_arena) = arenas();
        let mut state = crate::exec::agg::descriptor::init_trans_state(trans, &set_arena);

        // two upstream partials arrive serialized
        for (sum, count) in [(10i64, 2i64), (20, 3)] {
            let mut bytes = Vec::new();
            bytes.extend_from_slice(&sum.to_le_bytes());
            bytes.extend_from_slice(&count.to_le_bytes());
            let partial =
                deserialize_input(trans, Datum::Bytes(bytes), &set_arena, &temp_arena).unwrap();
            advance_transition(trans, &mut state, vec![partial], &set_arena, &temp_arena).unwrap();
        }
        let out = finalize_aggregate(&aggs[0], trans, &state, &vec![], &set_arena, &temp_arena)
            .unwrap();
        assert_eq!(out, Datum::Float(6.0));
    }

    #[test]
    fn filter_gates_rows() {
        let (_aggs, transes) = setup(
            AggCall::new(builtin::AGG_COUNT_STAR, vec![]).with_filter(ArgExpr::Column(1)),
        );
        let trans = &transes[0];
        assert!(filter_passes(trans, &vec![Datum::Int(1), Datum::Bool(true)]));
        assert!(!filter_passes(trans, &vec![Datum::Int(1), Datum::Bool(false)]));
        assert!(!filter_passes(trans, &vec![Datum::Int(1), Datum::Null]));
    }
}
