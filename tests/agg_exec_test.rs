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
//! End-to-end tests for the aggregation driver: plain, sorted, grouping
//! sets, mixed strategies, aggregate-level DISTINCT/ORDER BY, split modes
//! and the support API surface.

use std::sync::Arc;

use siltstone::common::error::ExecErrorKind;
use siltstone::exec::agg::driver::{AggDriver, ExecEnv, VecRowSource};
use siltstone::exec::agg::functions::{
    AggFunctionDef, AggKind, FinalModify, FunctionHandle, FunctionRegistry, builtin,
};
use siltstone::exec::agg::plan::{
    AggCall, AggPlan, AggStrategy, ArgExpr, GroupingSetPlan, SortedPhasePlan, SplitMode,
};
use siltstone::exec::row::{Datum, DatumType, Row};
use siltstone::exec::sorter::SortSpec;
use siltstone::runtime::cancel::CancelToken;

fn test_env() -> ExecEnv {
    let dir = std::env::temp_dir();
    ExecEnv::from_config(Arc::new(FunctionRegistry::builtin())).with_spill_dir(dir)
}

fn run_plan(plan: AggPlan, env: ExecEnv, rows: Vec<Row>) -> Vec<Row> {
    let mut driver =
        AggDriver::init(plan, env, Box::new(VecRowSource::new(rows))).expect("driver init");
    let mut out = Vec::new();
    while let Some(row) = driver.next().expect("driver next") {
        out.push(row);
    }
    out
}

fn int_rows(values: &[i64]) -> Vec<Row> {
    values.iter().map(|&v| vec![Datum::Int(v)]).collect()
}

fn sorted_multiset(rows: &[Row]) -> Vec<String> {
    let mut out: Vec<String> = rows.iter().map(|r| format!("{r:?}")).collect();
    out.sort();
    out
}

#[test]
fn plain_count_over_three_rows() {
    let plan = AggPlan::plain(1, vec![AggCall::new(builtin::AGG_COUNT_STAR, vec![])]);
    let out = run_plan(plan, test_env(), int_rows(&[1, 2, 3]));
    assert_eq!(out.len(), 1);
    assert_eq!(out[0], vec![Datum::Null, Datum::Int(3)]);
}

#[test]
fn plain_count_over_empty_input_is_zero() {
    let plan = AggPlan::plain(1, vec![AggCall::new(builtin::AGG_COUNT_STAR, vec![])]);
    let out = run_plan(plan, test_env(), vec![]);
    assert_eq!(out, vec![vec![Datum::Null, Datum::Int(0)]]);
}

#[test]
fn sorted_sum_per_group() {
    let plan = AggPlan::sorted(
        2,
        vec![0],
        vec![AggCall::new(builtin::AGG_SUM_INT, vec![ArgExpr::Column(1)])],
    );
    let rows = vec![
        vec![Datum::Int(1), Datum::Int(10)],
        vec![Datum::Int(1), Datum::Int(20)],
        vec![Datum::Int(2), Datum::Int(30)],
    ];
    let out = run_plan(plan, test_env(), rows);
    assert_eq!(
        out,
        vec![
            vec![Datum::Int(1), Datum::Null, Datum::Int(30)],
            vec![Datum::Int(2), Datum::Null, Datum::Int(30)],
        ]
    );
}

#[test]
fn sorted_grouping_over_empty_input_yields_no_rows() {
    let plan = AggPlan::sorted(
        2,
        vec![0],
        vec![AggCall::new(builtin::AGG_SUM_INT, vec![ArgExpr::Column(1)])],
    );
    let out = run_plan(plan, test_env(), vec![]);
    assert!(out.is_empty());
}

#[test]
fn strict_min_skips_nulls_and_adopts_first_value() {
    let plan = AggPlan::plain(
        1,
        vec![AggCall::new(builtin::AGG_MIN, vec![ArgExpr::Column(0)])],
    );
    let rows = vec![
        vec![Datum::Null],
        vec![Datum::Int(5)],
        vec![Datum::Int(3)],
        vec![Datum::Null],
        vec![Datum::Int(7)],
    ];
    let out = run_plan(plan, test_env(), rows);
    assert_eq!(out, vec![vec![Datum::Null, Datum::Int(3)]]);
}

#[test]
fn strict_min_over_all_null_group_is_null() {
    let plan = AggPlan::plain(
        1,
        vec![AggCall::new(builtin::AGG_MIN, vec![ArgExpr::Column(0)])],
    );
    let out = run_plan(plan, test_env(), vec![vec![Datum::Null], vec![Datum::Null]]);
    assert_eq!(out, vec![vec![Datum::Null, Datum::Null]]);
}

#[test]
fn distinct_count_and_sum() {
    let plan = AggPlan::plain(
        1,
        vec![
            AggCall::new(builtin::AGG_COUNT, vec![ArgExpr::Column(0)]).with_distinct(),
            AggCall::new(builtin::AGG_SUM_INT, vec![ArgExpr::Column(0)]).with_distinct(),
        ],
    );
    let out = run_plan(plan, test_env(), int_rows(&[1, 1, 2, 2, 3]));
    assert_eq!(out, vec![vec![Datum::Null, Datum::Int(3), Datum::Int(6)]]);
}

#[test]
fn order_by_aggregate_collects_in_requested_order() {
    let call = AggCall::new(builtin::AGG_ARRAY_COLLECT, vec![ArgExpr::Column(0)]).with_order_by(
        vec![SortSpec {
            column: 0,
            descending: true,
            nulls_first: false,
        }],
    );
    let plan = AggPlan::plain(1, vec![call]);
    let out = run_plan(plan, test_env(), int_rows(&[2, 9, 4]));
    assert_eq!(
        out[0][1],
        Datum::List(vec![Datum::Int(9), Datum::Int(4), Datum::Int(2)])
    );
}

fn rollup_rows() -> Vec<Row> {
    vec![
        vec![Datum::Text("a1".into()), Datum::Text("b1".into())],
        vec![Datum::Text("a1".into()), Datum::Text("b2".into())],
        vec![Datum::Text("a2".into()), Datum::Text("b1".into())],
    ]
}

fn rollup_expected() -> Vec<Row> {
    vec![
        vec![Datum::Text("a1".into()), Datum::Text("b1".into()), Datum::Int(1)],
        vec![Datum::Text("a1".into()), Datum::Text("b2".into()), Datum::Int(1)],
        vec![Datum::Text("a2".into()), Datum::Text("b1".into()), Datum::Int(1)],
        vec![Datum::Text("a1".into()), Datum::Null, Datum::Int(2)],
        vec![Datum::Text("a2".into()), Datum::Null, Datum::Int(1)],
        vec![Datum::Null, Datum::Null, Datum::Int(3)],
    ]
}

#[test]
fn rollup_grouping_sets_sorted() {
    let plan = AggPlan {
        strategy: AggStrategy::Sorted,
        input_width: 2,
        hashed_sets: Vec::new(),
        sorted_phases: vec![SortedPhasePlan {
            grouping_sets: vec![
                GroupingSetPlan::new(vec![0, 1], 4),
                GroupingSetPlan::new(vec![0], 2),
                GroupingSetPlan::new(vec![], 1),
            ],
            sort_order: None,
        }],
        aggs: vec![AggCall::new(builtin::AGG_COUNT_STAR, vec![])],
        split: SplitMode::Full,
    };
    let out = run_plan(plan, test_env(), rollup_rows());
    assert_eq!(sorted_multiset(&out), sorted_multiset(&rollup_expected()));
}

#[test]
fn rollup_grouping_sets_mixed_matches_sorted() {
    // the (a,b) level is hashed while (a) and () run in the sorted phase
    let plan = AggPlan {
        strategy: AggStrategy::Mixed,
        input_width: 2,
        hashed_sets: vec![GroupingSetPlan::new(vec![0, 1], 4)],
        sorted_phases: vec![SortedPhasePlan {
            grouping_sets: vec![
                GroupingSetPlan::new(vec![0], 2),
                GroupingSetPlan::new(vec![], 1),
            ],
            sort_order: None,
        }],
        aggs: vec![AggCall::new(builtin::AGG_COUNT_STAR, vec![])],
        split: SplitMode::Full,
    };
    let out = run_plan(plan, test_env(), rollup_rows());
    assert_eq!(sorted_multiset(&out), sorted_multiset(&rollup_expected()));
}

#[test]
fn empty_grouping_set_still_projects_on_empty_input() {
    // GROUPING SETS ((a), ()): no input still yields one () row
    let plan = AggPlan {
        strategy: AggStrategy::Sorted,
        input_width: 1,
        hashed_sets: Vec::new(),
        sorted_phases: vec![SortedPhasePlan {
            grouping_sets: vec![
                GroupingSetPlan::new(vec![0], 2),
                GroupingSetPlan::new(vec![], 1),
            ],
            sort_order: None,
        }],
        aggs: vec![AggCall::new(builtin::AGG_COUNT_STAR, vec![])],
        split: SplitMode::Full,
    };
    let out = run_plan(plan, test_env(), vec![]);
    assert_eq!(out, vec![vec![Datum::Null, Datum::Int(0)]]);
}

#[test]
fn grouping_sets_row_count_matches_distinct_projections() {
    // invariant: sum over sets of |distinct projection| (plus the empty set)
    let mut rows = Vec::new();
    for a in 0..5i64 {
        for b in 0..3i64 {
            for _ in 0..(a + b + 1) {
                rows.push(vec![Datum::Int(a), Datum::Int(b)]);
            }
        }
    }
    let plan = AggPlan {
        strategy: AggStrategy::Sorted,
        input_width: 2,
        hashed_sets: Vec::new(),
        sorted_phases: vec![SortedPhasePlan {
            grouping_sets: vec![
                GroupingSetPlan::new(vec![0, 1], 15),
                GroupingSetPlan::new(vec![0], 5),
                GroupingSetPlan::new(vec![], 1),
            ],
            sort_order: None,
        }],
        aggs: vec![AggCall::new(builtin::AGG_COUNT_STAR, vec![])],
        split: SplitMode::Full,
    };
    let out = run_plan(plan, test_env(), rows);
    assert_eq!(out.len(), 15 + 5 + 1);
}

#[test]
fn hashed_matches_sorted_on_the_same_input() {
    let mut rows = Vec::new();
    for i in 0..300i64 {
        rows.push(vec![Datum::Int(i % 17), Datum::Int(i)]);
    }
    let aggs = || {
        vec![
            AggCall::new(builtin::AGG_SUM_INT, vec![ArgExpr::Column(1)]),
            AggCall::new(builtin::AGG_COUNT_STAR, vec![]),
        ]
    };

    let mut sorted_input = rows.clone();
    sorted_input.sort_by_key(|r| match r[0] {
        Datum::Int(v) => v,
        _ => 0,
    });
    let sorted_out = run_plan(
        AggPlan::sorted(2, vec![0], aggs()),
        test_env(),
        sorted_input,
    );
    let hashed_out = run_plan(AggPlan::hashed(2, vec![0], 17, aggs()), test_env(), rows);

    assert_eq!(sorted_out.len(), 17);
    assert_eq!(sorted_multiset(&sorted_out), sorted_multiset(&hashed_out));
}

#[test]
fn partial_then_combine_matches_full_pass() {
    let all: Vec<i64> = (1..=20).collect();
    let (left, right) = all.split_at(7);

    let full = run_plan(
        AggPlan::plain(
            1,
            vec![AggCall::new(builtin::AGG_AVG_INT, vec![ArgExpr::Column(0)])],
        ),
        test_env(),
        int_rows(&all),
    );

    let partial_plan = || {
        let mut plan = AggPlan::plain(
            1,
            vec![AggCall::new(builtin::AGG_AVG_INT, vec![ArgExpr::Column(0)])],
        );
        plan.split = SplitMode::Partial;
        plan
    };
    let left_out = run_plan(partial_plan(), test_env(), int_rows(left));
    let right_out = run_plan(partial_plan(), test_env(), int_rows(right));
    assert!(matches!(left_out[0][1], Datum::Bytes(_)));

    let mut combine_plan = AggPlan::plain(
        1,
        vec![AggCall::new(builtin::AGG_AVG_INT, vec![ArgExpr::Column(0)])],
    );
    combine_plan.split = SplitMode::Combine;
    let combined = run_plan(
        combine_plan,
        test_env(),
        vec![
            vec![left_out[0][1].clone()],
            vec![right_out[0][1].clone()],
        ],
    );
    assert_eq!(combined[0][1], full[0][1]);
    assert_eq!(combined[0][1], Datum::Float(10.5));
}

#[test]
fn filter_clause_gates_one_aggregate_only() {
    // count rows where flag, sum everything
    let plan = AggPlan::plain(
        2,
        vec![
            AggCall::new(builtin::AGG_COUNT_STAR, vec![]).with_filter(ArgExpr::Column(1)),
            AggCall::new(builtin::AGG_SUM_INT, vec![ArgExpr::Column(0)]),
        ],
    );
    let rows = vec![
        vec![Datum::Int(1), Datum::Bool(true)],
        vec![Datum::Int(2), Datum::Bool(false)],
        vec![Datum::Int(3), Datum::Bool(true)],
    ];
    let out = run_plan(plan, test_env(), rows);
    assert_eq!(
        out,
        vec![vec![Datum::Null, Datum::Null, Datum::Int(2), Datum::Int(6)]]
    );
}

#[test]
fn ordered_set_aggregate_uses_direct_arguments() {
    let mut registry = FunctionRegistry::builtin();
    registry.register_function(FunctionHandle::new(
        700,
        "nth_final",
        false,
        Arc::new(|_ctx, args| {
            let n = match args.get(1) {
                Some(Datum::Int(n)) => *n,
                _ => return Ok(Datum::Null),
            };
            let items = match &args[0] {
                Datum::List(items) => items.clone(),
                Datum::Expanded(handle) => handle.flatten(),
                Datum::Null => return Ok(Datum::Null),
                other => {
                    return Err(siltstone::common::error::ExecError::function(format!(
                        "malformed nth state: {}",
                        other.type_name()
                    )));
                }
            };
            Ok(items
                .get((n - 1).max(0) as usize)
                .cloned()
                .unwrap_or(Datum::Null))
        }),
    ));
    registry.register_aggregate(AggFunctionDef {
        oid: 701,
        name: "nth_value".to_string(),
        kind: AggKind::OrderedSet,
        num_direct_args: 1,
        trans_oid: builtin::FN_ARRAY_COLLECT_TRANS,
        final_oid: Some(700),
        combine_oid: None,
        serial_oid: None,
        deserial_oid: None,
        input_type: None,
        trans_type: Some(DatumType::List),
        trans_internal: false,
        init_value: Datum::Null,
        trans_space: 64,
        final_num_args: 2,
        final_modify: FinalModify::ReadOnly,
        result_type: None,
    });

    let mut call = AggCall::new(701, vec![ArgExpr::Column(0)]);
    call.direct_args = vec![ArgExpr::Const(Datum::Int(2))];
    call.order_by = vec![SortSpec::asc(0)];
    let plan = AggPlan::plain(1, vec![call]);

    let env = ExecEnv::from_config(Arc::new(registry));
    let out = run_plan(plan, env, int_rows(&[30, 10, 20]));
    // second value in ascending order
    assert_eq!(out[0][1], Datum::Int(20));
}

#[test]
fn shared_aggregate_results_are_computed_once() {
    let plan = AggPlan::plain(
        1,
        vec![
            AggCall::new(builtin::AGG_SUM_INT, vec![ArgExpr::Column(0)]),
            AggCall::new(builtin::AGG_SUM_INT, vec![ArgExpr::Column(0)]),
            AggCall::new(builtin::AGG_AVG_INT, vec![ArgExpr::Column(0)]),
        ],
    );
    let out = run_plan(plan, test_env(), int_rows(&[2, 4]));
    assert_eq!(
        out,
        vec![vec![
            Datum::Null,
            Datum::Int(6),
            Datum::Int(6),
            Datum::Float(3.0)
        ]]
    );
}

#[test]
fn acl_rejection_surfaces_at_init() {
    let mut registry = FunctionRegistry::builtin();
    registry.set_acl(Arc::new(|oid| oid != builtin::FN_AVG_ACCUM));
    let env = ExecEnv::from_config(Arc::new(registry));
    let plan = AggPlan::plain(
        1,
        vec![AggCall::new(builtin::AGG_AVG_INT, vec![ArgExpr::Column(0)])],
    );
    let err = AggDriver::init(plan, env, Box::new(VecRowSource::new(vec![]))).unwrap_err();
    assert_eq!(err.kind, ExecErrorKind::PermissionDenied);
}

#[test]
fn cancellation_interrupts_next() {
    let cancel = CancelToken::new();
    let env = test_env().with_cancel(cancel.clone());
    let plan = AggPlan::plain(1, vec![AggCall::new(builtin::AGG_COUNT_STAR, vec![])]);
    let mut driver = AggDriver::init(
        plan,
        env,
        Box::new(VecRowSource::new(int_rows(&[1, 2, 3]))),
    )
    .unwrap();
    cancel.cancel();
    let err = driver.next().unwrap_err();
    assert_eq!(err.kind, ExecErrorKind::Interrupted);
}

#[test]
fn rescan_replays_the_aggregation() {
    let plan = AggPlan::sorted(
        2,
        vec![0],
        vec![AggCall::new(builtin::AGG_SUM_INT, vec![ArgExpr::Column(1)])],
    );
    let rows = vec![
        vec![Datum::Int(1), Datum::Int(10)],
        vec![Datum::Int(2), Datum::Int(20)],
    ];
    let mut driver = AggDriver::init(
        plan,
        test_env(),
        Box::new(VecRowSource::new(rows)),
    )
    .unwrap();
    let mut first = Vec::new();
    while let Some(row) = driver.next().unwrap() {
        first.push(row);
    }
    driver.rescan().unwrap();
    let mut second = Vec::new();
    while let Some(row) = driver.next().unwrap() {
        second.push(row);
    }
    assert_eq!(first, second);
    assert_eq!(first.len(), 2);
}

#[test]
fn rescan_reuses_a_filled_hash_table() {
    let plan = AggPlan::hashed(
        2,
        vec![0],
        8,
        vec![AggCall::new(builtin::AGG_COUNT_STAR, vec![])],
    );
    let rows: Vec<Row> = (0..40i64)
        .map(|i| vec![Datum::Int(i % 8), Datum::Int(i)])
        .collect();
    let mut driver = AggDriver::init(
        plan,
        test_env(),
        Box::new(VecRowSource::new(rows)),
    )
    .unwrap();
    let mut first = Vec::new();
    while let Some(row) = driver.next().unwrap() {
        first.push(row);
    }
    assert!(!driver.metrics().hash_spilled);
    driver.rescan().unwrap();
    let mut second = Vec::new();
    while let Some(row) = driver.next().unwrap() {
        second.push(row);
    }
    assert_eq!(sorted_multiset(&first), sorted_multiset(&second));
    assert_eq!(first.len(), 8);
}

#[test]
fn memory_accounting_is_visible_through_the_tracker() {
    let plan = AggPlan::hashed(
        2,
        vec![0],
        16,
        vec![AggCall::new(builtin::AGG_SUM_INT, vec![ArgExpr::Column(1)])],
    );
    let rows: Vec<Row> = (0..64i64)
        .map(|i| vec![Datum::Int(i % 16), Datum::Int(i)])
        .collect();
    let mut driver = AggDriver::init(
        plan,
        test_env(),
        Box::new(VecRowSource::new(rows)),
    )
    .unwrap();
    while let Some(_row) = driver.next().unwrap() {}
    assert!(driver.mem_tracker().peak() > 0);
    driver.end();
    assert_eq!(driver.mem_tracker().current(), 0);
}

#[test]
fn multi_phase_sorted_grouping_sets_resort_between_phases() {
    // GROUPING SETS ((a), (b)): two sort phases, the second re-sorted by b
    let rows = vec![
        vec![Datum::Int(1), Datum::Int(9)],
        vec![Datum::Int(1), Datum::Int(8)],
        vec![Datum::Int(2), Datum::Int(9)],
    ];
    let plan = AggPlan {
        strategy: AggStrategy::Sorted,
        input_width: 2,
        hashed_sets: Vec::new(),
        sorted_phases: vec![
            SortedPhasePlan {
                grouping_sets: vec![GroupingSetPlan::new(vec![0], 2)],
                sort_order: None,
            },
            SortedPhasePlan {
                grouping_sets: vec![GroupingSetPlan::new(vec![1], 2)],
                sort_order: Some(vec![SortSpec::asc(1)]),
            },
        ],
        aggs: vec![AggCall::new(builtin::AGG_COUNT_STAR, vec![])],
        split: SplitMode::Full,
    };
    let out = run_plan(plan, test_env(), rows);
    let expected = vec![
        vec![Datum::Int(1), Datum::Null, Datum::Int(2)],
        vec![Datum::Int(2), Datum::Null, Datum::Int(1)],
        vec![Datum::Null, Datum::Int(8), Datum::Int(1)],
        vec![Datum::Null, Datum::Int(9), Datum::Int(2)],
    ];
    assert_eq!(sorted_multiset(&out), sorted_multiset(&expected));
}
