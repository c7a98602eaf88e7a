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
//! Spill-path tests for hashed aggregation: memory-bounded execution,
//! partitioned overflow, recursive batch replay, and equivalence with the
//! unbounded path.

use std::sync::Arc;

use rand::SeedableRng;
use rand::seq::SliceRandom;
use tempfile::TempDir;

use siltstone::exec::agg::driver::{AggDriver, AggMetrics, ExecEnv, VecRowSource};
use siltstone::exec::agg::functions::{FunctionRegistry, builtin};
use siltstone::exec::agg::plan::{
    AggCall, AggPlan, AggStrategy, ArgExpr, GroupingSetPlan, SortedPhasePlan, SplitMode,
};
use siltstone::exec::row::{Datum, Row};

fn spill_env(work_mem: usize, dir: &TempDir) -> ExecEnv {
    ExecEnv::from_config(Arc::new(FunctionRegistry::builtin()))
        .with_work_mem(work_mem)
        .with_spill_dir(dir.path().to_path_buf())
}

fn run_collect(plan: AggPlan, env: ExecEnv, rows: Vec<Row>) -> (Vec<Row>, AggMetrics) {
    siltstone::siltstone_logging::init_with_level("info");
    let mut driver =
        AggDriver::init(plan, env, Box::new(VecRowSource::new(rows))).expect("driver init");
    let mut out = Vec::new();
    while let Some(row) = driver.next().expect("driver next") {
        out.push(row);
    }
    (out, driver.metrics())
}

fn sorted_multiset(rows: &[Row]) -> Vec<String> {
    let mut out: Vec<String> = rows.iter().map(|r| format!("{r:?}")).collect();
    out.sort();
    out
}

/// `n` four-column rows (i, i, i, i), shuffled deterministically.
fn wide_series(n: i64) -> Vec<Row> {
    let mut rows: Vec<Row> = (0..n)
        .map(|i| {
            vec![
                Datum::Int(i),
                Datum::Int(i),
                Datum::Int(i),
                Datum::Int(i),
            ]
        })
        .collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(42);
    rows.shuffle(&mut rng);
    rows
}

fn max_by_i2_plan() -> AggPlan {
    AggPlan::hashed(
        4,
        vec![1],
        30_000,
        vec![AggCall::new(builtin::AGG_MAX, vec![ArgExpr::Column(0)])],
    )
}

#[test]
fn hash_spill_thirty_thousand_groups() {
    let dir = TempDir::new().unwrap();
    let (out, metrics) = run_collect(
        max_by_i2_plan(),
        spill_env(96 * 1024, &dir),
        wide_series(30_000),
    );

    assert_eq!(out.len(), 30_000);
    assert!(metrics.hash_spilled);
    assert!(metrics.hash_batches_used > 0);
    assert!(metrics.hash_disk_used > 0);
    for row in &out {
        // key column survives, non-grouped columns are NULL, max(i1) == i2
        assert_eq!(row[1], row[4]);
        assert_eq!(row[0], Datum::Null);
        assert_eq!(row[2], Datum::Null);
    }

    // identical output with the caps disabled
    let dir2 = TempDir::new().unwrap();
    let (unbounded, unbounded_metrics) = run_collect(
        max_by_i2_plan(),
        spill_env(96 * 1024, &dir2).with_mem_overflow(true),
        wide_series(30_000),
    );
    assert!(!unbounded_metrics.hash_spilled);
    assert_eq!(unbounded_metrics.hash_disk_used, 0);
    assert_eq!(sorted_multiset(&out), sorted_multiset(&unbounded));
}

#[test]
fn batch_count_grows_with_input_at_fixed_memory() {
    let dir = TempDir::new().unwrap();
    let (_small_out, small) = run_collect(
        max_by_i2_plan(),
        spill_env(64 * 1024, &dir),
        wide_series(10_000),
    );
    let dir2 = TempDir::new().unwrap();
    let (_large_out, large) = run_collect(
        max_by_i2_plan(),
        spill_env(64 * 1024, &dir2),
        wide_series(30_000),
    );
    assert!(small.hash_batches_used > 0);
    assert!(large.hash_batches_used >= small.hash_batches_used);
}

#[test]
fn peak_hash_memory_stays_near_the_budget() {
    let work_mem = 64 * 1024;
    let dir = TempDir::new().unwrap();
    let (out, metrics) = run_collect(
        max_by_i2_plan(),
        spill_env(work_mem, &dir),
        wide_series(30_000),
    );
    assert_eq!(out.len(), 30_000);
    // one entry of slack beyond the configured budget
    assert!(
        metrics.hash_mem_peak <= work_mem as i64 + 8 * 1024,
        "peak {} exceeded budget {}",
        metrics.hash_mem_peak,
        work_mem
    );
}

#[test]
fn ample_memory_never_spills() {
    let dir = TempDir::new().unwrap();
    let (out, metrics) = run_collect(
        max_by_i2_plan(),
        spill_env(64 * 1024 * 1024, &dir),
        wide_series(30_000),
    );
    assert_eq!(out.len(), 30_000);
    assert!(!metrics.hash_spilled);
    assert_eq!(metrics.hash_batches_used, 0);
    assert_eq!(metrics.hash_disk_used, 0);
}

#[test]
fn by_ref_states_survive_spill_and_refill() {
    let rows: Vec<Row> = {
        let mut rows: Vec<Row> = (0..12_000i64)
            .map(|i| vec![Datum::Int(i % 3_000), Datum::Int(i)])
            .collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        rows.shuffle(&mut rng);
        rows
    };
    let plan = || {
        AggPlan::hashed(
            2,
            vec![0],
            3_000,
            vec![
                AggCall::new(builtin::AGG_AVG_INT, vec![ArgExpr::Column(1)]),
                AggCall::new(builtin::AGG_COUNT_STAR, vec![]),
            ],
        )
    };

    let dir = TempDir::new().unwrap();
    let (bounded, metrics) = run_collect(plan(), spill_env(32 * 1024, &dir), rows.clone());
    assert!(metrics.hash_spilled);

    let dir2 = TempDir::new().unwrap();
    let (unbounded, _) = run_collect(
        plan(),
        spill_env(32 * 1024, &dir2).with_mem_overflow(true),
        rows,
    );
    assert_eq!(bounded.len(), 3_000);
    assert_eq!(sorted_multiset(&bounded), sorted_multiset(&unbounded));
}

#[test]
fn multiple_hashed_grouping_sets_spill_independently() {
    // GROUPING SETS ((a), (b)), both hashed
    let rows: Vec<Row> = {
        let mut rows: Vec<Row> = (0..8_000i64)
            .map(|i| vec![Datum::Int(i % 2_000), Datum::Int(i % 1_500)])
            .collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        rows.shuffle(&mut rng);
        rows
    };
    let plan = || AggPlan {
        strategy: AggStrategy::Hashed,
        input_width: 2,
        hashed_sets: vec![
            GroupingSetPlan::new(vec![0], 2_000),
            GroupingSetPlan::new(vec![1], 1_500),
        ],
        sorted_phases: Vec::new(),
        aggs: vec![AggCall::new(builtin::AGG_COUNT_STAR, vec![])],
        split: SplitMode::Full,
    };

    let dir = TempDir::new().unwrap();
    let (bounded, metrics) = run_collect(plan(), spill_env(48 * 1024, &dir), rows.clone());
    assert!(metrics.hash_spilled);

    let dir2 = TempDir::new().unwrap();
    let (unbounded, _) = run_collect(
        plan(),
        spill_env(48 * 1024, &dir2).with_mem_overflow(true),
        rows,
    );
    assert_eq!(bounded.len(), 2_000 + 1_500);
    assert_eq!(sorted_multiset(&bounded), sorted_multiset(&unbounded));
}

#[test]
fn mixed_strategy_spills_during_the_sorted_phase() {
    // ROLLUP-style: (a,b) hashed, (a) and () sorted; input sorted by a
    let rows: Vec<Row> = (0..6_000i64)
        .map(|i| vec![Datum::Int(i / 4), Datum::Int(i % 40)])
        .collect();
    let plan = || AggPlan {
        strategy: AggStrategy::Mixed,
        input_width: 2,
        hashed_sets: vec![GroupingSetPlan::new(vec![0, 1], 6_000)],
        sorted_phases: vec![SortedPhasePlan {
            grouping_sets: vec![
                GroupingSetPlan::new(vec![0], 1_500),
                GroupingSetPlan::new(vec![], 1),
            ],
            sort_order: None,
        }],
        aggs: vec![AggCall::new(builtin::AGG_COUNT_STAR, vec![])],
        split: SplitMode::Full,
    };

    let dir = TempDir::new().unwrap();
    let (bounded, metrics) = run_collect(plan(), spill_env(48 * 1024, &dir), rows.clone());
    assert!(metrics.hash_spilled);

    let dir2 = TempDir::new().unwrap();
    let (unbounded, _) = run_collect(
        plan(),
        spill_env(48 * 1024, &dir2).with_mem_overflow(true),
        rows,
    );
    assert_eq!(sorted_multiset(&bounded), sorted_multiset(&unbounded));
}

#[test]
fn rescan_after_spill_rebuilds_from_scratch() {
    let dir = TempDir::new().unwrap();
    let plan = AggPlan::hashed(
        2,
        vec![0],
        4_000,
        vec![AggCall::new(builtin::AGG_COUNT_STAR, vec![])],
    );
    let rows: Vec<Row> = (0..8_000i64)
        .map(|i| vec![Datum::Int(i % 4_000), Datum::Int(i)])
        .collect();
    let mut driver = AggDriver::init(
        plan,
        spill_env(32 * 1024, &dir),
        Box::new(VecRowSource::new(rows)),
    )
    .unwrap();

    let mut first = Vec::new();
    while let Some(row) = driver.next().unwrap() {
        first.push(row);
    }
    assert!(driver.metrics().hash_spilled);
    assert_eq!(first.len(), 4_000);

    driver.rescan().unwrap();
    let mut second = Vec::new();
    while let Some(row) = driver.next().unwrap() {
        second.push(row);
    }
    assert_eq!(sorted_multiset(&first), sorted_multiset(&second));
}

#[test]
fn spill_tapes_are_removed_when_the_driver_ends() {
    let dir = TempDir::new().unwrap();
    {
        let plan = max_by_i2_plan();
        let mut driver = AggDriver::init(
            plan,
            spill_env(64 * 1024, &dir),
            Box::new(VecRowSource::new(wide_series(20_000))),
        )
        .unwrap();
        while let Some(_row) = driver.next().unwrap() {}
        assert!(driver.metrics().hash_spilled);
        driver.end();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
