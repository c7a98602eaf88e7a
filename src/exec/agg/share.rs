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
//! Descriptor construction with two-level deduplication.
//!
//! Level one: an aggregate call identical to an earlier one (same inputs,
//! ordering, filter, function, result typing, direct arguments) reuses that
//! call's result instead of computing it twice. Level two: calls that differ
//! only in finalization can still share one transition state when their
//! inputs, transition function, serialization functions and initial value
//! all match, and the final function is not allowed to scribble on the
//! state. Volatile argument expressions disable both levels.

use std::sync::Arc;

use crate::common::error::{ExecError, ExecResult};
use crate::exec::agg::descriptor::{AggDesc, TransDesc};
use crate::exec::agg::functions::{
    AggFunctionDef, AggKind, FinalModify, FunctionHandle, FunctionRegistry,
};
use crate::exec::agg::plan::{AggCall, AggPlan, ArgExpr};

/// Decode every aggregate call of the plan into descriptors, sharing result
/// slots and transition states where permitted.
pub fn build_descriptors(
    plan: &AggPlan,
    registry: &FunctionRegistry,
) -> ExecResult<(Vec<AggDesc>, Vec<TransDesc>)> {
    let mut aggs: Vec<AggDesc> = Vec::with_capacity(plan.aggs.len());
    let mut transes: Vec<TransDesc> = Vec::new();
    let has_hashing = !plan.hashed_sets.is_empty();

    for call in &plan.aggs {
        reject_nested_aggregates(call)?;

        let def = registry.aggregate(call.agg_oid)?;
        validate_call(call, &def, plan, has_hashing)?;

        // identical call already initialized: share its result slot
        if let Some(peer) = find_compatible_agg(&aggs, call) {
            let trans_no = aggs[peer].trans_no;
            transes[trans_no].shared = true;
            aggs.push(AggDesc {
                call: call.clone(),
                def,
                trans_no,
                final_fn: aggs[peer].final_fn.clone(),
                shared_result_of: Some(peer),
            });
            continue;
        }

        let trans_fn = lookup_trans_fn(&def, plan, registry)?;
        let serial_fn = match (plan.split.skip_final(), def.serial_oid) {
            (true, Some(oid)) => Some(registry.function(oid)?),
            _ => None,
        };
        let deserial_fn = match (plan.split.combining(), def.deserial_oid) {
            (true, Some(oid)) => Some(registry.function(oid)?),
            _ => None,
        };
        let final_fn = match (plan.split.skip_final(), def.final_oid) {
            (false, Some(oid)) => Some(registry.function(oid)?),
            _ => None,
        };

        check_strict_init(call, &def, &trans_fn, plan)?;

        let trans_no = match find_compatible_trans(
            &transes,
            call,
            &def,
            &trans_fn,
            plan,
        ) {
            Some(no) => {
                transes[no].shared = true;
                no
            }
            None => {
                transes.push(TransDesc {
                    first_call: call.clone(),
                    trans_fn,
                    serial_fn,
                    deserial_fn,
                    combining: plan.split.combining(),
                    args: call.args.clone(),
                    filter: call.filter.clone(),
                    order_by: call.order_by.clone(),
                    distinct: call.distinct,
                    input_collation: call.input_collation,
                    variadic: call.variadic,
                    init_value: def.init_value.clone(),
                    trans_type: def.trans_type,
                    trans_internal: def.trans_internal,
                    num_trans_inputs: if plan.split.combining() {
                        1
                    } else {
                        call.args.len()
                    },
                    trans_space: def.trans_space,
                    shared: false,
                });
                transes.len() - 1
            }
        };

        aggs.push(AggDesc {
            call: call.clone(),
            def,
            trans_no,
            final_fn,
            shared_result_of: None,
        });
    }

    Ok((aggs, transes))
}

fn reject_nested_aggregates(call: &AggCall) -> ExecResult<()> {
    let nested = call.args.iter().any(ArgExpr::contains_aggregate)
        || call.direct_args.iter().any(ArgExpr::contains_aggregate)
        || call
            .filter
            .as_ref()
            .map(ArgExpr::contains_aggregate)
            .unwrap_or(false);
    if nested {
        return Err(ExecError::nested_aggregate(
            "aggregate function calls cannot be nested",
        ));
    }
    Ok(())
}

fn validate_call(
    call: &AggCall,
    def: &AggFunctionDef,
    plan: &AggPlan,
    has_hashing: bool,
) -> ExecResult<()> {
    if call.has_sort() && has_hashing {
        return Err(ExecError::internal(
            "aggregates with DISTINCT or ORDER BY cannot run under a hashed strategy",
        ));
    }
    if call.has_sort() && plan.split.combining() {
        return Err(ExecError::internal(
            "sorted transition input cannot be combined",
        ));
    }
    if let Some(trans_type) = def.trans_type {
        if !trans_type.accepts(&def.init_value) {
            return Err(ExecError::type_mismatch(format!(
                "initial value of aggregate {} does not fit its transition type",
                def.name
            )));
        }
    }
    if !call.direct_args.is_empty() && def.kind != AggKind::OrderedSet {
        return Err(ExecError::type_mismatch(format!(
            "aggregate {} does not accept direct arguments",
            def.name
        )));
    }
    if def.kind == AggKind::OrderedSet && call.direct_args.len() != def.num_direct_args {
        return Err(ExecError::type_mismatch(format!(
            "aggregate {} expects {} direct arguments, got {}",
            def.name,
            def.num_direct_args,
            call.direct_args.len()
        )));
    }
    Ok(())
}

fn lookup_trans_fn(
    def: &AggFunctionDef,
    plan: &AggPlan,
    registry: &FunctionRegistry,
) -> ExecResult<Arc<FunctionHandle>> {
    if !plan.split.combining() {
        return registry.function(def.trans_oid);
    }
    let combine_oid = def.combine_oid.ok_or_else(|| {
        ExecError::internal(format!(
            "aggregate {} has no combine function but the plan requires one",
            def.name
        ))
    })?;
    let combine = registry.function(combine_oid)?;
    if def.trans_internal && combine.strict {
        return Err(ExecError::type_mismatch(format!(
            "combine function of aggregate {} over an internal transition type must not be strict",
            def.name
        )));
    }
    Ok(combine)
}

/// A strict transition function with a NULL initial value adopts the first
/// non-NULL input as its state verbatim, which requires the input and
/// transition representations to agree.
fn check_strict_init(
    call: &AggCall,
    def: &AggFunctionDef,
    trans_fn: &Arc<FunctionHandle>,
    plan: &AggPlan,
) -> ExecResult<()> {
    if plan.split.combining() || !trans_fn.strict || !def.init_value.is_null() {
        return Ok(());
    }
    if call.args.is_empty() {
        return Err(ExecError::type_mismatch(format!(
            "strict transition function of aggregate {} needs an argument to adopt as initial state",
            def.name
        )));
    }
    if let (Some(input), Some(trans)) = (def.input_type, def.trans_type) {
        if input != trans {
            return Err(ExecError::type_mismatch(format!(
                "aggregate {} has a strict transition function and NULL initial value, \
                 but its input and transition types differ",
                def.name
            )));
        }
    }
    Ok(())
}

/// Aggregate-level match: every observable property of the call must agree.
fn find_compatible_agg(aggs: &[AggDesc], call: &AggCall) -> Option<usize> {
    if call.volatile {
        return None;
    }
    aggs.iter().position(|desc| {
        !desc.call.volatile
            && desc.call.agg_oid == call.agg_oid
            && desc.call.input_collation == call.input_collation
            && desc.call.result_collation == call.result_collation
            && desc.call.variadic == call.variadic
            && desc.call.args == call.args
            && desc.call.order_by == call.order_by
            && desc.call.distinct == call.distinct
            && desc.call.filter == call.filter
            && desc.call.direct_args == call.direct_args
    })
}

/// Transition-level match: the calls may finalize differently, but consume
/// the same input through the same transition pipeline, and finalization is
/// not allowed to modify the shared state.
fn find_compatible_trans(
    transes: &[TransDesc],
    call: &AggCall,
    def: &AggFunctionDef,
    trans_fn: &Arc<FunctionHandle>,
    plan: &AggPlan,
) -> Option<usize> {
    if call.volatile {
        return None;
    }
    let final_may_modify =
        !plan.split.skip_final() && def.final_modify == FinalModify::ReadWrite;
    if final_may_modify {
        return None;
    }
    transes.iter().position(|trans| {
        trans.trans_fn.oid == trans_fn.oid
            && trans.input_collation == call.input_collation
            && trans.variadic == call.variadic
            && trans.args == call.args
            && trans.order_by == call.order_by
            && trans.distinct == call.distinct
            && trans.filter == call.filter
            && trans.trans_type == def.trans_type
            && trans.serial_fn.as_ref().map(|f| f.oid) == def.serial_oid.filter(|_| plan.split.skip_final())
            && trans.deserial_fn.as_ref().map(|f| f.oid) == def.deserial_oid.filter(|_| plan.split.combining())
            && trans.init_value == def.init_value
    })
}
