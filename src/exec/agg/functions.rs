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
//! Function registry: invocable handles for aggregate support functions and
//! the catalog-style descriptors binding them into aggregates.
//!
//! The executor never dispatches on function identity; every call goes
//! through an opaque `FnInvoke` handle plus a strictness flag. A small
//! built-in aggregate library is registered by `FunctionRegistry::builtin()`
//! and doubles as the test fixture set.

use std::sync::Arc;

use hashbrown::HashMap;

use crate::common::error::{ExecError, ExecResult};
use crate::exec::agg::context::AggCallContext;
use crate::exec::row::{Datum, DatumType, ExpandedObject, datum_cmp};

/// Invocable function body. Argument 0 is the transition state for
/// transition/final/serialize calls; remaining slots are call arguments.
pub type FnInvoke =
    Arc<dyn Fn(&mut AggCallContext<'_>, Vec<Datum>) -> ExecResult<Datum> + Send + Sync>;

/// Permission hook consulted on every function lookup.
pub type AclCheck = Arc<dyn Fn(u32) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct FunctionHandle {
    pub oid: u32,
    pub name: String,
    pub strict: bool,
    pub invoke: FnInvoke,
}

impl std::fmt::Debug for FunctionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionHandle")
            .field("oid", &self.oid)
            .field("name", &self.name)
            .field("strict", &self.strict)
            .finish()
    }
}

impl FunctionHandle {
    pub fn new(oid: u32, name: &str, strict: bool, invoke: FnInvoke) -> Self {
        Self {
            oid,
            name: name.to_string(),
            strict,
            invoke,
        }
    }

    pub fn call(
        &self,
        ctx: &mut AggCallContext<'_>,
        args: Vec<Datum>,
    ) -> ExecResult<Datum> {
        (self.invoke)(ctx, args).map_err(|err| {
            if err.kind == crate::common::error::ExecErrorKind::Function {
                err
            } else {
                ExecError::function(format!("{} failed: {}", self.name, err.message))
            }
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AggKind {
    Normal,
    /// Ordered-set aggregate with direct arguments evaluated at finalize.
    OrderedSet,
}

/// What the final function is allowed to do to the transition state. Sharing
/// one state between call sites requires read-only finalization (or no
/// finalization at all in partial split modes).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalModify {
    ReadOnly,
    Shareable,
    ReadWrite,
}

/// Catalog descriptor of one aggregate: which support functions implement
/// it, the transition representation, and the initial state.
#[derive(Clone, Debug)]
pub struct AggFunctionDef {
    pub oid: u32,
    pub name: String,
    pub kind: AggKind,
    pub num_direct_args: usize,
    pub trans_oid: u32,
    pub final_oid: Option<u32>,
    pub combine_oid: Option<u32>,
    pub serial_oid: Option<u32>,
    pub deserial_oid: Option<u32>,
    /// Declared aggregated-input type; `None` is polymorphic.
    pub input_type: Option<DatumType>,
    /// Declared transition type; `None` is polymorphic (same as input).
    pub trans_type: Option<DatumType>,
    /// Opaque in-memory transition representation; leaves the executor only
    /// through the serialize function, and its combine function must be
    /// callable on NULL inputs.
    pub trans_internal: bool,
    pub init_value: Datum,
    /// Planner hint: expected per-group state growth beyond the fixed entry.
    pub trans_space: usize,
    /// Total final-function argument count including the state slot; unused
    /// trailing slots are padded with NULL. Zero when there is no finalfn.
    pub final_num_args: usize,
    pub final_modify: FinalModify,
    pub result_type: Option<DatumType>,
}

#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<u32, Arc<FunctionHandle>>,
    aggregates: HashMap<u32, Arc<AggFunctionDef>>,
    acl: Option<AclCheck>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions.len())
            .field("aggregates", &self.aggregates.len())
            .finish()
    }
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_function(&mut self, handle: FunctionHandle) {
        self.functions.insert(handle.oid, Arc::new(handle));
    }

    pub fn register_aggregate(&mut self, def: AggFunctionDef) {
        self.aggregates.insert(def.oid, Arc::new(def));
    }

    /// Restrict which functions the current caller may execute.
    pub fn set_acl(&mut self, acl: AclCheck) {
        self.acl = Some(acl);
    }

    /// Look up an invocable function, enforcing execute permission.
    pub fn function(&self, oid: u32) -> ExecResult<Arc<FunctionHandle>> {
        let handle = self
            .functions
            .get(&oid)
            .cloned()
            .ok_or_else(|| ExecError::internal(format!("function {oid} is not registered")))?;
        if let Some(acl) = self.acl.as_ref() {
            if !acl(oid) {
                return Err(ExecError::permission_denied(format!(
                    "no execute permission on function {}",
                    handle.name
                )));
            }
        }
        Ok(handle)
    }

    pub fn aggregate(&self, oid: u32) -> ExecResult<Arc<AggFunctionDef>> {
        self.aggregates
            .get(&oid)
            .cloned()
            .ok_or_else(|| ExecError::internal(format!("aggregate {oid} is not registered")))
    }

    /// Registry preloaded with the built-in aggregate library.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        builtin::register_all(&mut registry);
        registry
    }
}

/// Built-in aggregates and their support functions.
pub mod builtin {
    use super::*;

    pub const AGG_COUNT_STAR: u32 = 1;
    pub const AGG_COUNT: u32 = 2;
    pub const AGG_SUM_INT: u32 = 3;
    pub const AGG_MIN: u32 = 4;
    pub const AGG_MAX: u32 = 5;
    pub const AGG_AVG_INT: u32 = 6;
    pub const AGG_ARRAY_COLLECT: u32 = 7;

    pub const FN_COUNT_STAR_TRANS: u32 = 101;
    pub const FN_COUNT_TRANS: u32 = 102;
    pub const FN_INT_ADD: u32 = 103;
    pub const FN_MIN_TRANS: u32 = 104;
    pub const FN_MAX_TRANS: u32 = 105;
    pub const FN_AVG_ACCUM: u32 = 106;
    pub const FN_AVG_FINAL: u32 = 107;
    pub const FN_AVG_COMBINE: u32 = 108;
    pub const FN_AVG_SERIAL: u32 = 109;
    pub const FN_AVG_DESERIAL: u32 = 110;
    pub const FN_ARRAY_COLLECT_TRANS: u32 = 111;
    pub const FN_ARRAY_COLLECT_FINAL: u32 = 112;

    fn int_of(datum: &Datum, what: &str) -> ExecResult<i64> {
        match datum {
            Datum::Int(v) => Ok(*v),
            other => Err(ExecError::function(format!(
                "{what} expects int, got {}",
                other.type_name()
            ))),
        }
    }

    fn avg_state_of(datum: &Datum) -> ExecResult<(i64, i64)> {
        match datum {
            Datum::List(items) if items.len() == 2 => {
                Ok((int_of(&items[0], "avg state")?, int_of(&items[1], "avg state")?))
            }
            other => Err(ExecError::function(format!(
                "malformed avg state: {}",
                other.type_name()
            ))),
        }
    }

    fn avg_state(sum: i64, count: i64) -> Datum {
        Datum::List(vec![Datum::Int(sum), Datum::Int(count)])
    }

    pub fn register_all(registry: &mut FunctionRegistry) {
        registry.register_function(FunctionHandle::new(
            FN_COUNT_STAR_TRANS,
            "count_star_trans",
            false,
            Arc::new(|_ctx, args| Ok(Datum::Int(int_of(&args[0], "count state")? + 1))),
        ));

        registry.register_function(FunctionHandle::new(
            FN_COUNT_TRANS,
            "count_trans",
            true,
            Arc::new(|_ctx, args| Ok(Datum::Int(int_of(&args[0], "count state")? + 1))),
        ));

        registry.register_function(FunctionHandle::new(
            FN_INT_ADD,
            "int_add",
            true,
            Arc::new(|_ctx, args| {
                Ok(Datum::Int(
                    int_of(&args[0], "int_add")? + int_of(&args[1], "int_add")?,
                ))
            }),
        ));

        registry.register_function(FunctionHandle::new(
            FN_MIN_TRANS,
            "min_trans",
            true,
            Arc::new(|_ctx, mut args| {
                let arg = args.remove(1);
                let state = args.remove(0);
                Ok(if datum_cmp(&arg, &state) == std::cmp::Ordering::Less {
                    arg
                } else {
                    state
                })
            }),
        ));

        registry.register_function(FunctionHandle::new(
            FN_MAX_TRANS,
            "max_trans",
            true,
            Arc::new(|_ctx, mut args| {
                let arg = args.remove(1);
                let state = args.remove(0);
                Ok(if datum_cmp(&arg, &state) == std::cmp::Ordering::Greater {
                    arg
                } else {
                    state
                })
            }),
        ));

        registry.register_function(FunctionHandle::new(
            FN_AVG_ACCUM,
            "avg_accum",
            true,
            Arc::new(|_ctx, args| {
                let (sum, count) = avg_state_of(&args[0])?;
                let value = int_of(&args[1], "avg input")?;
                Ok(avg_state(sum + value, count + 1))
            }),
        ));

        registry.register_function(FunctionHandle::new(
            FN_AVG_FINAL,
            "avg_final",
            true,
            Arc::new(|_ctx, args| {
                let (sum, count) = avg_state_of(&args[0])?;
                if count == 0 {
                    return Ok(Datum::Null);
                }
                Ok(Datum::Float(sum as f64 / count as f64))
            }),
        ));

        // combine must accept NULL partial states, so it is not strict
        registry.register_function(FunctionHandle::new(
            FN_AVG_COMBINE,
            "avg_combine",
            false,
            Arc::new(|_ctx, mut args| {
                let other = args.remove(1);
                let state = args.remove(0);
                match (state.is_null(), other.is_null()) {
                    (true, true) => Ok(Datum::Null),
                    (false, true) => Ok(state),
                    (true, false) => Ok(other),
                    (false, false) => {
                        let (sum_a, count_a) = avg_state_of(&state)?;
                        let (sum_b, count_b) = avg_state_of(&other)?;
                        Ok(avg_state(sum_a + sum_b, count_a + count_b))
                    }
                }
            }),
        ));

        registry.register_function(FunctionHandle::new(
            FN_AVG_SERIAL,
            "avg_serial",
            true,
            Arc::new(|_ctx, args| {
                let (sum, count) = avg_state_of(&args[0])?;
                let mut bytes = Vec::with_capacity(16);
                bytes.extend_from_slice(&sum.to_le_bytes());
                bytes.extend_from_slice(&count.to_le_bytes());
                Ok(Datum::Bytes(bytes))
            }),
        ));

        registry.register_function(FunctionHandle::new(
            FN_AVG_DESERIAL,
            "avg_deserial",
            true,
            Arc::new(|_ctx, args| {
                let bytes = match &args[0] {
                    Datum::Bytes(b) if b.len() == 16 => b,
                    other => {
                        return Err(ExecError::function(format!(
                            "malformed serialized avg state: {}",
                            other.type_name()
                        )));
                    }
                };
                let mut sum = [0u8; 8];
                let mut count = [0u8; 8];
                sum.copy_from_slice(&bytes[..8]);
                count.copy_from_slice(&bytes[8..]);
                Ok(avg_state(i64::from_le_bytes(sum), i64::from_le_bytes(count)))
            }),
        ));

        registry.register_function(FunctionHandle::new(
            FN_ARRAY_COLLECT_TRANS,
            "array_collect_trans",
            false,
            Arc::new(|ctx, mut args| {
                let value = args.remove(1);
                let state = args.remove(0);
                let arena_id = ctx.grouping_set_arena().id();
                match state {
                    // first call for this group: build an expanded object in
                    // the grouping-set arena and mutate it in place after
                    Datum::Null => {
                        let handle = ExpandedObject::new_in(arena_id);
                        handle.push(value);
                        Ok(Datum::Expanded(handle))
                    }
                    Datum::Expanded(handle) if handle.owner() == arena_id => {
                        handle.push(value);
                        Ok(Datum::Expanded(handle))
                    }
                    // state was flattened (combine input or copied value)
                    Datum::Expanded(handle) => {
                        let fresh = ExpandedObject::new_in(arena_id);
                        for item in handle.flatten() {
                            fresh.push(item);
                        }
                        fresh.push(value);
                        Ok(Datum::Expanded(fresh))
                    }
                    Datum::List(items) => {
                        let fresh = ExpandedObject::new_in(arena_id);
                        for item in items {
                            fresh.push(item);
                        }
                        fresh.push(value);
                        Ok(Datum::Expanded(fresh))
                    }
                    other => Err(ExecError::function(format!(
                        "malformed array_collect state: {}",
                        other.type_name()
                    ))),
                }
            }),
        ));

        registry.register_function(FunctionHandle::new(
            FN_ARRAY_COLLECT_FINAL,
            "array_collect_final",
            true,
            Arc::new(|_ctx, args| match &args[0] {
                Datum::Expanded(handle) => Ok(Datum::List(handle.flatten())),
                Datum::List(items) => Ok(Datum::List(items.clone())),
                other => Err(ExecError::function(format!(
                    "malformed array_collect state: {}",
                    other.type_name()
                ))),
            }),
        ));

        registry.register_aggregate(AggFunctionDef {
            oid: AGG_COUNT_STAR,
            name: "count(*)".to_string(),
            kind: AggKind::Normal,
            num_direct_args: 0,
            trans_oid: FN_COUNT_STAR_TRANS,
            final_oid: None,
            combine_oid: Some(FN_INT_ADD),
            serial_oid: None,
            deserial_oid: None,
            input_type: None,
            trans_type: Some(DatumType::Int),
            trans_internal: false,
            init_value: Datum::Int(0),
            trans_space: 0,
            final_num_args: 0,
            final_modify: FinalModify::ReadOnly,
            result_type: Some(DatumType::Int),
        });

        registry.register_aggregate(AggFunctionDef {
            oid: AGG_COUNT,
            name: "count".to_string(),
            kind: AggKind::Normal,
            num_direct_args: 0,
            trans_oid: FN_COUNT_TRANS,
            final_oid: None,
            combine_oid: Some(FN_INT_ADD),
            serial_oid: None,
            deserial_oid: None,
            input_type: None,
            trans_type: Some(DatumType::Int),
            trans_internal: false,
            init_value: Datum::Int(0),
            trans_space: 0,
            final_num_args: 0,
            final_modify: FinalModify::ReadOnly,
            result_type: Some(DatumType::Int),
        });

        registry.register_aggregate(AggFunctionDef {
            oid: AGG_SUM_INT,
            name: "sum".to_string(),
            kind: AggKind::Normal,
            num_direct_args: 0,
            trans_oid: FN_INT_ADD,
            final_oid: None,
            combine_oid: Some(FN_INT_ADD),
            serial_oid: None,
            deserial_oid: None,
            input_type: Some(DatumType::Int),
            trans_type: Some(DatumType::Int),
            trans_internal: false,
            init_value: Datum::Null,
            trans_space: 0,
            final_num_args: 0,
            final_modify: FinalModify::ReadOnly,
            result_type: Some(DatumType::Int),
        });

        registry.register_aggregate(AggFunctionDef {
            oid: AGG_MIN,
            name: "min".to_string(),
            kind: AggKind::Normal,
            num_direct_args: 0,
            trans_oid: FN_MIN_TRANS,
            final_oid: None,
            combine_oid: Some(FN_MIN_TRANS),
            serial_oid: None,
            deserial_oid: None,
            input_type: None,
            trans_type: None,
            trans_internal: false,
            init_value: Datum::Null,
            trans_space: 0,
            final_num_args: 0,
            final_modify: FinalModify::ReadOnly,
            result_type: None,
        });

        registry.register_aggregate(AggFunctionDef {
            oid: AGG_MAX,
            name: "max".to_string(),
            kind: AggKind::Normal,
            num_direct_args: 0,
            trans_oid: FN_MAX_TRANS,
            final_oid: None,
            combine_oid: Some(FN_MAX_TRANS),
            serial_oid: None,
            deserial_oid: None,
            input_type: None,
            trans_type: None,
            trans_internal: false,
            init_value: Datum::Null,
            trans_space: 0,
            final_num_args: 0,
            final_modify: FinalModify::ReadOnly,
            result_type: None,
        });

        registry.register_aggregate(AggFunctionDef {
            oid: AGG_AVG_INT,
            name: "avg".to_string(),
            kind: AggKind::Normal,
            num_direct_args: 0,
            trans_oid: FN_AVG_ACCUM,
            final_oid: Some(FN_AVG_FINAL),
            combine_oid: Some(FN_AVG_COMBINE),
            serial_oid: Some(FN_AVG_SERIAL),
            deserial_oid: Some(FN_AVG_DESERIAL),
            input_type: Some(DatumType::Int),
            trans_type: Some(DatumType::List),
            trans_internal: true,
            init_value: Datum::List(vec![Datum::Int(0), Datum::Int(0)]),
            trans_space: 48,
            final_num_args: 1,
            final_modify: FinalModify::ReadOnly,
            result_type: Some(DatumType::Float),
        });

        registry.register_aggregate(AggFunctionDef {
            oid: AGG_ARRAY_COLLECT,
            name: "array_collect".to_string(),
            kind: AggKind::Normal,
            num_direct_args: 0,
            trans_oid: FN_ARRAY_COLLECT_TRANS,
            final_oid: Some(FN_ARRAY_COLLECT_FINAL),
            combine_oid: None,
            serial_oid: None,
            deserial_oid: None,
            input_type: None,
            trans_type: Some(DatumType::List),
            trans_internal: false,
            init_value: Datum::Null,
            trans_space: 64,
            final_num_args: 1,
            final_modify: FinalModify::ReadOnly,
            result_type: Some(DatumType::List),
        });
    }
}
