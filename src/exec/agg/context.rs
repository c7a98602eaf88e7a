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
//! Support interface handed to user-defined aggregate functions.
//!
//! Mirrors the classic aggregate support API: a function can ask whether it
//! is being called as an aggregate, obtain the current grouping-set arena
//! and the short-lived per-tuple arena, inspect its own call node, learn
//! whether its state is shared with another call site, and register cleanup
//! callbacks on the grouping-set arena.

use std::sync::Arc;

use crate::exec::agg::plan::AggCall;
use crate::runtime::arena::{Arena, ResetCallback};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallContextKind {
    /// Called as an aggregate transition/final/support function.
    Aggregate,
    /// Not called from the aggregation driver.
    None,
}

pub struct AggCallContext<'a> {
    set_arena: &'a Arc<Arena>,
    temp_arena: &'a Arc<Arena>,
    aggref: Option<&'a AggCall>,
    state_shared: bool,
}

impl<'a> AggCallContext<'a> {
    pub(crate) fn new(
        set_arena: &'a Arc<Arena>,
        temp_arena: &'a Arc<Arena>,
        aggref: Option<&'a AggCall>,
        state_shared: bool,
    ) -> Self {
        Self {
            set_arena,
            temp_arena,
            aggref,
            state_shared,
        }
    }

    /// Whether the call is running under the aggregation driver, and if so
    /// which arena holds per-group state.
    pub fn check_call_context(&self) -> (CallContextKind, &Arc<Arena>) {
        (CallContextKind::Aggregate, self.set_arena)
    }

    /// The arena owning the current group's transition state.
    pub fn grouping_set_arena(&self) -> &Arc<Arena> {
        self.set_arena
    }

    /// Short-lived arena reset after every input row.
    pub fn temp_arena(&self) -> &Arc<Arena> {
        self.temp_arena
    }

    /// The aggregate call node this invocation serves, when identifiable.
    /// Shared transition states report the first of their call sites.
    pub fn aggref(&self) -> Option<&AggCall> {
        self.aggref
    }

    /// True when the transition state is shared by multiple call sites, in
    /// which case the final function must not scribble on it.
    pub fn state_is_shared(&self) -> bool {
        self.state_shared
    }

    /// Register a callback to fire when the grouping-set arena is reset at a
    /// group boundary or destroyed. Not fired on error unwinds.
    pub fn register_callback(&self, callback: ResetCallback) {
        self.set_arena.register_reset_callback(callback);
    }
}
