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
//! Grouped aggregation executor.
//!
//! The crate implements a pull-based aggregation driver over a stream of
//! input rows: plain (no grouping), sorted (presorted input) and hashed
//! strategies, their mixed composition for grouping sets, per-aggregate
//! DISTINCT/ORDER BY, partial/combine split modes, and memory-bounded hashed
//! aggregation that spills partitioned overflow to disk and reprocesses it
//! recursively.

pub mod common;
pub mod exec;
pub mod runtime;

pub use common::app_config as siltstone_config;
pub use common::error::{ExecError, ExecErrorKind, ExecResult};
pub use common::logging as siltstone_logging;
pub use exec::agg::driver::{AggDriver, AggMetrics, ExecEnv, RowSource};
pub use exec::row::{Datum, Row};
