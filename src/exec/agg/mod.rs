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
//! Responsibilities:
//! - Decodes an aggregation plan into per-aggregate and per-transition
//!   descriptors, deduplicating shared state.
//! - Runs the plain/sorted/hashed strategies and their mixed composition for
//!   grouping sets as a pull iterator over the child row stream.
//! - Bounds hashed-aggregation memory by spilling partitioned overflow to
//!   tape and reprocessing batches recursively.
//!
//! Key exported interfaces:
//! - Types: `driver::AggDriver`, `plan::AggPlan`, `functions::FunctionRegistry`.

pub mod context;
pub mod descriptor;
pub mod driver;
pub mod functions;
pub mod group_table;
pub mod invoke;
pub mod phase;
pub mod plan;
pub mod share;
pub mod spill;
