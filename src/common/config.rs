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
use std::path::PathBuf;

use crate::common::app_config::config as siltstone_app_config;

pub(crate) fn work_mem_bytes() -> usize {
    siltstone_app_config()
        .ok()
        .map(|c| c.exec.work_mem_bytes)
        .unwrap_or(4 * 1024 * 1024)
}

pub(crate) fn hashagg_mem_overflow() -> bool {
    siltstone_app_config()
        .ok()
        .map(|c| c.exec.hashagg_mem_overflow)
        .unwrap_or(false)
}

pub(crate) fn spill_dir() -> PathBuf {
    siltstone_app_config()
        .ok()
        .map(|c| c.exec.spill_dir.clone())
        .unwrap_or_else(std::env::temp_dir)
}
