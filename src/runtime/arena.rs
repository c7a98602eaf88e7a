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
//! Tracked allocation scopes for aggregation state.
//!
//! An `Arena` is a logical memory scope: values adopted into it are counted
//! against it (and any attached `MemTracker`) until the arena is reset at a
//! group boundary or destroyed. Aggregate support functions may register
//! callbacks that fire on reset or destroy, which lets user-defined
//! aggregates release non-memory resources at group boundaries.
//!
//! The aggregation driver keeps one arena per grouping set, one arena shared
//! by all hash tables, and one short-lived per-tuple arena.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::runtime::mem_tracker::MemTracker;

static NEXT_ARENA_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique arena identity, used to decide whether an expanded object
/// already belongs to the current grouping-set arena.
pub type ArenaId = u64;

pub type ResetCallback = Box<dyn FnOnce() + Send>;

pub struct Arena {
    id: ArenaId,
    label: String,
    allocated: AtomicI64,
    mem_tracker: Option<Arc<MemTracker>>,
    callbacks: Mutex<Vec<ResetCallback>>,
}

impl std::fmt::Debug for Arena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Arena")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("allocated", &self.allocated.load(Ordering::Relaxed))
            .finish()
    }
}

impl Arena {
    pub fn new(label: impl Into<String>) -> Arc<Self> {
        Self::build(label, None)
    }

    pub fn with_tracker(label: impl Into<String>, tracker: Arc<MemTracker>) -> Arc<Self> {
        Self::build(label, Some(tracker))
    }

    fn build(label: impl Into<String>, tracker: Option<Arc<MemTracker>>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ARENA_ID.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
            allocated: AtomicI64::new(0),
            mem_tracker: tracker,
            callbacks: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> ArenaId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn allocated_bytes(&self) -> i64 {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Count `bytes` as held by this arena until reset.
    pub fn adopt(&self, bytes: usize) {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        self.allocated.fetch_add(bytes, Ordering::AcqRel);
        if let Some(tracker) = self.mem_tracker.as_ref() {
            tracker.consume(bytes);
        }
    }

    /// Stop counting `bytes`, e.g. after replacing a prior transition value.
    pub fn forget(&self, bytes: usize) {
        let bytes = i64::try_from(bytes).unwrap_or(i64::MAX);
        self.allocated.fetch_sub(bytes, Ordering::AcqRel);
        if let Some(tracker) = self.mem_tracker.as_ref() {
            tracker.release(bytes);
        }
    }

    /// Register a callback to run on the next reset or on destroy.
    pub fn register_reset_callback(&self, callback: ResetCallback) {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    /// Drop everything held by the arena: fire registered callbacks and zero
    /// the byte accounting.
    pub fn reset(&self) {
        let callbacks = {
            let mut guard = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *guard)
        };
        for callback in callbacks {
            callback();
        }
        let held = self.allocated.swap(0, Ordering::AcqRel);
        if held > 0 {
            if let Some(tracker) = self.mem_tracker.as_ref() {
                tracker.release(held);
            }
        }
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        self.reset();
    }
}
