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
//! Executor error type.
//!
//! One error struct for the whole executor: a coarse kind that callers can
//! dispatch on, plus a human-readable message. Strict-function NULL
//! short-circuits are ordinary results, never errors.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecErrorKind {
    /// Incompatible types detected while building aggregate descriptors.
    TypeMismatch,
    /// Caller lacks execute permission on a required function.
    PermissionDenied,
    /// An aggregate call appeared inside another aggregate's arguments.
    NestedAggregate,
    /// Short read/write or file failure on a spill tape.
    Io,
    /// Cooperative cancellation tripped.
    Interrupted,
    /// Invariant violation inside the executor.
    Internal,
    /// Propagated from a user-defined aggregate support function.
    Function,
}

impl ExecErrorKind {
    fn as_str(&self) -> &'static str {
        match self {
            ExecErrorKind::TypeMismatch => "type mismatch",
            ExecErrorKind::PermissionDenied => "permission denied",
            ExecErrorKind::NestedAggregate => "nested aggregate",
            ExecErrorKind::Io => "io error",
            ExecErrorKind::Interrupted => "interrupted",
            ExecErrorKind::Internal => "internal error",
            ExecErrorKind::Function => "function error",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ExecError {
    pub kind: ExecErrorKind,
    pub message: String,
}

impl ExecError {
    pub fn new(kind: ExecErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::TypeMismatch, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::PermissionDenied, message)
    }

    pub fn nested_aggregate(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::NestedAggregate, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::Io, message)
    }

    pub fn interrupted() -> Self {
        Self::new(ExecErrorKind::Interrupted, "query execution was interrupted")
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::Internal, message)
    }

    pub fn function(message: impl Into<String>) -> Self {
        Self::new(ExecErrorKind::Function, message)
    }
}

impl fmt::Display for ExecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for ExecError {}

impl From<std::io::Error> for ExecError {
    fn from(err: std::io::Error) -> Self {
        ExecError::io(err.to_string())
    }
}

pub type ExecResult<T> = Result<T, ExecError>;
