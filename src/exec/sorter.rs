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
//! Sorters used by the aggregation driver.
//!
//! Two shapes: a by-datum sorter for single-argument DISTINCT/ORDER BY
//! aggregates, and a by-row sorter for multi-argument aggregates and for the
//! inter-phase sorts of grouping-set execution. Both follow a
//! put / perform_sort / drain protocol.

use std::cmp::Ordering;

use crate::common::error::{ExecError, ExecResult};
use crate::exec::row::{Datum, Row, datum_cmp};

/// One ORDER BY key: the column it reads, direction, and NULL placement.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortSpec {
    pub column: usize,
    pub descending: bool,
    pub nulls_first: bool,
}

impl SortSpec {
    pub fn asc(column: usize) -> Self {
        Self {
            column,
            descending: false,
            nulls_first: false,
        }
    }
}

/// Datum comparison honoring direction and NULL placement.
pub fn compare_datums(descending: bool, nulls_first: bool, a: &Datum, b: &Datum) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => {
            if nulls_first {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        (false, true) => {
            if nulls_first {
                Ordering::Greater
            } else {
                Ordering::Less
            }
        }
        (false, false) => {
            let ord = datum_cmp(a, b);
            if descending { ord.reverse() } else { ord }
        }
    }
}

pub fn compare_rows(specs: &[SortSpec], a: &Row, b: &Row) -> Ordering {
    for spec in specs {
        let ord = compare_datums(spec.descending, spec.nulls_first, &a[spec.column], &b[spec.column]);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

pub trait DatumSorter {
    fn put(&mut self, value: Datum) -> ExecResult<()>;
    fn perform_sort(&mut self) -> ExecResult<()>;
    fn next(&mut self) -> ExecResult<Option<Datum>>;
    /// Release working memory; the sorter cannot be used afterwards.
    fn end(&mut self);
}

pub trait RowSorter {
    fn put(&mut self, row: Row) -> ExecResult<()>;
    fn perform_sort(&mut self) -> ExecResult<()>;
    fn next(&mut self) -> ExecResult<Option<Row>>;
    fn end(&mut self);
}

pub trait SorterFactory: Send + Sync {
    fn new_datum_sorter(&self, descending: bool, nulls_first: bool) -> Box<dyn DatumSorter>;
    fn new_row_sorter(&self, specs: Vec<SortSpec>) -> Box<dyn RowSorter>;
}

/// Materialize-then-sort implementation backing both sorter shapes.
#[derive(Debug, Default)]
pub struct MemSorterFactory;

impl SorterFactory for MemSorterFactory {
    fn new_datum_sorter(&self, descending: bool, nulls_first: bool) -> Box<dyn DatumSorter> {
        Box::new(MemDatumSorter {
            descending,
            nulls_first,
            values: Vec::new(),
            cursor: 0,
            sorted: false,
        })
    }

    fn new_row_sorter(&self, specs: Vec<SortSpec>) -> Box<dyn RowSorter> {
        Box::new(MemRowSorter {
            specs,
            rows: Vec::new(),
            cursor: 0,
            sorted: false,
        })
    }
}

struct MemDatumSorter {
    descending: bool,
    nulls_first: bool,
    values: Vec<Datum>,
    cursor: usize,
    sorted: bool,
}

impl DatumSorter for MemDatumSorter {
    fn put(&mut self, value: Datum) -> ExecResult<()> {
        if self.sorted {
            return Err(ExecError::internal("datum sorter already sorted"));
        }
        self.values.push(value);
        Ok(())
    }

    fn perform_sort(&mut self) -> ExecResult<()> {
        if self.sorted {
            return Err(ExecError::internal("datum sorter already sorted"));
        }
        let (descending, nulls_first) = (self.descending, self.nulls_first);
        self.values
            .sort_by(|a, b| compare_datums(descending, nulls_first, a, b));
        self.sorted = true;
        Ok(())
    }

    fn next(&mut self) -> ExecResult<Option<Datum>> {
        if !self.sorted {
            return Err(ExecError::internal("datum sorter drained before sorting"));
        }
        if self.cursor >= self.values.len() {
            return Ok(None);
        }
        let out = std::mem::replace(&mut self.values[self.cursor], Datum::Null);
        self.cursor += 1;
        Ok(Some(out))
    }

    fn end(&mut self) {
        self.values = Vec::new();
        self.cursor = 0;
        self.sorted = true;
    }
}

struct MemRowSorter {
    specs: Vec<SortSpec>,
    rows: Vec<Row>,
    cursor: usize,
    sorted: bool,
}

impl RowSorter for MemRowSorter {
    fn put(&mut self, row: Row) -> ExecResult<()> {
        if self.sorted {
            return Err(ExecError::internal("row sorter already sorted"));
        }
        self.rows.push(row);
        Ok(())
    }

    fn perform_sort(&mut self) -> ExecResult<()> {
        if self.sorted {
            return Err(ExecError::internal("row sorter already sorted"));
        }
        let specs = self.specs.clone();
        self.rows.sort_by(|a, b| compare_rows(&specs, a, b));
        self.sorted = true;
        Ok(())
    }

    fn next(&mut self) -> ExecResult<Option<Row>> {
        if !self.sorted {
            return Err(ExecError::internal("row sorter drained before sorting"));
        }
        if self.cursor >= self.rows.len() {
            return Ok(None);
        }
        let out = std::mem::take(&mut self.rows[self.cursor]);
        self.cursor += 1;
        Ok(Some(out))
    }

    fn end(&mut self) {
        self.rows = Vec::new();
        self.cursor = 0;
        self.sorted = true;
    }
}
