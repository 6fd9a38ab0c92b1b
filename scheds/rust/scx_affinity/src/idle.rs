// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-CPU idle-time history.
//!
//! Every tick the accumulated execution time of each CPU's idle thread is read
//! into a small ring. The difference between the two most recent samples tells
//! how much a CPU idled since the previous tick.

use log::debug;
use log::warn;

use crate::affinity::AffinityLocation;
use crate::affinity::AffinitySpace;
use crate::trace::ExecutionTime;
use crate::trace::SubjectId;
use crate::trace::TraceConnection;
use crate::trace::TraceError;

/// Number of samples kept per CPU.
pub const HISTORY_LEN: usize = 4;

/// Returned by [`IdleTracker::diff`] for a CPU that reported activity but did
/// not advance between two samples.
pub const IDLE_SENTINEL: ExecutionTime = ExecutionTime::new(1, 1);

struct IdleCell {
    subject: Option<SubjectId>,
    history: [ExecutionTime; HISTORY_LEN],
}

pub struct IdleTracker {
    space: AffinitySpace,
    cells: Vec<IdleCell>,
    slot: usize,
}

impl IdleTracker {
    pub fn new(space: AffinitySpace) -> Self {
        let cells = (0..space.total())
            .map(|_| IdleCell {
                subject: None,
                history: [ExecutionTime::default(); HISTORY_LEN],
            })
            .collect();
        Self {
            space,
            cells,
            slot: 0,
        }
    }

    pub fn unresolved(&self) -> usize {
        self.cells.iter().filter(|c| c.subject.is_none()).count()
    }

    fn prev_slot(&self) -> usize {
        (self.slot + HISTORY_LEN - 1) % HISTORY_LEN
    }

    fn cell(&self, loc: &AffinityLocation) -> Option<&IdleCell> {
        self.space.cell_index(loc).and_then(|i| self.cells.get(i))
    }

    /// Read the idle time of every CPU into the next ring slot.
    ///
    /// Only an unrecoverable trace failure is returned, in which case the
    /// ring is left untouched. CPUs whose idle subject cannot be resolved or
    /// read record zero for this tick.
    pub fn sample(&mut self, trace: &mut TraceConnection) -> Result<(), TraceError> {
        let mut readings = Vec::with_capacity(self.cells.len());
        for idx in 0..self.cells.len() {
            let Some(loc) = self.space.location_of(idx) else {
                readings.push(ExecutionTime::default());
                continue;
            };
            let time = self.read_cell(idx, &loc, trace)?;
            readings.push(time);
        }

        self.slot = (self.slot + 1) % HISTORY_LEN;
        for (cell, time) in self.cells.iter_mut().zip(readings) {
            cell.history[self.slot] = time;
        }
        Ok(())
    }

    fn read_cell(
        &mut self,
        idx: usize,
        loc: &AffinityLocation,
        trace: &mut TraceConnection,
    ) -> Result<ExecutionTime, TraceError> {
        if self.cells[idx].subject.is_none() {
            let found = trace.lookup(|info| info.is_idle_of(loc))?;
            if found.is_none() {
                debug!("idle: no idle subject for CPU {} yet", loc);
            }
            self.cells[idx].subject = found;
        }

        let Some(id) = self.cells[idx].subject else {
            return Ok(ExecutionTime::default());
        };
        match trace.subject_info(id) {
            Ok(info) => Ok(info.execution_time),
            Err(TraceError::InvalidSubject(_)) => {
                warn!("idle: subject {} of CPU {} vanished", id, loc);
                self.cells[idx].subject = None;
                Ok(ExecutionTime::default())
            }
            Err(err @ TraceError::QuotaExhausted(_)) => Err(err),
            Err(err) => {
                warn!("idle: failed to read CPU {}: {}", loc, err);
                Ok(ExecutionTime::default())
            }
        }
    }

    /// Idle time the CPU at absolute `loc` accumulated since the previous
    /// sample.
    pub fn diff(&self, loc: &AffinityLocation) -> ExecutionTime {
        let Some(cell) = self.cell(loc) else {
            return ExecutionTime::default();
        };
        let cur = cell.history[self.slot];
        let prev = cell.history[self.prev_slot()];
        let diff = cur.saturating_sub(&prev);

        if diff.is_zero() && !cur.is_zero() {
            return IDLE_SENTINEL;
        }
        diff
    }

    /// The absolute cell of `base` that idled the most since the previous
    /// sample.
    ///
    /// Cells are scanned in row-major order and a cell only wins if it idled
    /// strictly more than every cell before it, so equal readings keep the
    /// first one. Returns `None` if no cell reported any idle time.
    pub fn most_idle(&self, base: &AffinityLocation) -> Option<AffinityLocation> {
        let mut best: Option<(AffinityLocation, u64)> = None;
        for rel in base.cells() {
            let abs = base.absolute(&rel);
            let metric = self.diff(&abs).metric();
            if metric > best.map_or(0, |(_, m)| m) {
                best = Some((abs, metric));
            }
        }
        best.map(|(loc, _)| loc)
    }
}
