// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Linux implementations of the CPU backend and the trace source.
//!
//! Threads are not created but adopted: a client names an existing thread of
//! one of its processes, and from then on the scheduler steers it with CPU
//! affinity masks. Placement and execution time are observed through procfs.

pub mod cpu;
pub mod procfs;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

use anyhow::Context;
use anyhow::Result;
use log::info;
use log::warn;
use scx_utils::Topology;

use crate::affinity::AffinityLocation;
use crate::affinity::AffinitySpace;

pub use cpu::HostCpu;
pub use cpu::Pinning;
pub use cpu::SchedPinning;
pub use procfs::ProcfsTraceFactory;

/// Thread adopted by a session, as seen by the trace source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracedThread {
    pub pid: u32,
    pub session_label: String,
    pub name: String,
    /// Host CPU the thread is confined to by its affinity mask.
    pub pinned: Option<usize>,
}

/// Adopted threads keyed by tid, shared between [`HostCpu`] and the procfs
/// trace source.
#[derive(Debug, Clone, Default)]
pub struct ThreadRegistry {
    threads: Arc<Mutex<BTreeMap<u32, TracedThread>>>,
}

impl ThreadRegistry {
    fn lock(&self) -> MutexGuard<'_, BTreeMap<u32, TracedThread>> {
        self.threads.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, tid: u32, thread: TracedThread) {
        self.lock().insert(tid, thread);
    }

    pub fn unregister(&self, tid: u32) -> Option<TracedThread> {
        self.lock().remove(&tid)
    }

    pub fn set_pinned(&self, tid: u32, cpu: usize) {
        if let Some(thread) = self.lock().get_mut(&tid) {
            thread.pinned = Some(cpu);
        }
    }

    pub fn get(&self, tid: u32) -> Option<TracedThread> {
        self.lock().get(&tid).cloned()
    }

    pub fn contains(&self, tid: u32) -> bool {
        self.lock().contains_key(&tid)
    }

    pub fn tids(&self) -> Vec<u32> {
        self.lock().keys().copied().collect()
    }
}

/// Mapping between the affinity grid and host CPU ids.
///
/// Each row holds the CPUs sharing a last-level cache, so a session window
/// spanning whole rows keeps its threads cache-local. Cells are numbered in
/// row-major order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuGrid {
    space: AffinitySpace,
    cpus: Vec<usize>,
}

impl CpuGrid {
    /// CPUs `0..n` laid out over `space` in row-major order.
    pub fn linear(space: AffinitySpace) -> Self {
        Self {
            space,
            cpus: (0..space.total() as usize).collect(),
        }
    }

    /// One row per group of CPUs. Groups of unequal size do not form a
    /// rectangle and collapse into a single row.
    pub fn from_rows(rows: Vec<Vec<usize>>) -> Self {
        let rows: Vec<Vec<usize>> = rows.into_iter().filter(|r| !r.is_empty()).collect();
        let width = rows.first().map_or(0, |r| r.len());

        if rows.iter().all(|r| r.len() == width) {
            return Self {
                space: AffinitySpace::new(width as u32, rows.len() as u32),
                cpus: rows.into_iter().flatten().collect(),
            };
        }

        let mut cpus: Vec<usize> = rows.into_iter().flatten().collect();
        cpus.sort_unstable();
        warn!(
            "host: uneven cache domains, using a single row of {} CPUs",
            cpus.len()
        );
        Self {
            space: AffinitySpace::new(cpus.len() as u32, 1),
            cpus,
        }
    }

    pub fn from_topology(topo: &Topology) -> Self {
        let mut llcs: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for cpu in topo.all_cpus.values() {
            llcs.entry(cpu.llc_id).or_default().push(cpu.id);
        }
        Self::from_rows(llcs.into_values().collect())
    }

    pub fn detect() -> Result<Self> {
        let topo = Topology::new().context("failed to gather CPU topology")?;
        let grid = Self::from_topology(&topo);
        if grid.space.is_empty() {
            anyhow::bail!("No CPUs in topology");
        }
        info!(
            "host: {} CPUs in {} cache domain(s), grid {}",
            grid.cpus.len(),
            grid.space.height,
            grid.space
        );
        Ok(grid)
    }

    pub fn space(&self) -> AffinitySpace {
        self.space
    }

    pub fn cpus(&self) -> &[usize] {
        &self.cpus
    }

    /// Host CPU of an absolute cell.
    pub fn cpu(&self, loc: &AffinityLocation) -> Option<usize> {
        self.space
            .cell_index(loc)
            .and_then(|i| self.cpus.get(i).copied())
    }

    /// Absolute cell of a host CPU.
    pub fn cell_of(&self, cpu: usize) -> Option<AffinityLocation> {
        let index = self.cpus.iter().position(|&c| c == cpu)?;
        self.space.location_of(index)
    }
}
