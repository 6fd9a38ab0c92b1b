// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Trace source backed by procfs.
//!
//! Idle subjects are the per-CPU idle counters of `/proc/stat`. Thread
//! subjects are the threads adopted through [`super::HostCpu`], read from
//! `/proc/<pid>/task/<tid>/{stat,schedstat}`. A pinned thread is reported on
//! the CPU of its mask rather than the CPU it last ran on.

use std::fs;
use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use log::debug;

use super::CpuGrid;
use super::ThreadRegistry;
use crate::trace::ExecutionTime;
use crate::trace::SubjectId;
use crate::trace::SubjectInfo;
use crate::trace::SubjectList;
use crate::trace::TraceError;
use crate::trace::TraceFactory;
use crate::trace::TraceSource;
use crate::trace::IDLE_LABEL;
use crate::trace::IDLE_NAME;

/// Buffer space one listed subject takes out of the RAM quota.
pub const SUBJECT_ENTRY_SIZE: usize = 256;

/// Thread subjects are numbered above every possible CPU subject.
const THREAD_SUBJECT_BASE: u64 = 1 << 32;

pub fn clock_ticks_per_sec() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

fn ticks_to_us(ticks: u64, hz: u64) -> u64 {
    ticks.saturating_mul(1_000_000) / hz.max(1)
}

/// Per-CPU idle ticks of a `/proc/stat` document.
pub fn parse_cpu_idle(content: &str) -> Vec<(usize, u64)> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let cpu = fields.next()?.strip_prefix("cpu")?.parse::<usize>().ok()?;
            // user nice system idle
            let idle = fields.nth(3)?.parse::<u64>().ok()?;
            Some((cpu, idle))
        })
        .collect()
}

/// Fields of `/proc/<pid>/task/<tid>/stat` the scheduler cares about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadStat {
    pub tid: u32,
    pub comm: String,
    pub utime: u64,
    pub stime: u64,
    /// CPU the thread last executed on.
    pub processor: Option<usize>,
}

impl ThreadStat {
    pub fn from_proc(proc_root: &Path, pid: u32, tid: u32) -> Result<Self> {
        let path = task_dir(proc_root, pid, tid).join("stat");
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse_stat(&content, tid)
    }

    /// Format: pid (comm) state ppid ... utime stime ... processor ...
    fn parse_stat(content: &str, tid: u32) -> Result<Self> {
        let comm_start = content.find('(').context("Invalid stat format")?;
        let comm_end = content.rfind(')').context("Invalid stat format")?;
        let comm = content[comm_start + 1..comm_end].to_string();
        let fields: Vec<&str> = content
            .get(comm_end + 2..)
            .unwrap_or("")
            .split_whitespace()
            .collect();
        if fields.len() < 13 {
            anyhow::bail!("Insufficient fields in stat file");
        }

        // 0=state ... 11=utime 12=stime ... 36=processor
        Ok(Self {
            tid,
            comm,
            utime: fields.get(11).and_then(|s| s.parse().ok()).unwrap_or(0),
            stime: fields.get(12).and_then(|s| s.parse().ok()).unwrap_or(0),
            processor: fields.get(36).and_then(|s| s.parse().ok()),
        })
    }

    pub fn total_time(&self) -> u64 {
        self.utime + self.stime
    }
}

pub fn task_dir(proc_root: &Path, pid: u32, tid: u32) -> PathBuf {
    proc_root
        .join(pid.to_string())
        .join("task")
        .join(tid.to_string())
}

/// On-CPU time in nanoseconds from `schedstat`.
fn read_schedstat(proc_root: &Path, pid: u32, tid: u32) -> Option<u64> {
    let content = fs::read_to_string(task_dir(proc_root, pid, tid).join("schedstat")).ok()?;
    content.split_whitespace().next()?.parse().ok()
}

pub struct ProcfsTraceFactory {
    proc_root: PathBuf,
    grid: CpuGrid,
    registry: ThreadRegistry,
}

impl ProcfsTraceFactory {
    pub fn new(proc_root: PathBuf, grid: CpuGrid, registry: ThreadRegistry) -> Self {
        Self {
            proc_root,
            grid,
            registry,
        }
    }
}

impl TraceFactory for ProcfsTraceFactory {
    fn connect(&mut self, ram_quota: usize) -> Result<Box<dyn TraceSource>, TraceError> {
        if !self.proc_root.join("stat").exists() {
            return Err(TraceError::Connect(format!(
                "{} is not a procfs mount",
                self.proc_root.display()
            )));
        }
        Ok(Box::new(ProcfsTrace {
            proc_root: self.proc_root.clone(),
            grid: self.grid.clone(),
            registry: self.registry.clone(),
            capacity: ram_quota / SUBJECT_ENTRY_SIZE,
            hz: clock_ticks_per_sec(),
        }))
    }
}

pub struct ProcfsTrace {
    proc_root: PathBuf,
    grid: CpuGrid,
    registry: ThreadRegistry,
    capacity: usize,
    hz: u64,
}

impl ProcfsTrace {
    fn cpu_idle(&self) -> Result<Vec<(usize, u64)>, TraceError> {
        let content = fs::read_to_string(self.proc_root.join("stat"))?;
        Ok(parse_cpu_idle(&content))
    }

    fn idle_info(&self, cpu: usize, ticks: u64) -> Option<SubjectInfo> {
        let us = ticks_to_us(ticks, self.hz);
        Some(SubjectInfo {
            session_label: IDLE_LABEL.to_string(),
            thread_name: IDLE_NAME.to_string(),
            affinity: self.grid.cell_of(cpu)?,
            execution_time: ExecutionTime::new(us, us),
        })
    }

    fn thread_info(&self, tid: u32) -> Option<SubjectInfo> {
        let thread = self.registry.get(tid)?;
        let stat = match ThreadStat::from_proc(&self.proc_root, thread.pid, tid) {
            Ok(stat) => stat,
            Err(e) => {
                debug!("trace: thread {} gone: {:#}", tid, e);
                return None;
            }
        };
        let run_us = read_schedstat(&self.proc_root, thread.pid, tid).map_or(0, |ns| ns / 1000);
        let affinity = thread
            .pinned
            .or(stat.processor)
            .and_then(|cpu| self.grid.cell_of(cpu))
            .unwrap_or_default();

        Some(SubjectInfo {
            session_label: thread.session_label,
            thread_name: thread.name,
            affinity,
            execution_time: ExecutionTime::new(ticks_to_us(stat.total_time(), self.hz), run_us),
        })
    }
}

impl TraceSource for ProcfsTrace {
    fn subjects(&mut self) -> Result<SubjectList, TraceError> {
        let mut list = SubjectList::default();

        let idle = self
            .cpu_idle()?
            .into_iter()
            .filter_map(|(cpu, ticks)| Some((SubjectId(cpu as u64 + 1), self.idle_info(cpu, ticks)?)));
        let threads = self.registry.tids().into_iter().filter_map(|tid| {
            Some((
                SubjectId(THREAD_SUBJECT_BASE + tid as u64),
                self.thread_info(tid)?,
            ))
        });

        for subject in idle.chain(threads) {
            if list.subjects.len() >= self.capacity {
                list.truncated = true;
                break;
            }
            list.subjects.push(subject);
        }
        Ok(list)
    }

    fn subject_info(&mut self, id: SubjectId) -> Result<SubjectInfo, TraceError> {
        let info = if id.0 >= THREAD_SUBJECT_BASE {
            self.thread_info((id.0 - THREAD_SUBJECT_BASE) as u32)
        } else {
            let cpu = id.0.checked_sub(1).map(|c| c as usize);
            self.cpu_idle()?
                .into_iter()
                .find(|(c, _)| Some(*c) == cpu)
                .and_then(|(c, ticks)| self.idle_info(c, ticks))
        };
        info.ok_or(TraceError::InvalidSubject(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::affinity::AffinityLocation;
    use crate::affinity::AffinitySpace;
    use crate::host::TracedThread;
    use crate::trace::TraceConnection;

    fn stat_line(tid: u32, comm: &str, utime: u64, stime: u64, cpu: usize) -> String {
        let mut fields = vec!["0".to_string(); 40];
        fields[0] = "S".to_string();
        fields[11] = utime.to_string();
        fields[12] = stime.to_string();
        fields[36] = cpu.to_string();
        format!("{} ({}) {}\n", tid, comm, fields.join(" "))
    }

    struct FakeProc {
        dir: tempfile::TempDir,
        registry: ThreadRegistry,
    }

    impl FakeProc {
        fn new(idle: &[u64]) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let mut stat = String::from("cpu  1 2 3 4 0 0 0 0 0 0\n");
            for (cpu, ticks) in idle.iter().enumerate() {
                stat += &format!("cpu{} 1 0 1 {} 0 0 0 0 0 0\n", cpu, ticks);
            }
            stat += "intr 1\nctxt 2\n";
            fs::write(dir.path().join("stat"), stat).unwrap();
            Self {
                dir,
                registry: ThreadRegistry::default(),
            }
        }

        fn add_thread(&self, pid: u32, tid: u32, comm: &str, cpu: usize) {
            let task = task_dir(self.dir.path(), pid, tid);
            fs::create_dir_all(&task).unwrap();
            fs::write(task.join("stat"), stat_line(tid, comm, 30, 20, cpu)).unwrap();
            fs::write(task.join("schedstat"), "5000000 100 3\n").unwrap();
            self.registry.register(
                tid,
                TracedThread {
                    pid,
                    session_label: "init -> app".to_string(),
                    name: comm.to_string(),
                    pinned: None,
                },
            );
        }

        fn factory(&self, space: AffinitySpace) -> ProcfsTraceFactory {
            self.factory_on(CpuGrid::linear(space))
        }

        fn factory_on(&self, grid: CpuGrid) -> ProcfsTraceFactory {
            ProcfsTraceFactory::new(self.dir.path().to_path_buf(), grid, self.registry.clone())
        }
    }

    #[test]
    fn parses_thread_stat() {
        let stat = ThreadStat::parse_stat(&stat_line(42, "worker (1)", 10, 5, 3), 42).unwrap();
        assert_eq!(stat.comm, "worker (1)");
        assert_eq!(stat.total_time(), 15);
        assert_eq!(stat.processor, Some(3));
        assert!(ThreadStat::parse_stat("42 (x) S 1", 42).is_err());
    }

    #[test]
    fn parses_cpu_idle() {
        let idle = parse_cpu_idle("cpu  1 1 1 9\ncpu0 1 1 1 4\ncpu1 1 1 1 5\nintr 3\n");
        assert_eq!(idle, vec![(0, 4), (1, 5)]);
    }

    #[test]
    fn lists_idle_and_adopted_threads() {
        let proc = FakeProc::new(&[100, 200]);
        proc.add_thread(10, 11, "ep", 1);
        let space = AffinitySpace::new(2, 1);
        let mut source = proc.factory(space).connect(64 * 1024).unwrap();

        let list = source.subjects().unwrap();
        assert!(!list.truncated);
        assert_eq!(list.subjects.len(), 3);

        let hz = clock_ticks_per_sec();
        let (id, info) = &list.subjects[1];
        assert!(info.is_idle_of(&AffinityLocation::cell(1, 0)));
        assert_eq!(info.execution_time.thread_context, ticks_to_us(200, hz));
        assert_eq!(source.subject_info(*id).unwrap(), *info);

        let (id, info) = &list.subjects[2];
        assert_eq!(info.thread_name, "ep");
        assert_eq!(info.affinity, AffinityLocation::cell(1, 0));
        assert_eq!(info.execution_time.scheduling_context, 5000);

        proc.registry.unregister(11);
        assert!(matches!(
            source.subject_info(*id),
            Err(TraceError::InvalidSubject(_))
        ));
    }

    #[test]
    fn pinned_thread_reports_its_mask() {
        let proc = FakeProc::new(&[1, 1, 1, 1]);
        proc.add_thread(10, 11, "ep", 1);
        let mut source = proc.factory(AffinitySpace::new(4, 1)).connect(64 * 1024).unwrap();
        let id = SubjectId(THREAD_SUBJECT_BASE + 11);
        assert_eq!(source.subject_info(id).unwrap().affinity, AffinityLocation::cell(1, 0));

        // Last ran on CPU 1 before the mask moved it to CPU 2.
        proc.registry.set_pinned(11, 2);
        assert_eq!(source.subject_info(id).unwrap().affinity, AffinityLocation::cell(2, 0));
    }

    #[test]
    fn cpus_map_through_cache_domains() {
        let proc = FakeProc::new(&[1, 2, 3, 4]);
        let grid = CpuGrid::from_rows(vec![vec![0, 2], vec![1, 3]]);
        let mut source = proc.factory_on(grid).connect(64 * 1024).unwrap();

        let list = source.subjects().unwrap();
        let cells: Vec<AffinityLocation> = list.subjects.iter().map(|(_, i)| i.affinity).collect();
        assert_eq!(
            cells,
            vec![
                AffinityLocation::cell(0, 0),
                AffinityLocation::cell(0, 1),
                AffinityLocation::cell(1, 0),
                AffinityLocation::cell(1, 1),
            ]
        );
    }

    #[test]
    fn small_quota_truncates() {
        let proc = FakeProc::new(&[1, 1]);
        proc.add_thread(10, 11, "ep", 0);
        let space = AffinitySpace::new(2, 1);
        let mut trace = TraceConnection::new(Box::new(proc.factory(space)));

        // Default quota lists far more than three subjects.
        assert!(trace.lookup_thread("init -> app", "ep").unwrap().is_some());

        let mut source = proc.factory(space).connect(2 * SUBJECT_ENTRY_SIZE).unwrap();
        let list = source.subjects().unwrap();
        assert!(list.truncated);
        assert_eq!(list.subjects.len(), 2);
    }

    #[test]
    fn connect_requires_procfs() {
        let dir = tempfile::tempdir().unwrap();
        let mut factory = ProcfsTraceFactory::new(
            dir.path().to_path_buf(),
            CpuGrid::linear(AffinitySpace::new(1, 1)),
            ThreadRegistry::default(),
        );
        assert!(matches!(factory.connect(4096), Err(TraceError::Connect(_))));
    }
}
