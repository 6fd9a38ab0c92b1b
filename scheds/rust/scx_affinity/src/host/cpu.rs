// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use log::debug;
use log::info;
use log::warn;
use nix::sched::sched_setaffinity;
use nix::sched::CpuSet;
use nix::unistd::Pid;

use super::CpuGrid;
use super::ThreadRegistry;
use super::TracedThread;
use crate::affinity::AffinityLocation;
use crate::affinity::AffinitySpace;
use crate::backend::BackendSession;
use crate::backend::Capability;
use crate::backend::CpuError;
use crate::backend::ParentCpu;
use crate::backend::PdId;
use crate::backend::Quota;
use crate::backend::SessionArgs;
use crate::backend::SignalHandler;
use crate::backend::ThreadCap;
use crate::backend::Weight;

/// Length of a task name including the terminating NUL.
const TASK_COMM_LEN: usize = 16;

const SUPER_PERIOD_US: u64 = 1_000_000;

/// Applies CPU masks to host threads.
pub trait Pinning: Send {
    fn pin(&mut self, tid: u32, cpus: &[usize]) -> Result<(), CpuError>;
}

pub struct SchedPinning;

impl Pinning for SchedPinning {
    fn pin(&mut self, tid: u32, cpus: &[usize]) -> Result<(), CpuError> {
        let mut set = CpuSet::new();
        for &cpu in cpus {
            set.set(cpu)?;
        }
        sched_setaffinity(Pid::from_raw(tid as i32), &set)?;
        Ok(())
    }
}

/// The kernel's view of `name` as a task comm.
fn task_comm(name: &str) -> &str {
    let mut end = name.len().min(TASK_COMM_LEN - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

struct HostSession {
    label: String,
    window: AffinityLocation,
    ram_quota: u64,
    cap_quota: u64,
    quota: Quota,
    account: Option<BackendSession>,
    sigh: Option<SignalHandler>,
}

struct AdoptedThread {
    session: BackendSession,
    tid: u32,
}

/// CPU backend that adopts existing threads and steers them with affinity
/// masks.
pub struct HostCpu {
    proc_root: PathBuf,
    grid: CpuGrid,
    registry: ThreadRegistry,
    pinning: Box<dyn Pinning>,
    sessions: BTreeMap<BackendSession, HostSession>,
    threads: BTreeMap<ThreadCap, AdoptedThread>,
    next_session: u64,
    next_thread: u64,
}

impl HostCpu {
    pub fn new(
        proc_root: PathBuf,
        grid: CpuGrid,
        registry: ThreadRegistry,
        pinning: Box<dyn Pinning>,
    ) -> Self {
        Self {
            proc_root,
            grid,
            registry,
            pinning,
            sessions: BTreeMap::new(),
            threads: BTreeMap::new(),
            next_session: 1,
            next_thread: 1,
        }
    }

    /// Find a not yet adopted thread of process `pd` named `name`.
    fn find_thread(&self, pd: PdId, name: &str) -> Result<u32, CpuError> {
        let task_dir = self.proc_root.join(pd.0.to_string()).join("task");
        let comm = task_comm(name);

        let mut tids: Vec<u32> = fs::read_dir(&task_dir)?
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
            .collect();
        tids.sort_unstable();

        for tid in tids {
            if self.registry.contains(tid) {
                continue;
            }
            let Ok(content) = fs::read_to_string(task_dir.join(tid.to_string()).join("comm")) else {
                continue;
            };
            if content.trim_end_matches('\n') == comm {
                return Ok(tid);
            }
        }

        Err(CpuError::ThreadCreationFailed(format!(
            "no thread '{}' in process {}",
            name, pd.0
        )))
    }

    fn release(&mut self, cap: ThreadCap) {
        let Some(thread) = self.threads.remove(&cap) else {
            return;
        };
        if let Err(e) = self.pinning.pin(thread.tid, self.grid.cpus()) {
            debug!("host: failed to release tid {}: {}", thread.tid, e);
        }
        self.registry.unregister(thread.tid);
    }

    fn session(&self, session: BackendSession) -> Result<&HostSession, CpuError> {
        self.sessions
            .get(&session)
            .ok_or(CpuError::InvalidSession(session))
    }
}

impl ParentCpu for HostCpu {
    fn open_session(
        &mut self,
        args: &SessionArgs,
        location: AffinityLocation,
    ) -> Result<BackendSession, CpuError> {
        let session = BackendSession(self.next_session);
        self.next_session += 1;
        self.sessions.insert(
            session,
            HostSession {
                label: args.label.clone(),
                window: location,
                ram_quota: args.ram_quota,
                cap_quota: args.cap_quota,
                quota: Quota {
                    super_period_us: SUPER_PERIOD_US,
                    us: SUPER_PERIOD_US,
                },
                account: None,
                sigh: None,
            },
        );
        debug!("host: {} opened {:?} at {}", args.label, session, location);
        Ok(session)
    }

    fn upgrade(&mut self, session: BackendSession, ram: u64, caps: u64) -> Result<(), CpuError> {
        let s = self
            .sessions
            .get_mut(&session)
            .ok_or(CpuError::InvalidSession(session))?;
        s.ram_quota = s.ram_quota.saturating_add(ram);
        s.cap_quota = s.cap_quota.saturating_add(caps);
        Ok(())
    }

    fn close_session(&mut self, session: BackendSession) {
        let caps: Vec<ThreadCap> = self
            .threads
            .iter()
            .filter(|(_, t)| t.session == session)
            .map(|(cap, _)| *cap)
            .collect();
        for cap in caps {
            self.release(cap);
        }
        if let Some(s) = self.sessions.remove(&session) {
            debug!(
                "host: {} closed {:?} (ram {} caps {} handler {:?})",
                s.label, session, s.ram_quota, s.cap_quota, s.sigh
            );
        }
    }

    fn create_thread(
        &mut self,
        session: BackendSession,
        pd: PdId,
        name: &str,
        location: AffinityLocation,
        _weight: Weight,
        _utcb: u64,
    ) -> Result<ThreadCap, CpuError> {
        let label = self.session(session)?.label.clone();
        let cpu = self
            .grid
            .cpu(&location)
            .ok_or(CpuError::InvalidLocation(location))?;
        let tid = self.find_thread(pd, name)?;

        self.pinning.pin(tid, &[cpu])?;
        self.registry.register(
            tid,
            TracedThread {
                pid: pd.0 as u32,
                session_label: label.clone(),
                name: name.to_string(),
                pinned: Some(cpu),
            },
        );

        let cap = ThreadCap(self.next_thread);
        self.next_thread += 1;
        self.threads.insert(cap, AdoptedThread { session, tid });
        info!("host: {} adopted tid {} as '{}' on CPU {}", label, tid, name, cpu);
        Ok(cap)
    }

    fn kill_thread(&mut self, session: BackendSession, thread: ThreadCap) {
        let owned = self
            .threads
            .get(&thread)
            .is_some_and(|t| t.session == session);
        if owned {
            self.release(thread);
        } else {
            debug!("host: kill of unknown {}", thread);
        }
    }

    fn migrate_thread(
        &mut self,
        thread: ThreadCap,
        location: AffinityLocation,
    ) -> Result<(), CpuError> {
        let tid = self
            .threads
            .get(&thread)
            .ok_or(CpuError::InvalidThread(thread))?
            .tid;
        let cpu = self
            .grid
            .cpu(&location)
            .ok_or(CpuError::InvalidLocation(location))?;
        self.pinning.pin(tid, &[cpu])?;
        self.registry.set_pinned(tid, cpu);
        Ok(())
    }

    fn exception_sigh(&mut self, session: BackendSession, handler: SignalHandler) {
        match self.sessions.get_mut(&session) {
            Some(s) => s.sigh = Some(handler),
            None => warn!("host: exception handler for unknown {:?}", session),
        }
    }

    fn affinity_space(&self, _session: BackendSession) -> AffinitySpace {
        self.grid.space()
    }

    fn trace_control(&self, session: BackendSession) -> Option<Capability> {
        self.sessions
            .contains_key(&session)
            .then_some(Capability(session.0))
    }

    fn ref_account(
        &mut self,
        session: BackendSession,
        account: BackendSession,
    ) -> Result<(), CpuError> {
        self.session(account)?;
        let s = self
            .sessions
            .get_mut(&session)
            .ok_or(CpuError::InvalidSession(session))?;
        s.account = Some(account);
        Ok(())
    }

    fn transfer_quota(
        &mut self,
        session: BackendSession,
        to: BackendSession,
        amount: u64,
    ) -> Result<(), CpuError> {
        if self.session(to)?.account != Some(session) {
            return Err(CpuError::InvalidSession(to));
        }
        let from = self
            .sessions
            .get_mut(&session)
            .ok_or(CpuError::InvalidSession(session))?;
        let moved = amount.min(from.quota.us);
        from.quota.us -= moved;
        if let Some(to) = self.sessions.get_mut(&to) {
            to.quota.us += moved;
        }
        Ok(())
    }

    fn quota(&self, session: BackendSession) -> Quota {
        self.sessions
            .get(&session)
            .map(|s| s.quota)
            .unwrap_or_default()
    }

    fn native_cpu(&self, session: BackendSession) -> Capability {
        let window = self.sessions.get(&session).map(|s| s.window);
        let cpu = window.and_then(|w| self.grid.cpu(&w)).unwrap_or(0);
        Capability(cpu as u64)
    }
}
