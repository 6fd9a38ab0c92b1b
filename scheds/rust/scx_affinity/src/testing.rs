// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Simulated CPU backend and trace source shared by the unit tests.
//!
//! Both halves operate on one world state: threads created or migrated
//! through the backend show up at their new location in the trace.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;

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
use crate::trace::ExecutionTime;
use crate::trace::SubjectId;
use crate::trace::SubjectInfo;
use crate::trace::SubjectList;
use crate::trace::TraceError;
use crate::trace::TraceFactory;
use crate::trace::TraceSource;
use crate::trace::IDLE_LABEL;
use crate::trace::IDLE_NAME;

const THREAD_SUBJECT_BASE: u64 = 1000;

struct SimThread {
    cap: Option<ThreadCap>,
    label: String,
    name: String,
    location: AffinityLocation,
    alive: bool,
    hidden: bool,
}

type CreateHook = Box<dyn FnMut() + Send>;

struct SimSession {
    label: String,
    ram_quota: u64,
}

struct WorldState {
    space: AffinitySpace,
    idle: Vec<Option<ExecutionTime>>,
    threads: Vec<SimThread>,
    sessions: BTreeMap<u64, SimSession>,
    next_session: u64,
    capacity: Option<(usize, usize)>,
    oom_next_info: bool,
    migrations: usize,
    on_create: Option<CreateHook>,
}

impl WorldState {
    fn subject(&self, id: SubjectId) -> Option<SubjectInfo> {
        if id.0 >= THREAD_SUBJECT_BASE {
            let thread = self.threads.get((id.0 - THREAD_SUBJECT_BASE) as usize)?;
            if !thread.alive || thread.hidden {
                return None;
            }
            return Some(SubjectInfo {
                session_label: thread.label.clone(),
                thread_name: thread.name.clone(),
                affinity: thread.location,
                execution_time: ExecutionTime::new(5, 5),
            });
        }

        let cpu = id.0.checked_sub(1)? as usize;
        let time = (*self.idle.get(cpu)?)?;
        Some(SubjectInfo {
            session_label: IDLE_LABEL.to_string(),
            thread_name: IDLE_NAME.to_string(),
            affinity: self.space.location_of(cpu)?,
            execution_time: time,
        })
    }

    fn subject_ids(&self) -> Vec<SubjectId> {
        let idle = (0..self.idle.len()).map(|cpu| SubjectId(cpu as u64 + 1));
        let threads = (0..self.threads.len()).map(|i| SubjectId(THREAD_SUBJECT_BASE + i as u64));
        idle.chain(threads).collect()
    }

    fn thread_mut(&mut self, cap: ThreadCap) -> Option<&mut SimThread> {
        self.threads
            .iter_mut()
            .find(|t| t.alive && t.cap == Some(cap))
    }
}

#[derive(Clone)]
pub struct SimWorld {
    state: Arc<Mutex<WorldState>>,
}

impl SimWorld {
    pub fn new(width: u32, height: u32) -> Self {
        let space = AffinitySpace::new(width, height);
        Self {
            state: Arc::new(Mutex::new(WorldState {
                space,
                idle: vec![Some(ExecutionTime::default()); space.total() as usize],
                threads: Vec::new(),
                sessions: BTreeMap::new(),
                next_session: 1,
                capacity: None,
                oom_next_info: false,
                migrations: 0,
                on_create: None,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, WorldState> {
        self.state.lock().unwrap()
    }

    pub fn space(&self) -> AffinitySpace {
        self.state().space
    }

    pub fn trace_factory(&self) -> Box<dyn TraceFactory> {
        Box::new(SimTraceFactory {
            world: self.clone(),
        })
    }

    pub fn parent_cpu(&self) -> Box<dyn ParentCpu> {
        Box::new(SimCpu {
            world: self.clone(),
        })
    }

    /// A thread not created through the backend.
    pub fn add_foreign_thread(&self, label: &str, name: &str, location: AffinityLocation) {
        self.state().threads.push(SimThread {
            cap: None,
            label: label.to_string(),
            name: name.to_string(),
            location,
            alive: true,
            hidden: false,
        });
    }

    fn set_hidden(&self, label: &str, name: &str, hidden: bool) {
        let mut state = self.state();
        for t in state
            .threads
            .iter_mut()
            .filter(|t| t.alive && t.label == label && t.name == name)
        {
            t.hidden = hidden;
        }
    }

    /// Keep a live thread out of the trace while it still runs.
    pub fn hide_thread(&self, label: &str, name: &str) {
        self.set_hidden(label, name, true);
    }

    pub fn show_thread(&self, label: &str, name: &str) {
        self.set_hidden(label, name, false);
    }

    /// Run `hook` inside every backend thread creation, without the world
    /// lock held.
    pub fn on_create_thread(&self, hook: impl FnMut() + Send + 'static) {
        self.state().on_create = Some(Box::new(hook));
    }

    /// Let a source opened with `base_quota` list at most `n` subjects. The
    /// capacity scales linearly with the quota.
    pub fn set_subjects_per_quota(&self, base_quota: usize, n: usize) {
        self.state().capacity = Some((base_quota, n));
    }

    pub fn fail_next_info_with_oom(&self) {
        self.state().oom_next_info = true;
    }

    pub fn set_idle(&self, cpu: usize, time: ExecutionTime) {
        self.state().idle[cpu] = Some(time);
    }

    /// Remove the idle subject of `cpu` from the trace.
    pub fn hide_idle(&self, cpu: usize) {
        self.state().idle[cpu] = None;
    }

    /// Absolute location of the live thread `name` of session `label`.
    pub fn thread_location(&self, label: &str, name: &str) -> Option<AffinityLocation> {
        self.state()
            .threads
            .iter()
            .rev()
            .find(|t| t.alive && t.label == label && t.name == name)
            .map(|t| t.location)
    }

    pub fn live_threads(&self) -> usize {
        self.state().threads.iter().filter(|t| t.alive).count()
    }

    pub fn migrations(&self) -> usize {
        self.state().migrations
    }

    pub fn session_ram(&self, label: &str) -> Option<u64> {
        self.state()
            .sessions
            .values()
            .find(|s| s.label == label)
            .map(|s| s.ram_quota)
    }

    pub fn open_sessions(&self) -> usize {
        self.state().sessions.len()
    }
}

struct SimTraceFactory {
    world: SimWorld,
}

impl TraceFactory for SimTraceFactory {
    fn connect(&mut self, ram_quota: usize) -> Result<Box<dyn TraceSource>, TraceError> {
        Ok(Box::new(SimTrace {
            world: self.world.clone(),
            ram_quota,
        }))
    }
}

struct SimTrace {
    world: SimWorld,
    ram_quota: usize,
}

impl TraceSource for SimTrace {
    fn subjects(&mut self) -> Result<SubjectList, TraceError> {
        let state = self.world.state();
        let limit = state
            .capacity
            .map(|(base, n)| n * self.ram_quota / base)
            .unwrap_or(usize::MAX);

        let mut list = SubjectList::default();
        for id in state.subject_ids() {
            let Some(info) = state.subject(id) else {
                continue;
            };
            if list.subjects.len() >= limit {
                list.truncated = true;
                break;
            }
            list.subjects.push((id, info));
        }
        Ok(list)
    }

    fn subject_info(&mut self, id: SubjectId) -> Result<SubjectInfo, TraceError> {
        let mut state = self.world.state();
        if std::mem::take(&mut state.oom_next_info) {
            return Err(TraceError::OutOfRam);
        }
        state.subject(id).ok_or(TraceError::InvalidSubject(id))
    }
}

struct SimCpu {
    world: SimWorld,
}

impl ParentCpu for SimCpu {
    fn open_session(
        &mut self,
        args: &SessionArgs,
        _location: AffinityLocation,
    ) -> Result<BackendSession, CpuError> {
        let mut state = self.world.state();
        let id = state.next_session;
        state.next_session += 1;
        state.sessions.insert(
            id,
            SimSession {
                label: args.label.clone(),
                ram_quota: args.ram_quota,
            },
        );
        Ok(BackendSession(id))
    }

    fn upgrade(&mut self, session: BackendSession, ram: u64, _caps: u64) -> Result<(), CpuError> {
        let mut state = self.world.state();
        let s = state
            .sessions
            .get_mut(&session.0)
            .ok_or(CpuError::InvalidSession(session))?;
        s.ram_quota += ram;
        Ok(())
    }

    fn close_session(&mut self, session: BackendSession) {
        let mut state = self.world.state();
        if let Some(s) = state.sessions.remove(&session.0) {
            for t in state.threads.iter_mut().filter(|t| t.label == s.label) {
                t.alive = false;
            }
        }
    }

    fn create_thread(
        &mut self,
        session: BackendSession,
        _pd: PdId,
        name: &str,
        location: AffinityLocation,
        _weight: Weight,
        _utcb: u64,
    ) -> Result<ThreadCap, CpuError> {
        let hook = self.world.state().on_create.take();
        if let Some(mut hook) = hook {
            hook();
            self.world.state().on_create = Some(hook);
        }

        let mut state = self.world.state();
        let label = state
            .sessions
            .get(&session.0)
            .ok_or(CpuError::InvalidSession(session))?
            .label
            .clone();
        if state.space.cell_index(&location).is_none() {
            return Err(CpuError::InvalidLocation(location));
        }
        let cap = ThreadCap(state.threads.len() as u64 + 1);
        state.threads.push(SimThread {
            cap: Some(cap),
            label,
            name: name.to_string(),
            location: AffinityLocation::cell(location.x, location.y),
            alive: true,
            hidden: false,
        });
        Ok(cap)
    }

    fn kill_thread(&mut self, _session: BackendSession, thread: ThreadCap) {
        if let Some(t) = self.world.state().thread_mut(thread) {
            t.alive = false;
        }
    }

    fn migrate_thread(
        &mut self,
        thread: ThreadCap,
        location: AffinityLocation,
    ) -> Result<(), CpuError> {
        let mut state = self.world.state();
        if state.space.cell_index(&location).is_none() {
            return Err(CpuError::InvalidLocation(location));
        }
        let t = state
            .thread_mut(thread)
            .ok_or(CpuError::InvalidThread(thread))?;
        t.location = location;
        state.migrations += 1;
        Ok(())
    }

    fn exception_sigh(&mut self, _session: BackendSession, _handler: SignalHandler) {}

    fn affinity_space(&self, _session: BackendSession) -> AffinitySpace {
        self.world.space()
    }

    fn trace_control(&self, session: BackendSession) -> Option<Capability> {
        Some(Capability(session.0))
    }

    fn ref_account(
        &mut self,
        session: BackendSession,
        account: BackendSession,
    ) -> Result<(), CpuError> {
        let state = self.world.state();
        for s in [session, account] {
            if !state.sessions.contains_key(&s.0) {
                return Err(CpuError::InvalidSession(s));
            }
        }
        Ok(())
    }

    fn transfer_quota(
        &mut self,
        session: BackendSession,
        to: BackendSession,
        _amount: u64,
    ) -> Result<(), CpuError> {
        self.ref_account(session, to)
    }

    fn quota(&self, _session: BackendSession) -> Quota {
        Quota {
            super_period_us: 1_000_000,
            us: 1_000_000,
        }
    }

    fn native_cpu(&self, session: BackendSession) -> Capability {
        Capability(session.0 + 100)
    }
}
