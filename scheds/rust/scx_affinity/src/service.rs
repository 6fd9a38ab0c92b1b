// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! The scheduler: session management and the periodic control loop.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::TryLockError;
use std::time::Duration;

use anyhow::Result;
use log::debug;
use log::info;
use log::warn;
use log::LevelFilter;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::affinity::AffinityLocation;
use crate::affinity::AffinitySpace;
use crate::backend::BackendSession;
use crate::backend::Capability;
use crate::backend::CpuError;
use crate::backend::PdId;
use crate::backend::Quota;
use crate::backend::SessionArgs;
use crate::backend::SignalHandler;
use crate::backend::ThreadCap;
use crate::backend::Weight;
use crate::config::Config;
use crate::config::MIN_INTERVAL_US;
use crate::idle::IdleTracker;
use crate::outbound::Outbound;
use crate::report::StatusReport;
use crate::session::Feedback;
use crate::session::Session;
use crate::session::SessionId;
use crate::stats::Metrics;
use crate::trace::TraceConnection;
use crate::trace::TraceError;
use crate::trace::TraceFactory;

/// RAM a client has to donate for the bookkeeping of one session.
pub const SESSION_SLOT_SIZE: u64 = std::mem::size_of::<Session>() as u64;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("insufficient RAM quota: {offered} bytes offered, {required} required")]
    InsufficientQuota { required: u64, offered: u64 },

    #[error("invalid session {0}")]
    InvalidSession(SessionId),

    #[error("backend busy with a thread operation")]
    Busy,

    #[error(transparent)]
    Backend(#[from] CpuError),
}

/// Arguments of a session open request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenArgs {
    pub label: String,
    pub ram_quota: u64,
    pub cap_quota: u64,
    /// Affinity space as seen by the client.
    pub space: AffinitySpace,
    /// Requested window. An empty window asks for the whole space.
    pub location: AffinityLocation,
}

/// Window granted for a session open with `space` and `location` on a host
/// grid of extent `host`.
fn session_window(
    host: AffinitySpace,
    space: AffinitySpace,
    location: AffinityLocation,
) -> AffinityLocation {
    if space.is_empty() {
        return AffinityLocation::cell(0, 0);
    }
    let wanted = if location.is_valid() {
        location
    } else {
        space.window()
    };
    host.crop(&wanted).unwrap_or(AffinityLocation::cell(0, 0))
}

struct SchedulerState {
    config: Config,
    sessions: BTreeMap<SessionId, Session>,
    next_id: u64,
    trace: Option<TraceConnection>,
    idle: IdleTracker,
    /// Set when sessions or threads came or went since the last report.
    layout_changed: bool,
    last_report: StatusReport,
    metrics: Metrics,
}

impl SchedulerState {
    /// Push the thread policies of the current document into every session.
    fn apply_config(&mut self) {
        let Self {
            config, sessions, ..
        } = self;
        for session in sessions.values_mut() {
            let label = session.label().to_string();
            for thread in config.threads_of(&label) {
                if let Err(err) = session.configure(&thread.name, thread.policy, thread.location()) {
                    warn!("{}: ignoring policy of thread '{}': {}", label, thread.name, err);
                }
            }
        }
    }

    /// Evaluate every session. Returns whether the placement changed.
    fn evaluate(&mut self, outbound: &Outbound) -> Result<bool, TraceError> {
        let Self {
            config,
            sessions,
            trace,
            idle,
            layout_changed,
            metrics,
            ..
        } = self;

        let mut trace = if config.trace { trace.as_mut() } else { None };
        if let Some(trace) = trace.as_deref_mut() {
            trace.begin_tick();
            idle.sample(trace)?;
        }
        let idle = trace.is_some().then_some(&*idle);

        let mut changed = std::mem::take(layout_changed);
        for session in sessions.values_mut() {
            let mut feedback = Feedback {
                trace: trace.as_deref_mut(),
                idle,
            };
            let eval = session.evaluate_and_migrate(&mut feedback, outbound)?;
            metrics.migrations += eval.migrations;
            metrics.unresolved += eval.unresolved;

            let dirty = session.take_report_dirty();
            if eval.migrations > 0 || dirty {
                changed = true;
            }
        }
        Ok(changed)
    }

    fn update_gauges(&mut self) {
        self.metrics.sessions = self.sessions.len() as u64;
        self.metrics.threads = self.sessions.values().map(|s| s.live_threads() as u64).sum();
        self.metrics.idle_unresolved = self.idle.unresolved() as u64;
        self.metrics.trace_reconstructs = self.trace.as_ref().map_or(0, |t| t.reconstructs());
    }
}

/// Session management and the control loop run on a different context than
/// thread operations, and the backend may call back into the scheduler while
/// serving a thread operation. Holders of `gate` own the backend: thread
/// operations wait for it, everything else gives up with
/// [`SessionError::Busy`] instead of queueing behind a call that may be
/// waiting on them. Lock order is `gate` before `state`.
pub struct SchedulerService {
    gate: Mutex<()>,
    state: Mutex<SchedulerState>,
    outbound: Outbound,
    space: AffinitySpace,
    config_path: Option<PathBuf>,
    report_path: Option<PathBuf>,
    interval_override: Option<u64>,
    log_level: Option<LevelFilter>,
}

impl SchedulerService {
    /// Scheduler on a host grid of extent `space`. Without a trace factory
    /// threads are assumed to stay where they were put and no idle time is
    /// tracked.
    pub fn new(
        outbound: Outbound,
        space: AffinitySpace,
        trace: Option<Box<dyn TraceFactory>>,
    ) -> Self {
        Self {
            gate: Mutex::new(()),
            state: Mutex::new(SchedulerState {
                config: Config::default(),
                sessions: BTreeMap::new(),
                next_id: 1,
                trace: trace.map(TraceConnection::new),
                idle: IdleTracker::new(space),
                layout_changed: false,
                last_report: StatusReport::default(),
                metrics: Metrics::default(),
            }),
            outbound,
            space,
            config_path: None,
            report_path: None,
            interval_override: None,
            log_level: None,
        }
    }

    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    pub fn with_report_path(mut self, path: PathBuf) -> Self {
        self.report_path = Some(path);
        self
    }

    pub fn with_interval_override(mut self, interval_us: Option<u64>) -> Self {
        self.interval_override = interval_us;
        self
    }

    /// Level restored when the document's `verbose` flag is cleared.
    pub fn with_log_level(mut self, level: LevelFilter) -> Self {
        self.log_level = Some(level);
        self
    }

    fn state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait for the backend. Used by thread operations.
    fn claim_backend(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the backend if no thread operation holds it.
    fn try_claim_backend(&self) -> Result<MutexGuard<'_, ()>, SessionError> {
        match self.gate.try_lock() {
            Ok(guard) => Ok(guard),
            Err(TryLockError::Poisoned(e)) => Ok(e.into_inner()),
            Err(TryLockError::WouldBlock) => Err(SessionError::Busy),
        }
    }

    pub fn space(&self) -> AffinitySpace {
        self.space
    }

    pub fn config(&self) -> Config {
        self.state().config.clone()
    }

    pub fn interval(&self) -> Duration {
        match self.interval_override {
            Some(us) => Duration::from_micros(us.max(MIN_INTERVAL_US)),
            None => self.state().config.interval(),
        }
    }

    pub fn metrics(&self) -> Metrics {
        let mut state = self.state();
        state.update_gauges();
        state.metrics.clone()
    }

    /// Report of the current placement.
    pub fn status_report(&self) -> StatusReport {
        StatusReport::generate(self.state().sessions.values())
    }

    /// Report written by the most recent tick that changed the placement.
    pub fn last_report(&self) -> StatusReport {
        self.state().last_report.clone()
    }

    fn backend_of(&self, id: SessionId) -> Result<BackendSession, SessionError> {
        self.state()
            .sessions
            .get(&id)
            .map(|s| s.backend())
            .ok_or(SessionError::InvalidSession(id))
    }

    pub fn open_session(&self, args: OpenArgs) -> Result<SessionId, SessionError> {
        if args.ram_quota < SESSION_SLOT_SIZE {
            return Err(SessionError::InsufficientQuota {
                required: SESSION_SLOT_SIZE,
                offered: args.ram_quota,
            });
        }

        let _backend = self.try_claim_backend()?;
        let base = session_window(self.space, args.space, args.location);
        let backend_args = SessionArgs {
            label: args.label.clone(),
            ram_quota: args.ram_quota - SESSION_SLOT_SIZE,
            cap_quota: args.cap_quota,
        };
        let backend = self
            .outbound
            .try_call(move |cpu| cpu.open_session(&backend_args, base))?;

        let mut state = self.state();
        let id = SessionId(state.next_id);
        state.next_id += 1;
        state
            .sessions
            .insert(id, Session::new(id, &args.label, base, backend));
        state.apply_config();
        state.layout_changed = true;
        info!("{}: opened {} with window {}", args.label, id, base);
        Ok(id)
    }

    /// Unknown sessions are ignored.
    pub fn upgrade(&self, id: SessionId, ram: u64, caps: u64) -> Result<(), SessionError> {
        let _backend = self.try_claim_backend()?;
        let Ok(backend) = self.backend_of(id) else {
            debug!("upgrade of unknown {}", id);
            return Ok(());
        };
        self.outbound
            .try_call(move |cpu| cpu.upgrade(backend, ram, caps))?;
        Ok(())
    }

    /// Unknown sessions are ignored.
    pub fn close_session(&self, id: SessionId) -> Result<(), SessionError> {
        let _backend = self.try_claim_backend()?;
        let session = {
            let mut state = self.state();
            let session = state.sessions.remove(&id);
            if session.is_some() {
                state.layout_changed = true;
            }
            session
        };
        let Some(session) = session else {
            debug!("close of unknown {}", id);
            return Ok(());
        };

        let backend = session.backend();
        self.outbound.call(move |cpu| cpu.close_session(backend))?;
        info!(
            "{}: closed {} with {} threads",
            session.label(),
            id,
            session.live_threads()
        );
        Ok(())
    }

    /// Create thread `name` at `location`, relative to the session's window.
    ///
    /// The backend call is made without holding the state lock.
    pub fn create_thread(
        &self,
        id: SessionId,
        pd: PdId,
        name: &str,
        location: AffinityLocation,
        weight: Weight,
        utcb: u64,
    ) -> Result<ThreadCap, SessionError> {
        let _backend = self.claim_backend();
        let (backend, base) = {
            let state = self.state();
            let session = state
                .sessions
                .get(&id)
                .ok_or(SessionError::InvalidSession(id))?;
            (session.backend(), session.base())
        };

        let rel = base.wrap(&location);
        let abs = base.absolute(&rel);
        let thread_name = name.to_string();
        let cap = self.outbound.try_call(move |cpu| {
            cpu.create_thread(backend, pd, &thread_name, abs, weight, utcb)
        })?;

        let mut state = self.state();
        let Some(session) = state.sessions.get_mut(&id) else {
            warn!("{} closed while creating thread '{}'", id, name);
            self.outbound
                .call(move |cpu| cpu.kill_thread(backend, cap))?;
            return Err(SessionError::InvalidSession(id));
        };
        if session.attach_thread(name, cap, rel) {
            state.layout_changed = true;
        }
        Ok(cap)
    }

    /// Unknown sessions are ignored.
    pub fn kill_thread(&self, id: SessionId, thread: ThreadCap) -> Result<(), SessionError> {
        let _backend = self.claim_backend();
        let Ok(backend) = self.backend_of(id) else {
            debug!("kill of {} in unknown {}", thread, id);
            return Ok(());
        };
        self.outbound
            .call(move |cpu| cpu.kill_thread(backend, thread))?;

        let mut state = self.state();
        let detached = state
            .sessions
            .get_mut(&id)
            .and_then(|s| s.detach_thread(thread));
        if let Some(name) = detached {
            debug!("{}: thread '{}' {} killed", id, name, thread);
            state.layout_changed = true;
        }
        Ok(())
    }

    pub fn exception_sigh(&self, id: SessionId, handler: SignalHandler) -> Result<(), SessionError> {
        let _backend = self.claim_backend();
        let backend = self.backend_of(id)?;
        self.outbound
            .call(move |cpu| cpu.exception_sigh(backend, handler))?;
        Ok(())
    }

    pub fn affinity_space(&self, id: SessionId) -> Result<AffinitySpace, SessionError> {
        let _backend = self.claim_backend();
        let backend = self.backend_of(id)?;
        Ok(self.outbound.call(move |cpu| cpu.affinity_space(backend))?)
    }

    pub fn trace_control(&self, id: SessionId) -> Result<Option<Capability>, SessionError> {
        let _backend = self.claim_backend();
        let backend = self.backend_of(id)?;
        Ok(self.outbound.call(move |cpu| cpu.trace_control(backend))?)
    }

    pub fn ref_account(&self, id: SessionId, account: SessionId) -> Result<(), SessionError> {
        let _backend = self.claim_backend();
        let backend = self.backend_of(id)?;
        let account = self.backend_of(account)?;
        self.outbound
            .try_call(move |cpu| cpu.ref_account(backend, account))?;
        Ok(())
    }

    pub fn transfer_quota(
        &self,
        id: SessionId,
        to: SessionId,
        amount: u64,
    ) -> Result<(), SessionError> {
        let _backend = self.claim_backend();
        let backend = self.backend_of(id)?;
        let to = self.backend_of(to)?;
        self.outbound
            .try_call(move |cpu| cpu.transfer_quota(backend, to, amount))?;
        Ok(())
    }

    pub fn quota(&self, id: SessionId) -> Result<Quota, SessionError> {
        let _backend = self.claim_backend();
        let backend = self.backend_of(id)?;
        Ok(self.outbound.call(move |cpu| cpu.quota(backend))?)
    }

    pub fn native_cpu(&self, id: SessionId) -> Result<Capability, SessionError> {
        let _backend = self.claim_backend();
        let backend = self.backend_of(id)?;
        Ok(self.outbound.call(move |cpu| cpu.native_cpu(backend))?)
    }

    /// Replace the configuration and push it into every session.
    pub fn apply_config(&self, config: Config) {
        if let Some(level) = self.log_level {
            let level = if config.verbose {
                level.max(LevelFilter::Debug)
            } else {
                level
            };
            log::set_max_level(level);
        }

        let mut state = self.state();
        if !config.trace {
            if let Some(trace) = state.trace.as_mut() {
                trace.disconnect();
            }
        }
        info!(
            "config: {} components, trace {}, report {}, interval {}us",
            config.components.len(),
            config.trace,
            config.report,
            config.interval_us
        );
        state.config = config;
        state.apply_config();
    }

    /// Re-read the configuration file. On error the current configuration
    /// stays in effect.
    pub fn reload_config(&self) -> Result<()> {
        let Some(path) = self.config_path.as_ref() else {
            debug!("config: no file to reload");
            return Ok(());
        };

        match Config::load(path) {
            Ok(config) => {
                self.apply_config(config);
                self.state().metrics.config_reloads += 1;
                Ok(())
            }
            Err(err) => {
                warn!("config: keeping previous configuration: {:#}", err);
                self.state().metrics.config_errors += 1;
                Err(err)
            }
        }
    }

    /// One control loop iteration. Skipped while a thread operation holds
    /// the backend.
    pub fn tick(&self) {
        let Ok(_backend) = self.try_claim_backend() else {
            debug!("tick deferred: backend busy");
            self.state().metrics.deferred_ticks += 1;
            return;
        };
        let mut state = self.state();
        state.metrics.ticks += 1;

        let changed = match state.evaluate(&self.outbound) {
            Ok(changed) => changed,
            Err(err) => {
                warn!("tick abandoned: {}", err);
                state.metrics.abandoned_ticks += 1;
                state.layout_changed = true;
                return;
            }
        };
        state.update_gauges();

        if !changed || !state.config.report {
            return;
        }
        let report = StatusReport::generate(state.sessions.values());
        state.metrics.reports += 1;
        if let Some(path) = self.report_path.as_ref() {
            if let Err(err) = report.write(path) {
                warn!("report: {:#}", err);
            }
        }
        state.last_report = report;
    }
}
