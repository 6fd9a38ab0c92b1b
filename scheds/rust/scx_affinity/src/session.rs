// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::collections::BTreeMap;
use std::fmt;

use log::debug;
use log::info;
use log::warn;
use serde::Deserialize;
use serde::Serialize;

use crate::affinity::AffinityLocation;
use crate::backend::BackendSession;
use crate::backend::ThreadCap;
use crate::idle::IdleTracker;
use crate::outbound::Outbound;
use crate::policy::Policy;
use crate::policy::PolicyError;
use crate::policy::PolicyKind;
use crate::trace::ExecutionTime;
use crate::trace::SubjectId;
use crate::trace::TraceConnection;
use crate::trace::TraceError;

/// Client-visible session handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// A thread tracked by a session.
///
/// Entries without a handle are placeholders created by the configuration for
/// threads that do not exist yet.
#[derive(Debug, Clone, Default)]
pub struct ThreadEntry {
    pub handle: Option<ThreadCap>,
    /// Current location relative to the session's base window.
    pub location: AffinityLocation,
    pub policy: Policy,
    pub subject: Option<SubjectId>,
    pub execution_time: ExecutionTime,
}

impl ThreadEntry {
    fn placeholder(policy: Policy) -> Self {
        Self {
            policy,
            ..Default::default()
        }
    }
}

/// Outcome of one evaluation pass over a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Evaluation {
    pub migrations: u64,
    pub unresolved: u64,
}

/// Per-tick view of the feedback sources.
pub struct Feedback<'a> {
    pub trace: Option<&'a mut TraceConnection>,
    pub idle: Option<&'a IdleTracker>,
}

pub struct Session {
    id: SessionId,
    label: String,
    base: AffinityLocation,
    backend: BackendSession,
    threads: BTreeMap<String, ThreadEntry>,
    report_dirty: bool,
}

impl Session {
    pub fn new(id: SessionId, label: &str, base: AffinityLocation, backend: BackendSession) -> Self {
        Self {
            id,
            label: label.to_string(),
            base,
            backend,
            threads: BTreeMap::new(),
            report_dirty: false,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn base(&self) -> AffinityLocation {
        self.base
    }

    pub fn backend(&self) -> BackendSession {
        self.backend
    }

    pub fn threads(&self) -> impl Iterator<Item = (&String, &ThreadEntry)> {
        self.threads.iter()
    }

    pub fn thread(&self, name: &str) -> Option<&ThreadEntry> {
        self.threads.get(name)
    }

    pub fn live_threads(&self) -> usize {
        self.threads.values().filter(|t| t.handle.is_some()).count()
    }

    pub fn has_thread(&self, handle: ThreadCap) -> bool {
        self.threads.values().any(|t| t.handle == Some(handle))
    }

    /// Take the report-dirty flag.
    pub fn take_report_dirty(&mut self) -> bool {
        std::mem::take(&mut self.report_dirty)
    }

    /// Record a thread the backend created at relative `location`.
    ///
    /// Returns false if a live thread of that name is already tracked; the new
    /// thread then stays where the backend put it.
    pub fn attach_thread(&mut self, name: &str, handle: ThreadCap, location: AffinityLocation) -> bool {
        let rel = self.base.wrap(&location);
        let entry = self
            .threads
            .entry(name.to_string())
            .or_insert_with(|| ThreadEntry::placeholder(Policy::None));

        if let Some(existing) = entry.handle {
            warn!(
                "{}: thread '{}' already tracked as {}, not scheduling {}",
                self.label, name, existing, handle
            );
            return false;
        }

        entry.handle = Some(handle);
        entry.location = rel;
        entry.subject = None;
        entry.execution_time = ExecutionTime::default();
        entry.policy.on_thread_created(rel);
        debug!(
            "{}: tracking thread '{}' {} at {} ({})",
            self.label,
            name,
            handle,
            rel,
            entry.policy.kind()
        );
        true
    }

    /// Forget the thread `handle`. Returns its name if it was tracked.
    pub fn detach_thread(&mut self, handle: ThreadCap) -> Option<String> {
        let name = self
            .threads
            .iter()
            .find(|(_, t)| t.handle == Some(handle))
            .map(|(name, _)| name.clone())?;
        self.threads.remove(&name);
        Some(name)
    }

    /// Assign policy `kind` with the relative location `rel` to thread `name`.
    ///
    /// A different kind replaces the policy, discarding its state. A thread
    /// not seen yet gets a placeholder entry. On error the previous policy
    /// stays in effect.
    pub fn configure(
        &mut self,
        name: &str,
        kind: PolicyKind,
        rel: AffinityLocation,
    ) -> Result<(), PolicyError> {
        let (old, location) = match self.threads.get(name) {
            Some(entry) => (entry.policy, entry.location),
            None => (Policy::None, AffinityLocation::cell(0, 0)),
        };

        let mut policy = if old.kind() == kind {
            old
        } else {
            Policy::new(kind, location)
        };
        policy.configure(&self.base, rel)?;

        if old.requires_report(&policy) {
            self.report_dirty = true;
        }
        if old.kind() != kind {
            info!("{}: thread '{}' policy {} -> {}", self.label, name, old.kind(), kind);
        }

        self.threads
            .entry(name.to_string())
            .or_insert_with(|| ThreadEntry::placeholder(Policy::None))
            .policy = policy;
        Ok(())
    }

    /// Let every live thread's policy decide its placement and migrate the
    /// threads whose placement changed.
    ///
    /// Per-thread failures are logged and skip that thread for this tick.
    /// Only an unrecoverable trace failure is returned.
    pub fn evaluate_and_migrate(
        &mut self,
        feedback: &mut Feedback<'_>,
        outbound: &Outbound,
    ) -> Result<Evaluation, TraceError> {
        let mut eval = Evaluation::default();
        let base = self.base;

        for (name, entry) in self.threads.iter_mut() {
            let Some(handle) = entry.handle else {
                continue;
            };
            if entry.policy.kind() == PolicyKind::None {
                continue;
            }

            let current = match feedback.trace.as_deref_mut() {
                Some(trace) => {
                    match observe(trace, &self.label, name, entry)? {
                        Some(loc) => loc,
                        None => {
                            eval.unresolved += 1;
                            continue;
                        }
                    }
                }
                None => base.absolute(&entry.location),
            };

            let Some(target) = entry.policy.evaluate(&base, &current, feedback.idle) else {
                if let Some(rel) = base.relative(&current) {
                    entry.location = rel;
                }
                continue;
            };

            match outbound.try_call(move |cpu| cpu.migrate_thread(handle, target)) {
                Ok(()) => {
                    debug!(
                        "{}: migrated '{}' {} -> {} ({})",
                        self.label,
                        name,
                        current,
                        target,
                        entry.policy.kind()
                    );
                    entry.location = base.relative(&target).unwrap_or(entry.location);
                    eval.migrations += 1;
                }
                Err(err) => {
                    warn!("{}: failed to migrate '{}' to {}: {}", self.label, name, target, err);
                }
            }
        }
        Ok(eval)
    }
}

/// Resolve and read the trace subject of `entry`, returning the absolute cell
/// the thread last ran on. `None` means no feedback for this tick.
fn observe(
    trace: &mut TraceConnection,
    label: &str,
    name: &str,
    entry: &mut ThreadEntry,
) -> Result<Option<AffinityLocation>, TraceError> {
    let id = match entry.subject {
        Some(id) => id,
        None => match trace.lookup_thread(label, name)? {
            Some(id) => {
                entry.subject = Some(id);
                id
            }
            None => {
                warn!("{}: no trace subject for thread '{}'", label, name);
                return Ok(None);
            }
        },
    };

    match trace.subject_info(id) {
        Ok(info) => {
            entry.execution_time = info.execution_time;
            Ok(Some(info.affinity))
        }
        Err(TraceError::InvalidSubject(_)) => {
            warn!("{}: trace subject of thread '{}' vanished", label, name);
            entry.subject = None;
            Ok(None)
        }
        Err(err @ TraceError::QuotaExhausted(_)) => Err(err),
        Err(err) => {
            warn!("{}: failed to trace thread '{}': {}", label, name, err);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new(
            SessionId(1),
            "init -> app",
            AffinityLocation::new(2, 0, 2, 1),
            BackendSession(7),
        )
    }

    #[test]
    fn configure_creates_placeholder() {
        let mut s = session();
        s.configure("ep", PolicyKind::Pin, AffinityLocation::cell(1, 0))
            .unwrap();

        let entry = s.thread("ep").unwrap();
        assert_eq!(entry.handle, None);
        assert_eq!(entry.policy.kind(), PolicyKind::Pin);
        assert_eq!(s.live_threads(), 0);
        assert!(s.take_report_dirty());
        assert!(!s.take_report_dirty());
    }

    #[test]
    fn attach_keeps_configured_pin() {
        let mut s = session();
        s.configure("ep", PolicyKind::Pin, AffinityLocation::cell(1, 0))
            .unwrap();
        assert!(s.attach_thread("ep", ThreadCap(3), AffinityLocation::cell(0, 0)));

        let entry = s.thread("ep").unwrap();
        assert_eq!(entry.handle, Some(ThreadCap(3)));
        assert_eq!(entry.location, AffinityLocation::cell(0, 0));
        assert_eq!(entry.policy.target(), Some(AffinityLocation::cell(1, 0)));
    }

    #[test]
    fn attach_unconfigured_thread_gets_no_policy() {
        let mut s = session();
        assert!(s.attach_thread("worker", ThreadCap(4), AffinityLocation::cell(3, 0)));
        let entry = s.thread("worker").unwrap();
        assert_eq!(entry.policy, Policy::None);
        assert_eq!(entry.location, AffinityLocation::cell(1, 0));
    }

    #[test]
    fn duplicate_live_name_is_not_tracked() {
        let mut s = session();
        assert!(s.attach_thread("ep", ThreadCap(3), AffinityLocation::cell(0, 0)));
        assert!(!s.attach_thread("ep", ThreadCap(4), AffinityLocation::cell(1, 0)));
        assert_eq!(s.thread("ep").unwrap().handle, Some(ThreadCap(3)));
        assert!(!s.has_thread(ThreadCap(4)));
    }

    #[test]
    fn detach_frees_the_name() {
        let mut s = session();
        s.attach_thread("ep", ThreadCap(3), AffinityLocation::cell(0, 0));
        assert_eq!(s.detach_thread(ThreadCap(3)), Some("ep".to_string()));
        assert_eq!(s.detach_thread(ThreadCap(3)), None);
        assert!(s.thread("ep").is_none());
        assert!(s.attach_thread("ep", ThreadCap(5), AffinityLocation::cell(0, 0)));
    }

    #[test]
    fn kind_change_resets_policy_state() {
        let mut s = session();
        s.attach_thread("ep", ThreadCap(3), AffinityLocation::cell(0, 0));
        s.configure("ep", PolicyKind::Pin, AffinityLocation::cell(1, 0))
            .unwrap();
        s.configure("ep", PolicyKind::RoundRobin, AffinityLocation::cell(0, 0))
            .unwrap();

        let entry = s.thread("ep").unwrap();
        assert_eq!(entry.policy.kind(), PolicyKind::RoundRobin);
        assert_eq!(entry.policy.target(), Some(entry.location));
    }

    #[test]
    fn rejected_configuration_keeps_previous_policy() {
        let mut s = session();
        s.configure("ep", PolicyKind::Pin, AffinityLocation::cell(1, 0))
            .unwrap();
        s.take_report_dirty();

        let err = s.configure("ep", PolicyKind::Pin, AffinityLocation::cell(2, 0));
        assert!(err.is_err());
        assert_eq!(
            s.thread("ep").unwrap().policy.target(),
            Some(AffinityLocation::cell(1, 0))
        );
        assert!(!s.take_report_dirty());

        assert!(s
            .configure("new", PolicyKind::Pin, AffinityLocation::cell(0, 3))
            .is_err());
        assert!(s.thread("new").is_none());
    }
}
