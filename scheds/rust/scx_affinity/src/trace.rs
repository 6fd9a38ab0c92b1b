// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Introspection channel used to observe where threads run and how long the
//! per-CPU idle threads executed.

use std::fmt;

use log::debug;
use log::info;
use log::warn;
use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::affinity::AffinityLocation;

/// Label and name under which the kernel reports its per-CPU idle threads.
pub const IDLE_LABEL: &str = "kernel";
pub const IDLE_NAME: &str = "idle";

/// Initial RAM quota of a trace connection.
pub const TRACE_RAM_QUOTA: usize = 64 * 1024;
/// Reconstruction never grows the RAM quota beyond this.
pub const TRACE_RAM_QUOTA_MAX: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectId(pub u64);

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "subject#{}", self.0)
    }
}

/// Accumulated execution time of a subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionTime {
    pub thread_context: u64,
    pub scheduling_context: u64,
}

impl ExecutionTime {
    pub const fn new(thread_context: u64, scheduling_context: u64) -> Self {
        Self {
            thread_context,
            scheduling_context,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.thread_context == 0 && self.scheduling_context == 0
    }

    pub fn saturating_sub(&self, prev: &ExecutionTime) -> ExecutionTime {
        ExecutionTime {
            thread_context: self.thread_context.saturating_sub(prev.thread_context),
            scheduling_context: self
                .scheduling_context
                .saturating_sub(prev.scheduling_context),
        }
    }

    /// Value used to rank CPUs by idleness: the thread-context time if the
    /// kernel accounts it, the scheduling-context time otherwise.
    pub fn metric(&self) -> u64 {
        if self.thread_context != 0 {
            self.thread_context
        } else {
            self.scheduling_context
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectInfo {
    pub session_label: String,
    pub thread_name: String,
    /// Absolute cell the subject last executed on.
    pub affinity: AffinityLocation,
    pub execution_time: ExecutionTime,
}

impl SubjectInfo {
    pub fn is_idle_of(&self, cell: &AffinityLocation) -> bool {
        self.session_label == IDLE_LABEL
            && self.thread_name == IDLE_NAME
            && self.affinity.same_cell(cell)
    }
}

/// Result of a subject enumeration. `truncated` is set when the source ran out
/// of buffer space before listing every subject.
#[derive(Debug, Clone, Default)]
pub struct SubjectList {
    pub subjects: Vec<(SubjectId, SubjectInfo)>,
    pub truncated: bool,
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("trace buffer out of RAM")]
    OutOfRam,

    #[error("invalid trace subject {0}")]
    InvalidSubject(SubjectId),

    #[error("trace quota exhausted ({0} bytes)")]
    QuotaExhausted(usize),

    #[error("trace connection failed: {0}")]
    Connect(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub trait TraceSource: Send {
    fn subjects(&mut self) -> Result<SubjectList, TraceError>;
    fn subject_info(&mut self, id: SubjectId) -> Result<SubjectInfo, TraceError>;
}

/// Opens trace sources with a given RAM quota. Used to rebuild the connection
/// with a larger quota once it ran dry.
pub trait TraceFactory: Send {
    fn connect(&mut self, ram_quota: usize) -> Result<Box<dyn TraceSource>, TraceError>;
}

/// Trace connection that survives exhaustion of its buffer by reconnecting
/// with a doubled quota.
///
/// The subject enumeration is cached until [`TraceConnection::begin_tick`] so
/// that every lookup within one control-loop tick shares one enumeration.
pub struct TraceConnection {
    factory: Box<dyn TraceFactory>,
    source: Option<Box<dyn TraceSource>>,
    ram_quota: usize,
    cached: Option<SubjectList>,
    reconstructs: u64,
}

impl TraceConnection {
    pub fn new(factory: Box<dyn TraceFactory>) -> Self {
        Self {
            factory,
            source: None,
            ram_quota: TRACE_RAM_QUOTA,
            cached: None,
            reconstructs: 0,
        }
    }

    pub fn ram_quota(&self) -> usize {
        self.ram_quota
    }

    pub fn reconstructs(&self) -> u64 {
        self.reconstructs
    }

    pub fn disconnect(&mut self) {
        self.source = None;
        self.cached = None;
    }

    pub fn begin_tick(&mut self) {
        self.cached = None;
    }

    fn source(&mut self) -> Result<&mut Box<dyn TraceSource>, TraceError> {
        if self.source.is_none() {
            let source = self.factory.connect(self.ram_quota)?;
            info!("trace: connected with {} bytes quota", self.ram_quota);
            self.source = Some(source);
        }
        self.source
            .as_mut()
            .ok_or_else(|| TraceError::Connect("not connected".to_string()))
    }

    /// Drop the current connection and open a new one with twice the quota.
    pub fn reconstruct(&mut self) -> Result<(), TraceError> {
        let quota = self.ram_quota.saturating_mul(2);
        if quota > TRACE_RAM_QUOTA_MAX {
            warn!(
                "trace: cannot grow quota beyond {} bytes",
                TRACE_RAM_QUOTA_MAX
            );
            return Err(TraceError::QuotaExhausted(self.ram_quota));
        }

        self.source = None;
        self.cached = None;
        self.ram_quota = quota;
        self.reconstructs += 1;
        self.source = Some(self.factory.connect(quota)?);
        info!("trace: reconstructed connection with {} bytes quota", quota);
        Ok(())
    }

    /// Run `op`, reconstructing the connection and retrying once if the trace
    /// buffer ran out of RAM.
    fn with_retry<T>(
        &mut self,
        mut op: impl FnMut(&mut dyn TraceSource) -> Result<T, TraceError>,
    ) -> Result<T, TraceError> {
        match op(&mut **self.source()?) {
            Err(TraceError::OutOfRam) => {
                self.reconstruct()?;
                op(&mut **self.source()?)
            }
            res => res,
        }
    }

    pub fn subject_info(&mut self, id: SubjectId) -> Result<SubjectInfo, TraceError> {
        self.with_retry(|src| src.subject_info(id))
    }

    fn enumerate(&mut self) -> Result<&SubjectList, TraceError> {
        if self.cached.is_none() {
            let list = self.with_retry(|src| src.subjects())?;
            debug!(
                "trace: enumerated {} subjects{}",
                list.subjects.len(),
                if list.truncated { " (truncated)" } else { "" }
            );
            self.cached = Some(list);
        }
        self.cached
            .as_ref()
            .ok_or_else(|| TraceError::Connect("enumeration missing".to_string()))
    }

    /// Find the first subject matching `pred`.
    ///
    /// If the subject is not found and the enumeration was truncated, the
    /// connection is reconstructed with a larger quota so that the lookup can
    /// succeed on the next tick.
    pub fn lookup(
        &mut self,
        pred: impl Fn(&SubjectInfo) -> bool,
    ) -> Result<Option<SubjectId>, TraceError> {
        let (found, truncated) = {
            let list = self.enumerate()?;
            let found = list
                .subjects
                .iter()
                .find(|(_, info)| pred(info))
                .map(|(id, _)| *id);
            (found, list.truncated)
        };

        if found.is_none() && truncated {
            self.reconstruct()?;
        }
        Ok(found)
    }

    /// Find the subject of thread `name` created through session `label`.
    pub fn lookup_thread(
        &mut self,
        label: &str,
        name: &str,
    ) -> Result<Option<SubjectId>, TraceError> {
        self.lookup(|info| info.session_label == label && info.thread_name == name)
    }
}
