// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Interface of the CPU service this scheduler wraps.
//!
//! Sessions and threads are created by the backend. The scheduler only keeps
//! track of them and asks the backend to move threads between CPUs.

use std::fmt;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::affinity::AffinityLocation;
use crate::affinity::AffinitySpace;

/// Session handle issued by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BackendSession(pub u64);

/// Thread capability issued by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadCap(pub u64);

impl fmt::Display for ThreadCap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// Protection domain a thread is created in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PdId(pub u64);

/// Opaque capability handed through to the client.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capability(pub u64);

/// Signal context that receives CPU exceptions of a session's threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SignalHandler(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Weight(pub u64);

impl Default for Weight {
    fn default() -> Self {
        Weight(10)
    }
}

/// CPU time quota of a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quota {
    pub super_period_us: u64,
    pub us: u64,
}

/// Arguments of a backend session open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionArgs {
    pub label: String,
    pub ram_quota: u64,
    pub cap_quota: u64,
}

#[derive(Debug, Error)]
pub enum CpuError {
    #[error("out of RAM")]
    OutOfRam,

    #[error("invalid session {0:?}")]
    InvalidSession(BackendSession),

    #[error("invalid thread {0}")]
    InvalidThread(ThreadCap),

    #[error("location {0} outside of the affinity space")]
    InvalidLocation(AffinityLocation),

    #[error("thread creation failed: {0}")]
    ThreadCreationFailed(String),

    #[error("backend worker is gone")]
    Disconnected,

    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The CPU service wrapped by the scheduler.
///
/// All calls run on the outbound worker, see [`crate::outbound::Outbound`].
pub trait ParentCpu: Send {
    fn open_session(
        &mut self,
        args: &SessionArgs,
        location: AffinityLocation,
    ) -> Result<BackendSession, CpuError>;

    fn upgrade(&mut self, session: BackendSession, ram: u64, caps: u64) -> Result<(), CpuError>;

    fn close_session(&mut self, session: BackendSession);

    fn create_thread(
        &mut self,
        session: BackendSession,
        pd: PdId,
        name: &str,
        location: AffinityLocation,
        weight: Weight,
        utcb: u64,
    ) -> Result<ThreadCap, CpuError>;

    fn kill_thread(&mut self, session: BackendSession, thread: ThreadCap);

    /// Move `thread` to the absolute cell `location`.
    fn migrate_thread(
        &mut self,
        thread: ThreadCap,
        location: AffinityLocation,
    ) -> Result<(), CpuError>;

    fn exception_sigh(&mut self, session: BackendSession, handler: SignalHandler);

    fn affinity_space(&self, session: BackendSession) -> AffinitySpace;

    fn trace_control(&self, session: BackendSession) -> Option<Capability>;

    fn ref_account(
        &mut self,
        session: BackendSession,
        account: BackendSession,
    ) -> Result<(), CpuError>;

    fn transfer_quota(
        &mut self,
        session: BackendSession,
        to: BackendSession,
        amount: u64,
    ) -> Result<(), CpuError>;

    fn quota(&self, session: BackendSession) -> Quota;

    fn native_cpu(&self, session: BackendSession) -> Capability;
}
