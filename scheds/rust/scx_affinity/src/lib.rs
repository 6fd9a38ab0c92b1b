// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! User space CPU-affinity scheduler.
//!
//! Clients open CPU sessions and create threads through the scheduler, which
//! forwards both to the real CPU backend and keeps track of the threads. A
//! periodic control loop then lets each thread's policy decide where on the
//! 2-D CPU grid it should run, using per-CPU idle time observed through the
//! trace source, and migrates the threads accordingly.

pub mod affinity;
pub mod backend;
pub mod config;
pub mod entrypoint;
pub mod host;
pub mod idle;
pub mod outbound;
pub mod policy;
pub mod report;
pub mod rpc;
pub mod service;
pub mod session;
pub mod stats;
pub mod trace;

#[cfg(test)]
mod testing;

pub use affinity::AffinityLocation;
pub use affinity::AffinitySpace;
pub use config::Config;
pub use policy::Policy;
pub use policy::PolicyKind;
pub use service::SchedulerService;
pub use service::SessionError;
pub use service::SESSION_SLOT_SIZE;

pub const SCHEDULER_NAME: &str = "scx_affinity";
