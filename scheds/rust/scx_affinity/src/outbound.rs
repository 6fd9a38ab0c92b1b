// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Worker that performs every call into the backend.
//!
//! Calls leaving the scheduler must not be served by the thread that handles
//! incoming requests, since the backend may call back into the scheduler while
//! it is blocked. The backend is therefore owned by a dedicated thread and
//! callers hand it jobs over a channel, waiting for the reply on a one-shot
//! channel of their own.

use std::thread;
use std::thread::JoinHandle;

use crossbeam::channel::bounded;
use crossbeam::channel::unbounded;
use crossbeam::channel::Sender;
use log::debug;
use log::info;
use log::warn;

use crate::backend::CpuError;
use crate::backend::ParentCpu;

type Job = Box<dyn FnOnce(&mut dyn ParentCpu) + Send>;

#[derive(Clone)]
pub struct Outbound {
    jobs: Sender<Job>,
}

pub struct OutboundWorker {
    handle: Option<JoinHandle<()>>,
}

impl Outbound {
    /// Move `backend` onto a new worker thread.
    pub fn spawn(mut backend: Box<dyn ParentCpu>) -> std::io::Result<(Self, OutboundWorker)> {
        let (jobs, rx) = unbounded::<Job>();
        let handle = thread::Builder::new()
            .name("outbound".to_string())
            .spawn(move || {
                debug!("outbound: worker started");
                for job in rx.iter() {
                    job(backend.as_mut());
                }
                info!("outbound: worker finished");
            })?;

        Ok((Self { jobs }, OutboundWorker { handle: Some(handle) }))
    }

    /// Run `f` on the worker and wait for its result.
    pub fn call<R, F>(&self, f: F) -> Result<R, CpuError>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn ParentCpu) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = bounded(1);
        let job: Job = Box::new(move |backend| {
            let _ = reply_tx.send(f(backend));
        });
        self.jobs.send(job).map_err(|_| CpuError::Disconnected)?;
        reply_rx.recv().map_err(|_| CpuError::Disconnected)
    }

    /// Like [`Outbound::call`] for backend operations that are fallible
    /// themselves.
    pub fn try_call<R, F>(&self, f: F) -> Result<R, CpuError>
    where
        R: Send + 'static,
        F: FnOnce(&mut dyn ParentCpu) -> Result<R, CpuError> + Send + 'static,
    {
        self.call(f)?
    }
}

impl OutboundWorker {
    /// Wait for the worker to drain its queue. Returns once every
    /// [`Outbound`] handle is gone.
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("outbound: worker panicked");
            }
        }
    }
}

impl Drop for OutboundWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                // The worker only exits once every Outbound handle is gone.
                debug!("outbound: detaching worker with live handles");
                return;
            }
            if handle.join().is_err() {
                warn!("outbound: worker panicked");
            }
        }
    }
}
