// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Inbound entrypoints.
//!
//! Requests are served on two contexts. The session context handles session
//! management, configuration reloads, stats requests and the control-loop
//! timer. The thread context handles thread operations, so that a backend
//! calling back into the scheduler while creating a thread still finds the
//! session context responsive. Both write their responses to one output.

use std::collections::VecDeque;
use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Result;
use crossbeam::channel::never;
use crossbeam::channel::select;
use crossbeam::channel::tick;
use crossbeam::channel::Receiver;
use crossbeam::channel::RecvTimeoutError;
use crossbeam::channel::Sender;
use log::debug;
use log::info;
use log::warn;

use crate::rpc::is_backend_method;
use crate::rpc::request_method;
use crate::rpc::JsonRpcResponse;
use crate::rpc::RpcServer;
use crate::service::SchedulerService;
use crate::stats::Metrics;

/// Upper bound on how long a context waits before checking for shutdown.
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// Retry period of requests deferred behind a thread operation.
const RETRY_TIMEOUT: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Default)]
pub struct EntrypointOpts {
    /// Return once the request channels disconnect.
    pub exit_on_eof: bool,
}

pub struct Entrypoint<'a, W: Write + Send> {
    service: &'a SchedulerService,
    session_requests: Receiver<String>,
    thread_requests: Receiver<String>,
    reload: Receiver<()>,
    stats: Option<(Sender<Metrics>, Receiver<()>)>,
    output: W,
    opts: EntrypointOpts,
}

fn write_response<W: Write>(output: &Mutex<W>, response: &JsonRpcResponse) -> Result<()> {
    let json = serde_json::to_string(response)? + "\n";
    debug!("rpc: sending {}", json.trim());
    let mut output = output.lock().unwrap_or_else(|e| e.into_inner());
    output.write_all(json.as_bytes())?;
    output.flush()?;
    Ok(())
}

/// Thread context: serve thread operations until shutdown, until the session
/// context is `done` or until the channel disconnects.
fn serve_threads<W: Write>(
    service: &SchedulerService,
    requests: Receiver<String>,
    output: &Mutex<W>,
    shutdown: &AtomicBool,
    done: &AtomicBool,
) -> Result<()> {
    let server = RpcServer::new(service);
    while !shutdown.load(Ordering::Relaxed) && !done.load(Ordering::Relaxed) {
        match requests.recv_timeout(POLL_TIMEOUT) {
            Ok(line) => write_response(output, &server.handle_request(&line))?,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("entrypoint: thread context finished");
    Ok(())
}

impl<'a, W: Write + Send> Entrypoint<'a, W> {
    pub fn new(
        service: &'a SchedulerService,
        session_requests: Receiver<String>,
        thread_requests: Receiver<String>,
        reload: Receiver<()>,
        output: W,
        opts: EntrypointOpts,
    ) -> Self {
        Self {
            service,
            session_requests,
            thread_requests,
            reload,
            stats: None,
            output,
            opts,
        }
    }

    /// Answer the stats server's requests, as handed out by
    /// `StatsServer::channels`.
    pub fn with_stats(mut self, channels: (Sender<Metrics>, Receiver<()>)) -> Self {
        self.stats = Some(channels);
        self
    }

    pub fn run(self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let Self {
            service,
            session_requests,
            thread_requests,
            reload,
            stats,
            output,
            opts,
        } = self;
        let output = Mutex::new(output);
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            let threads = thread::Builder::new()
                .name("thread-entrypoint".to_string())
                .spawn_scoped(s, || {
                    serve_threads(service, thread_requests, &output, &shutdown, &done)
                })?;

            let res = serve_sessions(
                service,
                session_requests,
                reload,
                stats,
                &output,
                &shutdown,
                &opts,
            );
            done.store(true, Ordering::Relaxed);

            let threads_res = threads
                .join()
                .map_err(|_| anyhow!("thread entrypoint panicked"));
            res.and(threads_res?)
        })
    }
}

/// Session context.
fn serve_sessions<W: Write>(
    service: &SchedulerService,
    mut requests: Receiver<String>,
    mut reload: Receiver<()>,
    stats: Option<(Sender<Metrics>, Receiver<()>)>,
    output: &Mutex<W>,
    shutdown: &AtomicBool,
    opts: &EntrypointOpts,
) -> Result<()> {
    let server = RpcServer::new(service);
    let mut interval = service.interval();
    let mut ticker = tick(interval);
    let (stats_tx, mut stats_requests) = match stats {
        Some((tx, rx)) => (Some(tx), rx),
        None => (None, never()),
    };
    let mut deferred: VecDeque<String> = VecDeque::new();
    let mut input_closed = false;

    info!("entrypoint: running with {:?} interval", interval);

    while !shutdown.load(Ordering::Relaxed) {
        while let Some(line) = deferred.front() {
            let Some(response) = server.try_handle_request(line) else {
                break;
            };
            write_response(output, &response)?;
            deferred.pop_front();
        }
        if input_closed && deferred.is_empty() && opts.exit_on_eof {
            break;
        }

        let timeout = if deferred.is_empty() {
            POLL_TIMEOUT
        } else {
            RETRY_TIMEOUT
        };
        let mut reload_closed = false;
        let mut stats_closed = false;
        select! {
            recv(requests) -> line => match line {
                Ok(line) => {
                    let queued = !deferred.is_empty()
                        && request_method(&line).is_some_and(|m| is_backend_method(&m));
                    if queued {
                        deferred.push_back(line);
                    } else {
                        match server.try_handle_request(&line) {
                            Some(response) => write_response(output, &response)?,
                            None => deferred.push_back(line),
                        }
                    }
                }
                Err(_) => input_closed = true,
            },
            recv(ticker) -> _ => service.tick(),
            recv(reload) -> msg => match msg {
                Ok(()) => {
                    info!("config: reload requested");
                    if let Err(e) = service.reload_config() {
                        warn!("config: reload failed: {:#}", e);
                    }
                }
                Err(_) => reload_closed = true,
            },
            recv(stats_requests) -> msg => match (msg, stats_tx.as_ref()) {
                (Ok(()), Some(tx)) => tx.send(service.metrics())?,
                _ => stats_closed = true,
            },
            default(timeout) => {},
        }

        if input_closed {
            requests = never();
        }
        if reload_closed {
            reload = never();
        }
        if stats_closed {
            stats_requests = never();
        }

        let wanted = service.interval();
        if wanted != interval {
            info!("entrypoint: interval {:?} -> {:?}", interval, wanted);
            interval = wanted;
            ticker = tick(interval);
        }
    }

    if !deferred.is_empty() {
        warn!("entrypoint: dropping {} deferred requests", deferred.len());
    }
    info!("entrypoint: finished");
    Ok(())
}
