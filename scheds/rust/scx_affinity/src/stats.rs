// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Local;
use scx_stats::prelude::*;
use scx_stats_derive::stat_doc;
use scx_stats_derive::Stats;
use serde::Deserialize;
use serde::Serialize;

#[stat_doc]
#[derive(Clone, Debug, Default, Serialize, Deserialize, Stats)]
#[serde(default)]
#[stat(top)]
pub struct Metrics {
    #[stat(desc = "Control loop iterations")]
    pub ticks: u64,
    #[stat(desc = "Ticks abandoned because the trace could not be restored")]
    pub abandoned_ticks: u64,
    #[stat(desc = "Ticks skipped while a thread operation held the backend")]
    pub deferred_ticks: u64,
    #[stat(desc = "Thread migrations")]
    pub migrations: u64,
    #[stat(desc = "Threads skipped for lack of trace feedback")]
    pub unresolved: u64,
    #[stat(desc = "Trace connection reconstructions")]
    pub trace_reconstructs: u64,
    #[stat(desc = "Status reports generated")]
    pub reports: u64,
    #[stat(desc = "Policy document reloads")]
    pub config_reloads: u64,
    #[stat(desc = "Rejected policy documents")]
    pub config_errors: u64,
    #[stat(desc = "Open sessions")]
    pub sessions: u64,
    #[stat(desc = "Tracked threads")]
    pub threads: u64,
    #[stat(desc = "CPUs without an idle subject")]
    pub idle_unresolved: u64,
}

impl Metrics {
    pub fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        let now = Local::now();
        writeln!(w, "┌─ {} {} ─", crate::SCHEDULER_NAME, now.format("%H:%M:%S"))?;
        writeln!(
            w,
            "│ sessions {:>4}  threads {:>5}  idle-unresolved {:>3}",
            self.sessions, self.threads, self.idle_unresolved
        )?;
        writeln!(
            w,
            "│ ticks {:>6}  abandoned {:>4}  deferred {:>4}  mig {:>6}  unres {:>6}",
            self.ticks, self.abandoned_ticks, self.deferred_ticks, self.migrations, self.unresolved
        )?;
        writeln!(
            w,
            "│ reports {:>5}  trace-rebuild {:>3}  reload {:>3}  cfg-err {:>3}",
            self.reports, self.trace_reconstructs, self.config_reloads, self.config_errors
        )?;
        writeln!(w, "└─")?;
        Ok(())
    }

    fn delta(&self, prev: &Self) -> Self {
        Self {
            ticks: self.ticks.saturating_sub(prev.ticks),
            abandoned_ticks: self.abandoned_ticks.saturating_sub(prev.abandoned_ticks),
            deferred_ticks: self.deferred_ticks.saturating_sub(prev.deferred_ticks),
            migrations: self.migrations.saturating_sub(prev.migrations),
            unresolved: self.unresolved.saturating_sub(prev.unresolved),
            trace_reconstructs: self.trace_reconstructs.saturating_sub(prev.trace_reconstructs),
            reports: self.reports.saturating_sub(prev.reports),
            config_reloads: self.config_reloads.saturating_sub(prev.config_reloads),
            config_errors: self.config_errors.saturating_sub(prev.config_errors),
            sessions: self.sessions,
            threads: self.threads,
            idle_unresolved: self.idle_unresolved,
        }
    }
}

pub fn server_data() -> StatsServerData<(), Metrics> {
    let open: Box<dyn StatsOpener<(), Metrics>> = Box::new(move |(req_ch, res_ch)| {
        req_ch.send(())?;
        let mut prev = res_ch.recv()?;

        let read: Box<dyn StatsReader<(), Metrics>> = Box::new(move |_args, (req_ch, res_ch)| {
            req_ch.send(())?;
            let cur = res_ch.recv()?;
            let delta = cur.delta(&prev);
            prev = cur;
            delta.to_json()
        });

        Ok(read)
    });

    StatsServerData::new()
        .add_meta(Metrics::meta())
        .add_ops("top", StatsOps { open, close: None })
}

/// Poll the stats server every `intv` and print each interval's metrics to
/// `out` until `shutdown` is set.
pub fn monitor<W: Write>(intv: Duration, shutdown: Arc<AtomicBool>, mut out: W) -> Result<()> {
    scx_utils::monitor_stats::<Metrics>(
        &[],
        intv,
        || shutdown.load(Ordering::Relaxed),
        |metrics| metrics.format(&mut out),
    )
}
