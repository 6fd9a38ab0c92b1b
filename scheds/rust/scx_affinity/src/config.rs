// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Policy document.
//!
//! ```toml
//! trace = true
//! report = true
//! interval_us = 1000000
//! verbose = false
//!
//! [[component]]
//! label = "init -> app"
//!
//! [[component.thread]]
//! name = "ep"
//! policy = "pin"
//! xpos = 1
//! ypos = 0
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::affinity::AffinityLocation;
use crate::policy::PolicyKind;

pub const DEFAULT_INTERVAL_US: u64 = 1_000_000;
pub const MIN_INTERVAL_US: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Track per-CPU idle time and thread placement through the trace source.
    pub trace: bool,
    /// Write the status report after placements changed.
    pub report: bool,
    /// Control loop period.
    pub interval_us: u64,
    pub verbose: bool,
    #[serde(rename = "component")]
    pub components: Vec<ComponentConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            trace: true,
            report: true,
            interval_us: DEFAULT_INTERVAL_US,
            verbose: false,
            components: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentConfig {
    pub label: String,
    #[serde(rename = "thread", default)]
    pub threads: Vec<ThreadConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThreadConfig {
    pub name: String,
    pub policy: PolicyKind,
    #[serde(default)]
    pub xpos: u32,
    #[serde(default)]
    pub ypos: u32,
}

impl ThreadConfig {
    pub fn location(&self) -> AffinityLocation {
        AffinityLocation::cell(self.xpos, self.ypos)
    }
}

impl Config {
    pub fn parse(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).context("Failed to parse policy document")?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("Invalid policy document {}", path.display()))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_micros(self.interval_us.max(MIN_INTERVAL_US))
    }

    /// Thread policies configured for the session labeled `label`.
    pub fn threads_of<'a>(&'a self, label: &'a str) -> impl Iterator<Item = &'a ThreadConfig> {
        self.components
            .iter()
            .filter(move |c| c.label == label)
            .flat_map(|c| c.threads.iter())
    }
}
