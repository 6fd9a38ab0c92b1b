// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Status report of the current thread placement.

use std::fs;
use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use crate::policy::PolicyKind;
use crate::session::Session;
use crate::trace::ExecutionTime;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    #[serde(rename = "component")]
    pub components: Vec<ComponentReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentReport {
    pub label: String,
    pub xpos: u32,
    pub ypos: u32,
    pub width: u32,
    pub height: u32,
    #[serde(rename = "thread")]
    pub threads: Vec<ThreadReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadReport {
    pub name: String,
    /// Location relative to the component's window.
    pub xpos: u32,
    pub ypos: u32,
    pub policy: PolicyKind,
    pub execution_time: ExecutionTime,
}

impl StatusReport {
    pub fn generate<'a>(sessions: impl Iterator<Item = &'a Session>) -> Self {
        let components = sessions
            .map(|session| {
                let base = session.base();
                ComponentReport {
                    label: session.label().to_string(),
                    xpos: base.x,
                    ypos: base.y,
                    width: base.width,
                    height: base.height,
                    threads: session
                        .threads()
                        .filter(|(_, t)| t.handle.is_some())
                        .map(|(name, t)| ThreadReport {
                            name: name.clone(),
                            xpos: t.location.x,
                            ypos: t.location.y,
                            policy: t.policy.kind(),
                            execution_time: t.execution_time,
                        })
                        .collect(),
                }
            })
            .collect();
        Self { components }
    }

    pub fn component(&self, label: &str) -> Option<&ComponentReport> {
        self.components.iter().find(|c| c.label == label)
    }

    /// Replace the report at `path`. Readers never see a partial file.
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, json + "\n")
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to move report to {}", path.display()))?;
        Ok(())
    }
}

impl ComponentReport {
    pub fn thread(&self, name: &str) -> Option<&ThreadReport> {
        self.threads.iter().find(|t| t.name == name)
    }
}
