// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Per-thread placement policies.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

use crate::affinity::AffinityLocation;
use crate::idle::IdleTracker;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    #[default]
    None,
    Pin,
    RoundRobin,
    MaxUtilize,
}

impl PolicyKind {
    pub fn name(&self) -> &'static str {
        match self {
            PolicyKind::None => "none",
            PolicyKind::Pin => "pin",
            PolicyKind::RoundRobin => "round-robin",
            PolicyKind::MaxUtilize => "max-utilize",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PolicyKind {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(PolicyKind::None),
            "pin" => Ok(PolicyKind::Pin),
            "round-robin" => Ok(PolicyKind::RoundRobin),
            "max-utilize" => Ok(PolicyKind::MaxUtilize),
            _ => Err(PolicyError::UnknownPolicy(s.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PolicyError {
    #[error("unknown policy '{0}'")]
    UnknownPolicy(String),

    #[error("location {location} lies outside of the {width}x{height} base window")]
    OutsideWindow {
        location: AffinityLocation,
        width: u32,
        height: u32,
    },
}

/// Placement policy of one thread together with its target cell, relative to
/// the session's base window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Policy {
    #[default]
    None,
    Pin { target: AffinityLocation },
    RoundRobin { target: AffinityLocation },
    MaxUtilize { target: AffinityLocation },
}

impl Policy {
    /// Fresh policy of `kind` for a thread currently at relative `current`.
    ///
    /// A pin starts without a target until it is configured.
    pub fn new(kind: PolicyKind, current: AffinityLocation) -> Self {
        match kind {
            PolicyKind::None => Policy::None,
            PolicyKind::Pin => Policy::Pin {
                target: AffinityLocation::default(),
            },
            PolicyKind::RoundRobin => Policy::RoundRobin { target: current },
            PolicyKind::MaxUtilize => Policy::MaxUtilize { target: current },
        }
    }

    pub fn kind(&self) -> PolicyKind {
        match self {
            Policy::None => PolicyKind::None,
            Policy::Pin { .. } => PolicyKind::Pin,
            Policy::RoundRobin { .. } => PolicyKind::RoundRobin,
            Policy::MaxUtilize { .. } => PolicyKind::MaxUtilize,
        }
    }

    pub fn target(&self) -> Option<AffinityLocation> {
        match self {
            Policy::None => None,
            Policy::Pin { target }
            | Policy::RoundRobin { target }
            | Policy::MaxUtilize { target } => Some(*target),
        }
    }

    /// Apply a configured relative location. Only a pin uses it; it must lie
    /// within `base`.
    pub fn configure(
        &mut self,
        base: &AffinityLocation,
        rel: AffinityLocation,
    ) -> Result<(), PolicyError> {
        if let Policy::Pin { target } = self {
            if !base.contains_relative(&rel) {
                return Err(PolicyError::OutsideWindow {
                    location: rel,
                    width: base.width,
                    height: base.height,
                });
            }
            *target = AffinityLocation::cell(rel.x, rel.y);
        }
        Ok(())
    }

    /// The thread this policy belongs to got created at relative `rel`.
    ///
    /// A configured pin keeps its target, everything else starts from `rel`.
    pub fn on_thread_created(&mut self, rel: AffinityLocation) {
        match self {
            Policy::None => {}
            Policy::Pin { target } => {
                if !target.is_valid() {
                    *target = rel;
                }
            }
            Policy::RoundRobin { target } | Policy::MaxUtilize { target } => *target = rel,
        }
    }

    /// Whether replacing `self` by `new` changes the configured placement
    /// enough to warrant a report on its own.
    pub fn requires_report(&self, new: &Policy) -> bool {
        match (self, new) {
            (Policy::Pin { target: old }, Policy::Pin { target: new }) => old != new,
            (_, Policy::Pin { target }) => target.is_valid(),
            _ => false,
        }
    }

    /// Decide where the thread currently at absolute `current` should run.
    ///
    /// Returns the absolute cell to migrate to, or `None` to stay.
    pub fn evaluate(
        &mut self,
        base: &AffinityLocation,
        current: &AffinityLocation,
        idle: Option<&IdleTracker>,
    ) -> Option<AffinityLocation> {
        match self {
            Policy::None => None,
            Policy::Pin { target } => {
                if !target.is_valid() {
                    return None;
                }
                let want = base.absolute(target);
                (!want.same_cell(current)).then_some(want)
            }
            Policy::RoundRobin { target } => {
                let from = base.relative(current).unwrap_or(*target);
                *target = base.next_cell(&from);
                Some(base.absolute(target))
            }
            Policy::MaxUtilize { target } => {
                let best = idle.and_then(|idle| idle.most_idle(base))?;
                if let Some(rel) = base.relative(&best) {
                    *target = rel;
                }
                (!best.same_cell(current)).then_some(best)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: AffinityLocation = AffinityLocation::new(4, 2, 2, 2);

    #[test]
    fn kind_names_roundtrip() {
        for kind in [
            PolicyKind::None,
            PolicyKind::Pin,
            PolicyKind::RoundRobin,
            PolicyKind::MaxUtilize,
        ] {
            assert_eq!(kind.name().parse::<PolicyKind>().unwrap(), kind);
        }
        assert!(matches!(
            "fifo".parse::<PolicyKind>(),
            Err(PolicyError::UnknownPolicy(_))
        ));
    }

    #[test]
    fn pin_moves_once() {
        let mut pin = Policy::new(PolicyKind::Pin, AffinityLocation::cell(0, 0));
        pin.configure(&BASE, AffinityLocation::cell(1, 1)).unwrap();

        let current = AffinityLocation::cell(4, 2);
        let want = pin.evaluate(&BASE, &current, None);
        assert_eq!(want, Some(AffinityLocation::cell(5, 3)));
        assert_eq!(pin.evaluate(&BASE, &want.unwrap(), None), None);
    }

    #[test]
    fn pin_rejects_location_outside_window() {
        let mut pin = Policy::new(PolicyKind::Pin, AffinityLocation::cell(0, 0));
        pin.configure(&BASE, AffinityLocation::cell(1, 0)).unwrap();
        let err = pin.configure(&BASE, AffinityLocation::cell(2, 0));
        assert!(matches!(err, Err(PolicyError::OutsideWindow { .. })));
        assert_eq!(pin.target(), Some(AffinityLocation::cell(1, 0)));
    }

    #[test]
    fn configured_pin_ignores_creation_location() {
        let mut pin = Policy::new(PolicyKind::Pin, AffinityLocation::cell(0, 0));
        pin.configure(&BASE, AffinityLocation::cell(1, 0)).unwrap();
        pin.on_thread_created(AffinityLocation::cell(0, 1));
        assert_eq!(pin.target(), Some(AffinityLocation::cell(1, 0)));

        let mut unconfigured = Policy::new(PolicyKind::Pin, AffinityLocation::cell(0, 0));
        unconfigured.on_thread_created(AffinityLocation::cell(0, 1));
        assert_eq!(unconfigured.target(), Some(AffinityLocation::cell(0, 1)));

        let mut rr = Policy::new(PolicyKind::RoundRobin, AffinityLocation::cell(0, 0));
        rr.on_thread_created(AffinityLocation::cell(1, 1));
        assert_eq!(rr.target(), Some(AffinityLocation::cell(1, 1)));
    }

    #[test]
    fn round_robin_visits_every_cell() {
        let base = AffinityLocation::new(0, 0, 3, 2);
        let mut rr = Policy::new(PolicyKind::RoundRobin, AffinityLocation::cell(0, 0));
        let mut current = AffinityLocation::cell(0, 0);
        let mut visited = Vec::new();
        for _ in 0..12 {
            current = rr.evaluate(&base, &current, None).unwrap();
            visited.push((current.x, current.y));
        }
        let period = [(1, 0), (2, 0), (0, 1), (1, 1), (2, 1), (0, 0)];
        assert_eq!(&visited[..6], &period);
        assert_eq!(&visited[6..], &period);
    }

    #[test]
    fn round_robin_migrates_even_on_single_cell() {
        let base = AffinityLocation::new(3, 0, 1, 1);
        let mut rr = Policy::new(PolicyKind::RoundRobin, AffinityLocation::cell(0, 0));
        let current = AffinityLocation::cell(3, 0);
        assert_eq!(rr.evaluate(&base, &current, None), Some(current));
    }

    #[test]
    fn max_utilize_without_feedback_stays() {
        let mut max = Policy::new(PolicyKind::MaxUtilize, AffinityLocation::cell(0, 0));
        assert_eq!(max.evaluate(&BASE, &AffinityLocation::cell(4, 2), None), None);
    }

    #[test]
    fn only_pin_requires_report() {
        let pin_a = Policy::Pin {
            target: AffinityLocation::cell(0, 0),
        };
        let pin_b = Policy::Pin {
            target: AffinityLocation::cell(1, 0),
        };
        let rr = Policy::RoundRobin {
            target: AffinityLocation::cell(1, 0),
        };
        assert!(pin_a.requires_report(&pin_b));
        assert!(!pin_a.requires_report(&pin_a));
        assert!(Policy::None.requires_report(&pin_b));
        assert!(!pin_a.requires_report(&rr));
        assert!(!Policy::None.requires_report(&Policy::None));
    }
}
