// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Two-dimensional CPU grid geometry.
//!
//! CPUs are arranged as a `width x height` grid whose cells are numbered in
//! row-major order. Sessions are granted a window of that grid and every
//! thread location kept by a session is relative to its window.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;

/// Largest grid accepted from the command line.
pub const MAX_GRID_CELLS: u64 = 8192;

/// Extent of the whole CPU grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AffinitySpace {
    pub width: u32,
    pub height: u32,
}

impl AffinitySpace {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn total(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// The window covering the whole space.
    pub fn window(&self) -> AffinityLocation {
        AffinityLocation::new(0, 0, self.width, self.height)
    }

    /// Row-major index of an absolute cell.
    pub fn cell_index(&self, loc: &AffinityLocation) -> Option<usize> {
        if loc.x >= self.width || loc.y >= self.height {
            return None;
        }
        Some(loc.y as usize * self.width as usize + loc.x as usize)
    }

    /// Absolute 1x1 cell of a row-major index.
    pub fn location_of(&self, index: usize) -> Option<AffinityLocation> {
        if self.is_empty() || index as u64 >= self.total() {
            return None;
        }
        let width = self.width as usize;
        Some(AffinityLocation::cell(
            (index % width) as u32,
            (index / width) as u32,
        ))
    }

    /// Crop `loc` so that it lies within the space. Returns `None` if nothing
    /// of `loc` overlaps the space.
    pub fn crop(&self, loc: &AffinityLocation) -> Option<AffinityLocation> {
        if loc.x >= self.width || loc.y >= self.height || !loc.is_valid() {
            return None;
        }
        let width = loc.width.min(self.width - loc.x);
        let height = loc.height.min(self.height - loc.y);
        Some(AffinityLocation::new(loc.x, loc.y, width, height))
    }
}

impl fmt::Display for AffinitySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for AffinitySpace {
    type Err = String;

    /// Parses `WxH` (e.g. `4x2`) or a plain CPU count `N`, which is read as a
    /// single row `Nx1`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.chars().any(|c| !c.is_ascii_digit() && c != 'x' && c != 'X') {
            return Err(format!("Invalid character in affinity space: {}", s));
        }

        let (w, h) = match s.split_once(|c: char| c == 'x' || c == 'X') {
            Some((w, h)) => (w, h),
            None => (s, "1"),
        };
        let width = w.parse::<u32>().map_err(|_| format!("Invalid width: {}", w))?;
        let height = h.parse::<u32>().map_err(|_| format!("Invalid height: {}", h))?;
        if width == 0 || height == 0 {
            return Err(format!("Empty affinity space: {}", s));
        }
        let space = Self { width, height };
        if space.total() > MAX_GRID_CELLS {
            return Err(format!(
                "Affinity space {} exceeds {} CPUs",
                space, MAX_GRID_CELLS
            ));
        }
        Ok(space)
    }
}

/// Position and extent within the CPU grid.
///
/// Depending on context a location is either absolute (grid coordinates) or
/// relative to a session's base window. A location is valid iff it covers at
/// least one cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AffinityLocation {
    #[serde(rename = "xpos")]
    pub x: u32,
    #[serde(rename = "ypos")]
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl AffinityLocation {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// A single 1x1 cell.
    pub const fn cell(x: u32, y: u32) -> Self {
        Self::new(x, y, 1, 1)
    }

    pub fn is_valid(&self) -> bool {
        self.width != 0 && self.height != 0
    }

    /// Whether two locations name the same cell, ignoring extent.
    pub fn same_cell(&self, other: &AffinityLocation) -> bool {
        self.x == other.x && self.y == other.y
    }

    /// Whether the relative location `rel` lies within this window.
    pub fn contains_relative(&self, rel: &AffinityLocation) -> bool {
        rel.x < self.width && rel.y < self.height
    }

    /// Absolute cell of the relative location `rel`.
    pub fn absolute(&self, rel: &AffinityLocation) -> AffinityLocation {
        AffinityLocation::cell(self.x.saturating_add(rel.x), self.y.saturating_add(rel.y))
    }

    /// Relative cell of the absolute location `abs`, if it lies within this
    /// window.
    pub fn relative(&self, abs: &AffinityLocation) -> Option<AffinityLocation> {
        if abs.x < self.x || abs.y < self.y {
            return None;
        }
        let rel = AffinityLocation::cell(abs.x - self.x, abs.y - self.y);
        self.contains_relative(&rel).then_some(rel)
    }

    /// Fold an arbitrary relative location into this window.
    pub fn wrap(&self, rel: &AffinityLocation) -> AffinityLocation {
        if !self.is_valid() {
            return AffinityLocation::cell(0, 0);
        }
        AffinityLocation::cell(rel.x % self.width, rel.y % self.height)
    }

    /// The cell following `rel` in row-major order, wrapping at the end of
    /// each row and at the end of the window.
    pub fn next_cell(&self, rel: &AffinityLocation) -> AffinityLocation {
        if !self.is_valid() {
            return AffinityLocation::cell(0, 0);
        }
        let mut x = rel.x.saturating_add(1);
        let mut y = rel.y;
        if x >= self.width {
            x = 0;
            y = y.saturating_add(1);
            if y >= self.height {
                y = 0;
            }
        }
        AffinityLocation::cell(x, y)
    }

    /// Relative cells of this window in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = AffinityLocation> {
        let (width, height) = (self.width, self.height);
        (0..height).flat_map(move |y| (0..width).map(move |x| AffinityLocation::cell(x, y)))
    }
}

impl fmt::Display for AffinityLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{} {}x{}", self.x, self.y, self.width, self.height)
    }
}
