//! Tile planning
//!
//! Splits the correlation matrix of a job unit into rectangular tiles that
//! fit the memory budget of a single compute resource. Tiles are emitted in
//! row-major order over tile coordinates, so the plan is deterministic and a
//! partially merged plan can be resumed by skipping completed tile ids.

use super::JobSpec;
use std::collections::HashSet;

/// A rectangular region of the correlation matrix, in unit-local indices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    /// Position of the tile in plan order
    pub id: usize,
    /// First row (inclusive)
    pub row_start: usize,
    /// Last row (exclusive)
    pub row_end: usize,
    /// First column (inclusive)
    pub col_start: usize,
    /// Last column (exclusive)
    pub col_end: usize,
    /// Diagonal tile of a symmetric plan: only `col > row` pairs are evaluated
    pub diagonal: bool,
}

impl Tile {
    /// Number of rows
    pub fn rows(&self) -> usize {
        self.row_end - self.row_start
    }

    /// Number of columns
    pub fn cols(&self) -> usize {
        self.col_end - self.col_start
    }

    /// Number of matrix cells covered
    pub fn area(&self) -> usize {
        self.rows() * self.cols()
    }
}

/// Largest edge not above `max(max_tile_size, window)` that evenly covers `n`
fn tile_edge(n: usize, window: usize, max_tile_size: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let effective = max_tile_size.max(window).max(1);
    let count = n.div_ceil(effective);
    n.div_ceil(count)
}

/// Deterministic sequence of tiles for one job unit
#[derive(Debug, Clone)]
pub struct TilePlan {
    n_rows: usize,
    n_cols: usize,
    row_edge: usize,
    col_edge: usize,
    row_tiles: usize,
    col_tiles: usize,
    symmetric: bool,
    cursor: (usize, usize),
    next_id: usize,
    skip: HashSet<usize>,
}

impl TilePlan {
    /// Plan tiles for an `n_rows` x `n_cols` matrix
    pub fn new(n_rows: usize, n_cols: usize, window: usize, max_tile_size: usize, symmetric: bool) -> Self {
        let row_edge = tile_edge(n_rows, window, max_tile_size);
        let col_edge = if symmetric {
            row_edge
        } else {
            tile_edge(n_cols, window, max_tile_size)
        };
        let row_tiles = if row_edge == 0 { 0 } else { n_rows.div_ceil(row_edge) };
        let col_tiles = if col_edge == 0 { 0 } else { n_cols.div_ceil(col_edge) };

        Self {
            n_rows,
            n_cols,
            row_edge,
            col_edge,
            row_tiles,
            col_tiles,
            symmetric,
            cursor: (0, 0),
            next_id: 0,
            skip: HashSet::new(),
        }
    }

    /// Plan tiles for a job unit
    pub fn for_spec(spec: &JobSpec) -> Self {
        Self::new(
            spec.n_rows(),
            spec.n_cols(),
            spec.window,
            spec.max_tile_size,
            spec.is_symmetric(),
        )
    }

    /// Skip tiles whose ids have already been merged
    pub fn resume(mut self, done: &HashSet<usize>) -> Self {
        self.skip.extend(done.iter().copied());
        self
    }

    /// Total number of tiles in the plan, including skipped and already
    /// emitted ones
    pub fn total(&self) -> usize {
        if self.symmetric {
            self.row_tiles * (self.row_tiles + 1) / 2
        } else {
            self.row_tiles * self.col_tiles
        }
    }

    /// Whether no tiles remain to be emitted
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remaining(&self) -> usize {
        let total = self.total();
        let skipped = self
            .skip
            .iter()
            .filter(|&&id| id >= self.next_id && id < total)
            .count();
        total.saturating_sub(self.next_id) - skipped
    }

    /// Tile edge lengths (rows, columns)
    pub fn edges(&self) -> (usize, usize) {
        (self.row_edge, self.col_edge)
    }

    fn advance(&mut self) -> Option<Tile> {
        let (rt, ct) = self.cursor;
        if rt >= self.row_tiles || self.col_tiles == 0 {
            return None;
        }

        let tile = Tile {
            id: self.next_id,
            row_start: rt * self.row_edge,
            row_end: ((rt + 1) * self.row_edge).min(self.n_rows),
            col_start: ct * self.col_edge,
            col_end: ((ct + 1) * self.col_edge).min(self.n_cols),
            diagonal: self.symmetric && rt == ct,
        };

        self.next_id += 1;
        self.cursor = if ct + 1 < self.col_tiles {
            (rt, ct + 1)
        } else if self.symmetric {
            (rt + 1, rt + 1)
        } else {
            (rt + 1, 0)
        };

        Some(tile)
    }
}

impl Iterator for TilePlan {
    type Item = Tile;

    fn next(&mut self) -> Option<Tile> {
        loop {
            let tile = self.advance()?;
            if !self.skip.contains(&tile.id) {
                return Some(tile);
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.remaining();
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for TilePlan {}
