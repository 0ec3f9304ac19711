//! Uniform spatial grid over one coordinate layer.
//!
//! Space is cut into cubes of edge `cell_size`; a token sits in the cube
//! containing its position. A radius query visits the cubes overlapping the
//! query's bounding box and then filters by exact distance, so its cost
//! follows the cells touched plus the candidates inside them.

use std::collections::HashMap;
use std::time::Instant;

use serde::Serialize;

use crate::constants::DEADLINE_CHECK_INTERVAL;
use crate::error::{CoreError, Result};
use crate::identity::TokenId;
use crate::layer::{Layer, Vec3};

/// Integer cell coordinates: `floor(coordinate / cell_size)` per axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CellKey {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

impl CellKey {
    pub fn of(position: Vec3, cell_size: f32) -> Self {
        let cs = cell_size as f64;
        Self {
            x: axis(position.x as f64, cs),
            y: axis(position.y as f64, cs),
            z: axis(position.z as f64, cs),
        }
    }

    fn within(self, lo: Self, hi: Self) -> bool {
        (lo.x..=hi.x).contains(&self.x)
            && (lo.y..=hi.y).contains(&self.y)
            && (lo.z..=hi.z).contains(&self.z)
    }
}

// `as` saturates, so far-out coordinates clamp to the edge cells instead of wrapping.
fn axis(coordinate: f64, cell_size: f64) -> i64 {
    (coordinate / cell_size).floor() as i64
}

/// Members of one cell with the position each was indexed at.
type Cell = HashMap<TokenId, Vec3>;

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct GridHit {
    pub id: TokenId,
    pub distance: f64,
}

/// Hits ordered by `(distance, id)`. `complete` is false when a deadline cut
/// the scan short.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GridHits {
    pub hits: Vec<GridHit>,
    pub complete: bool,
    pub cells_scanned: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GridStats {
    pub layer: Layer,
    pub cell_size: f32,
    pub cells: usize,
    pub tokens: usize,
    pub max_cell_occupancy: usize,
    /// Removals that found the token somewhere other than the supplied position.
    pub drift_repairs: u64,
}

#[derive(Debug, Clone)]
pub struct LayerGrid {
    layer: Layer,
    cell_size: f32,
    cells: HashMap<CellKey, Cell>,
    located: HashMap<TokenId, CellKey>,
    drift_repairs: u64,
}

impl LayerGrid {
    /// `cell_size` is assumed validated (finite, positive).
    pub fn new(layer: Layer, cell_size: f32) -> Self {
        Self {
            layer,
            cell_size,
            cells: HashMap::new(),
            located: HashMap::new(),
            drift_repairs: 0,
        }
    }

    pub fn layer(&self) -> Layer {
        self.layer
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    pub fn len(&self) -> usize {
        self.located.len()
    }

    pub fn is_empty(&self) -> bool {
        self.located.is_empty()
    }

    pub fn contains(&self, id: TokenId) -> bool {
        self.located.contains_key(&id)
    }

    /// Position the token was last indexed at.
    pub fn position(&self, id: TokenId) -> Option<Vec3> {
        let key = self.located.get(&id)?;
        self.cells.get(key)?.get(&id).copied()
    }

    /// Index `id` at `position`. Re-inserting into the same cell only refreshes
    /// the stored position; inserting into a different cell moves the token.
    pub fn insert(&mut self, id: TokenId, position: Vec3) {
        let key = CellKey::of(position, self.cell_size);
        if let Some(previous) = self.located.insert(id, key)
            && previous != key
        {
            self.detach(previous, id);
        }
        self.cells.entry(key).or_default().insert(id, position);
    }

    /// Remove `id`, looking first in the cell of `last_known`. If the token is
    /// indexed elsewhere it is removed from there instead. Unknown ids are a
    /// no-op. Returns whether anything was removed.
    pub fn remove(&mut self, id: TokenId, last_known: Vec3) -> bool {
        let Some(actual) = self.located.remove(&id) else {
            return false;
        };
        if actual != CellKey::of(last_known, self.cell_size) {
            self.drift_repairs += 1;
        }
        self.detach(actual, id);
        true
    }

    /// Move `id` from `from` to `to` under a single borrow, so no reader can
    /// observe the token missing from the layer in between.
    pub fn relocate(&mut self, id: TokenId, from: Vec3, to: Vec3) {
        self.remove(id, from);
        self.insert(id, to);
    }

    fn detach(&mut self, key: CellKey, id: TokenId) {
        if let Some(cell) = self.cells.get_mut(&key) {
            cell.remove(&id);
            if cell.is_empty() {
                self.cells.remove(&key);
            }
        }
    }

    /// Tokens within `radius` of `center`, nearest first, ties by ascending id,
    /// at most `max_results`.
    ///
    /// The deadline is checked every few cells; once it passes, the hits found
    /// so far are returned with `complete == false`.
    pub fn range_query(
        &self,
        center: Vec3,
        radius: f64,
        max_results: usize,
        deadline: Option<Instant>,
    ) -> Result<GridHits> {
        if !radius.is_finite() || radius < 0.0 {
            return Err(CoreError::OutOfRange {
                field: "radius",
                value: radius,
            });
        }
        if !center.is_finite() {
            return Err(CoreError::OutOfRange {
                field: "center",
                value: f64::NAN,
            });
        }

        let mut out = GridHits {
            hits: Vec::new(),
            complete: true,
            cells_scanned: 0,
        };
        if max_results == 0 || self.cells.is_empty() {
            return Ok(out);
        }

        let cs = self.cell_size as f64;
        let (cx, cy, cz) = (center.x as f64, center.y as f64, center.z as f64);
        let lo = CellKey {
            x: axis(cx - radius, cs),
            y: axis(cy - radius, cs),
            z: axis(cz - radius, cs),
        };
        let hi = CellKey {
            x: axis(cx + radius, cs),
            y: axis(cy + radius, cs),
            z: axis(cz + radius, cs),
        };

        let span = |a: i64, b: i64| (b as i128 - a as i128 + 1) as u128;
        let box_cells = span(lo.x, hi.x)
            .saturating_mul(span(lo.y, hi.y))
            .saturating_mul(span(lo.z, hi.z));

        let visit = |cell: &Cell, out: &mut GridHits| -> bool {
            if out.cells_scanned % DEADLINE_CHECK_INTERVAL == 0
                && deadline.is_some_and(|d| Instant::now() >= d)
            {
                out.complete = false;
                return false;
            }
            out.cells_scanned += 1;
            for (id, position) in cell {
                let distance = center.distance(*position);
                if distance <= radius {
                    out.hits.push(GridHit {
                        id: *id,
                        distance,
                    });
                }
            }
            true
        };

        if box_cells <= self.cells.len() as u128 {
            'scan: for x in lo.x..=hi.x {
                for y in lo.y..=hi.y {
                    for z in lo.z..=hi.z {
                        if let Some(cell) = self.cells.get(&CellKey { x, y, z })
                            && !visit(cell, &mut out)
                        {
                            break 'scan;
                        }
                    }
                }
            }
        } else {
            for (key, cell) in &self.cells {
                if key.within(lo, hi) && !visit(cell, &mut out) {
                    break;
                }
            }
        }

        out.hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.id.cmp(&b.id))
        });
        out.hits.truncate(max_results);
        Ok(out)
    }

    pub fn stats(&self) -> GridStats {
        GridStats {
            layer: self.layer,
            cell_size: self.cell_size,
            cells: self.cells.len(),
            tokens: self.located.len(),
            max_cell_occupancy: self.cells.values().map(HashMap::len).max().unwrap_or(0),
            drift_repairs: self.drift_repairs,
        }
    }
}
