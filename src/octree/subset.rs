//! Spatial sharding of a build into disjoint sub-trees.

use crate::config::SubsetId;
use crate::errors::*;
use crate::math::Bounds;
use crate::octree::ChunkKey;
use nalgebra::Point3;
use std::ops::Range;

/// The contiguous block of cell positions a shard owns at one depth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    pub depth: u32,
    pub x: Range<u64>,
    pub y: Range<u64>,
    pub z: Range<u64>,
}

impl Span {
    pub fn contains(&self, key: &ChunkKey) -> bool {
        key.depth() == self.depth
            && self.x.contains(&key.x())
            && self.y.contains(&key.y())
            && self.z.contains(&key.z())
    }

    pub fn cell_count(&self) -> u64 {
        (self.x.end - self.x.start) * (self.y.end - self.y.start) * (self.z.end - self.z.start)
    }
}

/// Shard `id` of `of` (a power of four): the global bounds split `k`
/// times along X then Y, yielding a `2^k x 2^k` column grid over the
/// full Z extent. Above depth `k` the shard builds nothing.
#[derive(Debug, Clone)]
pub struct Subset {
    id: u64,
    of: u64,
    k: u32,
    x_index: u64,
    y_index: u64,
    bounds: Bounds,
}

impl Subset {
    pub fn new(subset: SubsetId, root_bounds: &Bounds) -> Result<Subset> {
        let SubsetId { id, of } = subset;
        if !of.is_power_of_two() || of.trailing_zeros() % 2 != 0 {
            bail!(ErrorKind::InvalidInput(format!(
                "subset 'of' must be a power of four, got {}",
                of
            )));
        }
        if id == 0 || id > of {
            bail!(ErrorKind::InvalidInput(format!(
                "subset id must be in 1..={}, got {}",
                of, id
            )));
        }
        let k = of.trailing_zeros() / 2;
        let n = 1u64 << k;
        // Splits alternate X then Y, so the leading index bits select
        // the X half at every level: row-major with X as the slow axis.
        let index = id - 1;
        let x_index = index / n;
        let y_index = index % n;

        let min = root_bounds.min();
        let extents = root_bounds.extents();
        let width_x = extents.x / n as f64;
        let width_y = extents.y / n as f64;
        let bounds = Bounds::new(
            Point3::new(
                min.x + x_index as f64 * width_x,
                min.y + y_index as f64 * width_y,
                min.z,
            ),
            Point3::new(
                min.x + (x_index + 1) as f64 * width_x,
                min.y + (y_index + 1) as f64 * width_y,
                root_bounds.max().z,
            ),
        );

        Ok(Subset {
            id,
            of,
            k,
            x_index,
            y_index,
            bounds,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn of(&self) -> u64 {
        self.of
    }

    /// The shard's own box within the global bounds.
    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    /// The depth at which this shard's cells begin; no shallower cell
    /// belongs to it.
    pub fn minimum_null_depth(&self) -> u32 {
        self.k
    }

    /// Storage key postfix preventing cross-shard collisions.
    pub fn postfix(&self) -> String {
        format!("-{}", self.id)
    }

    /// Whether 'key' lies in this shard's column. Membership follows the
    /// descended key, not the raw coordinates, so a point on a shared
    /// shard face belongs to exactly one shard (the same one its octant
    /// tie-break sends it to).
    pub fn owns(&self, key: &ChunkKey) -> bool {
        if key.depth() < self.k {
            return false;
        }
        let anchor = key.ancestor_at(self.k);
        anchor.x() == self.x_index && anchor.y() == self.y_index
    }

    /// The key ranges this shard owns for each depth in
    /// `[minimum_null_depth, depth_end)`.
    pub fn calc_spans(&self, depth_end: u32) -> Vec<Span> {
        let mut spans = Vec::new();
        for depth in self.k..depth_end {
            let per_column = 1u64 << (depth - self.k);
            spans.push(Span {
                depth,
                x: self.x_index * per_column..(self.x_index + 1) * per_column,
                y: self.y_index * per_column..(self.y_index + 1) * per_column,
                z: 0..1u64 << depth,
            });
        }
        spans
    }
}
