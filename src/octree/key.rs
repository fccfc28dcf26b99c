// Copyright 2016 Google Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::errors::*;
use crate::math::Bounds;
use nalgebra::Point3;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A unique identifier of one octree node: a depth and a cell position.
/// At depth `d` every coordinate is in `[0, 2^d)`. The root is
/// `(0, (0, 0, 0))`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkKey {
    depth: u32,
    x: u64,
    y: u64,
    z: u64,
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{}-{}-{}", self.depth, self.x, self.y, self.z)
    }
}

impl ChunkKey {
    pub fn root() -> Self {
        ChunkKey {
            depth: 0,
            x: 0,
            y: 0,
            z: 0,
        }
    }

    pub fn new(depth: u32, x: u64, y: u64, z: u64) -> Self {
        debug_assert!(x < (1 << depth) && y < (1 << depth) && z < (1 << depth) || depth == 0);
        ChunkKey { depth, x, y, z }
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn x(&self) -> u64 {
        self.x
    }

    pub fn y(&self) -> u64 {
        self.y
    }

    pub fn z(&self) -> u64 {
        self.z
    }

    /// The key of the octant child. Bit 0 of 'octant' selects the high
    /// half in x, bit 1 in y, bit 2 in z.
    pub fn child(&self, octant: u8) -> ChunkKey {
        assert!(octant < 8);
        ChunkKey {
            depth: self.depth + 1,
            x: self.x << 1 | u64::from(octant & 1),
            y: self.y << 1 | u64::from(octant >> 1 & 1),
            z: self.z << 1 | u64::from(octant >> 2 & 1),
        }
    }

    pub fn parent(&self) -> Option<ChunkKey> {
        if self.depth == 0 {
            return None;
        }
        Some(ChunkKey {
            depth: self.depth - 1,
            x: self.x >> 1,
            y: self.y >> 1,
            z: self.z >> 1,
        })
    }

    /// The ancestor at 'depth'. Panics when 'depth' is below this key.
    pub fn ancestor_at(&self, depth: u32) -> ChunkKey {
        assert!(depth <= self.depth);
        let shift = self.depth - depth;
        ChunkKey {
            depth,
            x: self.x >> shift,
            y: self.y >> shift,
            z: self.z >> shift,
        }
    }

    /// Morton code of the cell position, interleaving x, y and z bits.
    /// Together with the depth this yields the total order on keys.
    pub fn morton(&self) -> u128 {
        let mut code: u128 = 0;
        for i in 0..42 {
            code |= u128::from(self.x >> i & 1) << (3 * i);
            code |= u128::from(self.y >> i & 1) << (3 * i + 1);
            code |= u128::from(self.z >> i & 1) << (3 * i + 2);
        }
        code
    }
}

impl Ord for ChunkKey {
    fn cmp(&self, other: &ChunkKey) -> Ordering {
        self.depth
            .cmp(&other.depth)
            .then_with(|| self.morton().cmp(&other.morton()))
    }
}

impl PartialOrd for ChunkKey {
    fn partial_cmp(&self, other: &ChunkKey) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for ChunkKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<ChunkKey> {
        let parts: Vec<&str> = s.split('-').collect();
        if parts.len() != 4 {
            bail!(ErrorKind::InvalidInput(format!(
                "'{}' is not a chunk key",
                s
            )));
        }
        let mut numbers = [0u64; 4];
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            *slot = part
                .parse()
                .chain_err(|| ErrorKind::InvalidInput(format!("'{}' is not a chunk key", s)))?;
        }
        Ok(ChunkKey {
            depth: numbers[0] as u32,
            x: numbers[1],
            y: numbers[2],
            z: numbers[3],
        })
    }
}

/// A `ChunkKey` paired with the bounds of its cell, descending towards
/// the cell containing a given point. Descent is a pure function of the
/// point's coordinates: equal points reach equal keys at equal depths.
#[derive(Debug, Clone)]
pub struct PointKey {
    key: ChunkKey,
    bounds: Bounds,
}

impl PointKey {
    pub fn new(root_bounds: Bounds) -> Self {
        PointKey {
            key: ChunkKey::root(),
            bounds: root_bounds,
        }
    }

    pub fn key(&self) -> ChunkKey {
        self.key
    }

    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    /// Descends one level into the octant containing 'p' and returns the
    /// octant index taken.
    pub fn step(&mut self, p: &Point3<f64>) -> u8 {
        let octant = self.bounds.octant_of(p);
        self.bounds = self.bounds.octant(octant);
        self.key = self.key.child(octant);
        octant
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;

    fn root_bounds() -> Bounds {
        Bounds::new(Point3::new(0., 0., 0.), Point3::new(16., 16., 16.))
    }

    #[test]
    fn display_and_parse_round_trip() {
        let key = ChunkKey::new(3, 1, 5, 7);
        assert_eq!(key.to_string(), "3-1-5-7");
        assert_eq!("3-1-5-7".parse::<ChunkKey>().unwrap(), key);
        assert!("3-1-5".parse::<ChunkKey>().is_err());
        assert!("a-b-c-d".parse::<ChunkKey>().is_err());
    }

    #[test]
    fn child_and_parent_are_inverse() {
        let key = ChunkKey::new(2, 1, 2, 3);
        for octant in 0..8 {
            let child = key.child(octant);
            assert_eq!(child.depth(), 3);
            assert_eq!(child.parent(), Some(key));
        }
        assert_eq!(ChunkKey::root().parent(), None);
    }

    #[test]
    fn child_bit_layout() {
        let root = ChunkKey::root();
        assert_eq!(root.child(0b001), ChunkKey::new(1, 1, 0, 0));
        assert_eq!(root.child(0b010), ChunkKey::new(1, 0, 1, 0));
        assert_eq!(root.child(0b100), ChunkKey::new(1, 0, 0, 1));
    }

    #[test]
    fn ancestor_at_walks_up() {
        let key = ChunkKey::new(4, 11, 5, 14);
        assert_eq!(key.ancestor_at(4), key);
        assert_eq!(key.ancestor_at(2), ChunkKey::new(2, 2, 1, 3));
        assert_eq!(key.ancestor_at(0), ChunkKey::root());
    }

    #[test]
    fn ordering_is_depth_then_morton() {
        let mut keys = vec![
            ChunkKey::new(1, 1, 1, 1),
            ChunkKey::new(0, 0, 0, 0),
            ChunkKey::new(1, 0, 0, 0),
            ChunkKey::new(2, 3, 0, 0),
            ChunkKey::new(1, 1, 0, 0),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                ChunkKey::new(0, 0, 0, 0),
                ChunkKey::new(1, 0, 0, 0),
                ChunkKey::new(1, 1, 0, 0),
                ChunkKey::new(1, 1, 1, 1),
                ChunkKey::new(2, 3, 0, 0),
            ]
        );
    }

    #[test]
    fn descent_is_deterministic() {
        let p = Point3::new(3.3, 9.9, 12.1);
        let mut a = PointKey::new(root_bounds());
        let mut b = PointKey::new(root_bounds());
        for _ in 0..26 {
            a.step(&p);
            b.step(&p);
            assert_eq!(a.key(), b.key());
            assert!(a.bounds().contains(&p));
        }
        assert_eq!(a.key().depth(), 26);
    }

    #[test]
    fn center_point_descends_into_octant_zero() {
        let mut pk = PointKey::new(root_bounds());
        let octant = pk.step(&Point3::new(8., 8., 8.));
        assert_eq!(octant, 0);
        assert_eq!(pk.key(), ChunkKey::new(1, 0, 0, 0));
    }

    #[test]
    fn max_corner_descends_into_high_octants() {
        let mut pk = PointKey::new(root_bounds());
        for _ in 0..4 {
            let octant = pk.step(&Point3::new(16., 16., 16.));
            assert_eq!(octant, 7);
        }
        assert_eq!(pk.key(), ChunkKey::new(4, 15, 15, 15));
    }
}
