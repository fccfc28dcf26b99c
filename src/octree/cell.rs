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

use crate::Point;

/// The in-memory bucket of points belonging to one octree node.
///
/// A base cell (shallow levels of the tree) owns an overflow region of
/// `capacity` extra slots. When it fills up completely the overflow
/// region is handed out in bulk via `swap_out_overflow` and retired, so
/// the builder can push a whole batch down one level instead of single
/// points. Ordinary leaf cells reject inserts at `capacity`.
#[derive(Debug)]
pub struct Cell {
    points: Vec<Point>,
    capacity: usize,
    overflow_reserve: usize,
    split: bool,
    written_len: usize,
}

impl Cell {
    pub fn base(capacity: usize) -> Self {
        Cell {
            points: Vec::new(),
            capacity,
            overflow_reserve: capacity,
            split: false,
            written_len: 0,
        }
    }

    pub fn overflow(capacity: usize) -> Self {
        Cell {
            points: Vec::new(),
            capacity,
            overflow_reserve: 0,
            split: false,
            written_len: 0,
        }
    }

    /// Rebuilds a cell from its persisted chunk. The loaded points count
    /// as already written; a base cell that had already shed its
    /// overflow region comes back with it retired.
    pub fn from_points(points: Vec<Point>, capacity: usize, base: bool, split: bool) -> Self {
        let written_len = points.len();
        Cell {
            points,
            capacity,
            overflow_reserve: if base { capacity } else { 0 },
            split,
            written_len,
        }
    }

    fn limit(&self) -> usize {
        if self.split {
            self.capacity
        } else {
            self.capacity + self.overflow_reserve
        }
    }

    pub fn is_base(&self) -> bool {
        self.overflow_reserve > 0
    }

    pub fn is_split(&self) -> bool {
        self.split
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn points(&self) -> &[Point] {
        &self.points
    }

    /// False when the cell is at capacity; overflow is a signal, not an
    /// error.
    pub fn try_insert(&mut self, p: &Point) -> bool {
        if self.points.len() >= self.limit() {
            return false;
        }
        self.points.push(p.clone());
        true
    }

    /// Hands out everything beyond the regular capacity and retires the
    /// overflow region. Only meaningful on base cells.
    pub fn swap_out_overflow(&mut self) -> Vec<Point> {
        self.split = true;
        if self.points.len() > self.capacity {
            self.points.split_off(self.capacity)
        } else {
            Vec::new()
        }
    }

    /// True when the cell holds points the store has not seen yet.
    pub fn dirty(&self) -> bool {
        self.points.len() != self.written_len
    }

    pub fn mark_written(&mut self) {
        self.written_len = self.points.len();
    }
}
