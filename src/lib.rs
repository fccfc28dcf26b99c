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

#![recursion_limit = "1024"]

#[macro_use]
extern crate error_chain;
#[macro_use]
extern crate serde_derive;

pub mod config;
pub mod errors;
pub mod manifest;
pub mod math;
pub mod octree;
pub mod read_write;

use nalgebra::Point3;

/// Number of points pulled from a source per `next_batch` call.
pub const NUM_POINTS_PER_BATCH: usize = 65_536;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Color<T> {
    pub red: T,
    pub green: T,
    pub blue: T,
}

/// A single point record. The position is mandatory; the remaining
/// dimensions are present when the build schema declares them.
#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub position: Point3<f64>,
    pub intensity: Option<u16>,
    pub color: Option<Color<u16>>,
    pub classification: Option<u8>,
    pub gps_time: Option<f64>,
}

impl Point {
    pub fn at(x: f64, y: f64, z: f64) -> Self {
        Point {
            position: Point3::new(x, y, z),
            intensity: None,
            color: None,
            classification: None,
            gps_time: None,
        }
    }

    /// NaN or infinite coordinates never enter the tree.
    pub fn is_finite(&self) -> bool {
        self.position.x.is_finite() && self.position.y.is_finite() && self.position.z.is_finite()
    }
}
