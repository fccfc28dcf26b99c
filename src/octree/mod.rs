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

pub mod builder;
pub mod cell;
pub mod clipper;
pub mod hierarchy;
pub mod key;
pub mod merger;
pub mod subset;

pub use self::builder::{BuildContext, BuildSummary, Builder, Counters};
pub use self::cell::Cell;
pub use self::clipper::Clipper;
pub use self::hierarchy::Hierarchy;
pub use self::key::{ChunkKey, PointKey};
pub use self::merger::{MergeSummary, Merger};
pub use self::subset::{Span, Subset};
