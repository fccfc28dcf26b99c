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

pub mod cache;
pub mod chunk_store;
pub mod endpoint;
pub mod source;

pub use self::cache::{CellSlot, ChunkCache};
pub use self::chunk_store::ChunkStore;
pub use self::endpoint::{Endpoint, LocalEndpoint, MemoryEndpoint};
pub use self::source::{MemoryReader, PtsReader, SourceReader, SourceStream};
