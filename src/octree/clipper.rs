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
use crate::octree::ChunkKey;
use crate::read_write::{CellSlot, ChunkCache};
use fnv::FnvHashMap;
use std::sync::Arc;

/// Per-worker pin holder. Every cell a worker touches while processing
/// one batch is pinned exactly once here and released as a group on
/// `clip`, which amortizes cache lookups and keeps eviction precise.
/// Dropping an unclipped clipper (e.g. on an error path) releases its
/// pins too.
pub struct Clipper<'a> {
    cache: &'a ChunkCache,
    pinned: FnvHashMap<ChunkKey, Arc<CellSlot>>,
}

impl<'a> Clipper<'a> {
    pub fn new(cache: &'a ChunkCache) -> Self {
        Clipper {
            cache,
            pinned: FnvHashMap::default(),
        }
    }

    /// The pinned cell for 'key'. A key already pinned in this batch is
    /// returned without touching the cache index again.
    pub fn acquire(&mut self, key: ChunkKey) -> Result<Arc<CellSlot>> {
        if let Some(slot) = self.pinned.get(&key) {
            return Ok(Arc::clone(slot));
        }
        let slot = self.cache.acquire(key)?;
        self.pinned.insert(key, Arc::clone(&slot));
        Ok(slot)
    }

    /// Releases all pins taken since the last clip.
    pub fn clip(&mut self) {
        for (key, _) in self.pinned.drain() {
            self.cache.release(&key);
        }
    }

    pub fn pinned_count(&self) -> usize {
        self.pinned.len()
    }
}

impl<'a> Drop for Clipper<'a> {
    fn drop(&mut self) {
        self.clip();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataType;
    use crate::manifest::Schema;
    use crate::octree::Hierarchy;
    use crate::read_write::{ChunkStore, MemoryEndpoint};

    fn test_cache() -> ChunkCache {
        let store = ChunkStore::new(
            Arc::new(MemoryEndpoint::new()),
            Schema::default(),
            DataType::Binary,
            String::new(),
        );
        ChunkCache::new(store, Arc::new(Hierarchy::new()), 4, 0, 64)
    }

    #[test]
    fn repeated_acquires_pin_once() {
        let cache = test_cache();
        let key = ChunkKey::new(1, 0, 0, 0);
        let mut clipper = Clipper::new(&cache);
        clipper.acquire(key).unwrap();
        clipper.acquire(key).unwrap();
        assert_eq!(clipper.pinned_count(), 1);

        clipper.clip();
        assert_eq!(clipper.pinned_count(), 0);
        // The single release left the cell unpinned: evictable.
        cache.evict_excess().unwrap();
        cache.flush().unwrap();
        assert_eq!(cache.resident_count(), 0);
    }

    #[test]
    fn dropping_a_clipper_releases_its_pins() {
        let cache = test_cache();
        let key = ChunkKey::new(2, 1, 2, 3);
        {
            let mut clipper = Clipper::new(&cache);
            clipper.acquire(key).unwrap();
        }
        // No pins left behind; the cell can be flushed away.
        cache.flush().unwrap();
        assert_eq!(cache.resident_count(), 0);
    }
}
