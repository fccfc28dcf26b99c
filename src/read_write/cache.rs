use crate::errors::*;
use crate::octree::{ChunkKey, Hierarchy};
use crate::read_write::chunk_store::ChunkStore;
use crate::octree::cell::Cell;
use fnv::FnvHashMap;
use lru::LruCache;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

/// Residency state of one slot, used to serialize concurrent loads of
/// the same key: the first acquirer loads, everyone else waits on the
/// per-slot condition.
#[derive(Debug, Clone, PartialEq)]
enum SlotState {
    Loading,
    Ready,
    Failed(String),
}

pub struct CellSlot {
    key: ChunkKey,
    state: Mutex<SlotState>,
    ready: Condvar,
    cell: Mutex<Cell>,
}

impl CellSlot {
    fn new(key: ChunkKey, placeholder: Cell) -> Self {
        CellSlot {
            key,
            state: Mutex::new(SlotState::Loading),
            ready: Condvar::new(),
            cell: Mutex::new(placeholder),
        }
    }

    pub fn key(&self) -> ChunkKey {
        self.key
    }

    pub fn lock(&self) -> MutexGuard<Cell> {
        self.cell.lock().unwrap()
    }

    fn resolve(&self, state: SlotState) {
        *self.state.lock().unwrap() = state;
        self.ready.notify_all();
    }

    fn wait_ready(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        while *state == SlotState::Loading {
            state = self.ready.wait(state).unwrap();
        }
        match &*state {
            SlotState::Ready => Ok(()),
            SlotState::Failed(msg) => {
                Err(format!("load of cell {} failed: {}", self.key, msg).into())
            }
            SlotState::Loading => unreachable!(),
        }
    }
}

struct ResidentCell {
    slot: Arc<CellSlot>,
    pins: usize,
}

struct CacheIndex {
    resident: FnvHashMap<ChunkKey, ResidentCell>,
    /// Unpinned cells in release order; eviction pops the least
    /// recently released one.
    released: LruCache<ChunkKey, ()>,
}

/// The only shared mutable state of a build: all resident cells, keyed
/// by `ChunkKey`. Guarantees at most one in-flight load per key and
/// spills evicted cells through the `ChunkStore`.
///
/// The index mutex is only ever held for map surgery; loads, stores and
/// point insertion happen under the per-cell locks.
pub struct ChunkCache {
    store: ChunkStore,
    hierarchy: Arc<Hierarchy>,
    index: Mutex<CacheIndex>,
    chunk_capacity: usize,
    base_depth: u32,
    soft_cap: usize,
}

impl ChunkCache {
    pub fn new(
        store: ChunkStore,
        hierarchy: Arc<Hierarchy>,
        chunk_capacity: usize,
        base_depth: u32,
        soft_cap: usize,
    ) -> Self {
        ChunkCache {
            store,
            hierarchy,
            index: Mutex::new(CacheIndex {
                resident: FnvHashMap::default(),
                released: LruCache::unbounded(),
            }),
            chunk_capacity,
            base_depth,
            soft_cap,
        }
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    fn is_base(&self, key: &ChunkKey) -> bool {
        key.depth() < self.base_depth
    }

    /// Returns a pinned cell for 'key', loading or creating it as
    /// needed. Every successful acquire must be paired with one
    /// `release`; the `Clipper` takes care of that for builder workers.
    pub fn acquire(&self, key: ChunkKey) -> Result<Arc<CellSlot>> {
        let (slot, loader) = {
            let mut index = self.index.lock().unwrap();
            if let Some(entry) = index.resident.get_mut(&key) {
                entry.pins += 1;
                let slot = Arc::clone(&entry.slot);
                index.released.pop(&key);
                (slot, false)
            } else {
                let placeholder = Cell::overflow(0);
                let slot = Arc::new(CellSlot::new(key, placeholder));
                index.resident.insert(
                    key,
                    ResidentCell {
                        slot: Arc::clone(&slot),
                        pins: 1,
                    },
                );
                (slot, true)
            }
        };

        if !loader {
            slot.wait_ready()?;
            return Ok(slot);
        }

        match self.load(&key) {
            Ok(cell) => {
                *slot.cell.lock().unwrap() = cell;
                slot.resolve(SlotState::Ready);
                Ok(slot)
            }
            Err(e) => {
                slot.resolve(SlotState::Failed(e.to_string()));
                self.index.lock().unwrap().resident.remove(&key);
                Err(e)
            }
        }
    }

    fn load(&self, key: &ChunkKey) -> Result<Cell> {
        let base = self.is_base(key);
        match self.store.read(key)? {
            Some((points, split)) => {
                Ok(Cell::from_points(points, self.chunk_capacity, base, split))
            }
            None if base => Ok(Cell::base(self.chunk_capacity)),
            None => Ok(Cell::overflow(self.chunk_capacity)),
        }
    }

    /// Drops one pin. A cell whose pin count reaches zero becomes an
    /// eviction candidate; base cells stay resident for the whole build
    /// so a split never has to shrink a persisted chunk.
    pub fn release(&self, key: &ChunkKey) {
        let mut index = self.index.lock().unwrap();
        if let Some(entry) = index.resident.get_mut(key) {
            debug_assert!(entry.pins > 0, "release without a pin for {}", key);
            entry.pins = entry.pins.saturating_sub(1);
            if entry.pins == 0 && !self.is_base(key) {
                index.released.put(*key, ());
            }
        }
    }

    /// Writes and drops least-recently-released cells until the resident
    /// count is back under the soft cap.
    pub fn evict_excess(&self) -> Result<()> {
        loop {
            let (key, slot) = {
                let mut index = self.index.lock().unwrap();
                if index.resident.len() <= self.soft_cap {
                    return Ok(());
                }
                let key = match index.released.pop_lru() {
                    Some((key, ())) => key,
                    // Everything over the cap is pinned; let the
                    // clippers release first.
                    None => return Ok(()),
                };
                match index.resident.get(&key) {
                    Some(entry) => (key, Arc::clone(&entry.slot)),
                    None => continue,
                }
            };

            self.write_through(&slot)?;

            let mut index = self.index.lock().unwrap();
            if let Some(entry) = index.resident.get(&key) {
                if entry.pins > 0 {
                    // Re-acquired while we were writing; it will come
                    // back through `release`.
                    continue;
                }
                let still_dirty = entry.slot.lock().dirty();
                if still_dirty {
                    index.released.put(key, ());
                } else {
                    index.resident.remove(&key);
                }
            }
        }
    }

    /// Writes every dirty resident cell through the store and empties
    /// the cache. Called once ingestion is done (or cancelled).
    pub fn flush(&self) -> Result<()> {
        let slots: Vec<Arc<CellSlot>> = {
            let index = self.index.lock().unwrap();
            index
                .resident
                .values()
                .map(|entry| Arc::clone(&entry.slot))
                .collect()
        };
        for slot in slots {
            self.write_through(&slot)?;
        }
        let mut index = self.index.lock().unwrap();
        index.resident.clear();
        while index.released.pop_lru().is_some() {}
        Ok(())
    }

    /// Checkpoint variant of `flush`: persists all dirty cells but keeps
    /// them resident.
    pub fn write_dirty(&self) -> Result<()> {
        let slots: Vec<Arc<CellSlot>> = {
            let index = self.index.lock().unwrap();
            index
                .resident
                .values()
                .map(|entry| Arc::clone(&entry.slot))
                .collect()
        };
        for slot in slots {
            self.write_through(&slot)?;
        }
        Ok(())
    }

    fn write_through(&self, slot: &Arc<CellSlot>) -> Result<()> {
        let mut cell = slot.lock();
        if cell.is_empty() || !cell.dirty() {
            return Ok(());
        }
        self.store.write(&slot.key(), cell.points(), cell.is_split())?;
        self.hierarchy.record(slot.key(), cell.len() as u64);
        cell.mark_written();
        Ok(())
    }

    pub fn resident_count(&self) -> usize {
        self.index.lock().unwrap().resident.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataType;
    use crate::manifest::Schema;
    use crate::read_write::{Endpoint, MemoryEndpoint};
    use crate::Point;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct CountingEndpoint {
        inner: MemoryEndpoint,
        gets: AtomicUsize,
    }

    impl CountingEndpoint {
        fn new() -> Self {
            CountingEndpoint {
                inner: MemoryEndpoint::new(),
                gets: AtomicUsize::new(0),
            }
        }
    }

    impl Endpoint for CountingEndpoint {
        fn get(&self, key: &str) -> Result<Vec<u8>> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key)
        }
        fn put(&self, key: &str, data: &[u8]) -> Result<()> {
            self.inner.put(key, data)
        }
        fn exists(&self, key: &str) -> Result<bool> {
            self.inner.exists(key)
        }
        fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix)
        }
    }

    fn cache_over(endpoint: Arc<dyn Endpoint>, soft_cap: usize) -> ChunkCache {
        let store = ChunkStore::new(endpoint, Schema::default(), DataType::Binary, String::new());
        ChunkCache::new(store, Arc::new(Hierarchy::new()), 4, 0, soft_cap)
    }

    #[test]
    fn acquire_creates_empty_cells_for_absent_chunks() {
        let cache = cache_over(Arc::new(MemoryEndpoint::new()), 8);
        let key = ChunkKey::new(2, 1, 1, 1);
        let slot = cache.acquire(key).unwrap();
        assert_eq!(slot.lock().len(), 0);
        cache.release(&key);
        assert_eq!(cache.resident_count(), 1);
    }

    #[test]
    fn eviction_spills_dirty_cells_and_reloads_them() {
        let endpoint = Arc::new(MemoryEndpoint::new());
        let cache = cache_over(endpoint.clone(), 1);

        let a = ChunkKey::new(1, 0, 0, 0);
        let b = ChunkKey::new(1, 1, 0, 0);
        let slot = cache.acquire(a).unwrap();
        assert!(slot.lock().try_insert(&Point::at(1., 2., 3.)));
        cache.release(&a);

        let slot_b = cache.acquire(b).unwrap();
        assert!(slot_b.lock().try_insert(&Point::at(9., 9., 9.)));
        cache.evict_excess().unwrap();
        // 'a' was unpinned and least recently released: spilled to the
        // endpoint and dropped.
        assert_eq!(cache.resident_count(), 1);
        assert!(endpoint.exists("ept-data/1-0-0-0.bin").unwrap());

        let again = cache.acquire(a).unwrap();
        assert_eq!(again.lock().len(), 1);
        assert_eq!(again.lock().points()[0], Point::at(1., 2., 3.));
        cache.release(&a);
        cache.release(&b);
    }

    #[test]
    fn pinned_cells_are_never_evicted() {
        let cache = cache_over(Arc::new(MemoryEndpoint::new()), 0);
        let key = ChunkKey::new(1, 0, 1, 0);
        let slot = cache.acquire(key).unwrap();
        assert!(slot.lock().try_insert(&Point::at(0., 0., 0.)));
        cache.evict_excess().unwrap();
        assert_eq!(cache.resident_count(), 1);
        cache.release(&key);
        cache.evict_excess().unwrap();
        assert_eq!(cache.resident_count(), 0);
    }

    #[test]
    fn flush_records_hierarchy_counts() {
        let endpoint = Arc::new(MemoryEndpoint::new());
        let store = ChunkStore::new(
            endpoint.clone(),
            Schema::default(),
            DataType::Binary,
            String::new(),
        );
        let hierarchy = Arc::new(Hierarchy::new());
        let cache = ChunkCache::new(store, hierarchy.clone(), 4, 0, 8);

        let key = ChunkKey::new(2, 3, 3, 3);
        let slot = cache.acquire(key).unwrap();
        assert!(slot.lock().try_insert(&Point::at(1., 1., 1.)));
        assert!(slot.lock().try_insert(&Point::at(2., 2., 2.)));
        cache.release(&key);
        cache.flush().unwrap();

        assert_eq!(hierarchy.get(&key), Some(2));
        assert_eq!(cache.resident_count(), 0);
        assert!(endpoint.exists("ept-data/2-3-3-3.bin").unwrap());
    }

    #[test]
    fn concurrent_acquires_load_once() {
        let endpoint = Arc::new(CountingEndpoint::new());
        // Persist one chunk up front.
        {
            let store = ChunkStore::new(
                endpoint.clone() as Arc<dyn Endpoint>,
                Schema::default(),
                DataType::Binary,
                String::new(),
            );
            store
                .write(&ChunkKey::root(), &[Point::at(5., 5., 5.)], false)
                .unwrap();
        }
        endpoint.gets.store(0, Ordering::SeqCst);

        let cache = Arc::new(cache_over(endpoint.clone() as Arc<dyn Endpoint>, 8));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(thread::spawn(move || {
                let slot = cache.acquire(ChunkKey::root()).unwrap();
                let len = slot.lock().len();
                cache.release(&ChunkKey::root());
                len
            }));
        }
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 1);
        }
        assert_eq!(endpoint.gets.load(Ordering::SeqCst), 1);
    }
}
