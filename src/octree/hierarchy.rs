//! The sparse map from `ChunkKey` to point count, and its block-wise
//! persistence.

use crate::errors::*;
use crate::octree::ChunkKey;
use crate::read_write::Endpoint;
use fnv::FnvHashMap;
use std::collections::BTreeMap;
use std::sync::Mutex;

pub const HIERARCHY_PREFIX: &str = "ept-hierarchy";

const NUM_SHARDS: usize = 16;

/// Concurrent count map, sharded by the top-level key bits so workers
/// rarely contend on the same mutex.
pub struct Hierarchy {
    shards: Vec<Mutex<FnvHashMap<ChunkKey, u64>>>,
}

impl Default for Hierarchy {
    fn default() -> Self {
        Hierarchy {
            shards: (0..NUM_SHARDS)
                .map(|_| Mutex::new(FnvHashMap::default()))
                .collect(),
        }
    }
}

impl Hierarchy {
    pub fn new() -> Self {
        Hierarchy::default()
    }

    fn shard(&self, key: &ChunkKey) -> &Mutex<FnvHashMap<ChunkKey, u64>> {
        let h = key.x() ^ key.y().rotate_left(21) ^ key.z().rotate_left(42) ^ u64::from(key.depth());
        &self.shards[(h as usize) % NUM_SHARDS]
    }

    /// Sets the count for 'key'. Counts track the persisted chunk sizes,
    /// so the latest write wins.
    pub fn record(&self, key: ChunkKey, count: u64) {
        self.shard(&key).lock().unwrap().insert(key, count);
    }

    pub fn get(&self, key: &ChunkKey) -> Option<u64> {
        self.shard(key).lock().unwrap().get(key).copied()
    }

    pub fn total_points(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap().values().sum::<u64>())
            .sum()
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A sorted copy of all entries.
    pub fn snapshot(&self) -> BTreeMap<ChunkKey, u64> {
        let mut all = BTreeMap::new();
        for shard in &self.shards {
            for (key, count) in shard.lock().unwrap().iter() {
                all.insert(*key, *count);
            }
        }
        all
    }

    pub fn extend(&self, entries: &BTreeMap<ChunkKey, u64>) {
        for (key, count) in entries {
            self.record(*key, *count);
        }
    }
}

/// The root of the block holding 'key': its ancestor at the largest
/// multiple of 'step' not exceeding the key's depth. Keys at a multiple
/// of 'step' anchor their own block.
pub fn block_root(key: &ChunkKey, step: u32) -> ChunkKey {
    let step = step.max(1);
    key.ancestor_at(key.depth() - key.depth() % step)
}

/// Groups a hierarchy snapshot into blocks keyed by their root.
pub fn partition_blocks(
    entries: &BTreeMap<ChunkKey, u64>,
    step: u32,
) -> BTreeMap<ChunkKey, BTreeMap<String, u64>> {
    let mut blocks: BTreeMap<ChunkKey, BTreeMap<String, u64>> = BTreeMap::new();
    for (key, count) in entries {
        blocks
            .entry(block_root(key, step))
            .or_insert_with(BTreeMap::new)
            .insert(key.to_string(), *count);
    }
    blocks
}

fn block_path(root: &ChunkKey, postfix: &str) -> String {
    format!("{}/{}{}.json", HIERARCHY_PREFIX, root, postfix)
}

/// Writes one JSON object per non-empty block.
pub fn write_blocks(
    endpoint: &dyn Endpoint,
    entries: &BTreeMap<ChunkKey, u64>,
    step: u32,
    postfix: &str,
) -> Result<()> {
    for (root, block) in partition_blocks(entries, step) {
        let data = serde_json::to_vec_pretty(&block)?;
        endpoint.put(&block_path(&root, postfix), &data)?;
    }
    Ok(())
}

/// Reads every hierarchy block carrying 'postfix' back into one map.
/// Blocks belonging to other subsets (different postfix) are skipped.
pub fn read_blocks(endpoint: &dyn Endpoint, postfix: &str) -> Result<BTreeMap<ChunkKey, u64>> {
    let mut entries = BTreeMap::new();
    let keys = match endpoint.list(HIERARCHY_PREFIX) {
        Ok(keys) => keys,
        Err(Error(ErrorKind::EndpointNotFound(_), _)) => return Ok(entries),
        Err(e) => return Err(e),
    };
    for object_key in keys {
        let name = match object_key
            .rsplit('/')
            .next()
            .and_then(|n| n.strip_suffix(".json"))
        {
            Some(name) => name,
            None => continue,
        };
        let root = match strip_postfix(name, postfix) {
            Some(root) => root,
            None => continue,
        };
        root.parse::<ChunkKey>()
            .chain_err(|| format!("unexpected hierarchy block name '{}'", object_key))?;
        let data = endpoint.get(&object_key)?;
        let block: BTreeMap<String, u64> = serde_json::from_slice(&data)
            .chain_err(|| format!("could not parse hierarchy block '{}'", object_key))?;
        for (key, count) in block {
            entries.insert(key.parse::<ChunkKey>()?, count);
        }
    }
    Ok(entries)
}

/// A block file name is "<d>-<x>-<y>-<z><postfix>". Returns the key part
/// when the name matches the wanted postfix exactly.
fn strip_postfix<'a>(name: &'a str, postfix: &str) -> Option<&'a str> {
    if postfix.is_empty() {
        if name.split('-').count() == 4 {
            Some(name)
        } else {
            None
        }
    } else {
        let key = name.strip_suffix(postfix)?;
        if key.split('-').count() == 4 {
            Some(key)
        } else {
            None
        }
    }
}
