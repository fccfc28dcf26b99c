//! Stitches N completed subset builds into one logical tree.

use crate::errors::*;
use crate::manifest::{Manifest, SourceSummary};
use crate::octree::{hierarchy, ChunkKey};
use crate::read_write::chunk_store::DATA_PREFIX;
use crate::read_write::endpoint::retry_io;
use crate::read_write::Endpoint;
use log::info;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const MERGER_PREFIX: &str = "ept-merger";

struct Shard {
    endpoint: Arc<dyn Endpoint>,
    manifest: Manifest,
    id: u64,
}

/// Merges subset outputs: concatenates their hierarchies, renames chunk
/// keys into the merged namespace and writes a unified manifest. The
/// merge is idempotent; completed shards leave a marker and re-runs
/// skip their copies.
pub struct Merger {
    destination: Arc<dyn Endpoint>,
    sources: Vec<Arc<dyn Endpoint>>,
}

#[derive(Debug, Clone)]
pub struct MergeSummary {
    pub shards: u64,
    pub points: u64,
    pub chunks: usize,
}

impl Merger {
    pub fn new(destination: Arc<dyn Endpoint>, sources: Vec<Arc<dyn Endpoint>>) -> Self {
        Merger {
            destination,
            sources,
        }
    }

    pub fn run(&self) -> Result<MergeSummary> {
        let shards = self.discover_shards()?;
        let of = shards[0].manifest.subset.map(|s| s.of).unwrap_or(0);

        // Hierarchies of every shard merge first; a key claimed twice is
        // a hard error before any chunk moves.
        let mut merged: BTreeMap<ChunkKey, u64> = BTreeMap::new();
        let mut per_shard: Vec<BTreeMap<ChunkKey, u64>> = Vec::with_capacity(shards.len());
        for shard in &shards {
            let entries =
                hierarchy::read_blocks(shard.endpoint.as_ref(), &format!("-{}", shard.id))?;
            for (key, count) in &entries {
                if merged.insert(*key, *count).is_some() {
                    bail!(ErrorKind::MergeCollision(key.to_string()));
                }
            }
            per_shard.push(entries);
        }

        for (shard, entries) in shards.iter().zip(&per_shard) {
            let marker = format!("{}/{}.json", MERGER_PREFIX, shard.id);
            if self.destination.exists(&marker)? {
                info!("shard {} already merged, skipping", shard.id);
                continue;
            }
            self.copy_shard_chunks(shard, entries)?;
            let note = serde_json::json!({ "id": shard.id, "merged": true });
            self.destination.put(&marker, &serde_json::to_vec(&note)?)?;
        }

        let manifest = self.assemble_manifest(&shards, &merged)?;
        hierarchy::write_blocks(
            self.destination.as_ref(),
            &merged,
            manifest.hierarchy_step,
            "",
        )?;
        self.merge_sources(&shards)?;
        manifest.write(self.destination.as_ref(), "")?;
        info!(
            "merged {} shards: {} points in {} chunks",
            shards.len(),
            manifest.points,
            merged.len()
        );
        Ok(MergeSummary {
            shards: of,
            points: manifest.points,
            chunks: merged.len(),
        })
    }

    /// Finds every subset manifest reachable through the source
    /// endpoints and checks the set is complete and consistent.
    fn discover_shards(&self) -> Result<Vec<Shard>> {
        let mut shards: BTreeMap<u64, Shard> = BTreeMap::new();
        for endpoint in &self.sources {
            for key in endpoint.list("")? {
                let id = match shard_id_of_manifest(&key) {
                    Some(id) => id,
                    None => continue,
                };
                let manifest = Manifest::read(endpoint.as_ref(), &format!("-{}", id))?
                    .ok_or_else(|| ErrorKind::InvalidInput(format!("cannot read {}", key)))?;
                shards.entry(id).or_insert(Shard {
                    endpoint: Arc::clone(endpoint),
                    manifest,
                    id,
                });
            }
        }
        if shards.is_empty() {
            bail!(ErrorKind::InvalidInput(
                "no subset manifests found on the source endpoints".into()
            ));
        }

        let shards: Vec<Shard> = shards.into_iter().map(|(_, shard)| shard).collect();
        let first = &shards[0].manifest;
        let of = match first.subset {
            Some(subset) => subset.of,
            None => bail!(ErrorKind::InvalidInput(
                "found a non-subset manifest among the merge inputs".into()
            )),
        };
        if shards.len() as u64 != of {
            bail!(ErrorKind::InvalidInput(format!(
                "expected {} subsets, found {}",
                of,
                shards.len()
            )));
        }
        for shard in &shards {
            let manifest = &shard.manifest;
            match manifest.subset {
                Some(subset) if subset.of == of && subset.id == shard.id => {}
                _ => bail!(ErrorKind::InvalidInput(format!(
                    "subset descriptor of shard {} is inconsistent",
                    shard.id
                ))),
            }
            if manifest.bounds != first.bounds
                || manifest.span != first.span
                || manifest.data_type != first.data_type
                || manifest.hierarchy_step != first.hierarchy_step
                || manifest.schema != first.schema
            {
                bail!(ErrorKind::InvalidInput(format!(
                    "shard {} was built with different parameters",
                    shard.id
                )));
            }
            for source in &manifest.sources {
                if source.status == crate::read_write::source::SourceStatus::Ingesting {
                    bail!(ErrorKind::InvalidInput(format!(
                        "shard {} is not a completed build",
                        shard.id
                    )));
                }
            }
        }
        Ok(shards)
    }

    fn copy_shard_chunks(&self, shard: &Shard, entries: &BTreeMap<ChunkKey, u64>) -> Result<()> {
        let extension = shard.manifest.data_type.extension();
        let same_endpoint = Arc::ptr_eq(&shard.endpoint, &self.destination);
        for key in entries.keys() {
            let src = format!("{}/{}-{}.{}", DATA_PREFIX, key, shard.id, extension);
            let dst = format!("{}/{}.{}", DATA_PREFIX, key, extension);
            if same_endpoint {
                retry_io(|| shard.endpoint.copy(&src, &dst))?;
            } else {
                let data = retry_io(|| shard.endpoint.get(&src))?;
                retry_io(|| self.destination.put(&dst, &data))?;
            }
        }
        Ok(())
    }

    fn assemble_manifest(
        &self,
        shards: &[Shard],
        merged: &BTreeMap<ChunkKey, u64>,
    ) -> Result<Manifest> {
        let mut manifest = shards[0].manifest.clone();
        manifest.subset = None;
        manifest.points = merged.values().sum();
        manifest.counters = Default::default();
        manifest.sources = Vec::new();
        let mut conforming = crate::math::Bounds::from_array(&manifest.bounds_conforming);
        for shard in shards {
            manifest.counters.accumulate(&shard.manifest.counters);
            conforming =
                conforming.union(&crate::math::Bounds::from_array(&shard.manifest.bounds_conforming));
            for source in &shard.manifest.sources {
                if !manifest.sources.iter().any(|s: &SourceSummary| s.path == source.path) {
                    manifest.sources.push(source.clone());
                }
            }
        }
        // Cross-shard skips cancel out once every shard is present.
        manifest.counters.out_of_subset = 0;
        manifest.bounds_conforming = conforming.to_array();
        Ok(manifest)
    }

    fn merge_sources(&self, shards: &[Shard]) -> Result<()> {
        let mut all = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for shard in shards {
            let sources = crate::read_write::source::read_sources(
                shard.endpoint.as_ref(),
                &format!("-{}", shard.id),
            )?;
            for source in sources {
                if seen.insert(source.path.clone()) {
                    all.push(source);
                }
            }
        }
        crate::read_write::source::write_sources(self.destination.as_ref(), &all, "")
    }
}

/// "ept-<id>.json" at the endpoint root names a subset manifest.
fn shard_id_of_manifest(key: &str) -> Option<u64> {
    if key.contains('/') {
        return None;
    }
    key.strip_prefix("ept-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_names_are_recognized() {
        assert_eq!(shard_id_of_manifest("ept-1.json"), Some(1));
        assert_eq!(shard_id_of_manifest("ept-12.json"), Some(12));
        assert_eq!(shard_id_of_manifest("ept.json"), None);
        assert_eq!(shard_id_of_manifest("ept-hierarchy/0-0-0-0.json"), None);
        assert_eq!(shard_id_of_manifest("ept-merger/1.json"), None);
    }
}
