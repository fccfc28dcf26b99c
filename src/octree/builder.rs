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

use crate::config::BuildOptions;
use crate::errors::*;
use crate::manifest::{CounterSnapshot, Manifest, Schema, SourceSummary, Srs, MANIFEST_VERSION};
use crate::math::Bounds;
use crate::octree::clipper::Clipper;
use crate::octree::{hierarchy, Hierarchy, PointKey, Subset};
use crate::read_write::source::{
    read_sources, write_sources, Source, SourceReader, SourceStatus, SourceStream,
};
use crate::read_write::{ChunkCache, ChunkStore, Endpoint};
use crate::{Point, NUM_POINTS_PER_BATCH};
use log::{info, warn};
use nalgebra::Vector3;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Derived bounds get a little slack so numeric noise at the hull never
/// lands points on the root faces.
const BOUNDS_GROWTH: f64 = 1.01;
const DEFAULT_SCALE: f64 = 0.01;

/// Per-point anomaly counters. Warnings, surfaced in the manifest.
#[derive(Debug, Default)]
pub struct Counters {
    pub out_of_bounds: AtomicU64,
    pub invalid: AtomicU64,
    pub duplicate_points: AtomicU64,
    pub out_of_subset: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            out_of_bounds: self.out_of_bounds.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            duplicate_points: self.duplicate_points.load(Ordering::Relaxed),
            out_of_subset: self.out_of_subset.load(Ordering::Relaxed),
        }
    }

    fn restore(&self, snapshot: &CounterSnapshot) {
        self.out_of_bounds.store(snapshot.out_of_bounds, Ordering::Relaxed);
        self.invalid.store(snapshot.invalid, Ordering::Relaxed);
        self.duplicate_points
            .store(snapshot.duplicate_points, Ordering::Relaxed);
        self.out_of_subset
            .store(snapshot.out_of_subset, Ordering::Relaxed);
    }
}

/// All build-wide state, shared by reference with every worker. There
/// are no process-wide singletons; two builds can run side by side.
pub struct BuildContext {
    pub options: BuildOptions,
    pub bounds: Bounds,
    pub bounds_conforming: Bounds,
    pub schema: Schema,
    pub cache: ChunkCache,
    pub hierarchy: Arc<Hierarchy>,
    pub counters: Counters,
    pub cancel: AtomicBool,
    pub subset: Option<Subset>,
    start_depth: u32,
}

impl BuildContext {
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    fn insert_batch(&self, points: &[Point], clipper: &mut Clipper) -> Result<()> {
        for point in points {
            self.insert_point(point, clipper)?;
        }
        Ok(())
    }

    fn insert_point(&self, point: &Point, clipper: &mut Clipper) -> Result<()> {
        if !point.is_finite() {
            self.counters.invalid.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        if !self.bounds.contains(&point.position) {
            self.counters.out_of_bounds.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }
        let mut point_key = PointKey::new(self.bounds);
        for _ in 0..self.start_depth {
            point_key.step(&point.position);
        }
        if let Some(subset) = &self.subset {
            if !subset.owns(&point_key.key()) {
                // Sibling shards own these; not an anomaly of the input.
                self.counters.out_of_subset.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        }
        self.descend_insert(point, point_key, clipper)
    }

    /// Walks 'point' down the tree until a cell takes it. Base cells
    /// shed their overflow region one level deeper in bulk before the
    /// point itself continues its descent.
    fn descend_insert(&self, point: &Point, mut point_key: PointKey, clipper: &mut Clipper) -> Result<()> {
        loop {
            let key = point_key.key();
            let slot = clipper.acquire(key)?;
            let mut cell = slot.lock();

            if key.depth() >= self.options.max_depth {
                // Degenerate data (e.g. massive duplicate runs) stops
                // here; whatever the deepest cell cannot take is counted
                // instead of descending forever.
                if !cell.try_insert(point) {
                    self.counters.duplicate_points.fetch_add(1, Ordering::Relaxed);
                }
                return Ok(());
            }

            if cell.try_insert(point) {
                return Ok(());
            }

            if cell.is_base() && !cell.is_split() {
                let spilled = cell.swap_out_overflow();
                drop(cell);
                for spilled_point in &spilled {
                    let mut child_key = point_key.clone();
                    child_key.step(&spilled_point.position);
                    self.descend_insert(spilled_point, child_key, clipper)?;
                }
            } else {
                drop(cell);
            }
            point_key.step(&point.position);
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildSummary {
    pub points: u64,
    pub chunks: usize,
    pub counters: CounterSnapshot,
    pub sources: Vec<SourceSummary>,
}

/// Drives point ingestion: analyzes sources, runs the worker pool over
/// each one, checkpoints after every source and writes the manifest
/// last.
pub struct Builder {
    ctx: Arc<BuildContext>,
    endpoint: Arc<dyn Endpoint>,
    reader: Arc<dyn SourceReader>,
    sources: Vec<Source>,
    postfix: String,
}

impl Builder {
    pub fn new(
        options: BuildOptions,
        endpoint: Arc<dyn Endpoint>,
        reader: Arc<dyn SourceReader>,
    ) -> Result<Builder> {
        options.validate()?;
        let postfix = options
            .subset
            .map(|s| format!("-{}", s.id))
            .unwrap_or_default();

        let existing = if options.reset_files {
            None
        } else {
            Manifest::read(endpoint.as_ref(), &postfix)?
        };

        let sources = Builder::analyze_sources(&options, endpoint.as_ref(), reader.as_ref(), &postfix, existing.is_some())?;

        let (bounds, bounds_conforming, schema) = match &existing {
            Some(manifest) => {
                // The tree on disk dictates the geometry; anything the
                // options pin explicitly must agree with it.
                manifest
                    .check_compatible(&Builder::requested_manifest(&options, manifest))
                    .map_err(|e| match e {
                        Error(ErrorKind::InvalidInput(msg), _) => {
                            Error::from(ErrorKind::InvalidInput(format!(
                                "{}; pass resetFiles to start over",
                                msg
                            )))
                        }
                        other => other,
                    })?;
                let schema = manifest.schema()?;
                let mut conforming = Bounds::from_array(&manifest.bounds_conforming);
                for source in &sources {
                    if let Some(source_bounds) = source.info.bounds() {
                        conforming = conforming.union(&source_bounds);
                    }
                }
                (manifest.root_bounds(), conforming, schema)
            }
            None => Builder::derive_geometry(&options, &sources)?,
        };

        let subset = match options.subset {
            Some(id) => Some(Subset::new(id, &bounds)?),
            None => None,
        };
        let start_depth = subset.as_ref().map_or(0, Subset::minimum_null_depth);
        if start_depth >= options.max_depth {
            bail!(ErrorKind::InvalidInput(format!(
                "subset depth {} does not fit under maxDepth {}",
                start_depth, options.max_depth
            )));
        }

        let hierarchy = Arc::new(Hierarchy::new());
        if existing.is_some() {
            hierarchy.extend(&hierarchy::read_blocks(endpoint.as_ref(), &postfix)?);
        }

        let store = ChunkStore::new(
            Arc::clone(&endpoint),
            schema.clone(),
            options.data_type,
            postfix.clone(),
        );
        let cache = ChunkCache::new(
            store,
            Arc::clone(&hierarchy),
            options.chunk_capacity(),
            options.base_depth,
            options.cached_chunks,
        );

        let counters = Counters::default();
        if let Some(manifest) = &existing {
            counters.restore(&manifest.counters);
        }

        let ctx = BuildContext {
            options,
            bounds,
            bounds_conforming,
            schema,
            cache,
            hierarchy,
            counters,
            cancel: AtomicBool::new(false),
            subset,
            start_depth,
        };
        Ok(Builder {
            ctx: Arc::new(ctx),
            endpoint,
            reader,
            sources,
            postfix,
        })
    }

    pub fn context(&self) -> &Arc<BuildContext> {
        &self.ctx
    }

    /// The manifest this configuration asks for, taking the recorded
    /// manifest's values wherever the options leave the choice open.
    /// Compared against the recorded manifest before a resume.
    fn requested_manifest(options: &BuildOptions, recorded: &Manifest) -> Manifest {
        let mut requested = recorded.clone();
        requested.span = options.span;
        requested.chunk_capacity = options.chunk_capacity();
        requested.hierarchy_step = options.hierarchy_step;
        requested.max_depth = options.max_depth;
        requested.base_depth = options.base_depth;
        requested.data_type = options.data_type;
        requested.subset = options.subset;
        if let Some(bounds) = options.bounds {
            requested.bounds = bounds;
        }
        for dimension in &mut requested.schema {
            let axis = match dimension.name.as_str() {
                "x" => 0,
                "y" => 1,
                "z" => 2,
                _ => continue,
            };
            if let Some(scale) = options.scale {
                dimension.scale = Some(scale[axis]);
            }
            if let Some(offset) = options.offset {
                dimension.offset = Some(offset[axis]);
            }
        }
        requested
    }

    /// Pre-analysis: resolve every input through the reader, reusing
    /// recorded state when resuming.
    fn analyze_sources(
        options: &BuildOptions,
        endpoint: &dyn Endpoint,
        reader: &dyn SourceReader,
        postfix: &str,
        resuming: bool,
    ) -> Result<Vec<Source>> {
        let mut sources = if resuming {
            read_sources(endpoint, postfix)?
        } else {
            Vec::new()
        };
        for source in &sources {
            if source.status == SourceStatus::Ingesting {
                bail!(ErrorKind::InvalidInput(format!(
                    "source '{}' was interrupted mid-ingest; its partial points cannot be \
                     separated from the chunks. Re-run with resetFiles on a clean prefix.",
                    source.path
                )));
            }
        }
        for path in &options.input {
            if sources.iter().any(|s| &s.path == path) {
                continue;
            }
            let source = match reader.info(path) {
                Ok(info) => Source::new(path.clone(), info),
                Err(e) => {
                    warn!("could not analyze '{}': {}", path, e);
                    let mut source = Source::new(path.clone(), Default::default());
                    source.info.errors.push(e.to_string());
                    source.status = SourceStatus::Errored;
                    source
                }
            };
            sources.push(source);
        }
        Ok(sources)
    }

    fn derive_geometry(
        options: &BuildOptions,
        sources: &[Source],
    ) -> Result<(Bounds, Bounds, Schema)> {
        let mut conforming = Bounds::empty();
        let mut intensity = false;
        let mut color = false;
        let mut classification = false;
        let mut gps_time = false;
        for source in sources {
            if let Some(bounds) = source.info.bounds() {
                conforming = conforming.union(&bounds);
            }
            for dimension in &source.info.dimensions {
                match dimension.as_str() {
                    "intensity" => intensity = true,
                    "red" | "green" | "blue" => color = true,
                    "classification" => classification = true,
                    "gpsTime" => gps_time = true,
                    _ => {}
                }
            }
        }

        let bounds = match options.bounds {
            Some(array) => Bounds::from_array(&array),
            None => {
                if conforming.is_empty() {
                    bail!(ErrorKind::InvalidInput(
                        "no readable source declares bounds and none were configured".into()
                    ));
                }
                conforming.grow_by(BOUNDS_GROWTH).cubeify()
            }
        };
        if conforming.is_empty() {
            conforming = bounds;
        }

        let scale = options
            .scale
            .map(|s| Vector3::new(s[0], s[1], s[2]))
            .or_else(|| Some(Vector3::new(DEFAULT_SCALE, DEFAULT_SCALE, DEFAULT_SCALE)));
        let offset = match options.offset {
            Some(o) => Vector3::new(o[0], o[1], o[2]),
            None => {
                let center = bounds.center();
                Vector3::new(center.x.floor(), center.y.floor(), center.z.floor())
            }
        };
        let schema = Schema {
            scale,
            offset,
            intensity,
            color,
            classification,
            gps_time,
        };
        Ok((bounds, conforming, schema))
    }

    /// Runs the whole build. On cancellation everything ingested so far
    /// is written through before `Cancelled` is returned.
    pub fn run(mut self) -> Result<BuildSummary> {
        let total = self.sources.len();
        for index in 0..total {
            if self.ctx.cancel.load(Ordering::Relaxed) {
                self.checkpoint()?;
                bail!(ErrorKind::Cancelled);
            }
            let (path, skip) = {
                let source = &self.sources[index];
                let skip = match source.status {
                    SourceStatus::Inserted => true,
                    SourceStatus::Errored => true,
                    SourceStatus::Pending | SourceStatus::Ingesting => false,
                };
                (source.path.clone(), skip)
            };
            if skip {
                continue;
            }

            info!("ingesting source {}/{}: {}", index + 1, total, path);
            self.sources[index].status = SourceStatus::Ingesting;
            write_sources(self.endpoint.as_ref(), &self.sources, &self.postfix)?;

            match self.reader.open(&path) {
                Ok(stream) => {
                    let errors = self.ingest_source(stream)?;
                    let source = &mut self.sources[index];
                    if errors.is_empty() {
                        source.status = SourceStatus::Inserted;
                    } else {
                        warn!("source '{}' failed: {}", path, errors.join("; "));
                        source.info.errors.extend(errors);
                        source.status = SourceStatus::Errored;
                    }
                }
                Err(e) => {
                    warn!("could not open '{}': {}", path, e);
                    let source = &mut self.sources[index];
                    source.info.errors.push(e.to_string());
                    source.status = SourceStatus::Errored;
                }
            }
            self.checkpoint()?;

            if self.ctx.cancel.load(Ordering::Relaxed) {
                bail!(ErrorKind::Cancelled);
            }
        }
        self.finalize()
    }

    /// Fans one source out over the worker pool. Source-level decode
    /// problems are collected and isolated; cache and endpoint failures
    /// abort the build.
    fn ingest_source(&self, stream: Box<dyn SourceStream>) -> Result<Vec<String>> {
        let ctx = &self.ctx;
        let stream = Mutex::new(stream);
        let source_errors: Mutex<Vec<String>> = Mutex::new(Vec::new());
        let fatal = AtomicBool::new(false);

        let worker = || -> Result<()> {
            let mut clipper = Clipper::new(&ctx.cache);
            loop {
                if ctx.cancel.load(Ordering::Relaxed) || fatal.load(Ordering::Relaxed) {
                    return Ok(());
                }
                if !source_errors.lock().unwrap().is_empty() {
                    return Ok(());
                }
                let batch = {
                    let mut stream = stream.lock().unwrap();
                    match stream.next_batch(NUM_POINTS_PER_BATCH) {
                        Ok(batch) => batch,
                        Err(e) => {
                            source_errors.lock().unwrap().push(e.to_string());
                            return Ok(());
                        }
                    }
                };
                if batch.is_empty() {
                    return Ok(());
                }
                ctx.insert_batch(&batch, &mut clipper)?;
                clipper.clip();
                ctx.cache.evict_excess()?;
            }
        };

        let joined: std::result::Result<Vec<Result<()>>, _> =
            crossbeam::thread::scope(|scope| {
                let handles: Vec<_> = (0..ctx.options.threads.max(1))
                    .map(|_| {
                        scope.spawn(|_| {
                            let result = worker();
                            if result.is_err() {
                                fatal.store(true, Ordering::Relaxed);
                            }
                            result
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| handle.join().unwrap_or_else(|_| Err("worker thread panicked".into())))
                    .collect()
            });
        let results = joined.map_err(|_| Error::from("worker pool panicked"))?;
        for result in results {
            result?;
        }
        Ok(source_errors.into_inner().unwrap())
    }

    fn assemble_manifest(&self) -> Manifest {
        let ctx = &self.ctx;
        Manifest {
            version: MANIFEST_VERSION.to_string(),
            software: format!("point_tiler {}", env!("CARGO_PKG_VERSION")),
            bounds: ctx.bounds.to_array(),
            bounds_conforming: ctx.bounds_conforming.to_array(),
            points: ctx.hierarchy.total_points(),
            span: ctx.options.span,
            chunk_capacity: ctx.options.chunk_capacity(),
            hierarchy_step: ctx.options.hierarchy_step,
            max_depth: ctx.options.max_depth,
            base_depth: ctx.options.base_depth,
            data_type: ctx.options.data_type,
            schema: ctx.schema.to_dimensions(),
            srs: self.derive_srs(),
            subset: ctx.options.subset,
            counters: ctx.counters.snapshot(),
            sources: self.sources.iter().map(SourceSummary::from_source).collect(),
        }
    }

    fn derive_srs(&self) -> Option<Srs> {
        if let Some(reprojection) = &self.ctx.options.reprojection {
            return Some(Srs {
                authority: None,
                horizontal: Some(reprojection.out_srs.clone()),
                vertical: None,
                wkt: None,
            });
        }
        self.sources
            .iter()
            .find_map(|s| s.info.srs.clone())
            .map(|wkt| Srs {
                authority: None,
                horizontal: None,
                vertical: None,
                wkt: Some(wkt),
            })
    }

    /// Persists everything ingested so far while keeping the cache warm.
    fn checkpoint(&self) -> Result<()> {
        self.ctx.cache.write_dirty()?;
        hierarchy::write_blocks(
            self.endpoint.as_ref(),
            &self.ctx.hierarchy.snapshot(),
            self.ctx.options.hierarchy_step,
            &self.postfix,
        )?;
        write_sources(self.endpoint.as_ref(), &self.sources, &self.postfix)?;
        self.assemble_manifest().write(self.endpoint.as_ref(), &self.postfix)
    }

    fn finalize(self) -> Result<BuildSummary> {
        self.ctx.cache.flush()?;
        let entries = self.ctx.hierarchy.snapshot();
        hierarchy::write_blocks(
            self.endpoint.as_ref(),
            &entries,
            self.ctx.options.hierarchy_step,
            &self.postfix,
        )?;
        write_sources(self.endpoint.as_ref(), &self.sources, &self.postfix)?;
        let manifest = self.assemble_manifest();
        manifest.write(self.endpoint.as_ref(), &self.postfix)?;
        info!(
            "build finished: {} points in {} chunks",
            manifest.points,
            entries.len()
        );
        Ok(BuildSummary {
            points: manifest.points,
            chunks: entries.len(),
            counters: manifest.counters,
            sources: manifest.sources,
        })
    }
}

/// Walks the persisted hierarchy and checks that every recorded chunk
/// exists with exactly the recorded point count. Used by tests and the
/// `info` tool.
pub fn verify_hierarchy(
    endpoint: &Arc<dyn Endpoint>,
    manifest: &Manifest,
    postfix: &str,
) -> Result<u64> {
    let schema = manifest.schema()?;
    let store = ChunkStore::new(
        Arc::clone(endpoint),
        schema,
        manifest.data_type,
        postfix.to_string(),
    );
    let entries = hierarchy::read_blocks(endpoint.as_ref(), postfix)?;
    let mut total = 0;
    for (key, count) in &entries {
        let (points, _) = store
            .read(key)?
            .ok_or_else(|| ErrorKind::ChunkCorrupt(key.to_string(), "chunk missing".into()))?;
        if points.len() as u64 != *count {
            bail!(ErrorKind::ChunkCorrupt(
                key.to_string(),
                format!("hierarchy says {} points, chunk has {}", count, points.len()),
            ));
        }
        total += count;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_write::source::SourceInfo;

    fn options() -> BuildOptions {
        BuildOptions {
            output: "out".into(),
            input: vec!["a".into()],
            ..Default::default()
        }
    }

    fn source_with_bounds(bounds: [f64; 6]) -> Source {
        let mut source = Source::new(
            "a".into(),
            SourceInfo {
                bounds: Some(bounds),
                points: 5,
                ..Default::default()
            },
        );
        source.info.dimensions =
            vec!["x".into(), "y".into(), "z".into(), "intensity".into()];
        source
    }

    #[test]
    fn geometry_derives_grown_cubic_bounds() {
        let source = source_with_bounds([0., 0., 0., 10., 20., 40.]);
        let (bounds, conforming, schema) =
            Builder::derive_geometry(&options(), &[source]).unwrap();

        assert_eq!(conforming.to_array(), [0., 0., 0., 10., 20., 40.]);
        let extents = bounds.extents();
        assert_eq!(extents.x, extents.y);
        assert_eq!(extents.y, extents.z);
        assert!(extents.x >= 40.);
        assert_eq!(bounds.center(), conforming.center());

        assert!(schema.intensity);
        assert!(!schema.color);
        assert_eq!(
            schema.scale,
            Some(Vector3::new(DEFAULT_SCALE, DEFAULT_SCALE, DEFAULT_SCALE))
        );
    }

    #[test]
    fn explicit_bounds_win_over_derived_ones() {
        let source = source_with_bounds([0., 0., 0., 4., 4., 4.]);
        let with_bounds = BuildOptions {
            bounds: Some([-8., -8., -8., 8., 8., 8.]),
            offset: Some([1., 2., 3.]),
            ..options()
        };
        let (bounds, _, schema) =
            Builder::derive_geometry(&with_bounds, &[source]).unwrap();
        assert_eq!(bounds.to_array(), [-8., -8., -8., 8., 8., 8.]);
        assert_eq!(schema.offset, Vector3::new(1., 2., 3.));
    }

    #[test]
    fn geometry_needs_bounds_from_somewhere() {
        let mut source = source_with_bounds([0.; 6]);
        source.info.bounds = None;
        assert!(Builder::derive_geometry(&options(), &[source]).is_err());
    }
}
