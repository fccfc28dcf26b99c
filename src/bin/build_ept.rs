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

use error_chain::bail;
use point_tiler::config::{BuildOptions, DataType, SubsetId};
use point_tiler::errors::*;
use point_tiler::manifest::Manifest;
use point_tiler::octree::{hierarchy, Builder, Merger};
use point_tiler::read_write::{ChunkStore, Endpoint, LocalEndpoint, PtsReader};
use std::sync::Arc;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "build_ept", about = "Octree indexing for large point clouds.")]
enum Command {
    /// Ingest point sources into an octree under the output prefix.
    Build {
        /// Output directory to write the octree into.
        #[structopt(long)]
        output: String,
        /// Source files to ingest (pts).
        #[structopt(required = true)]
        input: Vec<String>,
        #[structopt(long, default_value = "256")]
        span: u64,
        #[structopt(long)]
        chunk_capacity: Option<usize>,
        #[structopt(long, default_value = "6")]
        hierarchy_step: u32,
        #[structopt(long)]
        threads: Option<usize>,
        /// Chunk encoding: binary or zstandard.
        #[structopt(long, default_value = "binary")]
        data_type: String,
        /// Shard id for a subset build; requires --subset-of.
        #[structopt(long)]
        subset_id: Option<u64>,
        /// Total number of shards (a power of four).
        #[structopt(long)]
        subset_of: Option<u64>,
        #[structopt(long, default_value = "26")]
        max_depth: u32,
        /// Ignore recorded per-source progress and ingest everything.
        #[structopt(long)]
        reset_files: bool,
    },
    /// Stitch completed subset builds into one tree.
    Merge {
        /// Destination directory for the merged tree.
        #[structopt(long)]
        output: String,
        /// Directories holding the subset builds.
        #[structopt(required = true)]
        input: Vec<String>,
    },
    /// Print a summary of a built tree, optionally verifying chunks.
    Info {
        directory: String,
        #[structopt(long)]
        verify: bool,
    },
}

fn parse_data_type(name: &str) -> Result<DataType> {
    match name {
        "laz" => Ok(DataType::Laz),
        "binary" => Ok(DataType::Binary),
        "zstandard" => Ok(DataType::Zstandard),
        other => Err(ErrorKind::InvalidInput(format!("unknown data type '{}'", other)).into()),
    }
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Build {
            output,
            input,
            span,
            chunk_capacity,
            hierarchy_step,
            threads,
            data_type,
            subset_id,
            subset_of,
            max_depth,
            reset_files,
        } => {
            let subset = match (subset_id, subset_of) {
                (Some(id), Some(of)) => Some(SubsetId { id, of }),
                (None, None) => None,
                _ => bail!(ErrorKind::InvalidInput(
                    "--subset-id and --subset-of go together".into()
                )),
            };
            let options = BuildOptions {
                output: output.clone(),
                input,
                span,
                chunk_capacity,
                hierarchy_step,
                threads: threads.unwrap_or_else(num_cpus::get),
                data_type: parse_data_type(&data_type)?,
                subset,
                max_depth,
                reset_files,
                ..Default::default()
            };
            let endpoint: Arc<dyn Endpoint> = Arc::new(LocalEndpoint::new(output.as_str())?);
            let builder = Builder::new(options, endpoint, Arc::new(PtsReader))?;
            let summary = builder.run()?;
            println!(
                "Build complete: {} points in {} chunks.",
                summary.points, summary.chunks
            );
            let counters = summary.counters;
            if counters.out_of_bounds + counters.invalid + counters.duplicate_points > 0 {
                println!(
                    "Skipped points: {} out of bounds, {} invalid, {} duplicates.",
                    counters.out_of_bounds, counters.invalid, counters.duplicate_points
                );
            }
        }
        Command::Merge { output, input } => {
            let destination: Arc<dyn Endpoint> = Arc::new(LocalEndpoint::new(output.as_str())?);
            let sources = input
                .iter()
                .map(|dir| {
                    LocalEndpoint::new(dir.as_str()).map(|e| Arc::new(e) as Arc<dyn Endpoint>)
                })
                .collect::<Result<Vec<_>>>()?;
            let summary = Merger::new(destination, sources).run()?;
            println!(
                "Merged {} shards: {} points in {} chunks.",
                summary.shards, summary.points, summary.chunks
            );
        }
        Command::Info { directory, verify } => {
            let endpoint: Arc<dyn Endpoint> = Arc::new(LocalEndpoint::new(directory.as_str())?);
            let manifest = Manifest::read(endpoint.as_ref(), "")?.ok_or_else(|| {
                ErrorKind::InvalidInput(format!("no manifest under '{}'", directory))
            })?;
            println!("{} ({})", Manifest::path(""), manifest.software);
            println!("  points:  {}", manifest.points);
            println!("  bounds:  {:?}", manifest.bounds);
            println!("  span:    {}", manifest.span);
            println!("  schema:  {} dimensions", manifest.schema.len());
            println!("  sources: {}", manifest.sources.len());
            if verify {
                verify_chunks(&endpoint, &manifest)?;
            }
        }
    }
    Ok(())
}

/// Walks every hierarchy entry and re-reads its chunk, checking the
/// recorded point counts.
fn verify_chunks(endpoint: &Arc<dyn Endpoint>, manifest: &Manifest) -> Result<()> {
    let entries = hierarchy::read_blocks(endpoint.as_ref(), "")?;
    let store = ChunkStore::new(
        Arc::clone(endpoint),
        manifest.schema()?,
        manifest.data_type,
        String::new(),
    );
    let mut progress = pbr::ProgressBar::new(entries.len() as u64);
    progress.message("Verifying chunks: ");
    let mut total: u64 = 0;
    for (key, count) in &entries {
        let (points, _) = store.read(key)?.ok_or_else(|| {
            Error::from(ErrorKind::ChunkCorrupt(key.to_string(), "chunk missing".into()))
        })?;
        if points.len() as u64 != *count {
            bail!(ErrorKind::ChunkCorrupt(
                key.to_string(),
                format!("hierarchy says {}, chunk has {}", count, points.len()),
            ));
        }
        total += count;
        progress.inc();
    }
    progress.finish();
    println!("{} chunks verified, {} points.", entries.len(), total);
    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(e) = run(Command::from_args()) {
        eprintln!("Error: {}", e);
        for cause in e.iter().skip(1) {
            eprintln!("  caused by: {}", cause);
        }
        std::process::exit(1);
    }
}
