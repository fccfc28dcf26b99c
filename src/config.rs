//! The build configuration surface recognized by the core.

use crate::errors::*;

/// On-disk encoding of chunk payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// Compressed LAS, produced by the external writer stack.
    Laz,
    /// Raw packed tuples in an EWCK container.
    Binary,
    /// Zstandard-compressed packed tuples in an EWCK container.
    Zstandard,
}

impl Default for DataType {
    fn default() -> Self {
        DataType::Binary
    }
}

impl DataType {
    pub fn extension(self) -> &'static str {
        match self {
            DataType::Laz => "laz",
            DataType::Binary => "bin",
            DataType::Zstandard => "zst",
        }
    }
}

/// One spatial shard of a larger build: shard `id` out of `of`, with
/// `of` a power of four.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubsetId {
    pub id: u64,
    pub of: u64,
}

/// Coordinate reprojection request, applied by the external reader
/// stack and recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reprojection {
    #[serde(rename = "in", skip_serializing_if = "Option::is_none")]
    pub in_srs: Option<String>,
    #[serde(rename = "out")]
    pub out_srs: String,
    #[serde(default)]
    pub hammer: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuildOptions {
    /// Output prefix on the endpoint. Required.
    pub output: String,
    /// Source paths to ingest. Required.
    pub input: Vec<String>,
    pub threads: usize,
    /// Cube side length in addressable units. Power of two.
    pub span: u64,
    /// Maximum points per chunk. Derived from 'span' when absent.
    pub chunk_capacity: Option<usize>,
    pub hierarchy_step: u32,
    pub data_type: DataType,
    pub scale: Option<[f64; 3]>,
    pub offset: Option<[f64; 3]>,
    pub reprojection: Option<Reprojection>,
    pub subset: Option<SubsetId>,
    pub max_depth: u32,
    /// Ignore recorded per-source progress and ingest everything again.
    pub reset_files: bool,
    /// Explicit cubic root bounds; derived from source stats when absent.
    pub bounds: Option<[f64; 6]>,
    /// Levels of the tree that use base cells with an overflow region.
    pub base_depth: u32,
    /// Soft cap on resident cells before eviction kicks in.
    pub cached_chunks: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        BuildOptions {
            output: String::new(),
            input: Vec::new(),
            threads: num_cpus::get(),
            span: 256,
            chunk_capacity: None,
            hierarchy_step: 6,
            data_type: DataType::default(),
            scale: None,
            offset: None,
            reprojection: None,
            subset: None,
            max_depth: 26,
            reset_files: false,
            bounds: None,
            base_depth: 4,
            cached_chunks: 512,
        }
    }
}

impl BuildOptions {
    pub fn chunk_capacity(&self) -> usize {
        self.chunk_capacity
            .unwrap_or_else(|| ((self.span * self.span * self.span) / 64).max(1) as usize)
    }

    pub fn validate(&self) -> Result<()> {
        if self.output.is_empty() {
            bail!(ErrorKind::InvalidInput("no output prefix given".into()));
        }
        if self.input.is_empty() {
            bail!(ErrorKind::InvalidInput("no input sources given".into()));
        }
        if !self.span.is_power_of_two() {
            bail!(ErrorKind::InvalidInput(format!(
                "span must be a power of two, got {}",
                self.span
            )));
        }
        if self.chunk_capacity() == 0 {
            bail!(ErrorKind::InvalidInput("chunk capacity must not be zero".into()));
        }
        if self.threads == 0 {
            bail!(ErrorKind::InvalidInput("thread count must not be zero".into()));
        }
        if self.max_depth == 0 {
            bail!(ErrorKind::InvalidInput("max depth must not be zero".into()));
        }
        if self.data_type == DataType::Laz {
            bail!(ErrorKind::InvalidInput(
                "laz chunks require the external writer stack; use binary or zstandard".into()
            ));
        }
        if let Some(SubsetId { id, of }) = self.subset {
            let power_of_four = of.is_power_of_two() && of.trailing_zeros() % 2 == 0;
            if !power_of_four {
                bail!(ErrorKind::InvalidInput(format!(
                    "subset 'of' must be a power of four, got {}",
                    of
                )));
            }
            if id == 0 || id > of {
                bail!(ErrorKind::InvalidInput(format!(
                    "subset id must be in 1..={}, got {}",
                    of, id
                )));
            }
        }
        Ok(())
    }
}
