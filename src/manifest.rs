//! The top-level `ept.json` document: the single source of truth a
//! reader needs to traverse a built tree. Written last.

use crate::config::{DataType, SubsetId};
use crate::errors::*;
use crate::math::Bounds;
use crate::read_write::source::{Source, SourceStatus};
use crate::read_write::Endpoint;
use nalgebra::Vector3;

pub const MANIFEST_VERSION: &str = "1.0.0";

/// The set of dimensions carried by every point of a build, fixed at
/// build time. Coordinates quantize to scaled 32-bit integers when a
/// scale is present.
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    pub scale: Option<Vector3<f64>>,
    pub offset: Vector3<f64>,
    pub intensity: bool,
    pub color: bool,
    pub classification: bool,
    pub gps_time: bool,
}

impl Default for Schema {
    fn default() -> Self {
        Schema {
            scale: None,
            offset: Vector3::new(0., 0., 0.),
            intensity: false,
            color: false,
            classification: false,
            gps_time: false,
        }
    }
}

impl Schema {
    /// Packed byte width of one point record.
    pub fn point_size(&self) -> usize {
        let coords = if self.scale.is_some() { 3 * 4 } else { 3 * 8 };
        coords
            + if self.intensity { 2 } else { 0 }
            + if self.color { 6 } else { 0 }
            + if self.classification { 1 } else { 0 }
            + if self.gps_time { 8 } else { 0 }
    }

    pub fn to_dimensions(&self) -> Vec<Dimension> {
        let mut dimensions = Vec::new();
        let (coord_type, coord_size) = if self.scale.is_some() {
            ("int32", 4)
        } else {
            ("float64", 8)
        };
        for (i, name) in ["x", "y", "z"].iter().enumerate() {
            dimensions.push(Dimension {
                name: (*name).to_string(),
                dimension_type: coord_type.to_string(),
                size: coord_size,
                scale: self.scale.map(|s| s[i]),
                offset: Some(self.offset[i]),
            });
        }
        let mut aux = |present: bool, name: &str, dimension_type: &str, size: u32| {
            if present {
                dimensions.push(Dimension {
                    name: name.to_string(),
                    dimension_type: dimension_type.to_string(),
                    size,
                    scale: None,
                    offset: None,
                });
            }
        };
        aux(self.intensity, "intensity", "uint16", 2);
        aux(self.color, "red", "uint16", 2);
        aux(self.color, "green", "uint16", 2);
        aux(self.color, "blue", "uint16", 2);
        aux(self.classification, "classification", "uint8", 1);
        aux(self.gps_time, "gpsTime", "float64", 8);
        dimensions
    }

    pub fn from_dimensions(dimensions: &[Dimension]) -> Result<Schema> {
        let mut schema = Schema::default();
        let mut scale = [None; 3];
        let mut offset = [0.; 3];
        for dimension in dimensions {
            match dimension.name.as_str() {
                "x" | "y" | "z" => {
                    let axis = match dimension.name.as_str() {
                        "x" => 0,
                        "y" => 1,
                        _ => 2,
                    };
                    scale[axis] = dimension.scale;
                    offset[axis] = dimension.offset.unwrap_or(0.);
                }
                "intensity" => schema.intensity = true,
                "red" | "green" | "blue" => schema.color = true,
                "classification" => schema.classification = true,
                "gpsTime" => schema.gps_time = true,
                other => {
                    bail!(ErrorKind::InvalidInput(format!(
                        "unknown dimension '{}' in manifest schema",
                        other
                    )));
                }
            }
        }
        schema.offset = Vector3::new(offset[0], offset[1], offset[2]);
        schema.scale = match (scale[0], scale[1], scale[2]) {
            (Some(x), Some(y), Some(z)) => Some(Vector3::new(x, y, z)),
            (None, None, None) => None,
            _ => bail!(ErrorKind::InvalidInput(
                "manifest schema scales only some coordinate axes".into()
            )),
        };
        Ok(schema)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dimension {
    pub name: String,
    #[serde(rename = "type")]
    pub dimension_type: String,
    pub size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scale: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Srs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authority: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub horizontal: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vertical: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wkt: Option<String>,
}

/// Per-point anomaly counters surfaced in the manifest; these are
/// warnings, never errors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CounterSnapshot {
    pub out_of_bounds: u64,
    pub invalid: u64,
    pub duplicate_points: u64,
    pub out_of_subset: u64,
}

impl CounterSnapshot {
    pub fn accumulate(&mut self, other: &CounterSnapshot) {
        self.out_of_bounds += other.out_of_bounds;
        self.invalid += other.invalid;
        self.duplicate_points += other.duplicate_points;
        self.out_of_subset += other.out_of_subset;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSummary {
    pub path: String,
    pub status: SourceStatus,
    pub points: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl SourceSummary {
    pub fn from_source(source: &Source) -> Self {
        SourceSummary {
            path: source.path.clone(),
            status: source.status,
            points: source.info.points,
            errors: source.info.errors.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: String,
    pub software: String,
    /// Cubic bounds of the octree root.
    pub bounds: [f64; 6],
    /// Tight bounds of the ingested points.
    pub bounds_conforming: [f64; 6],
    pub points: u64,
    pub span: u64,
    pub chunk_capacity: usize,
    pub hierarchy_step: u32,
    pub max_depth: u32,
    pub base_depth: u32,
    pub data_type: DataType,
    pub schema: Vec<Dimension>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srs: Option<Srs>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subset: Option<SubsetId>,
    #[serde(default)]
    pub counters: CounterSnapshot,
    #[serde(default)]
    pub sources: Vec<SourceSummary>,
}

impl Manifest {
    pub fn path(postfix: &str) -> String {
        format!("ept{}.json", postfix)
    }

    pub fn root_bounds(&self) -> Bounds {
        Bounds::from_array(&self.bounds)
    }

    pub fn schema(&self) -> Result<Schema> {
        Schema::from_dimensions(&self.schema)
    }

    pub fn write(&self, endpoint: &dyn Endpoint, postfix: &str) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        endpoint.put(&Manifest::path(postfix), &data)
    }

    pub fn read(endpoint: &dyn Endpoint, postfix: &str) -> Result<Option<Manifest>> {
        match endpoint.get(&Manifest::path(postfix)) {
            Ok(data) => {
                let manifest = serde_json::from_slice(&data)
                    .chain_err(|| format!("could not parse {}", Manifest::path(postfix)))?;
                Ok(Some(manifest))
            }
            Err(Error(ErrorKind::EndpointNotFound(_), _)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// A build resuming on top of this manifest must agree on the tree
    /// geometry and encoding.
    pub fn check_compatible(&self, other: &Manifest) -> Result<()> {
        let mut mismatches = Vec::new();
        if self.span != other.span {
            mismatches.push("span");
        }
        if self.chunk_capacity != other.chunk_capacity {
            mismatches.push("chunkCapacity");
        }
        if self.hierarchy_step != other.hierarchy_step {
            mismatches.push("hierarchyStep");
        }
        if self.max_depth != other.max_depth {
            mismatches.push("maxDepth");
        }
        if self.base_depth != other.base_depth {
            mismatches.push("baseDepth");
        }
        if self.data_type != other.data_type {
            mismatches.push("dataType");
        }
        if self.bounds != other.bounds {
            mismatches.push("bounds");
        }
        if self.schema != other.schema {
            mismatches.push("schema");
        }
        if self.subset != other.subset {
            mismatches.push("subset");
        }
        if !mismatches.is_empty() {
            bail!(ErrorKind::InvalidInput(format!(
                "existing output is incompatible with this configuration: {} differ",
                mismatches.join(", ")
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_dimensions_round_trip() {
        let schema = Schema {
            scale: Some(Vector3::new(0.01, 0.01, 0.025)),
            offset: Vector3::new(100., 200., 0.),
            intensity: true,
            color: true,
            classification: false,
            gps_time: true,
        };
        let dimensions = schema.to_dimensions();
        assert_eq!(dimensions[0].name, "x");
        assert_eq!(dimensions[0].dimension_type, "int32");
        let back = Schema::from_dimensions(&dimensions).unwrap();
        assert_eq!(back, schema);
    }

    #[test]
    fn point_size_follows_the_schema() {
        let mut schema = Schema::default();
        assert_eq!(schema.point_size(), 24);
        schema.scale = Some(Vector3::new(0.01, 0.01, 0.01));
        assert_eq!(schema.point_size(), 12);
        schema.intensity = true;
        schema.color = true;
        schema.classification = true;
        schema.gps_time = true;
        assert_eq!(schema.point_size(), 12 + 2 + 6 + 1 + 8);
    }

    #[test]
    fn partially_scaled_schema_is_rejected() {
        let schema = Schema {
            scale: Some(Vector3::new(0.01, 0.01, 0.01)),
            ..Default::default()
        };
        let mut dimensions = schema.to_dimensions();
        dimensions[1].scale = None;
        assert!(Schema::from_dimensions(&dimensions).is_err());
    }

    #[test]
    fn manifest_round_trips_through_an_endpoint() {
        use crate::read_write::MemoryEndpoint;

        let endpoint = MemoryEndpoint::new();
        assert!(Manifest::read(&endpoint, "").unwrap().is_none());

        let manifest = Manifest {
            version: MANIFEST_VERSION.to_string(),
            software: "point_tiler test".to_string(),
            bounds: [0., 0., 0., 16., 16., 16.],
            bounds_conforming: [1., 1., 1., 15., 15., 15.],
            points: 42,
            span: 256,
            chunk_capacity: 100,
            hierarchy_step: 6,
            max_depth: 26,
            base_depth: 4,
            data_type: DataType::Binary,
            schema: Schema::default().to_dimensions(),
            srs: None,
            subset: Some(SubsetId { id: 2, of: 4 }),
            counters: CounterSnapshot::default(),
            sources: Vec::new(),
        };
        manifest.write(&endpoint, "-2").unwrap();
        let back = Manifest::read(&endpoint, "-2").unwrap().unwrap();
        assert_eq!(back.points, 42);
        assert_eq!(back.subset, Some(SubsetId { id: 2, of: 4 }));
        assert!(back.check_compatible(&manifest).is_ok());

        let mut incompatible = manifest.clone();
        incompatible.span = 128;
        assert!(back.check_compatible(&incompatible).is_err());
    }
}
