use crate::errors::*;
use crate::math::Bounds;
use crate::read_write::Endpoint;
use crate::{Color, Point};
use fnv::FnvHashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::Mutex;

pub const SOURCES_PREFIX: &str = "ept-sources";

/// Lifecycle of one input file across builds. `Ingesting` survives on
/// disk only when a build crashed mid-source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SourceStatus {
    Pending,
    Ingesting,
    Inserted,
    Errored,
}

/// What the pre-analysis phase learned about one input.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SourceInfo {
    pub bounds: Option<[f64; 6]>,
    pub points: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub srs: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dimensions: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

impl SourceInfo {
    pub fn bounds(&self) -> Option<Bounds> {
        self.bounds.as_ref().map(Bounds::from_array)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub path: String,
    pub info: SourceInfo,
    pub status: SourceStatus,
}

impl Source {
    pub fn new(path: String, info: SourceInfo) -> Self {
        Source {
            path,
            info,
            status: SourceStatus::Pending,
        }
    }

    /// File stem used for the per-source info object.
    pub fn stem(&self) -> String {
        Path::new(&self.path)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.replace('/', "_"))
    }
}

/// Writes `ept-sources/list.json` plus one info object per source.
pub fn write_sources(endpoint: &dyn Endpoint, sources: &[Source], postfix: &str) -> Result<()> {
    let list: Vec<serde_json::Value> = sources
        .iter()
        .map(|s| {
            serde_json::json!({
                "path": s.path,
                "id": s.stem(),
                "status": s.status,
                "points": s.info.points,
            })
        })
        .collect();
    endpoint.put(
        &format!("{}/list{}.json", SOURCES_PREFIX, postfix),
        &serde_json::to_vec_pretty(&list)?,
    )?;
    for source in sources {
        endpoint.put(
            &format!("{}/{}{}.json", SOURCES_PREFIX, source.stem(), postfix),
            &serde_json::to_vec_pretty(source)?,
        )?;
    }
    Ok(())
}

pub fn read_sources(endpoint: &dyn Endpoint, postfix: &str) -> Result<Vec<Source>> {
    let list_key = format!("{}/list{}.json", SOURCES_PREFIX, postfix);
    let data = match endpoint.get(&list_key) {
        Ok(data) => data,
        Err(Error(ErrorKind::EndpointNotFound(_), _)) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let list: Vec<serde_json::Value> =
        serde_json::from_slice(&data).chain_err(|| format!("could not parse {}", list_key))?;
    let mut sources = Vec::with_capacity(list.len());
    for entry in list {
        let id = entry
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ErrorKind::InvalidInput(format!("malformed entry in {}", list_key)))?;
        let key = format!("{}/{}{}.json", SOURCES_PREFIX, id, postfix);
        let source: Source = serde_json::from_slice(&endpoint.get(&key)?)
            .chain_err(|| format!("could not parse {}", key))?;
        sources.push(source);
    }
    Ok(sources)
}

/// A cursor into one open source. `next_batch` returning an empty vector
/// means end of input.
pub trait SourceStream: Send {
    fn next_batch(&mut self, n: usize) -> Result<Vec<Point>>;
}

/// The capability set the core consumes from the external reader stack.
/// Implementations dispatch on path or pipeline type at `open` time.
pub trait SourceReader: Send + Sync {
    fn open(&self, path: &str) -> Result<Box<dyn SourceStream>>;
    fn info(&self, path: &str) -> Result<SourceInfo>;
}

/// Plain text reader: one point per line as `x y z [intensity [r g b]]`,
/// `#` starts a comment.
pub struct PtsReader;

impl PtsReader {
    fn parse_line(line: &str, path: &str, line_number: usize) -> Result<Option<Point>> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return Ok(None);
        }
        let mut fields = line.split_whitespace();
        let mut coordinate = || -> Result<f64> {
            fields
                .next()
                .ok_or_else(|| {
                    Error::from(ErrorKind::InvalidInput(format!(
                        "{}:{}: expected at least 3 coordinates",
                        path, line_number
                    )))
                })?
                .parse()
                .chain_err(|| {
                    ErrorKind::InvalidInput(format!("{}:{}: malformed number", path, line_number))
                })
        };
        let x = coordinate()?;
        let y = coordinate()?;
        let z = coordinate()?;
        let mut point = Point::at(x, y, z);
        let rest: Vec<&str> = fields.collect();
        if !rest.is_empty() {
            point.intensity = Some(rest[0].parse().chain_err(|| {
                ErrorKind::InvalidInput(format!("{}:{}: malformed intensity", path, line_number))
            })?);
        }
        if rest.len() >= 4 {
            let mut channel = |i: usize| -> Result<u16> {
                rest[i].parse().chain_err(|| {
                    ErrorKind::InvalidInput(format!("{}:{}: malformed color", path, line_number))
                })
            };
            point.color = Some(Color {
                red: channel(1)?,
                green: channel(2)?,
                blue: channel(3)?,
            });
        }
        Ok(Some(point))
    }
}

struct PtsStream {
    path: String,
    reader: BufReader<File>,
    line_number: usize,
}

impl SourceStream for PtsStream {
    fn next_batch(&mut self, n: usize) -> Result<Vec<Point>> {
        let mut points = Vec::with_capacity(n.min(1024));
        let mut line = String::new();
        while points.len() < n {
            line.clear();
            let read = self
                .reader
                .read_line(&mut line)
                .chain_err(|| format!("could not read {}", self.path))?;
            if read == 0 {
                break;
            }
            self.line_number += 1;
            if let Some(point) = PtsReader::parse_line(&line, &self.path, self.line_number)? {
                points.push(point);
            }
        }
        Ok(points)
    }
}

impl SourceReader for PtsReader {
    fn open(&self, path: &str) -> Result<Box<dyn SourceStream>> {
        let file = File::open(path).chain_err(|| {
            ErrorKind::InvalidInput(format!("could not open source '{}'", path))
        })?;
        Ok(Box::new(PtsStream {
            path: path.to_string(),
            reader: BufReader::new(file),
            line_number: 0,
        }))
    }

    /// Full pre-analysis scan: bounds and point count.
    fn info(&self, path: &str) -> Result<SourceInfo> {
        let mut stream = self.open(path)?;
        let mut bounds = Bounds::empty();
        let mut points = 0u64;
        let mut dimensions = vec!["x".to_string(), "y".to_string(), "z".to_string()];
        let mut saw_intensity = false;
        let mut saw_color = false;
        loop {
            let batch = stream.next_batch(crate::NUM_POINTS_PER_BATCH)?;
            if batch.is_empty() {
                break;
            }
            for point in &batch {
                if point.is_finite() {
                    bounds.grow(&point.position);
                }
                saw_intensity |= point.intensity.is_some();
                saw_color |= point.color.is_some();
            }
            points += batch.len() as u64;
        }
        if saw_intensity {
            dimensions.push("intensity".to_string());
        }
        if saw_color {
            dimensions.extend(["red", "green", "blue"].iter().map(|s| s.to_string()));
        }
        Ok(SourceInfo {
            bounds: if bounds.is_empty() {
                None
            } else {
                Some(bounds.to_array())
            },
            points,
            srs: None,
            dimensions,
            errors: Vec::new(),
        })
    }
}

/// In-memory reader keyed by pseudo-path, shared by tests and tools
/// that synthesize clouds.
#[derive(Default)]
pub struct MemoryReader {
    clouds: Mutex<FnvHashMap<String, Vec<Point>>>,
}

struct MemoryStream {
    points: Vec<Point>,
    offset: usize,
}

impl SourceStream for MemoryStream {
    fn next_batch(&mut self, n: usize) -> Result<Vec<Point>> {
        let end = (self.offset + n).min(self.points.len());
        let batch = self.points[self.offset..end].to_vec();
        self.offset = end;
        Ok(batch)
    }
}

impl MemoryReader {
    pub fn new() -> Self {
        MemoryReader::default()
    }

    pub fn insert(&self, path: impl Into<String>, points: Vec<Point>) {
        self.clouds.lock().unwrap().insert(path.into(), points);
    }

    fn cloud(&self, path: &str) -> Result<Vec<Point>> {
        self.clouds
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| {
                ErrorKind::InvalidInput(format!("no such in-memory source '{}'", path)).into()
            })
    }
}

impl SourceReader for MemoryReader {
    fn open(&self, path: &str) -> Result<Box<dyn SourceStream>> {
        Ok(Box::new(MemoryStream {
            points: self.cloud(path)?,
            offset: 0,
        }))
    }

    fn info(&self, path: &str) -> Result<SourceInfo> {
        let points = self.cloud(path)?;
        let mut bounds = Bounds::empty();
        for point in &points {
            if point.is_finite() {
                bounds.grow(&point.position);
            }
        }
        Ok(SourceInfo {
            bounds: if bounds.is_empty() {
                None
            } else {
                Some(bounds.to_array())
            },
            points: points.len() as u64,
            srs: None,
            dimensions: vec!["x".to_string(), "y".to_string(), "z".to_string()],
            errors: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_write::MemoryEndpoint;
    use std::io::Write;
    use tempdir::TempDir;

    #[test]
    fn pts_reader_parses_points_and_attributes() {
        let dir = TempDir::new("pts").unwrap();
        let path = dir.path().join("cloud.pts");
        let mut file = File::create(&path).unwrap();
        writeln!(file, "# a comment").unwrap();
        writeln!(file, "1.5 2.5 3.5").unwrap();
        writeln!(file, "4 5 6 700").unwrap();
        writeln!(file, "7 8 9 10 255 0 127").unwrap();
        drop(file);

        let reader = PtsReader;
        let path = path.to_string_lossy().into_owned();
        let mut stream = reader.open(&path).unwrap();
        let points = stream.next_batch(100).unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0], Point::at(1.5, 2.5, 3.5));
        assert_eq!(points[1].intensity, Some(700));
        assert_eq!(
            points[2].color,
            Some(Color {
                red: 255,
                green: 0,
                blue: 127
            })
        );
        assert!(stream.next_batch(100).unwrap().is_empty());

        let info = reader.info(&path).unwrap();
        assert_eq!(info.points, 3);
        assert_eq!(info.bounds, Some([1.5, 2.5, 3.5, 7., 8., 9.]));
        assert!(info.dimensions.contains(&"intensity".to_string()));
    }

    #[test]
    fn pts_reader_reports_malformed_lines() {
        let dir = TempDir::new("pts").unwrap();
        let path = dir.path().join("bad.pts");
        std::fs::write(&path, "1 2\n").unwrap();
        let reader = PtsReader;
        let mut stream = reader.open(&path.to_string_lossy()).unwrap();
        assert!(stream.next_batch(10).is_err());
    }

    #[test]
    fn memory_reader_batches() {
        let reader = MemoryReader::new();
        reader.insert("a", (0..10).map(|i| Point::at(i as f64, 0., 0.)).collect());
        let mut stream = reader.open("a").unwrap();
        assert_eq!(stream.next_batch(4).unwrap().len(), 4);
        assert_eq!(stream.next_batch(4).unwrap().len(), 4);
        assert_eq!(stream.next_batch(4).unwrap().len(), 2);
        assert!(stream.next_batch(4).unwrap().is_empty());
        assert!(reader.open("missing").is_err());
    }

    #[test]
    fn sources_round_trip_through_an_endpoint() {
        let endpoint = MemoryEndpoint::new();
        let mut source = Source::new(
            "clouds/alpha.pts".to_string(),
            SourceInfo {
                bounds: Some([0., 0., 0., 1., 1., 1.]),
                points: 12,
                ..Default::default()
            },
        );
        source.status = SourceStatus::Inserted;
        write_sources(&endpoint, &[source], "").unwrap();

        let back = read_sources(&endpoint, "").unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].path, "clouds/alpha.pts");
        assert_eq!(back[0].status, SourceStatus::Inserted);
        assert_eq!(back[0].info.points, 12);
        assert!(endpoint.exists("ept-sources/alpha.json").unwrap());
    }
}
