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

use crate::config::DataType;
use crate::errors::*;
use crate::manifest::Schema;
use crate::octree::ChunkKey;
use crate::read_write::endpoint::{retry_io, Endpoint};
use crate::{Color, Point};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;
use std::sync::Arc;

pub const DATA_PREFIX: &str = "ept-data";

pub const CHUNK_MAGIC: &[u8; 4] = b"EWCK";
pub const CHUNK_VERSION: u16 = 1;
pub const CHUNK_HEADER_SIZE: usize = 24;

const FLAG_ZSTD: u16 = 1;
/// The cell's overflow region was already handed down the tree; it must
/// not be re-opened when the chunk is loaded again.
const FLAG_SPLIT: u16 = 1 << 1;
const ZSTD_LEVEL: i32 = 3;

/// Serializes cells into immutable EWCK chunks and moves them through an
/// `Endpoint`. Re-writing a chunk with identical content is idempotent;
/// writes are whole-object puts.
pub struct ChunkStore {
    endpoint: Arc<dyn Endpoint>,
    schema: Schema,
    data_type: DataType,
    postfix: String,
}

impl ChunkStore {
    pub fn new(
        endpoint: Arc<dyn Endpoint>,
        schema: Schema,
        data_type: DataType,
        postfix: String,
    ) -> Self {
        ChunkStore {
            endpoint,
            schema,
            data_type,
            postfix,
        }
    }

    pub fn endpoint(&self) -> &Arc<dyn Endpoint> {
        &self.endpoint
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn chunk_path(&self, key: &ChunkKey) -> String {
        format!(
            "{}/{}{}.{}",
            DATA_PREFIX,
            key,
            self.postfix,
            self.data_type.extension()
        )
    }

    pub fn exists(&self, key: &ChunkKey) -> Result<bool> {
        self.endpoint.exists(&self.chunk_path(key))
    }

    pub fn write(&self, key: &ChunkKey, points: &[Point], split: bool) -> Result<()> {
        let chunk = encode_chunk(points, split, &self.schema, self.data_type)?;
        let path = self.chunk_path(key);
        retry_io(|| self.endpoint.put(&path, &chunk))
    }

    /// Reads a chunk back, or `None` when nothing was persisted for this
    /// key. Verification failures are fatal `ChunkCorrupt` errors.
    pub fn read(&self, key: &ChunkKey) -> Result<Option<(Vec<Point>, bool)>> {
        let path = self.chunk_path(key);
        let data = match retry_io(|| self.endpoint.get(&path)) {
            Ok(data) => data,
            Err(Error(ErrorKind::EndpointNotFound(_), _)) => return Ok(None),
            Err(e) => return Err(e),
        };
        decode_chunk(&data, &self.schema, &path).map(Some)
    }
}

pub fn encode_chunk(
    points: &[Point],
    split: bool,
    schema: &Schema,
    data_type: DataType,
) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(points.len() * schema.point_size());
    for point in points {
        encode_point(point, schema, &mut body)?;
    }
    let uncompressed_size = body.len() as u32;

    let (mut flags, payload) = match data_type {
        DataType::Zstandard => {
            let compressed = zstd::stream::encode_all(&body[..], ZSTD_LEVEL)
                .chain_err(|| "zstd compression failed")?;
            (FLAG_ZSTD, compressed)
        }
        DataType::Binary => (0, body),
        DataType::Laz => bail!(ErrorKind::InvalidInput(
            "laz chunks require the external writer stack".into()
        )),
    };
    if split {
        flags |= FLAG_SPLIT;
    }

    let mut chunk = Vec::with_capacity(CHUNK_HEADER_SIZE + payload.len());
    chunk.extend_from_slice(CHUNK_MAGIC);
    chunk.write_u16::<LittleEndian>(CHUNK_VERSION)?;
    chunk.write_u16::<LittleEndian>(flags)?;
    chunk.write_u32::<LittleEndian>(points.len() as u32)?;
    chunk.write_u32::<LittleEndian>(uncompressed_size)?;
    chunk.write_u32::<LittleEndian>(payload.len() as u32)?;
    chunk.write_u32::<LittleEndian>(0)?; // reserved
    chunk.extend_from_slice(&payload);
    Ok(chunk)
}

pub fn decode_chunk(data: &[u8], schema: &Schema, name: &str) -> Result<(Vec<Point>, bool)> {
    let corrupt = |msg: &str| -> Error {
        ErrorKind::ChunkCorrupt(name.to_string(), msg.to_string()).into()
    };

    if data.len() < CHUNK_HEADER_SIZE {
        return Err(corrupt("shorter than the chunk header"));
    }
    if &data[..4] != CHUNK_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let mut header = Cursor::new(&data[4..CHUNK_HEADER_SIZE]);
    let version = header.read_u16::<LittleEndian>()?;
    if version != CHUNK_VERSION {
        bail!(ErrorKind::InvalidVersion(version));
    }
    let flags = header.read_u16::<LittleEndian>()?;
    let point_count = header.read_u32::<LittleEndian>()? as usize;
    let uncompressed_size = header.read_u32::<LittleEndian>()? as usize;
    let compressed_size = header.read_u32::<LittleEndian>()? as usize;

    if data.len() - CHUNK_HEADER_SIZE != compressed_size {
        return Err(corrupt("compressed size does not match the payload"));
    }
    let payload = &data[CHUNK_HEADER_SIZE..];
    let decompressed;
    let body: &[u8] = if flags & FLAG_ZSTD != 0 {
        decompressed =
            zstd::stream::decode_all(payload).map_err(|_| corrupt("zstd body is undecodable"))?;
        &decompressed
    } else {
        payload
    };
    if body.len() != uncompressed_size {
        return Err(corrupt("uncompressed size does not match the body"));
    }
    if point_count * schema.point_size() != uncompressed_size {
        return Err(corrupt("body size does not match the point count"));
    }

    let mut cursor = Cursor::new(body);
    let mut points = Vec::with_capacity(point_count);
    for _ in 0..point_count {
        points.push(decode_point(&mut cursor, schema)?);
    }
    Ok((points, flags & FLAG_SPLIT != 0))
}

/// Scale-offset quantization with a range check; coordinates that do
/// not fit the stored integer width are a configuration problem, not
/// silent wrap-around.
fn quantize<T>(value: f64, scale: f64, offset: f64) -> Result<T>
where
    T: num_traits::PrimInt + num_traits::Bounded + num_traits::NumCast,
{
    let stored = ((value - offset) / scale).round();
    num_traits::cast(stored).ok_or_else(|| {
        ErrorKind::InvalidInput(format!(
            "coordinate {} does not fit the scaled integer range (scale {}, offset {})",
            value, scale, offset
        ))
        .into()
    })
}

fn encode_point(point: &Point, schema: &Schema, out: &mut Vec<u8>) -> Result<()> {
    match schema.scale {
        Some(scale) => {
            for axis in 0..3 {
                let stored: i32 = quantize(point.position[axis], scale[axis], schema.offset[axis])?;
                out.write_i32::<LittleEndian>(stored)?;
            }
        }
        None => {
            for axis in 0..3 {
                out.write_f64::<LittleEndian>(point.position[axis])?;
            }
        }
    }
    if schema.intensity {
        out.write_u16::<LittleEndian>(point.intensity.unwrap_or(0))?;
    }
    if schema.color {
        let color = point.color.unwrap_or_default();
        out.write_u16::<LittleEndian>(color.red)?;
        out.write_u16::<LittleEndian>(color.green)?;
        out.write_u16::<LittleEndian>(color.blue)?;
    }
    if schema.classification {
        out.write_u8(point.classification.unwrap_or(0))?;
    }
    if schema.gps_time {
        out.write_f64::<LittleEndian>(point.gps_time.unwrap_or(0.))?;
    }
    Ok(())
}

fn decode_point(cursor: &mut Cursor<&[u8]>, schema: &Schema) -> Result<Point> {
    let mut coords = [0.; 3];
    match schema.scale {
        Some(scale) => {
            for (axis, coord) in coords.iter_mut().enumerate() {
                let stored = cursor.read_i32::<LittleEndian>()?;
                *coord = f64::from(stored) * scale[axis] + schema.offset[axis];
            }
        }
        None => {
            for coord in coords.iter_mut() {
                *coord = cursor.read_f64::<LittleEndian>()?;
            }
        }
    }
    let mut point = Point::at(coords[0], coords[1], coords[2]);
    if schema.intensity {
        point.intensity = Some(cursor.read_u16::<LittleEndian>()?);
    }
    if schema.color {
        point.color = Some(Color {
            red: cursor.read_u16::<LittleEndian>()?,
            green: cursor.read_u16::<LittleEndian>()?,
            blue: cursor.read_u16::<LittleEndian>()?,
        });
    }
    if schema.classification {
        point.classification = Some(cursor.read_u8()?);
    }
    if schema.gps_time {
        point.gps_time = Some(cursor.read_f64::<LittleEndian>()?);
    }
    Ok(point)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::read_write::MemoryEndpoint;
    use nalgebra::{Point3, Vector3};

    fn store(data_type: DataType, schema: Schema) -> ChunkStore {
        ChunkStore::new(Arc::new(MemoryEndpoint::new()), schema, data_type, String::new())
    }

    fn sample_points() -> Vec<Point> {
        vec![
            Point {
                position: Point3::new(1.25, -2.5, 3.75),
                intensity: Some(700),
                color: Some(Color {
                    red: 65535,
                    green: 128,
                    blue: 0,
                }),
                classification: Some(2),
                gps_time: Some(123456.789),
            },
            Point {
                position: Point3::new(-10., 0., 99.5),
                intensity: Some(1),
                color: Some(Color::default()),
                classification: Some(0),
                gps_time: Some(0.),
            },
        ]
    }

    fn full_schema() -> Schema {
        Schema {
            scale: None,
            offset: Vector3::new(0., 0., 0.),
            intensity: true,
            color: true,
            classification: true,
            gps_time: true,
        }
    }

    #[test]
    fn chunks_survive_a_raw_round_trip() {
        let store = store(DataType::Binary, full_schema());
        let key = ChunkKey::new(1, 0, 1, 0);
        assert_eq!(store.read(&key).unwrap(), None);

        let points = sample_points();
        store.write(&key, &points, false).unwrap();
        assert!(store.exists(&key).unwrap());
        assert_eq!(store.read(&key).unwrap().unwrap(), (points, false));
    }

    #[test]
    fn chunks_survive_a_zstd_round_trip() {
        let store = store(DataType::Zstandard, full_schema());
        let key = ChunkKey::root();
        let points = sample_points();
        store.write(&key, &points, true).unwrap();
        assert_eq!(store.read(&key).unwrap().unwrap(), (points, true));
        assert_eq!(store.chunk_path(&key), "ept-data/0-0-0-0.zst");
    }

    #[test]
    fn scaled_coordinates_quantize() {
        let schema = Schema {
            scale: Some(Vector3::new(0.01, 0.01, 0.01)),
            offset: Vector3::new(100., 100., 0.),
            ..Default::default()
        };
        let store = store(DataType::Binary, schema);
        let key = ChunkKey::root();
        let points = vec![Point::at(101.23, 99.99, 0.07)];
        store.write(&key, &points, false).unwrap();
        let (back, _) = store.read(&key).unwrap().unwrap();
        assert!((back[0].position.x - 101.23).abs() < 1e-9);
        assert!((back[0].position.y - 99.99).abs() < 1e-9);
        assert!((back[0].position.z - 0.07).abs() < 1e-9);
    }

    #[test]
    fn corrupt_chunks_are_rejected() {
        let schema = Schema::default();
        let points = vec![Point::at(1., 2., 3.)];
        let good = encode_chunk(&points, false, &schema, DataType::Binary).unwrap();

        let mut bad_magic = good.clone();
        bad_magic[0] = b'X';
        assert!(decode_chunk(&bad_magic, &schema, "t").is_err());

        let mut truncated = good.clone();
        truncated.pop();
        assert!(decode_chunk(&truncated, &schema, "t").is_err());

        let mut wrong_count = good;
        wrong_count[8] = 9;
        match decode_chunk(&wrong_count, &schema, "t") {
            Err(Error(ErrorKind::ChunkCorrupt(name, _), _)) => assert_eq!(name, "t"),
            other => panic!("expected ChunkCorrupt, got {:?}", other),
        }
    }

    #[test]
    fn subset_postfix_lands_in_the_chunk_path() {
        let store = ChunkStore::new(
            Arc::new(MemoryEndpoint::new()),
            Schema::default(),
            DataType::Binary,
            "-3".to_string(),
        );
        assert_eq!(
            store.chunk_path(&ChunkKey::new(2, 1, 0, 3)),
            "ept-data/2-1-0-3-3.bin"
        );
    }
}
