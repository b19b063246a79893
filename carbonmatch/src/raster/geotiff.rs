//! Minimal GeoTIFF window reader for Cloud-Optimized covariate layers.
//!
//! Reads only what the exported covariates need: classic (non-Big) TIFF,
//! single band, tiled or striped layout, uncompressed or DEFLATE, with
//! GeoTIFF pixel-scale/tiepoint georeferencing and the GDAL nodata tag.
//! Only the IFD and the tiles intersecting a requested window are fetched,
//! so a layer is never downloaded in full.

use super::fetch::RangeFetch;
use super::grid::{GridInfo, Window};
use super::RasterLayer;
use crate::error::PipelineError;
use flate2::read::ZlibDecoder;
use std::io::Read;
use tracing::debug;

const TAG_IMAGE_WIDTH: u16 = 256;
const TAG_IMAGE_LENGTH: u16 = 257;
const TAG_BITS_PER_SAMPLE: u16 = 258;
const TAG_COMPRESSION: u16 = 259;
const TAG_STRIP_OFFSETS: u16 = 273;
const TAG_SAMPLES_PER_PIXEL: u16 = 277;
const TAG_ROWS_PER_STRIP: u16 = 278;
const TAG_STRIP_BYTE_COUNTS: u16 = 279;
const TAG_PREDICTOR: u16 = 317;
const TAG_TILE_WIDTH: u16 = 322;
const TAG_TILE_LENGTH: u16 = 323;
const TAG_TILE_OFFSETS: u16 = 324;
const TAG_TILE_BYTE_COUNTS: u16 = 325;
const TAG_SAMPLE_FORMAT: u16 = 339;
const TAG_MODEL_PIXEL_SCALE: u16 = 33550;
const TAG_MODEL_TIEPOINT: u16 = 33922;
const TAG_GDAL_NODATA: u16 = 42113;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endian {
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Compression {
    None,
    Deflate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleType {
    U8,
    U16,
    I16,
    I32,
    F32,
    F64,
}

impl SampleType {
    fn byte_len(self) -> usize {
        match self {
            SampleType::U8 => 1,
            SampleType::U16 | SampleType::I16 => 2,
            SampleType::I32 | SampleType::F32 => 4,
            SampleType::F64 => 8,
        }
    }
}

/// Chunking scheme of the image data.
#[derive(Debug, Clone)]
enum Layout {
    Tiled {
        tile_width: u32,
        tile_length: u32,
        offsets: Vec<u64>,
        byte_counts: Vec<u64>,
    },
    Striped {
        rows_per_strip: u32,
        offsets: Vec<u64>,
        byte_counts: Vec<u64>,
    },
}

/// One opened covariate raster.
pub struct GeoTiffLayer<F: RangeFetch> {
    fetch: F,
    name: String,
    grid: GridInfo,
    layout: Layout,
    endian: Endian,
    compression: Compression,
    sample: SampleType,
}

/// Raw IFD entry before value resolution.
struct IfdEntry {
    tag: u16,
    field_type: u16,
    count: u32,
    value_bytes: [u8; 4],
}

impl<F: RangeFetch> GeoTiffLayer<F> {
    /// Open a layer, parsing the header and first IFD via range reads.
    pub fn open(fetch: F, name: &str) -> Result<Self, PipelineError> {
        let err = |m: String| PipelineError::raster(name, m);

        let header = fetch.fetch(0, 8)?;
        let endian = match &header[0..2] {
            b"II" => Endian::Little,
            b"MM" => Endian::Big,
            _ => return Err(err("not a TIFF file (bad byte-order mark)".into())),
        };
        let magic = read_u16(&header[2..4], endian);
        if magic == 43 {
            return Err(err("BigTIFF is not supported".into()));
        }
        if magic != 42 {
            return Err(err(format!("bad TIFF magic {magic}")));
        }
        let ifd_offset = read_u32(&header[4..8], endian) as u64;

        let count_bytes = fetch.fetch(ifd_offset, 2)?;
        let entry_count = read_u16(&count_bytes, endian) as usize;
        let entries_raw = fetch.fetch(ifd_offset + 2, entry_count * 12)?;

        let mut entries = Vec::with_capacity(entry_count);
        for i in 0..entry_count {
            let e = &entries_raw[i * 12..(i + 1) * 12];
            entries.push(IfdEntry {
                tag: read_u16(&e[0..2], endian),
                field_type: read_u16(&e[2..4], endian),
                count: read_u32(&e[4..8], endian),
                value_bytes: [e[8], e[9], e[10], e[11]],
            });
        }

        let get = |tag: u16| entries.iter().find(|e| e.tag == tag);
        let values = |tag: u16| -> Result<Option<Vec<f64>>, PipelineError> {
            match get(tag) {
                Some(e) => Ok(Some(read_entry_values(&fetch, e, endian, name)?)),
                None => Ok(None),
            }
        };
        let scalar = |tag: u16| -> Result<Option<f64>, PipelineError> {
            Ok(values(tag)?.and_then(|v| v.first().copied()))
        };

        let width = scalar(TAG_IMAGE_WIDTH)?.ok_or_else(|| err("missing ImageWidth".into()))?
            as u32;
        let height = scalar(TAG_IMAGE_LENGTH)?.ok_or_else(|| err("missing ImageLength".into()))?
            as u32;

        let samples_per_pixel = scalar(TAG_SAMPLES_PER_PIXEL)?.unwrap_or(1.0) as u32;
        if samples_per_pixel != 1 {
            return Err(err(format!(
                "expected single-band raster, got {samples_per_pixel} samples per pixel"
            )));
        }

        let compression = match scalar(TAG_COMPRESSION)?.unwrap_or(1.0) as u32 {
            1 => Compression::None,
            8 | 32946 => Compression::Deflate,
            c => return Err(err(format!("unsupported compression {c}"))),
        };

        if let Some(p) = scalar(TAG_PREDICTOR)? {
            if p as u32 != 1 {
                return Err(err(format!("unsupported predictor {p}")));
            }
        }

        let bits = scalar(TAG_BITS_PER_SAMPLE)?.unwrap_or(8.0) as u32;
        let format = scalar(TAG_SAMPLE_FORMAT)?.unwrap_or(1.0) as u32;
        let sample = match (format, bits) {
            (1, 8) => SampleType::U8,
            (1, 16) => SampleType::U16,
            (2, 16) => SampleType::I16,
            (2, 32) => SampleType::I32,
            (3, 32) => SampleType::F32,
            (3, 64) => SampleType::F64,
            _ => {
                return Err(err(format!(
                    "unsupported sample format {format}/{bits} bits"
                )))
            }
        };

        let layout = if let Some(tile_offsets) = values(TAG_TILE_OFFSETS)? {
            let tile_width = scalar(TAG_TILE_WIDTH)?
                .ok_or_else(|| err("tiled image missing TileWidth".into()))?
                as u32;
            let tile_length = scalar(TAG_TILE_LENGTH)?
                .ok_or_else(|| err("tiled image missing TileLength".into()))?
                as u32;
            let byte_counts = values(TAG_TILE_BYTE_COUNTS)?
                .ok_or_else(|| err("tiled image missing TileByteCounts".into()))?;
            Layout::Tiled {
                tile_width,
                tile_length,
                offsets: tile_offsets.iter().map(|v| *v as u64).collect(),
                byte_counts: byte_counts.iter().map(|v| *v as u64).collect(),
            }
        } else if let Some(strip_offsets) = values(TAG_STRIP_OFFSETS)? {
            let rows_per_strip = scalar(TAG_ROWS_PER_STRIP)?.unwrap_or(height as f64) as u32;
            let byte_counts = values(TAG_STRIP_BYTE_COUNTS)?
                .ok_or_else(|| err("striped image missing StripByteCounts".into()))?;
            Layout::Striped {
                rows_per_strip,
                offsets: strip_offsets.iter().map(|v| *v as u64).collect(),
                byte_counts: byte_counts.iter().map(|v| *v as u64).collect(),
            }
        } else {
            return Err(err("image has neither tile nor strip offsets".into()));
        };

        let scale = values(TAG_MODEL_PIXEL_SCALE)?
            .ok_or_else(|| err("missing ModelPixelScale (not a GeoTIFF?)".into()))?;
        let tiepoint = values(TAG_MODEL_TIEPOINT)?
            .ok_or_else(|| err("missing ModelTiepoint (not a GeoTIFF?)".into()))?;
        if scale.len() < 2 || tiepoint.len() < 5 {
            return Err(err("malformed georeferencing tags".into()));
        }
        // Tiepoint maps raster (i, j) to model (x, y); covariate exports
        // anchor at the upper-left corner.
        let origin_x = tiepoint[3] - tiepoint[0] * scale[0];
        let origin_y = tiepoint[4] + tiepoint[1] * scale[1];

        let nodata = match get(TAG_GDAL_NODATA) {
            Some(e) => parse_nodata(&read_entry_ascii(&fetch, e, endian, name)?),
            None => None,
        };

        let grid = GridInfo {
            width,
            height,
            origin_x,
            origin_y,
            dx: scale[0],
            dy: -scale[1],
            nodata,
        };

        debug!(
            layer = name,
            width,
            height,
            compression = ?compression,
            sample = ?sample,
            "opened GeoTIFF layer"
        );

        Ok(Self {
            fetch,
            name: name.to_string(),
            grid,
            layout,
            endian,
            compression,
            sample,
        })
    }

    /// Fetch and decompress one chunk's worth of raw sample bytes.
    fn chunk_bytes(&self, offset: u64, byte_count: u64) -> Result<Vec<u8>, PipelineError> {
        let raw = self.fetch.fetch(offset, byte_count as usize)?;
        match self.compression {
            Compression::None => Ok(raw),
            Compression::Deflate => {
                let mut out = Vec::new();
                ZlibDecoder::new(&raw[..])
                    .read_to_end(&mut out)
                    .map_err(|e| {
                        PipelineError::raster(&self.name, format!("deflate error: {e}"))
                    })?;
                Ok(out)
            }
        }
    }

    fn decode_sample(&self, bytes: &[u8], index: usize) -> Option<f64> {
        let n = self.sample.byte_len();
        let at = index * n;
        if at + n > bytes.len() {
            return None;
        }
        let b = &bytes[at..at + n];
        let value = match self.sample {
            SampleType::U8 => b[0] as f64,
            SampleType::U16 => read_u16(b, self.endian) as f64,
            SampleType::I16 => read_u16(b, self.endian) as i16 as f64,
            SampleType::I32 => read_u32(b, self.endian) as i32 as f64,
            SampleType::F32 => f32::from_bits(read_u32(b, self.endian)) as f64,
            SampleType::F64 => f64::from_bits(read_u64(b, self.endian)),
        };
        if value.is_nan() {
            return None;
        }
        if let Some(nd) = self.grid.nodata {
            if value == nd || (nd.is_nan() && value.is_nan()) {
                return None;
            }
        }
        Some(value)
    }
}

impl<F: RangeFetch> RasterLayer for GeoTiffLayer<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn grid(&self) -> &GridInfo {
        &self.grid
    }

    fn read_window(&self, window: &Window) -> Result<Vec<Option<f64>>, PipelineError> {
        if window.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = vec![None; window.len()];

        match &self.layout {
            Layout::Tiled {
                tile_width,
                tile_length,
                offsets,
                byte_counts,
            } => {
                let tiles_across = self.grid.width.div_ceil(*tile_width);
                let t_col0 = window.col0 / tile_width;
                let t_col1 = (window.col0 + window.cols - 1) / tile_width;
                let t_row0 = window.row0 / tile_length;
                let t_row1 = (window.row0 + window.rows - 1) / tile_length;

                for trow in t_row0..=t_row1 {
                    for tcol in t_col0..=t_col1 {
                        let tidx = (trow * tiles_across + tcol) as usize;
                        let (offset, count) = match (offsets.get(tidx), byte_counts.get(tidx)) {
                            (Some(o), Some(c)) => (*o, *c),
                            _ => {
                                return Err(PipelineError::raster(
                                    &self.name,
                                    format!("tile index {tidx} out of range"),
                                ))
                            }
                        };
                        // Sparse tile: GDAL writes offset 0 for all-nodata tiles
                        if offset == 0 || count == 0 {
                            continue;
                        }
                        let bytes = self.chunk_bytes(offset, count)?;
                        copy_chunk_into(
                            &mut out,
                            window,
                            trow * tile_length,
                            tcol * tile_width,
                            *tile_width,
                            *tile_length,
                            |idx| self.decode_sample(&bytes, idx),
                        );
                    }
                }
            }
            Layout::Striped {
                rows_per_strip,
                offsets,
                byte_counts,
            } => {
                let rows_per_strip = *rows_per_strip;
                let s0 = window.row0 / rows_per_strip;
                let s1 = (window.row0 + window.rows - 1) / rows_per_strip;
                for strip in s0..=s1 {
                    let sidx = strip as usize;
                    let (offset, count) = match (offsets.get(sidx), byte_counts.get(sidx)) {
                        (Some(o), Some(c)) => (*o, *c),
                        _ => {
                            return Err(PipelineError::raster(
                                &self.name,
                                format!("strip index {sidx} out of range"),
                            ))
                        }
                    };
                    let bytes = self.chunk_bytes(offset, count)?;
                    let strip_rows = rows_per_strip.min(self.grid.height - strip * rows_per_strip);
                    copy_chunk_into(
                        &mut out,
                        window,
                        strip * rows_per_strip,
                        0,
                        self.grid.width,
                        strip_rows,
                        |idx| self.decode_sample(&bytes, idx),
                    );
                }
            }
        }

        Ok(out)
    }
}

/// Copy the overlap between a chunk (tile or strip) and the requested
/// window. `decode` maps a chunk-local sample index to a value.
#[allow(clippy::too_many_arguments)]
fn copy_chunk_into(
    out: &mut [Option<f64>],
    window: &Window,
    chunk_row0: u32,
    chunk_col0: u32,
    chunk_width: u32,
    chunk_height: u32,
    decode: impl Fn(usize) -> Option<f64>,
) {
    let row_lo = window.row0.max(chunk_row0);
    let row_hi = (window.row0 + window.rows).min(chunk_row0 + chunk_height);
    let col_lo = window.col0.max(chunk_col0);
    let col_hi = (window.col0 + window.cols).min(chunk_col0 + chunk_width);

    for row in row_lo..row_hi {
        for col in col_lo..col_hi {
            let chunk_idx = ((row - chunk_row0) * chunk_width + (col - chunk_col0)) as usize;
            let out_idx = ((row - window.row0) * window.cols + (col - window.col0)) as usize;
            out[out_idx] = decode(chunk_idx);
        }
    }
}

fn read_u16(b: &[u8], endian: Endian) -> u16 {
    match endian {
        Endian::Little => u16::from_le_bytes([b[0], b[1]]),
        Endian::Big => u16::from_be_bytes([b[0], b[1]]),
    }
}

fn read_u32(b: &[u8], endian: Endian) -> u32 {
    match endian {
        Endian::Little => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        Endian::Big => u32::from_be_bytes([b[0], b[1], b[2], b[3]]),
    }
}

fn read_u64(b: &[u8], endian: Endian) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[..8]);
    match endian {
        Endian::Little => u64::from_le_bytes(a),
        Endian::Big => u64::from_be_bytes(a),
    }
}

fn type_size(field_type: u16) -> Option<usize> {
    match field_type {
        1 | 2 | 6 | 7 => Some(1), // BYTE, ASCII, SBYTE, UNDEFINED
        3 | 8 => Some(2),         // SHORT, SSHORT
        4 | 9 | 11 => Some(4),    // LONG, SLONG, FLOAT
        5 | 10 | 12 => Some(8),   // RATIONAL, SRATIONAL, DOUBLE
        _ => None,
    }
}

/// Resolve an IFD entry's raw bytes, inline or at the external offset.
fn entry_raw_bytes<F: RangeFetch>(
    fetch: &F,
    entry: &IfdEntry,
    endian: Endian,
    layer: &str,
) -> Result<Vec<u8>, PipelineError> {
    let size = type_size(entry.field_type).ok_or_else(|| {
        PipelineError::raster(
            layer,
            format!("unknown field type {} for tag {}", entry.field_type, entry.tag),
        )
    })?;
    let total = size * entry.count as usize;
    if total <= 4 {
        Ok(entry.value_bytes[..total].to_vec())
    } else {
        let offset = read_u32(&entry.value_bytes, endian) as u64;
        fetch.fetch(offset, total)
    }
}

/// Read an entry's values, widened to f64.
fn read_entry_values<F: RangeFetch>(
    fetch: &F,
    entry: &IfdEntry,
    endian: Endian,
    layer: &str,
) -> Result<Vec<f64>, PipelineError> {
    let bytes = entry_raw_bytes(fetch, entry, endian, layer)?;
    let size = type_size(entry.field_type).unwrap_or(1);
    let mut values = Vec::with_capacity(entry.count as usize);
    for i in 0..entry.count as usize {
        let b = &bytes[i * size..(i + 1) * size];
        let v = match entry.field_type {
            1 | 2 | 7 => b[0] as f64,
            6 => b[0] as i8 as f64,
            3 => read_u16(b, endian) as f64,
            8 => read_u16(b, endian) as i16 as f64,
            4 => read_u32(b, endian) as f64,
            9 => read_u32(b, endian) as i32 as f64,
            11 => f32::from_bits(read_u32(b, endian)) as f64,
            12 => f64::from_bits(read_u64(b, endian)),
            5 | 10 => {
                let num = read_u32(&b[0..4], endian) as f64;
                let den = read_u32(&b[4..8], endian) as f64;
                if den == 0.0 {
                    0.0
                } else {
                    num / den
                }
            }
            t => {
                return Err(PipelineError::raster(
                    layer,
                    format!("cannot read field type {t}"),
                ))
            }
        };
        values.push(v);
    }
    Ok(values)
}

/// Read an ASCII entry as a string (dropping the trailing NUL).
fn read_entry_ascii<F: RangeFetch>(
    fetch: &F,
    entry: &IfdEntry,
    endian: Endian,
    layer: &str,
) -> Result<String, PipelineError> {
    let bytes = entry_raw_bytes(fetch, entry, endian, layer)?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

fn parse_nodata(text: &str) -> Option<f64> {
    let t = text.trim();
    if t.eq_ignore_ascii_case("nan") {
        Some(f64::NAN)
    } else {
        t.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::fetch::tests::MemoryFetcher;

    #[test]
    fn rejects_non_tiff_bytes() {
        let fetch = MemoryFetcher(b"PK\x03\x04garbagegarbage".to_vec());
        let err = GeoTiffLayer::open(fetch, "region").map(|_| ()).unwrap_err();
        assert!(err.to_string().contains("byte-order mark"), "{err}");
    }

    #[test]
    fn rejects_bigtiff() {
        let mut bytes = b"II".to_vec();
        bytes.extend_from_slice(&43u16.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 12]);
        let err = GeoTiffLayer::open(MemoryFetcher(bytes), "region")
            .map(|_| ())
            .unwrap_err();
        assert!(err.to_string().contains("BigTIFF"), "{err}");
    }

    #[test]
    fn nodata_parsing() {
        assert_eq!(parse_nodata("-9999"), Some(-9999.0));
        assert_eq!(parse_nodata(" 255 "), Some(255.0));
        assert!(parse_nodata("nan").unwrap().is_nan());
        assert_eq!(parse_nodata(""), None);
    }
}
