// src/backend/mod.rs
//! Boundary toward the raster library.
//!
//! A [`RasterBackend`] opens [`RasterDataset`]s; a dataset owns the native
//! objects for one [`DatasetKey`] and is never touched by two threads at once.
//! The pool and dispatch layer only see these traits.

pub mod gdal_backend;
pub mod memory;

pub use self::gdal_backend::GdalBackend;
pub use self::memory::{MemoryBackend, MemoryBand, MemoryRaster};

use serde::{Deserialize, Serialize};

use crate::error::NativeError;
use crate::key::{DatasetKey, DatasetSelector};

pub type NativeResult<T> = Result<T, NativeError>;

/// CPL error numbers, shared by every backend so codes mean the same thing
/// regardless of where they came from.
pub mod cple {
    pub const APP_DEFINED: i32 = 1;
    pub const OUT_OF_MEMORY: i32 = 2;
    pub const FILE_IO: i32 = 3;
    pub const OPEN_FAILED: i32 = 4;
    pub const ILLEGAL_ARG: i32 = 5;
    pub const NOT_SUPPORTED: i32 = 6;
    pub const ASSERTION_FAILED: i32 = 7;
    pub const NO_WRITE_ACCESS: i32 = 8;
    pub const USER_INTERRUPT: i32 = 9;
    pub const OBJECT_NULL: i32 = 10;
    pub const HTTP_RESPONSE: i32 = 11;
    pub const AWS_BUCKET_NOT_FOUND: i32 = 12;
    pub const AWS_OBJECT_NOT_FOUND: i32 = 13;
    pub const AWS_ACCESS_DENIED: i32 = 14;
    pub const AWS_INVALID_CREDENTIALS: i32 = 15;
    pub const AWS_SIGNATURE_DOES_NOT_MATCH: i32 = 16;
    pub const AWS_ERROR: i32 = 17;

    /// Whether a failure with this number may clear up after reopening.
    pub fn is_transient(number: i32) -> bool {
        matches!(
            number,
            APP_DEFINED
                | OUT_OF_MEMORY
                | FILE_IO
                | OPEN_FAILED
                | OBJECT_NULL
                | HTTP_RESPONSE
                | AWS_ERROR
                | USER_INTERRUPT
        )
    }
}

/// Pixel types a window can be read as. Values match GDAL's `GDALDataType`.
#[repr(i32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelType {
    Byte = 1,
    UInt16 = 2,
    Int16 = 3,
    UInt32 = 4,
    Int32 = 5,
    Float32 = 6,
    Float64 = 7,
}

impl PixelType {
    pub const fn size(self) -> usize {
        match self {
            PixelType::Byte => 1,
            PixelType::UInt16 | PixelType::Int16 => 2,
            PixelType::UInt32 | PixelType::Int32 | PixelType::Float32 => 4,
            PixelType::Float64 => 8,
        }
    }

    pub const fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            1 => PixelType::Byte,
            2 => PixelType::UInt16,
            3 => PixelType::Int16,
            4 => PixelType::UInt32,
            5 => PixelType::Int32,
            6 => PixelType::Float32,
            7 => PixelType::Float64,
            _ => return None,
        })
    }

    /// Encode `value` as this type, native-endian, saturating like a C cast.
    pub fn encode(self, value: f64, out: &mut [u8]) {
        match self {
            PixelType::Byte => out.copy_from_slice(&[value as u8]),
            PixelType::UInt16 => out.copy_from_slice(&(value as u16).to_ne_bytes()),
            PixelType::Int16 => out.copy_from_slice(&(value as i16).to_ne_bytes()),
            PixelType::UInt32 => out.copy_from_slice(&(value as u32).to_ne_bytes()),
            PixelType::Int32 => out.copy_from_slice(&(value as i32).to_ne_bytes()),
            PixelType::Float32 => out.copy_from_slice(&(value as f32).to_ne_bytes()),
            PixelType::Float64 => out.copy_from_slice(&value.to_ne_bytes()),
        }
    }
}

/// Source rectangle in pixel space of the addressed view.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Window {
    pub offset: (isize, isize),
    pub size: (usize, usize),
}

impl Window {
    pub fn new(x: isize, y: isize, width: usize, height: usize) -> Self {
        Self {
            offset: (x, y),
            size: (width, height),
        }
    }

    /// Whether the window lies entirely inside a raster of `raster_size`.
    pub fn fits(&self, raster_size: (usize, usize)) -> bool {
        let (x, y) = self.offset;
        x >= 0
            && y >= 0
            && (x as usize).saturating_add(self.size.0) <= raster_size.0
            && (y as usize).saturating_add(self.size.1) <= raster_size.1
    }
}

/// Bytes needed to hold a `dst_shape` read of `pixel`, or `None` if that does
/// not fit in a `usize`.
pub fn read_len(dst_shape: (usize, usize), pixel: PixelType) -> Option<usize> {
    dst_shape
        .0
        .checked_mul(dst_shape.1)?
        .checked_mul(pixel.size())
}

#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistogramRequest {
    pub min: f64,
    pub max: f64,
    pub buckets: usize,
    pub include_out_of_range: bool,
    pub approx_ok: bool,
}

/// Opens datasets and forwards process-wide settings to the library.
pub trait RasterBackend: Send + Sync + 'static {
    fn open(&self, key: &DatasetKey) -> NativeResult<Box<dyn RasterDataset>>;

    /// `None` clears the option.
    fn set_option(&self, key: &str, value: Option<&str>) -> NativeResult<()>;

    fn version(&self) -> String;
}

/// One opened source and its processed view. Dropping it closes both.
///
/// Bands are 1-based; metadata calls accept band 0 for the dataset itself.
pub trait RasterDataset: Send {
    fn raster_size(&self, sel: DatasetSelector) -> NativeResult<(usize, usize)>;

    fn band_count(&self, sel: DatasetSelector) -> NativeResult<usize>;

    /// Raw GDAL data type code of the band.
    fn band_data_type(&self, sel: DatasetSelector, band: usize) -> NativeResult<i32>;

    fn band_nodata(&self, sel: DatasetSelector, band: usize) -> NativeResult<Option<f64>>;

    fn band_scale(&self, sel: DatasetSelector, band: usize) -> NativeResult<Option<f64>>;

    fn band_offset(&self, sel: DatasetSelector, band: usize) -> NativeResult<Option<f64>>;

    fn band_min_max(
        &self,
        sel: DatasetSelector,
        band: usize,
        approx_ok: bool,
    ) -> NativeResult<(f64, f64)>;

    fn band_histogram(
        &self,
        sel: DatasetSelector,
        band: usize,
        request: &HistogramRequest,
    ) -> NativeResult<Vec<u64>>;

    fn block_size(&self, sel: DatasetSelector, band: usize) -> NativeResult<(usize, usize)>;

    fn overview_sizes(&self, sel: DatasetSelector, band: usize) -> NativeResult<Vec<(usize, usize)>>;

    /// Raw GDAL color interpretation code.
    fn color_interpretation(&self, sel: DatasetSelector, band: usize) -> NativeResult<i32>;

    fn geo_transform(&self, sel: DatasetSelector) -> NativeResult<[f64; 6]>;

    fn crs_wkt(&self, sel: DatasetSelector) -> NativeResult<String>;

    fn crs_proj4(&self, sel: DatasetSelector) -> NativeResult<String>;

    fn metadata_domains(&self, sel: DatasetSelector, band: usize) -> NativeResult<Vec<String>>;

    fn metadata(&self, sel: DatasetSelector, band: usize, domain: &str) -> NativeResult<Vec<String>>;

    fn metadata_item(
        &self,
        sel: DatasetSelector,
        band: usize,
        key: &str,
        domain: &str,
    ) -> NativeResult<Option<String>>;

    /// Fill `out` (exactly `read_len(dst_shape, pixel)` bytes) with the window,
    /// resampled to `dst_shape`.
    fn read_window(
        &self,
        sel: DatasetSelector,
        band: usize,
        window: Window,
        dst_shape: (usize, usize),
        pixel: PixelType,
        out: &mut [u8],
    ) -> NativeResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_codes_match_gdal() {
        assert_eq!(PixelType::Byte.code(), 1);
        assert_eq!(PixelType::Float64.code(), 7);
        assert_eq!(PixelType::from_code(6), Some(PixelType::Float32));
        // complex types are not readable through this interface
        assert_eq!(PixelType::from_code(8), None);
    }

    #[test]
    fn encode_writes_native_endian() {
        let mut out = [0u8; 2];
        PixelType::Int16.encode(-2.0, &mut out);
        assert_eq!(i16::from_ne_bytes(out), -2);

        let mut out = [0u8; 1];
        PixelType::Byte.encode(300.0, &mut out);
        assert_eq!(out[0], 255);
    }

    #[test]
    fn window_bounds() {
        assert!(Window::new(0, 0, 10, 10).fits((10, 10)));
        assert!(!Window::new(1, 0, 10, 10).fits((10, 10)));
        assert!(!Window::new(-1, 0, 2, 2).fits((10, 10)));
        assert_eq!(read_len((4, 3), PixelType::UInt16), Some(24));
        assert_eq!(read_len((usize::MAX / 4, 3), PixelType::Float64), None);
    }
}
