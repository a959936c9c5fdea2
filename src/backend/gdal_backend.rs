// src/backend/gdal_backend.rs
use std::env;
use std::ffi::{c_char, c_int, CStr, CString};
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

use gdal::errors::{CplErrType, GdalError};
use gdal::raster::RasterBand;
use gdal::{Dataset, DriverManager, Metadata};
use tracing::{debug, error, info, warn};

use super::{cple, HistogramRequest, NativeResult, PixelType, RasterBackend, RasterDataset, Window};
use crate::error::{NativeError, WarpError, WarpResult};
use crate::key::{DatasetKey, DatasetSelector};

const DEFAULT_MAX_ERROR_REPORTS: usize = 1000;

/// Backend over the GDAL library. Each opened dataset holds the source plus a
/// warped VRT built from the key's options.
pub struct GdalBackend {
    _priv: (),
}

impl GdalBackend {
    /// Register every driver and route CPL errors into `tracing`.
    pub fn new() -> WarpResult<Self> {
        DriverManager::register_all();
        if DriverManager::count() == 0 {
            return Err(WarpError::InitializationFailure(
                "GDAL reports no registered raster drivers".to_string(),
            ));
        }
        install_error_handler();
        info!(
            version = %gdal::version::version_info("RELEASE_NAME"),
            drivers = DriverManager::count(),
            "GDAL initialized"
        );
        Ok(Self { _priv: () })
    }
}

/// Report CPL errors through `tracing`, at most `CPL_MAX_ERROR_REPORTS` times.
fn install_error_handler() {
    let max_reports = env::var("CPL_MAX_ERROR_REPORTS")
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(DEFAULT_MAX_ERROR_REPORTS);
    let reported = AtomicUsize::new(0);

    gdal::config::set_error_handler(move |class, number, msg| {
        let n = reported.fetch_add(1, Ordering::Relaxed) + 1;
        if n > max_reports {
            return;
        }
        match class {
            CplErrType::None | CplErrType::Debug => {
                debug!(number, report = n, max_reports, "{msg}")
            }
            CplErrType::Warning => warn!(number, report = n, max_reports, "{msg}"),
            CplErrType::Failure => error!(number, report = n, max_reports, "{msg}"),
            CplErrType::Fatal => error!(number, report = n, max_reports, fatal = true, "{msg}"),
        }
    });
}

/// Split GDAL failures into ones worth a reopen and ones that are not.
fn classify(err: GdalError) -> NativeError {
    match err {
        GdalError::CplError { number, msg, .. } => {
            if cple::is_transient(number) {
                NativeError::transient(number, msg)
            } else {
                NativeError::permanent(number, msg)
            }
        }
        GdalError::NullPointer { method_name, msg } => {
            NativeError::transient(cple::OBJECT_NULL, format!("{method_name}: {msg}"))
        }
        other => NativeError::permanent(cple::ILLEGAL_ARG, other.to_string()),
    }
}

/// A plain local path that is not there will not appear on reopen. Virtual
/// file systems and driver-prefixed names are left to GDAL.
fn missing_local_file(uri: &str) -> Option<NativeError> {
    let plain = !uri.starts_with("/vsi") && !uri.contains(':');
    (plain && !Path::new(uri).exists()).then(|| {
        NativeError::permanent(cple::OPEN_FAILED, format!("`{uri}' does not exist"))
    })
}

fn last_cpl_error(fallback: &str) -> NativeError {
    // SAFETY: both calls only read the calling thread's error context.
    let (number, msg) = unsafe {
        let number = gdal_sys::CPLGetLastErrorNo();
        let msg = gdal_sys::CPLGetLastErrorMsg();
        let msg = if msg.is_null() {
            String::new()
        } else {
            CStr::from_ptr(msg).to_string_lossy().into_owned()
        };
        (number, msg)
    };
    let msg = if msg.is_empty() { fallback.to_string() } else { msg };
    if number == 0 || cple::is_transient(number) {
        NativeError::transient(if number == 0 { cple::APP_DEFINED } else { number }, msg)
    } else {
        NativeError::permanent(number, msg)
    }
}

fn check(err: gdal_sys::CPLErr::Type, what: &str) -> NativeResult<()> {
    if err == gdal_sys::CPLErr::CE_None {
        Ok(())
    } else {
        Err(last_cpl_error(what))
    }
}

/// Build the warped view of `source` as an in-memory VRT.
fn warp_to_vrt(source: &Dataset, options: &[String]) -> NativeResult<Dataset> {
    let args = options
        .iter()
        .map(String::as_str)
        .chain(["-of", "VRT"])
        .map(CString::new)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| NativeError::permanent(cple::ILLEGAL_ARG, e.to_string()))?;
    let mut argv: Vec<*mut c_char> = args
        .iter()
        .map(|a| a.as_ptr() as *mut c_char)
        .chain(std::iter::once(ptr::null_mut()))
        .collect();
    let dest = CString::default();

    // SAFETY: `argv` is NUL-terminated and outlives the options object, which
    // is freed before returning. The source handle stays owned by `source`.
    unsafe {
        let app_options = gdal_sys::GDALWarpAppOptionsNew(argv.as_mut_ptr(), ptr::null_mut());
        if app_options.is_null() {
            return Err(NativeError::permanent(
                cple::ILLEGAL_ARG,
                format!("rejected warp options {options:?}"),
            ));
        }

        let mut src = source.c_dataset();
        let mut usage_error: c_int = 0;
        let handle = gdal_sys::GDALWarp(
            dest.as_ptr(),
            ptr::null_mut(),
            1,
            &mut src,
            app_options,
            &mut usage_error,
        );
        gdal_sys::GDALWarpAppOptionsFree(app_options);

        if usage_error != 0 {
            return Err(NativeError::permanent(
                cple::ILLEGAL_ARG,
                format!("invalid warp options {options:?}"),
            ));
        }
        if handle.is_null() {
            return Err(last_cpl_error("GDALWarp returned no dataset"));
        }
        Ok(Dataset::from_c_dataset(handle))
    }
}

impl RasterBackend for GdalBackend {
    fn open(&self, key: &DatasetKey) -> NativeResult<Box<dyn RasterDataset>> {
        if let Some(err) = missing_local_file(&key.uri) {
            return Err(err);
        }
        let source = Dataset::open(&key.uri).map_err(classify)?;
        let warped = warp_to_vrt(&source, &key.options)?;
        debug!(key = %key, "opened GDAL dataset");
        Ok(Box::new(GdalDataset { warped, source }))
    }

    fn set_option(&self, key: &str, value: Option<&str>) -> NativeResult<()> {
        match value {
            Some(value) => gdal::config::set_config_option(key, value),
            None => gdal::config::clear_config_option(key),
        }
        .map_err(classify)
    }

    fn version(&self) -> String {
        gdal::version::version_info("RELEASE_NAME")
    }
}

/// `warped` references `source`, so it is declared first and dropped first.
struct GdalDataset {
    warped: Dataset,
    source: Dataset,
}

fn metadata_domains<M: Metadata>(m: &M) -> Vec<String> {
    m.metadata_domains()
}

fn metadata_domain<M: Metadata>(m: &M, domain: &str) -> Vec<String> {
    m.metadata_domain(domain).unwrap_or_default()
}

fn metadata_item<M: Metadata>(m: &M, key: &str, domain: &str) -> Option<String> {
    m.metadata_item(key, domain)
}

macro_rules! read_typed {
    ($band:expr, $window:expr, $dst:expr, $out:expr, $t:ty) => {{
        let buffer = $band
            .read_as::<$t>($window.offset, $window.size, $dst, None)
            .map_err(classify)?;
        let size = std::mem::size_of::<$t>();
        for (chunk, value) in $out.chunks_exact_mut(size).zip(buffer.data()) {
            chunk.copy_from_slice(&value.to_ne_bytes());
        }
    }};
}

impl GdalDataset {
    fn view(&self, sel: DatasetSelector) -> &Dataset {
        match sel {
            DatasetSelector::Source => &self.source,
            DatasetSelector::Processed => &self.warped,
        }
    }

    fn band(&self, sel: DatasetSelector, band: usize) -> NativeResult<RasterBand<'_>> {
        let ds = self.view(sel);
        let count = ds.raster_count() as usize;
        if band == 0 || band > count {
            return Err(NativeError::permanent(
                cple::ILLEGAL_ARG,
                format!("band {band} out of range 1..={count}"),
            ));
        }
        ds.rasterband(band as _).map_err(classify)
    }
}

impl RasterDataset for GdalDataset {
    fn raster_size(&self, sel: DatasetSelector) -> NativeResult<(usize, usize)> {
        Ok(self.view(sel).raster_size())
    }

    fn band_count(&self, sel: DatasetSelector) -> NativeResult<usize> {
        Ok(self.view(sel).raster_count() as usize)
    }

    fn band_data_type(&self, sel: DatasetSelector, band: usize) -> NativeResult<i32> {
        let band = self.band(sel, band)?;
        // SAFETY: the band handle is valid while `band` borrows the dataset.
        Ok(unsafe { gdal_sys::GDALGetRasterDataType(band.c_rasterband()) } as i32)
    }

    fn band_nodata(&self, sel: DatasetSelector, band: usize) -> NativeResult<Option<f64>> {
        Ok(self.band(sel, band)?.no_data_value())
    }

    fn band_scale(&self, sel: DatasetSelector, band: usize) -> NativeResult<Option<f64>> {
        Ok(self.band(sel, band)?.scale())
    }

    fn band_offset(&self, sel: DatasetSelector, band: usize) -> NativeResult<Option<f64>> {
        Ok(self.band(sel, band)?.offset())
    }

    fn band_min_max(
        &self,
        sel: DatasetSelector,
        band: usize,
        approx_ok: bool,
    ) -> NativeResult<(f64, f64)> {
        let band = self.band(sel, band)?;
        let (mut min, mut max, mut mean, mut std_dev) = (0.0, 0.0, 0.0, 0.0);
        // SAFETY: out-pointers are valid locals.
        let err = unsafe {
            gdal_sys::GDALGetRasterStatistics(
                band.c_rasterband(),
                approx_ok as c_int,
                1,
                &mut min,
                &mut max,
                &mut mean,
                &mut std_dev,
            )
        };
        check(err, "GDALGetRasterStatistics failed")?;
        Ok((min, max))
    }

    fn band_histogram(
        &self,
        sel: DatasetSelector,
        band: usize,
        request: &HistogramRequest,
    ) -> NativeResult<Vec<u64>> {
        let band = self.band(sel, band)?;
        let buckets = c_int::try_from(request.buckets)
            .ok()
            .filter(|b| *b > 0)
            .ok_or_else(|| NativeError::permanent(cple::ILLEGAL_ARG, "bad bucket count"))?;
        let mut counts = vec![0u64; request.buckets];
        // SAFETY: `counts` holds exactly `buckets` entries.
        let err = unsafe {
            gdal_sys::GDALGetRasterHistogramEx(
                band.c_rasterband(),
                request.min,
                request.max,
                buckets,
                counts.as_mut_ptr() as _,
                request.include_out_of_range as c_int,
                request.approx_ok as c_int,
                None,
                ptr::null_mut(),
            )
        };
        check(err, "GDALGetRasterHistogramEx failed")?;
        Ok(counts)
    }

    fn block_size(&self, sel: DatasetSelector, band: usize) -> NativeResult<(usize, usize)> {
        Ok(self.band(sel, band)?.block_size())
    }

    fn overview_sizes(&self, sel: DatasetSelector, band: usize) -> NativeResult<Vec<(usize, usize)>> {
        let band = self.band(sel, band)?;
        // SAFETY: overview handles are owned by the parent band and only read.
        unsafe {
            let handle = band.c_rasterband();
            let count = gdal_sys::GDALGetOverviewCount(handle).max(0);
            (0..count)
                .map(|i| {
                    let ov = gdal_sys::GDALGetOverview(handle, i);
                    if ov.is_null() {
                        Err(last_cpl_error("GDALGetOverview returned null"))
                    } else {
                        Ok((
                            gdal_sys::GDALGetRasterBandXSize(ov) as usize,
                            gdal_sys::GDALGetRasterBandYSize(ov) as usize,
                        ))
                    }
                })
                .collect()
        }
    }

    fn color_interpretation(&self, sel: DatasetSelector, band: usize) -> NativeResult<i32> {
        let band = self.band(sel, band)?;
        // SAFETY: the band handle is valid while `band` borrows the dataset.
        Ok(unsafe { gdal_sys::GDALGetRasterColorInterpretation(band.c_rasterband()) } as i32)
    }

    fn geo_transform(&self, sel: DatasetSelector) -> NativeResult<[f64; 6]> {
        self.view(sel).geo_transform().map_err(classify)
    }

    fn crs_wkt(&self, sel: DatasetSelector) -> NativeResult<String> {
        Ok(self.view(sel).projection())
    }

    fn crs_proj4(&self, sel: DatasetSelector) -> NativeResult<String> {
        self.view(sel)
            .spatial_ref()
            .and_then(|srs| srs.to_proj4())
            .map_err(classify)
    }

    fn metadata_domains(&self, sel: DatasetSelector, band: usize) -> NativeResult<Vec<String>> {
        if band == 0 {
            Ok(metadata_domains(self.view(sel)))
        } else {
            Ok(metadata_domains(&self.band(sel, band)?))
        }
    }

    fn metadata(&self, sel: DatasetSelector, band: usize, domain: &str) -> NativeResult<Vec<String>> {
        if band == 0 {
            Ok(metadata_domain(self.view(sel), domain))
        } else {
            Ok(metadata_domain(&self.band(sel, band)?, domain))
        }
    }

    fn metadata_item(
        &self,
        sel: DatasetSelector,
        band: usize,
        key: &str,
        domain: &str,
    ) -> NativeResult<Option<String>> {
        if band == 0 {
            Ok(metadata_item(self.view(sel), key, domain))
        } else {
            Ok(metadata_item(&self.band(sel, band)?, key, domain))
        }
    }

    fn read_window(
        &self,
        sel: DatasetSelector,
        band: usize,
        window: Window,
        dst_shape: (usize, usize),
        pixel: PixelType,
        out: &mut [u8],
    ) -> NativeResult<()> {
        let raster_size = self.view(sel).raster_size();
        if !window.fits(raster_size) {
            return Err(NativeError::permanent(
                cple::ILLEGAL_ARG,
                format!("window {window:?} outside {}x{}", raster_size.0, raster_size.1),
            ));
        }
        let band = self.band(sel, band)?;
        match pixel {
            PixelType::Byte => read_typed!(band, window, dst_shape, out, u8),
            PixelType::UInt16 => read_typed!(band, window, dst_shape, out, u16),
            PixelType::Int16 => read_typed!(band, window, dst_shape, out, i16),
            PixelType::UInt32 => read_typed!(band, window, dst_shape, out, u32),
            PixelType::Int32 => read_typed!(band, window, dst_shape, out, i32),
            PixelType::Float32 => read_typed!(band, window, dst_shape, out, f32),
            PixelType::Float64 => read_typed!(band, window, dst_shape, out, f64),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpl_errors_are_classified_by_number() {
        let err = classify(GdalError::CplError {
            class: gdal_sys::CPLErr::CE_Failure,
            number: cple::OPEN_FAILED,
            msg: "no such file".into(),
        });
        assert!(err.is_transient());

        let err = classify(GdalError::CplError {
            class: gdal_sys::CPLErr::CE_Failure,
            number: cple::ILLEGAL_ARG,
            msg: "bad window".into(),
        });
        assert!(!err.is_transient());
    }

    #[test]
    fn missing_local_files_are_permanent() {
        let err = missing_local_file("/nonexistent/warp-pool/typo.tif").unwrap();
        assert!(!err.is_transient());
        assert_eq!(missing_local_file("/vsicurl/https://example.com/a.tif"), None);
        assert_eq!(missing_local_file("NETCDF:\"a.nc\":var"), None);
        let file = tempfile::NamedTempFile::new().unwrap();
        assert_eq!(missing_local_file(&file.path().to_string_lossy()), None);
    }

    #[test]
    fn null_pointers_are_transient() {
        let err = classify(GdalError::NullPointer {
            method_name: "GDALOpenEx",
            msg: String::new(),
        });
        assert_eq!(
            err,
            NativeError::transient(cple::OBJECT_NULL, "GDALOpenEx: ")
        );
    }
}
