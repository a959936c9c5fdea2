// src/backend/memory.rs
//! In-process rasters behind the same boundary as GDAL.
//!
//! Rasters are registered by URI and opened like files. The backend counts
//! opens and live handles, can inject failures, and records any moment where
//! two threads are inside the same dataset at once.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use super::{cple, HistogramRequest, NativeResult, PixelType, RasterBackend, RasterDataset, Window};
use crate::error::NativeError;
use crate::key::{DatasetKey, DatasetSelector};

#[derive(Clone, Debug, PartialEq)]
pub struct MemoryBand {
    /// Row-major pixel values.
    pub data: Vec<f64>,
    pub data_type: PixelType,
    pub nodata: Option<f64>,
    pub scale: Option<f64>,
    pub offset: Option<f64>,
    pub block_size: (usize, usize),
    pub overviews: Vec<(usize, usize)>,
    pub color_interp: i32,
    /// Domain -> `KEY=VALUE` entries.
    pub metadata: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MemoryRaster {
    pub width: usize,
    pub height: usize,
    pub bands: Vec<MemoryBand>,
    pub transform: [f64; 6],
    pub wkt: String,
    pub proj4: String,
    pub metadata: BTreeMap<String, Vec<String>>,
}

impl MemoryRaster {
    /// A raster where band `b` holds `b * 1_000_000 + y * width + x`.
    pub fn gradient(width: usize, height: usize, band_count: usize) -> Self {
        let bands = (1..=band_count)
            .map(|b| MemoryBand {
                data: (0..width * height)
                    .map(|i| (b * 1_000_000 + i) as f64)
                    .collect(),
                data_type: PixelType::Int32,
                nodata: None,
                scale: None,
                offset: None,
                block_size: (width.min(256), height.min(256)),
                overviews: overview_chain(width, height),
                color_interp: if band_count == 1 { 1 } else { 0 },
                metadata: BTreeMap::new(),
            })
            .collect();

        let mut metadata = BTreeMap::new();
        metadata.insert(
            String::new(),
            vec!["AREA_OR_POINT=Area".to_string()],
        );
        metadata.insert(
            "IMAGE_STRUCTURE".to_string(),
            vec!["INTERLEAVE=BAND".to_string()],
        );

        Self {
            width,
            height,
            bands,
            transform: [500_000.0, 10.0, 0.0, 4_600_000.0, 0.0, -10.0],
            wkt: UTM_32N_WKT.to_string(),
            proj4: "+proj=utm +zone=32 +datum=WGS84 +units=m +no_defs".to_string(),
            metadata,
        }
    }

    pub fn with_metadata_entry(mut self, domain: &str, entry: &str) -> Self {
        self.metadata
            .entry(domain.to_string())
            .or_default()
            .push(entry.to_string());
        self
    }

    pub fn with_nodata(mut self, band: usize, nodata: f64) -> Self {
        if let Some(b) = self.bands.get_mut(band.wrapping_sub(1)) {
            b.nodata = Some(nodata);
        }
        self
    }

    /// Nearest-neighbour resize, keeping the same footprint.
    pub fn resized(&self, width: usize, height: usize) -> Self {
        let bands = self
            .bands
            .iter()
            .map(|band| {
                let mut data = Vec::with_capacity(width * height);
                for y in 0..height {
                    let sy = y * self.height / height;
                    for x in 0..width {
                        let sx = x * self.width / width;
                        data.push(band.data[sy * self.width + sx]);
                    }
                }
                MemoryBand {
                    data,
                    block_size: (width.min(256), height.min(256)),
                    overviews: overview_chain(width, height),
                    ..band.clone()
                }
            })
            .collect();

        let mut transform = self.transform;
        transform[1] *= self.width as f64 / width as f64;
        transform[5] *= self.height as f64 / height as f64;

        Self {
            width,
            height,
            bands,
            transform,
            wkt: self.wkt.clone(),
            proj4: self.proj4.clone(),
            metadata: self.metadata.clone(),
        }
    }

    fn band(&self, band: usize) -> NativeResult<&MemoryBand> {
        band.checked_sub(1)
            .and_then(|i| self.bands.get(i))
            .ok_or_else(|| {
                NativeError::permanent(
                    cple::ILLEGAL_ARG,
                    format!("band {band} out of range 1..={}", self.bands.len()),
                )
            })
    }

    fn metadata_for(&self, band: usize) -> NativeResult<&BTreeMap<String, Vec<String>>> {
        if band == 0 {
            Ok(&self.metadata)
        } else {
            Ok(&self.band(band)?.metadata)
        }
    }
}

fn overview_chain(width: usize, height: usize) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let (mut w, mut h) = (width / 2, height / 2);
    while w >= 64 && h >= 64 {
        out.push((w, h));
        w /= 2;
        h /= 2;
    }
    out
}

const UTM_32N_WKT: &str = "PROJCS[\"WGS 84 / UTM zone 32N\",GEOGCS[\"WGS 84\",DATUM[\"WGS_1984\",SPHEROID[\"WGS 84\",6378137,298.257223563]],PRIMEM[\"Greenwich\",0],UNIT[\"degree\",0.0174532925199433]],PROJECTION[\"Transverse_Mercator\"],PARAMETER[\"central_meridian\",9],PARAMETER[\"scale_factor\",0.9996],PARAMETER[\"false_easting\",500000],UNIT[\"metre\",1],AUTHORITY[\"EPSG\",\"32632\"]]";

#[derive(Default)]
struct Faults {
    failing_opens: usize,
    open_transient: bool,
    failing_calls: usize,
    call_transient: bool,
}

#[derive(Default)]
struct Shared {
    rasters: RwLock<HashMap<String, Arc<MemoryRaster>>>,
    faults: Mutex<HashMap<String, Faults>>,
    epochs: Mutex<HashMap<String, u64>>,
    opens: Mutex<HashMap<String, usize>>,
    options: Mutex<HashMap<String, String>>,
    /// Option name -> whether setting it fails transiently.
    rejected_options: Mutex<HashMap<String, bool>>,
    live: AtomicUsize,
    max_live: AtomicUsize,
    native_calls: AtomicUsize,
    in_call: AtomicUsize,
    max_in_call: AtomicUsize,
    violations: AtomicUsize,
    delay_micros: AtomicU64,
    close_delay_micros: AtomicU64,
}

impl Shared {
    fn epoch(&self, uri: &str) -> u64 {
        self.epochs.lock().get(uri).copied().unwrap_or(0)
    }
}

/// Backend over [`MemoryRaster`]s. Cloning shares the registry and counters.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, uri: impl Into<String>, raster: MemoryRaster) {
        self.shared.rasters.write().insert(uri.into(), Arc::new(raster));
    }

    /// The next `n` opens of `uri` fail.
    pub fn fail_next_opens(&self, uri: &str, n: usize, transient: bool) {
        let mut faults = self.shared.faults.lock();
        let f = faults.entry(uri.to_string()).or_default();
        f.failing_opens = n;
        f.open_transient = transient;
    }

    /// The next `n` calls against any open dataset of `uri` fail.
    pub fn fail_next_calls(&self, uri: &str, n: usize, transient: bool) {
        let mut faults = self.shared.faults.lock();
        let f = faults.entry(uri.to_string()).or_default();
        f.failing_calls = n;
        f.call_transient = transient;
    }

    /// Every dataset of `uri` opened so far reports a stale handle on its next
    /// call, until it is reopened.
    pub fn expire_handles(&self, uri: &str) {
        *self.shared.epochs.lock().entry(uri.to_string()).or_insert(0) += 1;
    }

    /// Sleep inside every native call, to widen race windows in tests.
    pub fn set_call_delay(&self, delay: Duration) {
        self.shared
            .delay_micros
            .store(delay.as_micros() as u64, Ordering::Relaxed);
    }

    /// Sleep while closing every dataset, before it stops counting as live.
    pub fn set_close_delay(&self, delay: Duration) {
        self.shared
            .close_delay_micros
            .store(delay.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn opens(&self, uri: &str) -> usize {
        self.shared.opens.lock().get(uri).copied().unwrap_or(0)
    }

    pub fn live_handles(&self) -> usize {
        self.shared.live.load(Ordering::SeqCst)
    }

    pub fn max_live_handles(&self) -> usize {
        self.shared.max_live.load(Ordering::SeqCst)
    }

    pub fn native_calls(&self) -> usize {
        self.shared.native_calls.load(Ordering::SeqCst)
    }

    /// Most native calls seen in progress at once, across all datasets.
    pub fn max_concurrent_calls(&self) -> usize {
        self.shared.max_in_call.load(Ordering::SeqCst)
    }

    /// Times two threads were found inside one dataset simultaneously.
    pub fn overlap_violations(&self) -> usize {
        self.shared.violations.load(Ordering::SeqCst)
    }

    /// Every attempt to set `key` fails.
    pub fn reject_option(&self, key: &str, transient: bool) {
        self.shared
            .rejected_options
            .lock()
            .insert(key.to_string(), transient);
    }

    pub fn option(&self, key: &str) -> Option<String> {
        self.shared.options.lock().get(key).cloned()
    }

    fn take_open_fault(&self, uri: &str) -> Option<NativeError> {
        let mut faults = self.shared.faults.lock();
        let f = faults.get_mut(uri)?;
        if f.failing_opens == 0 {
            return None;
        }
        f.failing_opens -= 1;
        Some(if f.open_transient {
            NativeError::transient(cple::OPEN_FAILED, format!("injected open failure for {uri}"))
        } else {
            NativeError::permanent(cple::NOT_SUPPORTED, format!("injected open failure for {uri}"))
        })
    }
}

impl RasterBackend for MemoryBackend {
    fn open(&self, key: &DatasetKey) -> NativeResult<Box<dyn RasterDataset>> {
        *self.shared.opens.lock().entry(key.uri.clone()).or_insert(0) += 1;

        if let Some(err) = self.take_open_fault(&key.uri) {
            return Err(err);
        }

        let source = self
            .shared
            .rasters
            .read()
            .get(&key.uri)
            .cloned()
            .ok_or_else(|| {
                NativeError::permanent(
                    cple::OPEN_FAILED,
                    format!("`{}' does not exist in the memory registry", key.uri),
                )
            })?;

        let processed = match key.option_values("-ts", 2) {
            Some(values) => {
                let parse = |s: &str| {
                    s.parse::<usize>().ok().filter(|v| *v > 0).ok_or_else(|| {
                        NativeError::permanent(cple::ILLEGAL_ARG, format!("bad -ts value `{s}'"))
                    })
                };
                let (w, h) = (parse(values[0].as_str())?, parse(values[1].as_str())?);
                Arc::new(source.resized(w, h))
            }
            None => Arc::clone(&source),
        };

        let live = self.shared.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_live.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(MemoryDataset {
            shared: Arc::clone(&self.shared),
            uri: key.uri.clone(),
            epoch: self.shared.epoch(&key.uri),
            source,
            processed,
            busy: AtomicBool::new(false),
        }))
    }

    fn set_option(&self, key: &str, value: Option<&str>) -> NativeResult<()> {
        if let Some(&transient) = self.shared.rejected_options.lock().get(key) {
            let msg = format!("option {key} rejected");
            return Err(if transient {
                NativeError::transient(cple::APP_DEFINED, msg)
            } else {
                NativeError::permanent(cple::ILLEGAL_ARG, msg)
            });
        }
        let mut options = self.shared.options.lock();
        match value {
            Some(v) => options.insert(key.to_string(), v.to_string()),
            None => options.remove(key),
        };
        Ok(())
    }

    fn version(&self) -> String {
        format!("memory {}", env!("CARGO_PKG_VERSION"))
    }
}

struct MemoryDataset {
    shared: Arc<Shared>,
    uri: String,
    epoch: u64,
    source: Arc<MemoryRaster>,
    processed: Arc<MemoryRaster>,
    busy: AtomicBool,
}

struct CallGuard<'a> {
    busy: &'a AtomicBool,
    in_call: &'a AtomicUsize,
    owned: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.in_call.fetch_sub(1, Ordering::SeqCst);
        if self.owned {
            self.busy.store(false, Ordering::SeqCst);
        }
    }
}

impl MemoryDataset {
    /// Bookkeeping shared by every native call.
    fn enter(&self, sel: DatasetSelector) -> NativeResult<(CallGuard<'_>, &MemoryRaster)> {
        self.shared.native_calls.fetch_add(1, Ordering::SeqCst);

        let owned = !self.busy.swap(true, Ordering::SeqCst);
        if !owned {
            self.shared.violations.fetch_add(1, Ordering::SeqCst);
        }
        let in_call = self.shared.in_call.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_in_call.fetch_max(in_call, Ordering::SeqCst);
        let guard = CallGuard {
            busy: &self.busy,
            in_call: &self.shared.in_call,
            owned,
        };

        let delay = self.shared.delay_micros.load(Ordering::Relaxed);
        if delay > 0 {
            thread::sleep(Duration::from_micros(delay));
        }

        if self.shared.epoch(&self.uri) != self.epoch {
            return Err(NativeError::transient(
                cple::OBJECT_NULL,
                format!("handle for {} has expired", self.uri),
            ));
        }

        {
            let mut faults = self.shared.faults.lock();
            if let Some(f) = faults.get_mut(&self.uri) {
                if f.failing_calls > 0 {
                    f.failing_calls -= 1;
                    let msg = format!("injected call failure for {}", self.uri);
                    return Err(if f.call_transient {
                        NativeError::transient(cple::FILE_IO, msg)
                    } else {
                        NativeError::permanent(cple::NOT_SUPPORTED, msg)
                    });
                }
            }
        }

        let raster = match sel {
            DatasetSelector::Source => &*self.source,
            DatasetSelector::Processed => &*self.processed,
        };
        Ok((guard, raster))
    }
}

impl Drop for MemoryDataset {
    fn drop(&mut self) {
        let delay = self.shared.close_delay_micros.load(Ordering::Relaxed);
        if delay > 0 {
            thread::sleep(Duration::from_micros(delay));
        }
        self.shared.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RasterDataset for MemoryDataset {
    fn raster_size(&self, sel: DatasetSelector) -> NativeResult<(usize, usize)> {
        let (_g, r) = self.enter(sel)?;
        Ok((r.width, r.height))
    }

    fn band_count(&self, sel: DatasetSelector) -> NativeResult<usize> {
        let (_g, r) = self.enter(sel)?;
        Ok(r.bands.len())
    }

    fn band_data_type(&self, sel: DatasetSelector, band: usize) -> NativeResult<i32> {
        let (_g, r) = self.enter(sel)?;
        Ok(r.band(band)?.data_type.code())
    }

    fn band_nodata(&self, sel: DatasetSelector, band: usize) -> NativeResult<Option<f64>> {
        let (_g, r) = self.enter(sel)?;
        Ok(r.band(band)?.nodata)
    }

    fn band_scale(&self, sel: DatasetSelector, band: usize) -> NativeResult<Option<f64>> {
        let (_g, r) = self.enter(sel)?;
        Ok(r.band(band)?.scale)
    }

    fn band_offset(&self, sel: DatasetSelector, band: usize) -> NativeResult<Option<f64>> {
        let (_g, r) = self.enter(sel)?;
        Ok(r.band(band)?.offset)
    }

    fn band_min_max(
        &self,
        sel: DatasetSelector,
        band: usize,
        _approx_ok: bool,
    ) -> NativeResult<(f64, f64)> {
        let (_g, r) = self.enter(sel)?;
        let b = r.band(band)?;
        b.data
            .iter()
            .copied()
            .filter(|v| Some(*v) != b.nodata)
            .fold(None, |acc: Option<(f64, f64)>, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
            .ok_or_else(|| NativeError::permanent(cple::APP_DEFINED, "band has no valid pixels"))
    }

    fn band_histogram(
        &self,
        sel: DatasetSelector,
        band: usize,
        request: &HistogramRequest,
    ) -> NativeResult<Vec<u64>> {
        let (_g, r) = self.enter(sel)?;
        let b = r.band(band)?;
        if request.buckets == 0 || request.max <= request.min {
            return Err(NativeError::permanent(cple::ILLEGAL_ARG, "empty histogram range"));
        }

        let mut counts = vec![0u64; request.buckets];
        let width = (request.max - request.min) / request.buckets as f64;
        for &v in b.data.iter().filter(|v| Some(**v) != b.nodata) {
            let idx = ((v - request.min) / width).floor();
            let idx = if idx < 0.0 {
                if !request.include_out_of_range {
                    continue;
                }
                0
            } else if idx as usize >= request.buckets {
                if !request.include_out_of_range {
                    continue;
                }
                request.buckets - 1
            } else {
                idx as usize
            };
            counts[idx] += 1;
        }
        Ok(counts)
    }

    fn block_size(&self, sel: DatasetSelector, band: usize) -> NativeResult<(usize, usize)> {
        let (_g, r) = self.enter(sel)?;
        Ok(r.band(band)?.block_size)
    }

    fn overview_sizes(&self, sel: DatasetSelector, band: usize) -> NativeResult<Vec<(usize, usize)>> {
        let (_g, r) = self.enter(sel)?;
        Ok(r.band(band)?.overviews.clone())
    }

    fn color_interpretation(&self, sel: DatasetSelector, band: usize) -> NativeResult<i32> {
        let (_g, r) = self.enter(sel)?;
        Ok(r.band(band)?.color_interp)
    }

    fn geo_transform(&self, sel: DatasetSelector) -> NativeResult<[f64; 6]> {
        let (_g, r) = self.enter(sel)?;
        Ok(r.transform)
    }

    fn crs_wkt(&self, sel: DatasetSelector) -> NativeResult<String> {
        let (_g, r) = self.enter(sel)?;
        Ok(r.wkt.clone())
    }

    fn crs_proj4(&self, sel: DatasetSelector) -> NativeResult<String> {
        let (_g, r) = self.enter(sel)?;
        Ok(r.proj4.clone())
    }

    fn metadata_domains(&self, sel: DatasetSelector, band: usize) -> NativeResult<Vec<String>> {
        let (_g, r) = self.enter(sel)?;
        Ok(r.metadata_for(band)?.keys().cloned().collect())
    }

    fn metadata(&self, sel: DatasetSelector, band: usize, domain: &str) -> NativeResult<Vec<String>> {
        let (_g, r) = self.enter(sel)?;
        Ok(r.metadata_for(band)?
            .get(domain)
            .cloned()
            .unwrap_or_default())
    }

    fn metadata_item(
        &self,
        sel: DatasetSelector,
        band: usize,
        key: &str,
        domain: &str,
    ) -> NativeResult<Option<String>> {
        let (_g, r) = self.enter(sel)?;
        Ok(r.metadata_for(band)?.get(domain).and_then(|entries| {
            entries.iter().find_map(|entry| {
                entry
                    .split_once('=')
                    .filter(|(k, _)| *k == key)
                    .map(|(_, v)| v.to_string())
            })
        }))
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
        let (_g, r) = self.enter(sel)?;
        let b = r.band(band)?;
        if !window.fits((r.width, r.height)) || window.size.0 == 0 || window.size.1 == 0 {
            return Err(NativeError::permanent(
                cple::ILLEGAL_ARG,
                format!("window {window:?} outside {}x{}", r.width, r.height),
            ));
        }
        if super::read_len(dst_shape, pixel) != Some(out.len()) {
            return Err(NativeError::permanent(cple::ILLEGAL_ARG, "output length mismatch"));
        }

        let (x0, y0) = (window.offset.0 as usize, window.offset.1 as usize);
        let (ww, wh) = window.size;
        let (dw, dh) = dst_shape;
        let size = pixel.size();
        for dy in 0..dh {
            let sy = y0 + dy * wh / dh;
            for dx in 0..dw {
                let sx = x0 + dx * ww / dw;
                let i = (dy * dw + dx) * size;
                pixel.encode(b.data[sy * r.width + sx], &mut out[i..i + size]);
            }
        }
        Ok(())
    }
}
