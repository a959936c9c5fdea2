// src/ops.rs
//! Typed operations on a [`WarpContext`].
//!
//! Every operation takes the token, the view it addresses and an attempt
//! bound, and reports how many tries it took. The `_into` forms write into a
//! caller buffer and return the bytes used; the plain forms grow a
//! thread-local scratch buffer until the value fits.

use serde::{Deserialize, Serialize};

use crate::backend::{cple, read_len, HistogramRequest, PixelType, Window};
use crate::buffer;
use crate::context::WarpContext;
use crate::error::{WarpError, WarpResult};
use crate::key::DatasetSelector;
use crate::retry::{Attempted, Attempts};
use crate::tokens::Token;

/// One band window, resampled to `dst_shape` and converted to `pixel`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub band: usize,
    pub window: Window,
    pub dst_shape: (usize, usize),
    pub pixel: PixelType,
}

impl ReadRequest {
    /// Read `window` at its own resolution.
    pub fn new(band: usize, window: Window, pixel: PixelType) -> Self {
        Self {
            band,
            window,
            dst_shape: window.size,
            pixel,
        }
    }

    pub fn resampled_to(mut self, dst_shape: (usize, usize)) -> Self {
        self.dst_shape = dst_shape;
        self
    }

    /// Bytes the read produces. A shape too large to address is a permanent
    /// failure.
    pub fn byte_len(&self) -> WarpResult<usize> {
        read_len(self.dst_shape, self.pixel).ok_or_else(|| WarpError::Permanent {
            code: cple::ILLEGAL_ARG,
            message: format!(
                "{}x{} {:?} read does not fit in memory",
                self.dst_shape.0, self.dst_shape.1, self.pixel
            ),
        })
    }
}

impl WarpContext {
    pub fn raster_size(
        &self,
        token: Token,
        sel: DatasetSelector,
        attempts: Attempts,
    ) -> WarpResult<Attempted<(usize, usize)>> {
        self.execute(token, attempts, |ds| ds.raster_size(sel))
    }

    pub fn band_count(
        &self,
        token: Token,
        sel: DatasetSelector,
        attempts: Attempts,
    ) -> WarpResult<Attempted<usize>> {
        self.execute(token, attempts, |ds| ds.band_count(sel))
    }

    pub fn band_data_type(
        &self,
        token: Token,
        sel: DatasetSelector,
        band: usize,
        attempts: Attempts,
    ) -> WarpResult<Attempted<i32>> {
        self.execute(token, attempts, |ds| ds.band_data_type(sel, band))
    }

    pub fn band_nodata(
        &self,
        token: Token,
        sel: DatasetSelector,
        band: usize,
        attempts: Attempts,
    ) -> WarpResult<Attempted<Option<f64>>> {
        self.execute(token, attempts, |ds| ds.band_nodata(sel, band))
    }

    pub fn band_scale(
        &self,
        token: Token,
        sel: DatasetSelector,
        band: usize,
        attempts: Attempts,
    ) -> WarpResult<Attempted<Option<f64>>> {
        self.execute(token, attempts, |ds| ds.band_scale(sel, band))
    }

    pub fn band_offset(
        &self,
        token: Token,
        sel: DatasetSelector,
        band: usize,
        attempts: Attempts,
    ) -> WarpResult<Attempted<Option<f64>>> {
        self.execute(token, attempts, |ds| ds.band_offset(sel, band))
    }

    pub fn band_min_max(
        &self,
        token: Token,
        sel: DatasetSelector,
        band: usize,
        approx_ok: bool,
        attempts: Attempts,
    ) -> WarpResult<Attempted<(f64, f64)>> {
        self.execute(token, attempts, |ds| ds.band_min_max(sel, band, approx_ok))
    }

    pub fn band_histogram(
        &self,
        token: Token,
        sel: DatasetSelector,
        band: usize,
        request: &HistogramRequest,
        attempts: Attempts,
    ) -> WarpResult<Attempted<Vec<u64>>> {
        self.execute(token, attempts, |ds| ds.band_histogram(sel, band, request))
    }

    pub fn block_size(
        &self,
        token: Token,
        sel: DatasetSelector,
        band: usize,
        attempts: Attempts,
    ) -> WarpResult<Attempted<(usize, usize)>> {
        self.execute(token, attempts, |ds| ds.block_size(sel, band))
    }

    pub fn overview_sizes(
        &self,
        token: Token,
        sel: DatasetSelector,
        band: usize,
        attempts: Attempts,
    ) -> WarpResult<Attempted<Vec<(usize, usize)>>> {
        self.execute(token, attempts, |ds| ds.overview_sizes(sel, band))
    }

    pub fn color_interpretation(
        &self,
        token: Token,
        sel: DatasetSelector,
        band: usize,
        attempts: Attempts,
    ) -> WarpResult<Attempted<i32>> {
        self.execute(token, attempts, |ds| ds.color_interpretation(sel, band))
    }

    pub fn geo_transform(
        &self,
        token: Token,
        sel: DatasetSelector,
        attempts: Attempts,
    ) -> WarpResult<Attempted<[f64; 6]>> {
        self.execute(token, attempts, |ds| ds.geo_transform(sel))
    }

    /// Read a window into `out`, which must hold at least
    /// `request.byte_len()` bytes. The size check happens before anything is
    /// opened.
    pub fn read_window_into(
        &self,
        token: Token,
        sel: DatasetSelector,
        request: &ReadRequest,
        attempts: Attempts,
        out: &mut [u8],
    ) -> WarpResult<Attempted<usize>> {
        let required = request.byte_len()?;
        if out.len() < required {
            return Err(WarpError::BufferTooSmall { required });
        }
        let dst = &mut out[..required];
        self.execute(token, attempts, |ds| {
            ds.read_window(
                sel,
                request.band,
                request.window,
                request.dst_shape,
                request.pixel,
                &mut *dst,
            )
        })
        .map(|done| done.map(|()| required))
    }

    pub fn read_window(
        &self,
        token: Token,
        sel: DatasetSelector,
        request: &ReadRequest,
        attempts: Attempts,
    ) -> WarpResult<Attempted<Vec<u8>>> {
        let mut out = vec![0u8; request.byte_len()?];
        let done = self.read_window_into(token, sel, request, attempts, &mut out)?;
        Ok(done.map(|_| out))
    }

    pub fn crs_wkt_into(
        &self,
        token: Token,
        sel: DatasetSelector,
        attempts: Attempts,
        out: &mut [u8],
    ) -> WarpResult<Attempted<usize>> {
        self.execute(token, attempts, |ds| ds.crs_wkt(sel))?
            .try_map(|wkt| buffer::write_str(out, &wkt))
    }

    pub fn crs_proj4_into(
        &self,
        token: Token,
        sel: DatasetSelector,
        attempts: Attempts,
        out: &mut [u8],
    ) -> WarpResult<Attempted<usize>> {
        self.execute(token, attempts, |ds| ds.crs_proj4(sel))?
            .try_map(|proj4| buffer::write_str(out, &proj4))
    }

    /// Band 0 addresses the dataset itself.
    pub fn metadata_domains_into(
        &self,
        token: Token,
        sel: DatasetSelector,
        band: usize,
        attempts: Attempts,
        out: &mut [u8],
    ) -> WarpResult<Attempted<usize>> {
        self.execute(token, attempts, |ds| ds.metadata_domains(sel, band))?
            .try_map(|domains| buffer::write_list(out, &domains))
    }

    pub fn metadata_into(
        &self,
        token: Token,
        sel: DatasetSelector,
        band: usize,
        domain: &str,
        attempts: Attempts,
        out: &mut [u8],
    ) -> WarpResult<Attempted<usize>> {
        self.execute(token, attempts, |ds| ds.metadata(sel, band, domain))?
            .try_map(|entries| buffer::write_list(out, &entries))
    }

    /// Writes nothing and reports zero bytes when the item is absent.
    #[allow(clippy::too_many_arguments)]
    pub fn metadata_item_into(
        &self,
        token: Token,
        sel: DatasetSelector,
        band: usize,
        key: &str,
        domain: &str,
        attempts: Attempts,
        out: &mut [u8],
    ) -> WarpResult<Attempted<usize>> {
        self.execute(token, attempts, |ds| ds.metadata_item(sel, band, key, domain))?
            .try_map(|item| buffer::write_opt_str(out, item.as_deref()))
    }

    pub fn crs_wkt(
        &self,
        token: Token,
        sel: DatasetSelector,
        attempts: Attempts,
    ) -> WarpResult<Attempted<String>> {
        buffer::fill_growing(
            self.config().scratch_capacity,
            |buf| self.crs_wkt_into(token, sel, attempts, buf),
            buffer::decode_str,
        )
    }

    pub fn crs_proj4(
        &self,
        token: Token,
        sel: DatasetSelector,
        attempts: Attempts,
    ) -> WarpResult<Attempted<String>> {
        buffer::fill_growing(
            self.config().scratch_capacity,
            |buf| self.crs_proj4_into(token, sel, attempts, buf),
            buffer::decode_str,
        )
    }

    pub fn metadata_domains(
        &self,
        token: Token,
        sel: DatasetSelector,
        band: usize,
        attempts: Attempts,
    ) -> WarpResult<Attempted<Vec<String>>> {
        buffer::fill_growing(
            self.config().scratch_capacity,
            |buf| self.metadata_domains_into(token, sel, band, attempts, buf),
            buffer::decode_list,
        )
    }

    pub fn metadata(
        &self,
        token: Token,
        sel: DatasetSelector,
        band: usize,
        domain: &str,
        attempts: Attempts,
    ) -> WarpResult<Attempted<Vec<String>>> {
        buffer::fill_growing(
            self.config().scratch_capacity,
            |buf| self.metadata_into(token, sel, band, domain, attempts, buf),
            buffer::decode_list,
        )
    }

    pub fn metadata_item(
        &self,
        token: Token,
        sel: DatasetSelector,
        band: usize,
        key: &str,
        domain: &str,
        attempts: Attempts,
    ) -> WarpResult<Attempted<Option<String>>> {
        buffer::fill_growing(
            self.config().scratch_capacity,
            |buf| self.metadata_item_into(token, sel, band, key, domain, attempts, buf),
            buffer::decode_opt_str,
        )
    }
}
