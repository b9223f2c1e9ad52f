//! Inverse wavelet transforms and the reconstruction cascade.
//!
//! A wavelet is reconstructed as soon as its last band turns valid. The
//! inverse writes band 0 (or a frame) of the next finer level, which may in
//! turn complete that wavelet; one job follows the chain as far as the
//! reconstruction plan allows.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc;

use anyhow::{Result, anyhow, bail};
use log::{debug, info, warn};

use crate::structs::band::{Band, saturate};
use crate::structs::plan::{OutputSource, ReconstructionPlan};
use crate::structs::transform::{Target, Transform};
use crate::structs::wavelet::{Wavelet, WaveletKind};
use crate::utils::buffer_pool::{BufferPool, allocate_zeroed};
use crate::utils::errors::{CodecError, ReconstructError};

#[inline(always)]
fn predict(low: &[i32], i: usize) -> i32 {
    let n = low.len();
    if n < 3 {
        0
    } else if i == 0 {
        (3 * low[0] - 4 * low[1] + low[2] + 4) >> 3
    } else if i == n - 1 {
        (-3 * low[n - 1] + 4 * low[n - 2] - low[n - 3] + 4) >> 3
    } else {
        (low[i - 1] - low[i + 1] + 4) >> 3
    }
}

/// One 1-D inverse step: `n` lowpass and `n` highpass values into `2n`
/// samples.
pub fn inverse_lifting(low: &[i32], high: &[i32], rounding: i32, out: &mut [i32]) {
    for (i, pair) in out.chunks_exact_mut(2).take(low.len()).enumerate() {
        let p = predict(low, i);
        pair[0] = (low[i] + high[i] + p + rounding) >> 1;
        pair[1] = (low[i] - high[i] - p + rounding) >> 1;
    }
}

/// Column-wise inverse of two `width × height` bands into `width × 2height`.
pub fn inverse_vertical(
    low: &[i32],
    high: &[i32],
    width: usize,
    height: usize,
    rounding: i32,
    out: &mut [i32],
) -> Result<()> {
    let mut column_low = allocate_zeroed(height)?;
    let mut column_high = allocate_zeroed(height)?;
    let mut column_out = allocate_zeroed(height * 2)?;

    for x in 0..width {
        for y in 0..height {
            column_low[y] = low[y * width + x];
            column_high[y] = high[y * width + x];
        }
        inverse_lifting(&column_low, &column_high, rounding, &mut column_out);
        for (y, &value) in column_out.iter().enumerate() {
            out[y * width + x] = value;
        }
    }

    Ok(())
}

/// Row-wise inverse of two `width × height` bands into `2width × height`.
pub fn inverse_horizontal(
    low: &[i32],
    high: &[i32],
    width: usize,
    height: usize,
    rounding: i32,
    out: &mut [i32],
) {
    for y in 0..height {
        let row = y * width..(y + 1) * width;
        inverse_lifting(
            &low[row.clone()],
            &high[row],
            rounding,
            &mut out[y * width * 2..(y + 1) * width * 2],
        );
    }
}

/// Sum/difference inverse into two frames of the same size.
pub fn inverse_temporal(
    low: &[i32],
    high: &[i32],
    rounding: i32,
    first: &mut [i32],
    second: &mut [i32],
) {
    for (i, (&l, &h)) in low.iter().zip(high).enumerate() {
        first[i] = (l + h + rounding) >> 1;
        second[i] = (l - h + rounding) >> 1;
    }
}

/// Copies a band into a dense `i32` buffer.
fn load_band(band: &Band, out: &mut [i32]) {
    let width = band.width();
    for y in 0..band.height() {
        for (dst, &src) in out[y * width..(y + 1) * width].iter_mut().zip(band.row(y)) {
            *dst = src as i32;
        }
    }
}

/// Geometry and rounding of a complete wavelet's bands.
fn wavelet_geometry(wavelet: &Wavelet) -> Result<(usize, usize)> {
    wavelet.geometry().ok_or_else(|| {
        anyhow!(ReconstructError::BandsNotValid {
            wavelet: wavelet.index,
            valid: wavelet.valid_mask(),
        })
    })
}

/// Loads the listed bands of a wavelet, checking each matches the geometry.
fn load_bands(
    wavelet: &Wavelet,
    bands: &[usize],
    scratch: &BufferPool,
) -> Result<(Vec<Vec<i32>>, Vec<i32>, usize, usize)> {
    let (width, height) = wavelet_geometry(wavelet)?;

    let mut loaded = Vec::with_capacity(bands.len());
    let mut rounding = Vec::with_capacity(bands.len());
    for &index in bands {
        if !wavelet.is_band_valid(index) {
            bail!(ReconstructError::BandsNotValid {
                wavelet: wavelet.index,
                valid: wavelet.valid_mask(),
            });
        }

        let band = wavelet.lock_band(index);
        if band.width() != width || band.height() != height {
            bail!(CodecError::DimensionMismatch {
                wavelet: wavelet.index,
                width,
                height,
                found_width: band.width(),
                found_height: band.height(),
            });
        }

        let mut buffer = scratch.acquire(width * height)?;
        load_band(&band, &mut buffer);
        loaded.push(buffer);
        rounding.push((band.quantization > 1) as i32);
    }

    Ok((loaded, rounding, width, height))
}

/// Full 2-D inverse of a four-band wavelet. Returns `2width × 2height`
/// coefficients.
fn inverse_spatial(wavelet: &Wavelet, scratch: &BufferPool) -> Result<(Vec<i32>, usize, usize)> {
    let (bands, rounding, width, height) = load_bands(wavelet, &[0, 1, 2, 3], scratch)?;

    let mut low = scratch.acquire(width * height * 2)?;
    let mut high = scratch.acquire(width * height * 2)?;
    inverse_vertical(&bands[0], &bands[2], width, height, rounding[2], &mut low)?;
    inverse_vertical(&bands[1], &bands[3], width, height, rounding[3], &mut high)?;

    let mut out = allocate_zeroed(width * height * 4)?;
    inverse_horizontal(&low, &high, width, height * 2, rounding[1], &mut out);

    for buffer in bands.into_iter().chain([low, high]) {
        scratch.release(buffer);
    }

    Ok((out, width * 2, height * 2))
}

/// Band 0 of a wavelet as dense coefficients.
pub fn lowpass_output(wavelet: &Wavelet, scratch: &BufferPool) -> Result<(Vec<i32>, usize, usize)> {
    let (mut bands, _, width, height) = load_bands(wavelet, &[0], scratch)?;
    Ok((bands.remove(0), width, height))
}

/// One-axis inverse used by the half-width and half-height outputs.
pub fn axis_output(
    wavelet: &Wavelet,
    source: OutputSource,
    scratch: &BufferPool,
) -> Result<(Vec<i32>, usize, usize)> {
    match source {
        OutputSource::Vertical(_) => {
            let (bands, rounding, width, height) = load_bands(wavelet, &[0, 2], scratch)?;
            let mut out = allocate_zeroed(width * height * 2)?;
            inverse_vertical(&bands[0], &bands[1], width, height, rounding[1], &mut out)?;
            for buffer in bands {
                scratch.release(buffer);
            }
            Ok((out, width, height * 2))
        }
        OutputSource::Horizontal(_) => {
            let (bands, rounding, width, height) = load_bands(wavelet, &[0, 1], scratch)?;
            let mut out = allocate_zeroed(width * height * 2)?;
            inverse_horizontal(&bands[0], &bands[1], width, height, rounding[1], &mut out);
            for buffer in bands {
                scratch.release(buffer);
            }
            Ok((out, width * 2, height))
        }
        OutputSource::Frame(_) | OutputSource::Lowpass(_) => lowpass_output(wavelet, scratch),
    }
}

/// Reconstruction of one channel, starting from a wavelet whose bands all
/// became valid.
#[derive(Debug, Clone)]
pub struct CascadeJob {
    pub transform: Arc<Transform>,
    pub wavelet: usize,
    pub plan: Arc<ReconstructionPlan>,
    pub prescale: Arc<[u8]>,
    pub scratch: BufferPool,
}

impl CascadeJob {
    /// Runs the cascade. Returns how many wavelets were reconstructed.
    pub fn run(self) -> Result<usize> {
        let mut worklist = vec![self.wavelet];
        let mut reconstructed = 0;

        while let Some(index) = worklist.pop() {
            for ready in self.reconstruct(index)? {
                if self.plan.reconstructs(ready) {
                    worklist.push(ready);
                }
            }
            reconstructed += 1;
        }

        Ok(reconstructed)
    }

    /// Inverse transforms one wavelet into its targets. Returns the target
    /// wavelets this completed.
    fn reconstruct(&self, index: usize) -> Result<Vec<usize>> {
        let transform = &self.transform;
        let wavelet = transform.wavelet(index);
        wavelet.ensure_complete()?;

        let spec = transform.layout().wavelet(index);
        let shift = self.prescale.get(index).copied().unwrap_or(0) as u32;

        let (outputs, width, height) = match spec.kind {
            WaveletKind::Temporal => {
                let (bands, rounding, width, height) = load_bands(wavelet, &[0, 1], &self.scratch)?;
                let mut first = allocate_zeroed(width * height)?;
                let mut second = allocate_zeroed(width * height)?;
                inverse_temporal(&bands[0], &bands[1], rounding[1], &mut first, &mut second);
                for buffer in bands {
                    self.scratch.release(buffer);
                }
                (vec![first, second], width, height)
            }
            WaveletKind::Frame | WaveletKind::Spatial => {
                let (out, width, height) = inverse_spatial(wavelet, &self.scratch)?;
                (vec![out], width, height)
            }
        };

        debug!(
            "channel {}: wavelet {index} ({:?}) reconstructed to {width}x{height}",
            transform.channel, spec.kind
        );

        let mut completed = Vec::new();
        for (&target, mut data) in spec.targets.iter().zip(outputs) {
            if shift > 0 {
                for value in data.iter_mut() {
                    *value <<= shift;
                }
            }

            match target {
                Target::Frame(frame) => {
                    transform.lock_frame(frame).store(width, height, &data)?;
                }
                Target::Band { wavelet, band } => {
                    let target = transform.wavelet(wavelet);
                    target.declare_geometry(width, height)?;
                    {
                        let mut storage = target.lock_band(band);
                        storage.prepare(width, height, 1)?;
                        for (y, row) in data.chunks_exact(width.max(1)).enumerate().take(height) {
                            for (dst, &value) in storage.row_mut(y).iter_mut().zip(row) {
                                *dst = saturate(value);
                            }
                        }
                    }
                    if target.mark_band_valid(band) {
                        completed.push(wavelet);
                    }
                }
            }
        }

        Ok(completed)
    }
}

#[derive(Debug)]
enum Backend {
    Inline,
    Pool(rayon_core::ThreadPool),
}

/// Runs cascade jobs, inline or on a worker pool, and collects their
/// results at the end of a sample.
#[derive(Debug)]
pub struct Reconstructor {
    backend: Backend,
    sender: mpsc::Sender<Result<usize>>,
    receiver: mpsc::Receiver<Result<usize>>,
    outstanding: usize,
}

impl Reconstructor {
    pub fn inline() -> Self {
        Self::with_backend(Backend::Inline)
    }

    /// A pool of `threads` workers; 0 reconstructs inline.
    ///
    /// Falls back to inline reconstruction if the pool cannot be built.
    pub fn new(threads: usize) -> Self {
        if threads == 0 {
            return Self::inline();
        }

        let pool = rayon_core::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("cfhd reconstruction #{index}"))
            .build();

        match pool {
            Ok(pool) => {
                info!("reconstructing on {} worker threads", pool.current_num_threads());
                Self::with_backend(Backend::Pool(pool))
            }
            Err(err) => {
                warn!("could not start reconstruction pool ({err}), reconstructing inline");
                Self::inline()
            }
        }
    }

    fn with_backend(backend: Backend) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            backend,
            sender,
            receiver,
            outstanding: 0,
        }
    }

    pub fn is_parallel(&self) -> bool {
        matches!(self.backend, Backend::Pool(_))
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn submit(&mut self, job: CascadeJob) {
        self.outstanding += 1;

        match &self.backend {
            Backend::Inline => {
                let _ = self.sender.send(job.run());
            }
            Backend::Pool(pool) => {
                let sender = self.sender.clone();
                pool.spawn_fifo(move || {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| job.run()))
                        .unwrap_or_else(|_| Err(anyhow!(ReconstructError::WorkerLost)));
                    let _ = sender.send(result);
                });
            }
        }
    }

    /// Blocks until every submitted job has finished.
    ///
    /// Returns the number of wavelets reconstructed, or the first error any
    /// job reported.
    pub fn wait_all(&mut self) -> Result<usize> {
        let mut reconstructed = 0;
        let mut first_error = None;

        while self.outstanding > 0 {
            let result = self
                .receiver
                .recv()
                .map_err(|_| ReconstructError::WorkerLost)?;
            self.outstanding -= 1;

            match result {
                Ok(count) => reconstructed += count,
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(reconstructed),
        }
    }
}

impl Default for Reconstructor {
    fn default() -> Self {
        Self::inline()
    }
}
