//! One level of a channel's pyramid and its validity tracking.

use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};

use crate::structs::band::Band;
use crate::utils::errors::{CodecError, ReconstructError};

pub const MAX_BANDS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaveletKind {
    /// Finest spatial level, reconstructed into a frame plane.
    Frame,
    /// Sum/difference of two frames, one lowpass and one highpass band.
    Temporal,
    Spatial,
}

impl WaveletKind {
    pub fn band_count(self) -> usize {
        match self {
            WaveletKind::Temporal => 2,
            WaveletKind::Frame | WaveletKind::Spatial => MAX_BANDS,
        }
    }

    /// log2 of the lowpass gain of the forward transform.
    pub fn gain(self) -> i32 {
        match self {
            WaveletKind::Temporal => 1,
            WaveletKind::Frame | WaveletKind::Spatial => 2,
        }
    }
}

#[derive(Debug, Default)]
struct WaveletState {
    valid: u8,
    started: u8,
    claimed: bool,
    geometry: Option<(usize, usize)>,
}

#[derive(Debug)]
pub struct Wavelet {
    pub index: usize,
    pub kind: WaveletKind,
    pub level: u8,
    bands: Vec<Mutex<Band>>,
    state: Mutex<WaveletState>,
}

impl Wavelet {
    pub fn new(index: usize, kind: WaveletKind, level: u8) -> Self {
        Self {
            index,
            kind,
            level,
            bands: (0..kind.band_count())
                .map(|_| Mutex::new(Band::default()))
                .collect(),
            state: Mutex::new(WaveletState::default()),
        }
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    fn complete_mask(&self) -> u8 {
        (1u8 << self.bands.len()) - 1
    }

    fn state(&self) -> MutexGuard<'_, WaveletState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lock_band(&self, band: usize) -> MutexGuard<'_, Band> {
        self.bands[band]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Clears the per-sample flags. Band storage is kept.
    pub fn reset(&self) {
        *self.state() = WaveletState::default();
    }

    /// Records the band dimensions for this sample, or checks them against the
    /// dimensions recorded earlier.
    pub fn declare_geometry(&self, width: usize, height: usize) -> Result<()> {
        let mut state = self.state();
        match state.geometry {
            None => state.geometry = Some((width, height)),
            Some((w, h)) if w == width && h == height => {}
            Some((w, h)) => bail!(CodecError::DimensionMismatch {
                wavelet: self.index,
                width: w,
                height: h,
                found_width: width,
                found_height: height,
            }),
        }

        Ok(())
    }

    pub fn geometry(&self) -> Option<(usize, usize)> {
        self.state().geometry
    }

    /// Marks a band as being written. Returns `false` if it already was.
    pub fn start_band(&self, band: usize) -> bool {
        let mut state = self.state();
        let bit = 1u8 << band;
        if state.started & bit != 0 {
            return false;
        }
        state.started |= bit;
        true
    }

    /// Sets a band's valid flag.
    ///
    /// Returns `true` exactly once per sample: for the call that completes the
    /// wavelet. That caller owns the wavelet's reconstruction.
    pub fn mark_band_valid(&self, band: usize) -> bool {
        let complete = self.complete_mask();
        let mut state = self.state();
        state.valid |= 1u8 << band;

        if state.valid == complete && !state.claimed {
            state.claimed = true;
            return true;
        }

        false
    }

    pub fn is_band_valid(&self, band: usize) -> bool {
        self.state().valid & (1u8 << band) != 0
    }

    pub fn valid_mask(&self) -> u8 {
        self.state().valid
    }

    pub fn is_complete(&self) -> bool {
        self.valid_mask() == self.complete_mask()
    }

    /// Fails unless every band is valid.
    pub fn ensure_complete(&self) -> Result<()> {
        let valid = self.valid_mask();
        if valid != self.complete_mask() {
            bail!(ReconstructError::BandsNotValid {
                wavelet: self.index,
                valid,
            });
        }

        Ok(())
    }
}
