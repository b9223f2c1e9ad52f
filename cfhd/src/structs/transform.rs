//! Pyramid layouts and the per-channel coefficient pyramid.
//!
//! A layout is a fixed table: which wavelets exist, where each one writes
//! when it is inverse transformed, and which `(wavelet, band)` every coded
//! sub-band lands in.

use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::structs::wavelet::{Wavelet, WaveletKind};
use crate::utils::buffer_pool::allocate_zeroed;
use crate::utils::errors::CodecError;

pub const MAX_SPATIAL_LEVELS: usize = 5;

/// Largest number of wavelets any layout has.
pub const MAX_WAVELETS: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformKind {
    #[default]
    Spatial,
    /// Two interlaced fields joined by a temporal level.
    FieldPlus,
}

impl TransformKind {
    pub fn from_code(code: u16) -> Result<Self> {
        Ok(match code {
            0 => TransformKind::Spatial,
            1 => TransformKind::FieldPlus,
            value => bail!(CodecError::Unsupported {
                field: "transform type",
                value,
            }),
        })
    }

    pub fn code(self) -> u16 {
        match self {
            TransformKind::Spatial => 0,
            TransformKind::FieldPlus => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TransformKind::Spatial => "spatial",
            TransformKind::FieldPlus => "field-plus",
        }
    }
}

/// Where a wavelet's inverse transform writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Frame(usize),
    Band { wavelet: usize, band: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaveletSpec {
    pub kind: WaveletKind,
    pub level: u8,
    /// One target per output; temporal wavelets have two.
    pub targets: Vec<Target>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PyramidLayout {
    pub kind: TransformKind,
    wavelets: Vec<WaveletSpec>,
    subbands: Vec<(usize, usize)>,
    frames: usize,
}

impl PyramidLayout {
    /// `levels` 2-D levels, wavelet 0 being the frame wavelet.
    pub fn spatial(levels: usize) -> Result<Self> {
        if !(1..=MAX_SPATIAL_LEVELS).contains(&levels) {
            bail!(CodecError::InvalidHeaderValue {
                field: "spatial levels",
                value: levels as u16,
            });
        }

        let wavelets = (0..levels)
            .map(|i| WaveletSpec {
                kind: if i == 0 {
                    WaveletKind::Frame
                } else {
                    WaveletKind::Spatial
                },
                level: i as u8 + 1,
                targets: vec![if i == 0 {
                    Target::Frame(0)
                } else {
                    Target::Band {
                        wavelet: i - 1,
                        band: 0,
                    }
                }],
            })
            .collect();

        let mut subbands = vec![(levels - 1, 0)];
        for k in 0..levels {
            for band in 1..4 {
                subbands.push((levels - 1 - k, band));
            }
        }

        Ok(Self {
            kind: TransformKind::Spatial,
            wavelets,
            subbands,
            frames: 1,
        })
    }

    pub fn field_plus() -> Self {
        let band = |wavelet, band| Target::Band { wavelet, band };
        let spec = |kind, level, targets| WaveletSpec {
            kind,
            level,
            targets,
        };

        let wavelets = vec![
            spec(WaveletKind::Frame, 1, vec![Target::Frame(0)]),
            spec(WaveletKind::Frame, 1, vec![Target::Frame(1)]),
            spec(WaveletKind::Temporal, 2, vec![band(0, 0), band(1, 0)]),
            spec(WaveletKind::Spatial, 3, vec![band(2, 1)]),
            spec(WaveletKind::Spatial, 3, vec![band(2, 0)]),
            spec(WaveletKind::Spatial, 4, vec![band(4, 0)]),
        ];

        let mut subbands: Vec<(usize, usize)> = (0..4).map(|b| (5, b)).collect();
        subbands.extend((1..4).map(|b| (4, b)));
        subbands.extend((0..4).map(|b| (3, b)));
        subbands.extend((1..4).map(|b| (0, b)));
        subbands.extend((1..4).map(|b| (1, b)));

        Self {
            kind: TransformKind::FieldPlus,
            wavelets,
            subbands,
            frames: 2,
        }
    }

    pub fn new(kind: TransformKind, spatial_levels: usize) -> Result<Self> {
        match kind {
            TransformKind::Spatial => Self::spatial(spatial_levels),
            TransformKind::FieldPlus => Ok(Self::field_plus()),
        }
    }

    pub fn wavelet_count(&self) -> usize {
        self.wavelets.len()
    }

    pub fn subband_count(&self) -> usize {
        self.subbands.len()
    }

    pub fn frame_count(&self) -> usize {
        self.frames
    }

    pub fn wavelet(&self, index: usize) -> &WaveletSpec {
        &self.wavelets[index]
    }

    pub fn wavelets(&self) -> &[WaveletSpec] {
        &self.wavelets
    }

    /// Maps a coded sub-band to its `(wavelet, band)`.
    pub fn subband(&self, subband: usize) -> Result<(usize, usize)> {
        match self.subbands.get(subband) {
            Some(&location) => Ok(location),
            None => bail!(CodecError::SubbandOutOfRange {
                subband,
                count: self.subbands.len(),
            }),
        }
    }

    pub fn subbands(&self) -> &[(usize, usize)] {
        &self.subbands
    }

    /// How many times band 0 of `wavelet` is halved in each direction
    /// relative to a frame.
    pub fn decimation(&self, wavelet: usize) -> u32 {
        let spec = &self.wavelets[wavelet];
        let own = (spec.kind != WaveletKind::Temporal) as u32;

        match spec.targets[0] {
            Target::Frame(_) => own,
            Target::Band { wavelet: target, .. } => own + self.decimation(target),
        }
    }

    /// Size of every band of `wavelet` in a `width × height` picture.
    pub fn band_dimensions(&self, wavelet: usize, width: usize, height: usize) -> (usize, usize) {
        let d = self.decimation(wavelet);
        (width.div_ceil(1 << d), height.div_ceil(1 << d))
    }

    /// log2 of band 0's gain over the pixel domain.
    pub fn lowpass_shift(&self, wavelet: usize, prescale: &[u8]) -> i32 {
        let spec = &self.wavelets[wavelet];
        let own = spec.kind.gain() - prescale.get(wavelet).copied().unwrap_or(0) as i32;

        match spec.targets[0] {
            Target::Frame(_) => own,
            Target::Band { wavelet: target, .. } => own + self.lowpass_shift(target, prescale),
        }
    }

    /// Prescale shifts implied by the source bit depth.
    pub fn default_prescale(&self, precision: u8) -> Vec<u8> {
        let mut prescale = vec![0; self.wavelets.len()];

        match precision {
            0..=8 => {}
            10 => {
                for (shift, spec) in prescale.iter_mut().zip(&self.wavelets) {
                    if spec.kind == WaveletKind::Frame {
                        *shift = 2;
                    }
                }
            }
            _ => {
                let shifted = match self.kind {
                    TransformKind::Spatial => 2,
                    TransformKind::FieldPlus => 3,
                };
                for shift in prescale.iter_mut().take(shifted) {
                    *shift = 2;
                }
            }
        }

        prescale
    }

    /// Unpacks a `PrescaleTable` value, two bits per wavelet from the top.
    pub fn prescale_from_table(&self, table: u16) -> Vec<u8> {
        (0..self.wavelets.len())
            .map(|i| {
                if i < MAX_WAVELETS {
                    ((table >> (14 - 2 * i)) & 0x3) as u8
                } else {
                    0
                }
            })
            .collect()
    }

    /// Packs per-wavelet shifts into a `PrescaleTable` value.
    pub fn prescale_to_table(prescale: &[u8]) -> u16 {
        prescale
            .iter()
            .take(MAX_WAVELETS)
            .enumerate()
            .fold(0, |table, (i, &shift)| {
                table | ((shift as u16 & 0x3) << (14 - 2 * i))
            })
    }
}

/// Reconstructed full-resolution coefficients of one frame.
#[derive(Debug, Default)]
pub struct FramePlane {
    pub width: usize,
    pub height: usize,
    pub data: Vec<i32>,
    pub written: bool,
}

impl FramePlane {
    pub fn store(&mut self, width: usize, height: usize, data: &[i32]) -> Result<()> {
        if self.width != width || self.height != height || self.data.len() != width * height {
            self.data = allocate_zeroed(width * height)?;
            self.width = width;
            self.height = height;
        }

        self.data.copy_from_slice(data);
        self.written = true;
        Ok(())
    }
}

/// The coefficient pyramid of one channel.
#[derive(Debug)]
pub struct Transform {
    pub channel: usize,
    layout: PyramidLayout,
    wavelets: Vec<Wavelet>,
    frames: Vec<Mutex<FramePlane>>,
}

impl Transform {
    pub fn new(channel: usize, layout: PyramidLayout) -> Self {
        let wavelets = layout
            .wavelets()
            .iter()
            .enumerate()
            .map(|(index, spec)| Wavelet::new(index, spec.kind, spec.level))
            .collect();
        let frames = (0..layout.frame_count())
            .map(|_| Mutex::new(FramePlane::default()))
            .collect();

        Self {
            channel,
            layout,
            wavelets,
            frames,
        }
    }

    pub fn layout(&self) -> &PyramidLayout {
        &self.layout
    }

    pub fn wavelet(&self, index: usize) -> &Wavelet {
        &self.wavelets[index]
    }

    pub fn wavelets(&self) -> &[Wavelet] {
        &self.wavelets
    }

    pub fn lock_frame(&self, frame: usize) -> MutexGuard<'_, FramePlane> {
        self.frames[frame]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Clears every per-sample flag.
    pub fn reset(&self) {
        for wavelet in &self.wavelets {
            wavelet.reset();
        }
        for frame in 0..self.frames.len() {
            self.lock_frame(frame).written = false;
        }
    }
}
