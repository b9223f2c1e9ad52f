//! Output resolutions and what each one requires from a pyramid.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

use crate::structs::transform::{PyramidLayout, Target};
use crate::utils::errors::CodecError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    #[default]
    Full,
    Half,
    Quarter,
    /// The coarsest lowpass band, no inverse transform at all.
    LowpassOnly,
    /// Full height, half width.
    HalfHorizontal,
    /// Full width, half height.
    HalfVertical,
}

impl Resolution {
    pub fn name(self) -> &'static str {
        match self {
            Resolution::Full => "full",
            Resolution::Half => "half",
            Resolution::Quarter => "quarter",
            Resolution::LowpassOnly => "lowpass-only",
            Resolution::HalfHorizontal => "half-horizontal",
            Resolution::HalfVertical => "half-vertical",
        }
    }
}

/// Where one output plane comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSource {
    Frame(usize),
    /// Band 0 of a wavelet.
    Lowpass(usize),
    /// Vertical inverse of bands 0 and 2 of a wavelet.
    Vertical(usize),
    /// Horizontal inverse of bands 0 and 1 of a wavelet.
    Horizontal(usize),
}

impl OutputSource {
    /// Plane size this source yields for a `width × height` picture.
    pub fn dimensions(self, layout: &PyramidLayout, width: usize, height: usize) -> (usize, usize) {
        let scale = |value: usize, shift: u32| value.div_ceil(1 << shift);

        match self {
            OutputSource::Frame(_) => (width, height),
            OutputSource::Lowpass(w) => {
                let d = layout.decimation(w);
                (scale(width, d), scale(height, d))
            }
            OutputSource::Vertical(w) => {
                let d = layout.decimation(w);
                (scale(width, d), scale(height, d - 1))
            }
            OutputSource::Horizontal(w) => {
                let d = layout.decimation(w);
                (scale(width, d - 1), scale(height, d))
            }
        }
    }

    fn reads(self, wavelet: usize, band: usize) -> bool {
        match self {
            OutputSource::Frame(_) => false,
            OutputSource::Lowpass(w) => w == wavelet && band == 0,
            OutputSource::Vertical(w) => w == wavelet && (band == 0 || band == 2),
            OutputSource::Horizontal(w) => w == wavelet && (band == 0 || band == 1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconstructionPlan {
    pub resolution: Resolution,
    /// One source per frame the sample carries.
    pub outputs: Vec<OutputSource>,
    reconstruct: Vec<bool>,
    needed: u32,
}

impl ReconstructionPlan {
    pub fn new(layout: &PyramidLayout, resolution: Resolution) -> Result<Self> {
        use crate::structs::transform::TransformKind::*;
        use Resolution::*;

        let count = layout.wavelet_count();
        let unsupported = || CodecError::InvalidResolution {
            resolution: resolution.name(),
            transform: layout.kind.name(),
        };

        let outputs = match (layout.kind, resolution) {
            (Spatial, Full) => vec![OutputSource::Frame(0)],
            (Spatial, Half) => vec![OutputSource::Lowpass(0)],
            (Spatial, Quarter) if count >= 2 => vec![OutputSource::Lowpass(1)],
            (Spatial, LowpassOnly) => vec![OutputSource::Lowpass(count - 1)],
            (Spatial, HalfHorizontal) => vec![OutputSource::Vertical(0)],
            (Spatial, HalfVertical) => vec![OutputSource::Horizontal(0)],
            (FieldPlus, Full) => vec![OutputSource::Frame(0), OutputSource::Frame(1)],
            (FieldPlus, Half) => vec![OutputSource::Lowpass(0), OutputSource::Lowpass(1)],
            (FieldPlus, Quarter) => vec![OutputSource::Lowpass(2); 2],
            (FieldPlus, LowpassOnly) => vec![OutputSource::Lowpass(5); 2],
            _ => bail!(unsupported()),
        };

        // Targets always point at lower indices, so one ascending pass settles
        // every wavelet.
        let mut reconstruct = vec![false; count];
        for index in 0..count {
            let feeds_output = layout.wavelet(index).targets.iter().any(|&target| match target {
                Target::Frame(frame) => outputs.contains(&OutputSource::Frame(frame)),
                Target::Band { wavelet, band } => {
                    reconstruct[wavelet] || outputs.iter().any(|o| o.reads(wavelet, band))
                }
            });
            reconstruct[index] = feeds_output;
        }

        let mut needed = 0u32;
        for (subband, &(wavelet, band)) in layout.subbands().iter().enumerate() {
            if reconstruct[wavelet] || outputs.iter().any(|o| o.reads(wavelet, band)) {
                needed |= 1 << subband;
            }
        }

        Ok(Self {
            resolution,
            outputs,
            reconstruct,
            needed,
        })
    }

    /// Whether the wavelet is inverse transformed for this resolution.
    pub fn reconstructs(&self, wavelet: usize) -> bool {
        self.reconstruct.get(wavelet).copied().unwrap_or(false)
    }

    pub fn needed_subbands(&self) -> u32 {
        self.needed
    }

    pub fn needs(&self, subband: usize) -> bool {
        subband < 32 && self.needed & (1 << subband) != 0
    }

    /// True once `decoded` covers every sub-band this resolution uses.
    pub fn is_satisfied(&self, decoded: u32) -> bool {
        self.needed & !decoded == 0
    }
}
