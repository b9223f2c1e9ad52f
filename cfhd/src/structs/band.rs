//! Coefficient storage for one wavelet band.

use anyhow::{Result, bail};

use crate::utils::buffer_pool::allocate_zeroed;
use crate::utils::errors::CodecError;

/// Rows are padded to a multiple of this many coefficients.
pub const BAND_ROW_ALIGN: usize = 8;

/// Saturation bounds for anything stored in a band.
pub const COEFFICIENT_MIN: i32 = i16::MIN as i32;
pub const COEFFICIENT_MAX: i32 = i16::MAX as i32;

#[inline(always)]
pub fn saturate(value: i32) -> i16 {
    value.clamp(COEFFICIENT_MIN, COEFFICIENT_MAX) as i16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BandEncoding {
    #[default]
    Lossy,
    /// Low bytes in a first FSM pass, high bytes in a second one.
    Lossless,
}

impl BandEncoding {
    pub fn from_code(code: u16) -> Result<Self> {
        Ok(match code {
            0 => BandEncoding::Lossy,
            1 => BandEncoding::Lossless,
            value => bail!(CodecError::Unsupported {
                field: "band encoding",
                value,
            }),
        })
    }

    pub fn code(self) -> u16 {
        match self {
            BandEncoding::Lossy => 0,
            BandEncoding::Lossless => 1,
        }
    }
}

/// Parameters declared ahead of one band's coefficient payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandHeader {
    pub subband: usize,
    pub width: usize,
    pub height: usize,
    pub quantization: u16,
    pub encoding: BandEncoding,
    pub codebook: u16,
    /// Magnitudes above this are replaced from the peak table; 0 disables.
    pub peak_level: u16,
}

/// A band header with its borrowed peak table and entropy-coded payload.
#[derive(Debug, Clone, Copy)]
pub struct BandPayload<'a> {
    pub header: BandHeader,
    /// Big-endian 16-bit literals.
    pub peaks: &'a [u8],
    pub data: &'a [u8],
}

/// A `width × height` array of signed 16-bit coefficients.
///
/// The storage survives across samples; it is only reallocated when the
/// dimensions change.
#[derive(Debug, Default)]
pub struct Band {
    width: usize,
    height: usize,
    pitch: usize,
    /// Quantization divisor the coefficients were dequantized with.
    pub quantization: u16,
    data: Vec<i16>,
}

impl Band {
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn pitch(&self) -> usize {
        self.pitch
    }

    /// Number of coefficients (excluding row padding).
    pub fn len(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sizes the band for a new payload and zeroes it.
    ///
    /// Returns `true` if the storage had to be reallocated.
    pub fn prepare(&mut self, width: usize, height: usize, quantization: u16) -> Result<bool> {
        let pitch = width.div_ceil(BAND_ROW_ALIGN) * BAND_ROW_ALIGN;
        let reallocated = width != self.width || height != self.height;

        if reallocated {
            self.data = allocate_zeroed(pitch * height)?;
            self.width = width;
            self.height = height;
            self.pitch = pitch;
        } else {
            self.data.fill(0);
        }

        self.quantization = quantization.max(1);
        Ok(reallocated)
    }

    #[inline(always)]
    pub fn row(&self, y: usize) -> &[i16] {
        let start = y * self.pitch;
        &self.data[start..start + self.width]
    }

    #[inline(always)]
    pub fn row_mut(&mut self, y: usize) -> &mut [i16] {
        let start = y * self.pitch;
        &mut self.data[start..start + self.width]
    }

    #[inline(always)]
    pub fn get(&self, x: usize, y: usize) -> i16 {
        self.data[y * self.pitch + x]
    }

    /// Raw storage including row padding.
    pub fn storage_mut(&mut self) -> &mut [i16] {
        &mut self.data
    }

    pub fn fill_zero(&mut self) {
        self.data.fill(0);
    }

    /// Copies the coefficients out without row padding.
    pub fn to_vec(&self) -> Vec<i16> {
        (0..self.height).flat_map(|y| self.row(y).iter().copied()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_pads_rows_and_reuses_storage() -> Result<()> {
        let mut band = Band::default();
        assert!(band.prepare(5, 3, 4)?);
        assert_eq!(band.pitch(), 8);
        assert_eq!(band.len(), 15);
        assert_eq!(band.quantization, 4);

        band.row_mut(2)[4] = -9;
        assert_eq!(band.get(4, 2), -9);

        assert!(!band.prepare(5, 3, 0)?);
        assert_eq!(band.get(4, 2), 0);
        assert_eq!(band.quantization, 1);

        assert!(band.prepare(6, 3, 1)?);
        assert_eq!(band.to_vec().len(), 18);

        Ok(())
    }

    #[test]
    fn saturation_bounds() {
        assert_eq!(saturate(40_000), i16::MAX);
        assert_eq!(saturate(-40_000), i16::MIN);
        assert_eq!(saturate(-12), -12);
    }
}
