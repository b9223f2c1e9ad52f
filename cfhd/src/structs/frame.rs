//! Decoded planes handed to the caller.

use anyhow::{Result, bail};

use crate::structs::sample::EncodedFormat;
use crate::utils::buffer_pool::allocate_zeroed;
use crate::utils::errors::CodecError;

/// Rounds `value / 2^shift` to nearest, or scales up for negative shifts.
#[inline(always)]
pub fn round_shift(value: i32, shift: i32) -> i32 {
    match shift {
        0 => value,
        s if s > 0 => (value + (1 << (s - 1))) >> s,
        s => value << -s,
    }
}

/// Maps a signed coefficient with `shift` bits of gain to an unsigned sample.
#[inline(always)]
pub fn to_pixel(value: i32, shift: i32, precision: u8) -> u16 {
    let max = (1i32 << precision) - 1;
    (round_shift(value, shift) + (1 << (precision - 1))).clamp(0, max) as u16
}

/// One channel of output, `precision`-bit samples in 16-bit storage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plane {
    pub width: usize,
    pub height: usize,
    /// Distance between rows, in samples.
    pub pitch: usize,
    pub data: Vec<u16>,
}

impl Plane {
    pub fn new(width: usize, height: usize) -> Result<Self> {
        Ok(Self {
            width,
            height,
            pitch: width,
            data: allocate_zeroed(width * height)?,
        })
    }

    /// Converts the top-left `width × height` corner of a coefficient array.
    pub fn from_coefficients(
        source: &[i32],
        source_width: usize,
        width: usize,
        height: usize,
        shift: i32,
        precision: u8,
    ) -> Result<Self> {
        if width > source_width || source.len() < source_width * height {
            bail!(CodecError::LayoutMismatch {
                field: "output plane",
                declared: width * height,
                expected: source.len(),
            });
        }

        let mut plane = Self::new(width, height)?;
        for (y, row) in plane.data.chunks_exact_mut(width.max(1)).enumerate() {
            let src = &source[y * source_width..y * source_width + width];
            for (dst, &value) in row.iter_mut().zip(src) {
                *dst = to_pixel(value, shift, precision);
            }
        }

        Ok(plane)
    }

    pub fn row(&self, y: usize) -> &[u16] {
        &self.data[y * self.pitch..y * self.pitch + self.width]
    }

    pub fn is_zero(&self) -> bool {
        self.data.iter().all(|&v| v == 0)
    }
}

/// The planes of one decoded picture.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameBuffer {
    pub planes: Vec<Plane>,
    pub frame_number: u16,
    pub precision: u8,
    pub format: Option<EncodedFormat>,
    /// Picture of the nested second-eye sample, when there was one.
    pub second_eye: Option<Box<FrameBuffer>>,
}

impl FrameBuffer {
    /// Replaces the planes with zeroed ones of the given sizes.
    pub fn blank(&mut self, sizes: &[(usize, usize)]) -> Result<()> {
        self.planes = sizes
            .iter()
            .map(|&(width, height)| Plane::new(width, height))
            .collect::<Result<_>>()?;
        self.second_eye = None;
        Ok(())
    }

    pub fn zero_fill(&mut self) {
        for plane in &mut self.planes {
            plane.data.fill(0);
        }
        if let Some(eye) = &mut self.second_eye {
            eye.zero_fill();
        }
    }

    pub fn is_zero(&self) -> bool {
        self.planes.iter().all(Plane::is_zero)
            && self.second_eye.as_ref().is_none_or(|eye| eye.is_zero())
    }
}

/// Final pixel-format stage.
///
/// The decoder stops at planar samples; implementations of this trait turn a
/// [`FrameBuffer`] into whatever packed layout the caller displays.
pub trait PixelConverter {
    type Output;

    fn convert(&self, frame: &FrameBuffer) -> Result<Self::Output>;
}

/// Interleaves equally sized planes sample by sample.
#[derive(Debug, Default, Clone, Copy)]
pub struct Interleave;

impl PixelConverter for Interleave {
    type Output = Vec<u16>;

    fn convert(&self, frame: &FrameBuffer) -> Result<Vec<u16>> {
        let Some(first) = frame.planes.first() else {
            return Ok(Vec::new());
        };

        for plane in &frame.planes {
            if plane.width != first.width || plane.height != first.height {
                bail!(CodecError::LayoutMismatch {
                    field: "interleaved plane samples",
                    declared: plane.width * plane.height,
                    expected: first.width * first.height,
                });
            }
        }

        let mut packed = Vec::with_capacity(first.width * first.height * frame.planes.len());
        for y in 0..first.height {
            for x in 0..first.width {
                packed.extend(frame.planes.iter().map(|plane| plane.row(y)[x]));
            }
        }

        Ok(packed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_conversion_rounds_and_clamps() {
        assert_eq!(to_pixel(0, 0, 8), 128);
        assert_eq!(to_pixel(0, 4, 10), 512);
        assert_eq!(to_pixel(-128, 0, 8), 0);
        assert_eq!(to_pixel(500, 0, 8), 255);
        assert_eq!(to_pixel(6, 2, 8), 130);
        assert_eq!(to_pixel(5, 2, 8), 129);
        assert_eq!(to_pixel(3, -1, 8), 134);
    }

    #[test]
    fn crops_coefficients() -> Result<()> {
        let source = [0, 1, 2, 3, 10, 11, 12, 13];
        let plane = Plane::from_coefficients(&source, 4, 3, 2, 0, 8)?;
        assert_eq!(plane.row(0), &[128, 129, 130]);
        assert_eq!(plane.row(1), &[138, 139, 140]);

        assert!(Plane::from_coefficients(&source, 4, 5, 2, 0, 8).is_err());
        Ok(())
    }

    #[test]
    fn zero_fill_reaches_second_eye() -> Result<()> {
        let mut frame = FrameBuffer::default();
        frame.blank(&[(2, 2)])?;
        frame.planes[0].data[3] = 9;

        let mut eye = FrameBuffer::default();
        eye.blank(&[(1, 1)])?;
        eye.planes[0].data[0] = 4;
        frame.second_eye = Some(Box::new(eye));

        assert!(!frame.is_zero());
        frame.zero_fill();
        assert!(frame.is_zero());
        Ok(())
    }

    #[test]
    fn interleave_packs_samples() -> Result<()> {
        let mut frame = FrameBuffer::default();
        frame.blank(&[(2, 1), (2, 1)])?;
        frame.planes[0].data.copy_from_slice(&[1, 2]);
        frame.planes[1].data.copy_from_slice(&[3, 4]);

        assert_eq!(Interleave.convert(&frame)?, vec![1, 3, 2, 4]);

        frame.planes[1] = Plane::new(1, 1)?;
        assert!(Interleave.convert(&frame).is_err());
        Ok(())
    }
}
