//! Checked write cursor over a band.
//!
//! The entropy decoder walks a band in raster order by run lengths. Every
//! move is checked against the band's capacity so a malformed stream turns
//! into a decode error instead of an out-of-bounds write.

use anyhow::{Result, bail};

use crate::structs::band::Band;
use crate::utils::errors::EntropyError;

#[derive(Debug)]
pub struct BandCursor<'a> {
    data: &'a mut [i16],
    width: usize,
    pitch: usize,
    capacity: usize,
    position: usize,
    row: usize,
    column: usize,
}

impl<'a> BandCursor<'a> {
    pub fn new(band: &'a mut Band) -> Self {
        let width = band.width();
        let pitch = band.pitch();
        let capacity = band.len();

        Self {
            data: band.storage_mut(),
            width,
            pitch,
            capacity,
            position: 0,
            row: 0,
            column: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline(always)]
    pub fn skip(&mut self, count: usize) -> Result<()> {
        if count == 0 {
            return Ok(());
        }

        let position = self.position + count;
        if position > self.capacity {
            bail!(EntropyError::CursorOverflow {
                position,
                capacity: self.capacity,
            });
        }

        self.position = position;
        self.row = position / self.width;
        self.column = position % self.width;
        Ok(())
    }

    #[inline(always)]
    fn offset(&self) -> Result<usize> {
        if self.position >= self.capacity {
            bail!(EntropyError::CursorOverflow {
                position: self.position + 1,
                capacity: self.capacity,
            });
        }

        Ok(self.row * self.pitch + self.column)
    }

    #[inline(always)]
    fn step(&mut self) {
        self.position += 1;
        self.column += 1;
        if self.column == self.width {
            self.column = 0;
            self.row += 1;
        }
    }

    /// Stores a value at the cursor and advances by one.
    #[inline(always)]
    pub fn write(&mut self, value: i16) -> Result<()> {
        let offset = self.offset()?;
        self.data[offset] = value;
        self.step();
        Ok(())
    }

    /// Combines a value with the one already stored at the cursor.
    #[inline(always)]
    pub fn merge(&mut self, merge: impl FnOnce(i16) -> i16) -> Result<()> {
        let offset = self.offset()?;
        self.data[offset] = merge(self.data[offset]);
        self.step();
        Ok(())
    }

    pub fn rewind(&mut self) {
        self.position = 0;
        self.row = 0;
        self.column = 0;
    }

    /// Checks that the band was covered exactly.
    pub fn finish(&self) -> Result<usize> {
        if self.position != self.capacity {
            bail!(EntropyError::SkipSumMismatch {
                position: self.position,
                capacity: self.capacity,
            });
        }

        Ok(self.position)
    }
}
