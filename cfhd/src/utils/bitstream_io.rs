//! Tag stream reader for wavelet samples.
//!
//! Reads the big-endian tag/value segments of a sample and hands out sized
//! chunk payloads as borrowed slices, moving the read position by pure
//! position arithmetic.

use std::io;
use std::io::SeekFrom;

use anyhow::{Result, bail};
use bitstream_io::{BigEndian, BitRead, BitReader};
use log::trace;

use crate::structs::tag::{SEGMENT_SIZE, Segment, SegmentHeader};
use crate::utils::errors::TagError;

#[derive(Debug)]
pub struct TagReader<'a> {
    data: &'a [u8],
    bs: BitReader<io::Cursor<&'a [u8]>, BigEndian>,
}

impl<'a> TagReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            bs: BitReader::new(io::Cursor::new(data)),
        }
    }

    /// Total length of the region this reader covers.
    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Current read position in bytes.
    #[inline(always)]
    pub fn position(&mut self) -> Result<u64> {
        Ok(self.bs.position_in_bits()? >> 3)
    }

    #[inline(always)]
    pub fn remaining(&mut self) -> Result<u64> {
        Ok(self.len().saturating_sub(self.position()?))
    }

    #[inline(always)]
    fn require(&mut self, requested: u64) -> Result<()> {
        let position = self.position()?;
        let remaining = self.len().saturating_sub(position);
        if requested > remaining {
            bail!(TagError::Underflow {
                position,
                requested,
                remaining,
            });
        }

        Ok(())
    }

    /// Reads one raw `(tag, value)` pair.
    #[inline(always)]
    pub fn read_word(&mut self) -> Result<(i16, u16)> {
        self.require(SEGMENT_SIZE)?;
        let tag = self.bs.read_signed_var::<i16>(16)?;
        let value = self.bs.read_unsigned_var::<u16>(16)?;
        Ok((tag, value))
    }

    /// Borrows the next `len` bytes and moves past them.
    pub fn take_bytes(&mut self, len: u64) -> Result<&'a [u8]> {
        self.require(len)?;
        let start = self.position()? as usize;
        let end = start + len as usize;
        self.bs.seek_bits(SeekFrom::Start((end as u64) << 3))?;
        Ok(&self.data[start..end])
    }

    /// Moves the read position to an absolute byte offset inside the region.
    pub fn seek_to(&mut self, position: u64) -> Result<()> {
        if position > self.len() {
            let current = self.position()?;
            bail!(TagError::Underflow {
                position: current,
                requested: position.saturating_sub(current),
                remaining: self.len().saturating_sub(current),
            });
        }

        self.bs.seek_bits(SeekFrom::Start(position << 3))?;
        Ok(())
    }

    pub fn skip_bytes(&mut self, len: u64) -> Result<()> {
        self.require(len)?;
        self.bs.seek_bits(SeekFrom::Current(len as i64 * 8))?;
        Ok(())
    }

    /// Reads the next segment, including its chunk payload if it carries one.
    ///
    /// Returns `Ok(None)` once the region is exhausted on a segment boundary.
    pub fn next_segment(&mut self) -> Result<Option<Segment<'a>>> {
        let position = self.position()?;
        if position == self.len() {
            return Ok(None);
        }

        let (raw_tag, value) = self.read_word()?;
        let header = SegmentHeader::decode(raw_tag, value)?;

        let payload = match header.chunk_len() {
            Some(len) => self.take_bytes(len)?,
            None => &[],
        };

        trace!(
            "segment at {position}: tag {:#06X}{} value {value}",
            header.tag,
            if header.optional { " (optional)" } else { "" },
        );

        Ok(Some(Segment {
            header,
            value,
            position,
            payload,
        }))
    }
}

impl Default for TagReader<'_> {
    fn default() -> Self {
        Self::new(&[])
    }
}
