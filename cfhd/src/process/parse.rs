use anyhow::{Result, bail};
use log::trace;

use crate::process::codec::{Action, CodecState};
use crate::structs::sample::SampleHeader;
use crate::structs::tag::{CodecTag, SEGMENT_SIZE};
use crate::utils::bitstream_io::TagReader;
use crate::utils::errors::TagError;

/// Walks the segments of one sample through the codec state machine.
///
/// Wraps a [`TagReader`] over the sample and a [`CodecState`] seeded with
/// the stream defaults. The decoder drives it with [`Parser::next_action`];
/// [`Parser::parse_header`] reads the header alone without touching either.
#[derive(Debug)]
pub struct Parser<'a> {
    data: &'a [u8],
    reader: TagReader<'a>,
    state: CodecState<'a>,
}

impl<'a> Parser<'a> {
    pub fn new(data: &'a [u8], defaults: &SampleHeader) -> Self {
        Self {
            data,
            reader: TagReader::new(data),
            state: CodecState::new(defaults),
        }
    }

    /// Reads the sample header without decoding any coefficients.
    ///
    /// Stops once width, height, format, frame number and channel count are
    /// known, or at the index table or the first band marker. Returns the
    /// header with stream defaults filled in. Works on its own reader and
    /// state, so it can be called any number of times with the same result.
    pub fn parse_header(&self) -> Result<SampleHeader> {
        let mut reader = TagReader::new(self.data);
        let mut state = CodecState::new(self.state.defaults());

        loop {
            if state.effective_header().is_complete() {
                break;
            }

            let Some(segment) = reader.next_segment()? else {
                let header = state.effective_header();
                if header.width.is_none() || header.height.is_none() || header.channels.is_none()
                {
                    let position = reader.position()?;
                    bail!(TagError::Underflow {
                        position,
                        requested: SEGMENT_SIZE,
                        remaining: 0,
                    });
                }
                break;
            };

            if let Some(tag) = segment.tag() {
                if tag == CodecTag::Index || tag.is_band_marker() {
                    trace!("header ends at {:?} (offset {})", tag, segment.position);
                    break;
                }
            }

            state.apply(&segment)?;
        }

        Ok(state.effective_header())
    }

    /// Applies the next segment. Returns `None` at the end of the data.
    pub fn next_action(&mut self) -> Result<Option<Action<'a>>> {
        match self.reader.next_segment()? {
            Some(segment) => Ok(Some(self.state.apply(&segment)?)),
            None => Ok(None),
        }
    }

    pub fn position(&mut self) -> Result<u64> {
        self.reader.position()
    }

    pub fn len(&self) -> u64 {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reader.is_empty()
    }

    /// Moves forward to `position` without interpreting the bytes in
    /// between. Returns the number of bytes skipped. Seeking backwards means
    /// the bytes read so far disagree with the index table.
    pub fn skip_to(&mut self, position: u64) -> Result<u64> {
        let current = self.reader.position()?;
        if position < current {
            bail!(TagError::BackwardSeek {
                position: current,
                target: position,
            });
        }
        if position == current {
            return Ok(0);
        }

        self.reader.seek_to(position)?;
        trace!("skipped {} bytes to offset {position}", position - current);
        Ok(position - current)
    }

    pub fn state(&self) -> &CodecState<'a> {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut CodecState<'a> {
        &mut self.state
    }
}
