//! Codec state machine.
//!
//! Interprets one segment at a time and tells the driver what to do next.
//! Every check that can reject a segment runs before any state changes, so
//! a failed segment leaves the state as it was.

use std::ops::Range;

use anyhow::{Result, bail};
use log::trace;

use crate::structs::band::{BandEncoding, BandHeader, BandPayload};
use crate::structs::sample::{EncodedFormat, SampleHeader, SampleKind};
use crate::structs::tag::{CodecTag, Segment};
use crate::structs::transform::{PyramidLayout, TransformKind};
use crate::utils::errors::{CodecError, TagError};

/// What the driver has to do after a segment.
#[derive(Debug, Clone, Copy)]
pub enum Action<'a> {
    Continue,
    /// The channel index table is known; channel data follows.
    IndexParsed,
    EnterChannel(usize),
    DecodeBand(BandPayload<'a>),
    SecondEye(&'a [u8]),
    Trailer,
}

/// Band parameters collected since the last `SubbandNumber`.
#[derive(Debug, Default, Clone, Copy)]
struct PendingBand {
    subband: Option<usize>,
    width: Option<u16>,
    height: Option<u16>,
    quantization: u16,
    encoding: BandEncoding,
    codebook: u16,
    peak_level: u16,
}

#[derive(Debug, Default)]
pub struct CodecState<'a> {
    pub header: SampleHeader,
    /// Stream-level values from the last sequence header.
    defaults: SampleHeader,
    layout: Option<PyramidLayout>,

    channel_sizes: Option<Vec<u32>>,
    data_start: u64,
    channel: Option<usize>,
    next_channel: usize,

    band: PendingBand,
    peaks: &'a [u8],
}

impl<'a> CodecState<'a> {
    pub fn new(defaults: &SampleHeader) -> Self {
        Self {
            defaults: defaults.clone(),
            ..Default::default()
        }
    }

    /// The header with sequence defaults filled in.
    pub fn effective_header(&self) -> SampleHeader {
        let mut header = self.header.clone();
        header.inherit(&self.defaults);
        header
    }

    pub fn defaults(&self) -> &SampleHeader {
        &self.defaults
    }

    /// Sets the pyramid sub-band numbers are checked against.
    pub fn set_layout(&mut self, layout: PyramidLayout) {
        self.layout = Some(layout);
    }

    pub fn has_index(&self) -> bool {
        self.channel_sizes.is_some()
    }

    pub fn current_channel(&self) -> Option<usize> {
        self.channel
    }

    /// Channels whose `ChannelNumber` has been seen.
    pub fn channels_entered(&self) -> usize {
        self.next_channel
    }

    pub fn channel_count(&self) -> usize {
        self.channel_sizes.as_ref().map_or(0, Vec::len)
    }

    /// Byte range of a channel inside the sample, from the index table.
    pub fn channel_range(&self, channel: usize) -> Option<Range<u64>> {
        let sizes = self.channel_sizes.as_ref()?;
        if channel >= sizes.len() {
            return None;
        }

        let start = self.data_start + sizes[..channel].iter().map(|&s| s as u64).sum::<u64>();
        Some(start..start + sizes[channel] as u64)
    }

    pub fn channel_ranges(&self) -> Vec<Range<u64>> {
        (0..self.channel_count())
            .filter_map(|c| self.channel_range(c))
            .collect()
    }

    /// Offset where the last channel ends.
    pub fn data_end(&self) -> Option<u64> {
        self.channel_range(self.channel_count().checked_sub(1)?)
            .map(|range| range.end)
    }

    pub fn apply(&mut self, segment: &Segment<'a>) -> Result<Action<'a>> {
        self.check_channel_end(segment)?;

        let Some(tag) = segment.tag() else {
            if segment.is_optional() {
                trace!("skipping optional tag {:#06X}", segment.header.tag);
                return Ok(Action::Continue);
            }
            bail!(TagError::UnknownRequiredTag {
                tag: segment.header.tag,
                position: segment.position,
            });
        };

        let value = segment.value;
        let header = &mut self.header;

        match tag {
            CodecTag::SampleType => header.kind = Some(SampleKind::from_code(value)?),
            CodecTag::TransformType => header.transform = Some(TransformKind::from_code(value)?),
            CodecTag::NumFrames => header.frames = Some(value),
            CodecTag::NumChannels => header.channels = Some(value),
            CodecTag::NumWavelets => header.wavelets = Some(value),
            CodecTag::NumSubbands => header.subbands = Some(value),
            CodecTag::NumSpatial => header.spatial_levels = Some(value),
            CodecTag::ImageWidth => header.width = Some(value),
            CodecTag::ImageHeight => header.height = Some(value),
            CodecTag::FrameNumber => header.frame_number = Some(value),
            CodecTag::Precision => {
                if value > u8::MAX as u16 {
                    bail!(CodecError::Unsupported {
                        field: "precision",
                        value,
                    });
                }
                header.precision = Some(value as u8);
            }
            CodecTag::EncodedFormat => header.format = Some(EncodedFormat::from_code(value)?),
            CodecTag::PrescaleTable => header.prescale_table = Some(value),
            CodecTag::GroupTrailer => return Ok(Action::Trailer),
            CodecTag::Index => return self.apply_index(segment),
            CodecTag::ChannelNumber => return self.enter_channel(value as usize, segment),
            CodecTag::SubbandNumber => self.start_subband(value as usize)?,
            CodecTag::BandWidth => self.pending()?.width = Some(value),
            CodecTag::BandHeight => self.pending()?.height = Some(value),
            CodecTag::Quantization => self.pending()?.quantization = value,
            CodecTag::BandEncoding => self.pending()?.encoding = BandEncoding::from_code(value)?,
            CodecTag::Codebook => self.pending()?.codebook = value,
            CodecTag::PeakLevel => self.pending()?.peak_level = value,
            CodecTag::WaveletLevel => self.check_level(value)?,
            CodecTag::PeakTable => {
                self.pending()?;
                self.peaks = segment.payload;
            }
            CodecTag::BandData | CodecTag::LargeBandData => {
                return self.finish_band(segment.payload);
            }
            CodecTag::SecondEye => return Ok(Action::SecondEye(segment.payload)),
        }

        Ok(Action::Continue)
    }

    fn apply_index(&mut self, segment: &Segment<'a>) -> Result<Action<'a>> {
        if self.has_index() {
            bail!(CodecError::DuplicateIndex);
        }

        let declared = self
            .effective_header()
            .channels
            .ok_or(CodecError::MissingHeaderField("channel count"))? as usize;

        let sizes: Vec<u32> = segment
            .payload
            .chunks_exact(4)
            .map(|word| u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
            .collect();

        if sizes.len() != declared {
            bail!(CodecError::ChannelCountMismatch {
                index: sizes.len(),
                declared,
            });
        }

        self.channel_sizes = Some(sizes);
        self.data_start = segment.end();
        Ok(Action::IndexParsed)
    }

    /// Segments of the current channel have to end inside the byte range the
    /// index table gives it. The trailer and a second eye close the channel.
    fn check_channel_end(&self, segment: &Segment<'a>) -> Result<()> {
        if let Some(CodecTag::ChannelNumber | CodecTag::GroupTrailer | CodecTag::SecondEye) =
            segment.tag()
        {
            return Ok(());
        }

        let Some(channel) = self.channel else {
            return Ok(());
        };
        let Some(range) = self.channel_range(channel) else {
            return Ok(());
        };

        if segment.end() > range.end {
            bail!(CodecError::ChannelOverrun {
                channel,
                found: segment.end(),
                end: range.end,
            });
        }
        Ok(())
    }

    fn enter_channel(&mut self, channel: usize, segment: &Segment<'a>) -> Result<Action<'a>> {
        if !self.has_index() {
            bail!(CodecError::ChannelBeforeIndex);
        }

        if channel != self.next_channel || channel >= self.channel_count() {
            bail!(CodecError::UnexpectedChannel {
                found: channel,
                expected: self.next_channel,
            });
        }

        let range = self
            .channel_range(channel)
            .ok_or(CodecError::UnexpectedChannel {
                found: channel,
                expected: self.next_channel,
            })?;
        if segment.position != range.start {
            bail!(CodecError::ChannelOffsetMismatch {
                channel,
                found: segment.position,
                expected: range.start,
            });
        }
        if segment.end() > range.end {
            bail!(CodecError::ChannelOverrun {
                channel,
                found: segment.end(),
                end: range.end,
            });
        }

        self.channel = Some(channel);
        self.next_channel = channel + 1;
        self.band = PendingBand::default();
        self.peaks = &[];
        Ok(Action::EnterChannel(channel))
    }

    fn start_subband(&mut self, subband: usize) -> Result<()> {
        if self.channel.is_none() {
            bail!(CodecError::BandOutsideChannel);
        }

        match &self.layout {
            Some(layout) => {
                layout.subband(subband)?;
            }
            None => bail!(CodecError::BandOutsideChannel),
        }

        self.band = PendingBand {
            subband: Some(subband),
            quantization: 1,
            ..Default::default()
        };
        self.peaks = &[];
        Ok(())
    }

    fn pending(&mut self) -> Result<&mut PendingBand> {
        if self.band.subband.is_none() {
            bail!(CodecError::BandWithoutSubband);
        }
        Ok(&mut self.band)
    }

    fn check_level(&mut self, level: u16) -> Result<()> {
        let subband = self
            .band
            .subband
            .ok_or(CodecError::BandWithoutSubband)?;

        if let Some(layout) = &self.layout {
            let (wavelet, _) = layout.subband(subband)?;
            let expected = layout.wavelet(wavelet).level;
            if level != expected as u16 {
                bail!(CodecError::LevelMismatch {
                    subband,
                    found: level,
                    expected,
                });
            }
        }

        Ok(())
    }

    fn finish_band(&mut self, data: &'a [u8]) -> Result<Action<'a>> {
        if self.channel.is_none() {
            bail!(CodecError::BandOutsideChannel);
        }

        let band = self.band;
        let subband = band.subband.ok_or(CodecError::BandWithoutSubband)?;
        let (Some(width), Some(height)) = (band.width, band.height) else {
            bail!(CodecError::MissingBandDimensions(subband));
        };

        let payload = BandPayload {
            header: BandHeader {
                subband,
                width: width as usize,
                height: height as usize,
                quantization: band.quantization.max(1),
                encoding: band.encoding,
                codebook: band.codebook,
                peak_level: band.peak_level,
            },
            peaks: self.peaks,
            data,
        };

        self.band = PendingBand::default();
        self.peaks = &[];
        Ok(Action::DecodeBand(payload))
    }
}
