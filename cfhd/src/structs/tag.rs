//! Tag/value segments and the codec tag catalogue.
//!
//! Every segment is a big-endian `(tag: i16, value: u16)` word. A negative tag
//! is optional and may be ignored when unrecognized. Two tag bit patterns
//! carry an inline word count for a payload that directly follows the
//! segment:
//!
//! - `|tag| & 0x4000`: small chunk, `value` words.
//! - `|tag| & 0x6000 == 0x2000`: large chunk, id `|tag| & 0xFF00`,
//!   `((|tag| & 0xFF) << 16) | value` words.
//!
//! Chunk payloads can be bypassed by position without knowing the tag.

use anyhow::{Result, bail};

use crate::utils::errors::TagError;

/// Size of one segment in bytes.
pub const SEGMENT_SIZE: u64 = 4;

/// Chunk sizes are counted in 32-bit words.
pub const CHUNK_WORD_SIZE: u64 = 4;

pub const SMALL_CHUNK_FLAG: u16 = 0x4000;
pub const LARGE_CHUNK_FLAG: u16 = 0x2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkSize {
    /// 16-bit word count held in the value.
    Small(u16),
    /// 24-bit word count split between the tag's low byte and the value.
    Large(u32),
}

impl ChunkSize {
    pub fn words(&self) -> u32 {
        match *self {
            ChunkSize::Small(words) => words as u32,
            ChunkSize::Large(words) => words,
        }
    }

    pub fn bytes(&self) -> u64 {
        self.words() as u64 * CHUNK_WORD_SIZE
    }
}

/// Decoded form of a segment's tag field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Tag id with the optional marker and any inline size removed.
    pub tag: u16,
    pub optional: bool,
    pub chunk: Option<ChunkSize>,
}

impl SegmentHeader {
    pub fn decode(raw_tag: i16, value: u16) -> Result<Self> {
        let optional = raw_tag < 0;
        let magnitude = raw_tag.unsigned_abs();

        if magnitude & 0x8000 != 0 {
            bail!(TagError::ReservedTag(magnitude));
        }

        let (tag, chunk) = if magnitude & SMALL_CHUNK_FLAG != 0 {
            (magnitude, Some(ChunkSize::Small(value)))
        } else if magnitude & LARGE_CHUNK_FLAG != 0 {
            let words = ((magnitude as u32 & 0xFF) << 16) | value as u32;
            (magnitude & 0xFF00, Some(ChunkSize::Large(words)))
        } else {
            (magnitude, None)
        };

        Ok(Self {
            tag,
            optional,
            chunk,
        })
    }

    pub fn chunk_len(&self) -> Option<u64> {
        self.chunk.map(|chunk| chunk.bytes())
    }

    /// Re-encodes the tag field (inverse of [`SegmentHeader::decode`]).
    pub fn encode(tag: u16, optional: bool, chunk_words: Option<u32>) -> (i16, u16) {
        let (magnitude, value) = match chunk_words {
            Some(words) if tag & SMALL_CHUNK_FLAG == 0 && tag & LARGE_CHUNK_FLAG != 0 => {
                (tag | ((words >> 16) & 0xFF) as u16, words as u16)
            }
            Some(words) => (tag, words as u16),
            None => (tag, 0),
        };

        let raw = magnitude as i16;
        (if optional { -raw } else { raw }, value)
    }
}

/// One parsed segment, with its chunk payload when it has one.
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    pub header: SegmentHeader,
    pub value: u16,
    /// Byte offset of the segment inside the sample.
    pub position: u64,
    pub payload: &'a [u8],
}

impl Segment<'_> {
    pub fn tag(&self) -> Option<CodecTag> {
        CodecTag::from_id(self.header.tag)
    }

    pub fn is_optional(&self) -> bool {
        self.header.optional
    }

    /// Byte offset directly after the segment and its payload.
    pub fn end(&self) -> u64 {
        self.position + SEGMENT_SIZE + self.payload.len() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum CodecTag {
    SampleType = 0x0001,
    TransformType = 0x0003,
    NumFrames = 0x0004,
    NumChannels = 0x0005,
    NumWavelets = 0x0006,
    NumSubbands = 0x0007,
    NumSpatial = 0x0008,
    ImageWidth = 0x000A,
    ImageHeight = 0x000B,
    FrameNumber = 0x000C,
    Precision = 0x000D,
    EncodedFormat = 0x000E,
    PrescaleTable = 0x000F,
    GroupTrailer = 0x0010,
    ChannelNumber = 0x0013,
    SubbandNumber = 0x0020,
    BandWidth = 0x0021,
    BandHeight = 0x0022,
    Quantization = 0x0023,
    BandEncoding = 0x0024,
    Codebook = 0x0025,
    PeakLevel = 0x0026,
    WaveletLevel = 0x0028,
    Index = 0x4002,
    PeakTable = 0x4027,
    BandData = 0x4029,
    LargeBandData = 0x2100,
    SecondEye = 0x2200,
}

impl CodecTag {
    pub fn from_id(id: u16) -> Option<Self> {
        use CodecTag::*;

        Some(match id {
            0x0001 => SampleType,
            0x0003 => TransformType,
            0x0004 => NumFrames,
            0x0005 => NumChannels,
            0x0006 => NumWavelets,
            0x0007 => NumSubbands,
            0x0008 => NumSpatial,
            0x000A => ImageWidth,
            0x000B => ImageHeight,
            0x000C => FrameNumber,
            0x000D => Precision,
            0x000E => EncodedFormat,
            0x000F => PrescaleTable,
            0x0010 => GroupTrailer,
            0x0013 => ChannelNumber,
            0x0020 => SubbandNumber,
            0x0021 => BandWidth,
            0x0022 => BandHeight,
            0x0023 => Quantization,
            0x0024 => BandEncoding,
            0x0025 => Codebook,
            0x0026 => PeakLevel,
            0x0028 => WaveletLevel,
            0x4002 => Index,
            0x4027 => PeakTable,
            0x4029 => BandData,
            0x2100 => LargeBandData,
            0x2200 => SecondEye,
            _ => return None,
        })
    }

    pub fn id(self) -> u16 {
        self as u16
    }

    /// Tags that mark the start of coded band data.
    pub fn is_band_marker(self) -> bool {
        matches!(
            self,
            CodecTag::ChannelNumber
                | CodecTag::SubbandNumber
                | CodecTag::BandData
                | CodecTag::LargeBandData
        )
    }
}
