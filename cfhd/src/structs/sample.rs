//! Sample-level header fields.

use anyhow::{Result, bail};

use crate::structs::transform::{PyramidLayout, TransformKind};
use crate::utils::errors::CodecError;

pub const DEFAULT_PRECISION: u8 = 8;
/// Source bit depths the prescale rules are defined for.
pub const SUPPORTED_PRECISIONS: [u8; 3] = [8, 10, 12];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SampleKind {
    /// Key sample carrying a complete group.
    Group,
    /// Second frame of the preceding group.
    Frame,
    /// Key sample with a single spatial frame.
    IFrame,
    /// Defaults for the samples that follow, no picture.
    SequenceHeader,
}

impl SampleKind {
    pub fn from_code(code: u16) -> Result<Self> {
        Ok(match code {
            1 => SampleKind::Group,
            2 => SampleKind::Frame,
            3 => SampleKind::IFrame,
            4 => SampleKind::SequenceHeader,
            value => bail!(CodecError::InvalidHeaderValue {
                field: "sample type",
                value,
            }),
        })
    }

    pub fn code(self) -> u16 {
        match self {
            SampleKind::Group => 1,
            SampleKind::Frame => 2,
            SampleKind::IFrame => 3,
            SampleKind::SequenceHeader => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SampleKind::Group => "group",
            SampleKind::Frame => "frame",
            SampleKind::IFrame => "intra frame",
            SampleKind::SequenceHeader => "sequence header",
        }
    }

    pub fn is_key(self) -> bool {
        matches!(self, SampleKind::Group | SampleKind::IFrame)
    }

    pub fn is_difference(self) -> bool {
        self == SampleKind::Frame
    }

    pub fn is_droppable(self) -> bool {
        self == SampleKind::SequenceHeader
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncodedFormat {
    Yuv422,
    Rgb444,
    Rgba4444,
    Bayer,
    Gray,
}

impl EncodedFormat {
    pub fn from_code(code: u16) -> Result<Self> {
        Ok(match code {
            0 => EncodedFormat::Yuv422,
            1 => EncodedFormat::Rgb444,
            2 => EncodedFormat::Rgba4444,
            3 => EncodedFormat::Bayer,
            4 => EncodedFormat::Gray,
            value => bail!(CodecError::Unsupported {
                field: "encoded format",
                value,
            }),
        })
    }

    pub fn code(self) -> u16 {
        match self {
            EncodedFormat::Yuv422 => 0,
            EncodedFormat::Rgb444 => 1,
            EncodedFormat::Rgba4444 => 2,
            EncodedFormat::Bayer => 3,
            EncodedFormat::Gray => 4,
        }
    }

    pub fn channel_count(self) -> usize {
        match self {
            EncodedFormat::Gray => 1,
            EncodedFormat::Yuv422 | EncodedFormat::Rgb444 => 3,
            EncodedFormat::Rgba4444 | EncodedFormat::Bayer => 4,
        }
    }
}

/// Header fields as they appear in one sample; absent tags stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleHeader {
    pub kind: Option<SampleKind>,
    pub transform: Option<TransformKind>,
    pub frames: Option<u16>,
    pub channels: Option<u16>,
    pub wavelets: Option<u16>,
    pub subbands: Option<u16>,
    pub spatial_levels: Option<u16>,
    pub width: Option<u16>,
    pub height: Option<u16>,
    pub frame_number: Option<u16>,
    pub precision: Option<u8>,
    pub format: Option<EncodedFormat>,
    pub prescale_table: Option<u16>,
}

impl SampleHeader {
    /// The fields a header-only parse waits for.
    pub fn is_complete(&self) -> bool {
        self.width.is_some()
            && self.height.is_some()
            && self.format.is_some()
            && self.frame_number.is_some()
            && self.channels.is_some()
    }

    /// Takes every stream-level field this header lacks from `defaults`.
    ///
    /// Sample kind and frame number always belong to the sample itself.
    pub fn inherit(&mut self, defaults: &SampleHeader) {
        self.transform = self.transform.or(defaults.transform);
        self.frames = self.frames.or(defaults.frames);
        self.channels = self.channels.or(defaults.channels);
        self.wavelets = self.wavelets.or(defaults.wavelets);
        self.subbands = self.subbands.or(defaults.subbands);
        self.spatial_levels = self.spatial_levels.or(defaults.spatial_levels);
        self.width = self.width.or(defaults.width);
        self.height = self.height.or(defaults.height);
        self.precision = self.precision.or(defaults.precision);
        self.format = self.format.or(defaults.format);
        self.prescale_table = self.prescale_table.or(defaults.prescale_table);
    }

    /// Overwrites fields with every field `update` carries.
    pub fn merge(&mut self, update: &SampleHeader) {
        let mut merged = update.clone();
        merged.inherit(self);
        merged.kind = update.kind.or(self.kind);
        merged.frame_number = update.frame_number.or(self.frame_number);
        *self = merged;
    }

    /// Validates a picture-carrying header and derives its pyramid.
    pub fn resolve(&self) -> Result<SampleInfo> {
        let kind = self
            .kind
            .ok_or(CodecError::MissingHeaderField("sample type"))?;
        let width = self.width.ok_or(CodecError::MissingHeaderField("width"))?;
        let height = self.height.ok_or(CodecError::MissingHeaderField("height"))?;
        let channels = self
            .channels
            .ok_or(CodecError::MissingHeaderField("channel count"))?;

        for (field, value) in [("width", width), ("height", height), ("channel count", channels)] {
            if value == 0 {
                bail!(CodecError::InvalidHeaderValue { field, value });
            }
        }

        let precision = self.precision.unwrap_or(DEFAULT_PRECISION);
        if !SUPPORTED_PRECISIONS.contains(&precision) {
            bail!(CodecError::Unsupported {
                field: "precision",
                value: precision as u16,
            });
        }

        let transform = self.transform.unwrap_or_default();
        if kind == SampleKind::IFrame && transform != TransformKind::Spatial {
            bail!(CodecError::Unsupported {
                field: "intra frame transform type",
                value: transform.code(),
            });
        }

        let layout = match transform {
            TransformKind::Spatial => {
                let levels = self
                    .spatial_levels
                    .ok_or(CodecError::MissingHeaderField("spatial levels"))?;
                PyramidLayout::spatial(levels as usize)?
            }
            TransformKind::FieldPlus => PyramidLayout::field_plus(),
        };

        for (field, declared, expected) in [
            ("wavelets", self.wavelets, layout.wavelet_count()),
            ("sub-bands", self.subbands, layout.subband_count()),
            ("frames", self.frames, layout.frame_count()),
        ] {
            if let Some(declared) = declared {
                if declared as usize != expected {
                    bail!(CodecError::LayoutMismatch {
                        field,
                        declared: declared as usize,
                        expected,
                    });
                }
            }
        }

        let prescale = match self.prescale_table {
            Some(table) => layout.prescale_from_table(table),
            None => layout.default_prescale(precision),
        };

        Ok(SampleInfo {
            kind,
            width: width as usize,
            height: height as usize,
            channels: channels as usize,
            frame_number: self.frame_number.unwrap_or(0),
            precision,
            format: self.format,
            layout,
            prescale,
        })
    }
}

/// A validated key-sample header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleInfo {
    pub kind: SampleKind,
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub frame_number: u16,
    pub precision: u8,
    pub format: Option<EncodedFormat>,
    pub layout: PyramidLayout,
    pub prescale: Vec<u8>,
}
