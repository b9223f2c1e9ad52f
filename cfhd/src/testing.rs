//! Reference encoder used by the decoder's tests.
//!
//! Produces bitstreams with the reference codebook, and the forward wavelet
//! transforms the decoder inverts.

use crate::structs::band::BandEncoding;
use crate::structs::codebook::REFERENCE_PEAK_LEVEL;
use crate::structs::sample::{EncodedFormat, SampleKind};
use crate::structs::tag::{CodecTag, SegmentHeader};
use crate::structs::transform::{PyramidLayout, Target, TransformKind};
use crate::structs::wavelet::WaveletKind;

#[derive(Debug, Default)]
struct NibbleWriter {
    bytes: Vec<u8>,
    pending: Option<u8>,
}

impl NibbleWriter {
    fn push(&mut self, nibble: u8) {
        match self.pending.take() {
            Some(high) => self.bytes.push(high << 4 | (nibble & 0xF)),
            None => self.pending = Some(nibble & 0xF),
        }
    }

    /// Ends a pass: band-end nibble, then padding to the byte boundary.
    fn end_pass(&mut self) {
        self.push(0);
        if self.pending.is_some() {
            self.push(0);
        }
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

fn push_zero_run(writer: &mut NibbleWriter, mut run: usize) {
    const RUNS: [(usize, u8); 6] = [(64, 6), (16, 5), (8, 4), (4, 3), (2, 2), (1, 1)];

    while run > 0 {
        for &(len, nibble) in &RUNS {
            if run >= len {
                writer.push(nibble);
                run -= len;
                break;
            }
        }
    }
}

fn push_value(writer: &mut NibbleWriter, peaks: &mut Vec<u8>, value: i32) {
    match value {
        1 => writer.push(0x7),
        -1 => writer.push(0x8),
        2..=8 => {
            writer.push(0xF);
            writer.push((value - 2) as u8);
        }
        -8..=-2 => {
            writer.push(0xF);
            writer.push((-value + 6) as u8);
        }
        _ => {
            // 9 or -9 from the escape state is a peak marker.
            writer.push(0xF);
            writer.push(if value > 0 { 0x7 } else { 0xF });
            peaks.extend_from_slice(&(value as i16).to_be_bytes());
        }
    }
}

/// Encodes one pass of values with the reference codebook.
fn encode_pass(writer: &mut NibbleWriter, peaks: &mut Vec<u8>, values: &[i32]) {
    let mut i = 0;
    while i < values.len() {
        let zeros = values[i..].iter().take_while(|&&v| v == 0).count();
        if zeros > 0 {
            // A single zero ahead of ±1 fits one nibble.
            if zeros == 1 && matches!(values.get(i + 1), Some(1 | -1)) {
                writer.push(if values[i + 1] == 1 { 0xB } else { 0xC });
                i += 2;
                continue;
            }
            push_zero_run(writer, zeros);
            i += zeros;
            continue;
        }

        match (values[i], values.get(i + 1)) {
            (1, Some(1)) => {
                writer.push(0x9);
                i += 2;
            }
            (-1, Some(-1)) => {
                writer.push(0xA);
                i += 2;
            }
            (value @ (1 | -1), Some(0)) => {
                writer.push(if value == 1 { 0xD } else { 0xE });
                i += 2;
            }
            (value, _) => {
                push_value(writer, peaks, value);
                i += 1;
            }
        }
    }
    writer.end_pass();
}

/// Quantizes and encodes a lossy band. Returns `(payload, peak table)`.
pub fn encode_lossy_band(values: &[i16], quantization: u16) -> (Vec<u8>, Vec<u8>) {
    let q = quantization.max(1) as i32;
    let limit = i16::MAX as i32 / q;
    let quantized: Vec<i32> = values
        .iter()
        .map(|&v| {
            let v = v as i32;
            let rounded = (v.abs() + q / 2) / q * v.signum();
            rounded.clamp(-limit, limit)
        })
        .collect();

    let mut writer = NibbleWriter::default();
    let mut peaks = Vec::new();
    encode_pass(&mut writer, &mut peaks, &quantized);
    (writer.finish(), peaks)
}

/// Encodes a lossless band as low bytes then high bytes.
pub fn encode_lossless_band(values: &[i16]) -> (Vec<u8>, Vec<u8>) {
    let low: Vec<i32> = values.iter().map(|&v| v as i32 & 0xFF).collect();
    let high: Vec<i32> = values.iter().map(|&v| v as i32 >> 8).collect();

    let mut writer = NibbleWriter::default();
    let mut peaks = Vec::new();
    encode_pass(&mut writer, &mut peaks, &low);
    encode_pass(&mut writer, &mut peaks, &high);
    (writer.finish(), peaks)
}

fn predict(low: &[i32], i: usize) -> i32 {
    let n = low.len();
    if n < 3 {
        0
    } else if i == 0 {
        (3 * low[0] - 4 * low[1] + low[2] + 4) >> 3
    } else if i == n - 1 {
        (-3 * low[n - 1] + 4 * low[n - 2] - low[n - 3] + 4) >> 3
    } else {
        (low[i - 1] - low[i + 1] + 4) >> 3
    }
}

/// Forward 1-D lifting step on an even-length signal.
pub fn forward_lifting(signal: &[i32]) -> (Vec<i32>, Vec<i32>) {
    let low: Vec<i32> = signal.chunks_exact(2).map(|p| p[0] + p[1]).collect();
    let high = signal
        .chunks_exact(2)
        .enumerate()
        .map(|(i, p)| p[0] - p[1] - predict(&low, i))
        .collect();
    (low, high)
}

/// Forward 2-D transform: rows, then columns. Returns bands 0..=3 of
/// `width/2 × height/2` each.
pub fn forward_2d(input: &[i32], width: usize, height: usize) -> [Vec<i32>; 4] {
    let half_w = width / 2;
    let half_h = height / 2;

    let mut row_low = vec![0; half_w * height];
    let mut row_high = vec![0; half_w * height];
    for y in 0..height {
        let (l, h) = forward_lifting(&input[y * width..(y + 1) * width]);
        row_low[y * half_w..(y + 1) * half_w].copy_from_slice(&l);
        row_high[y * half_w..(y + 1) * half_w].copy_from_slice(&h);
    }

    let columns = |source: &[i32]| {
        let mut low = vec![0; half_w * half_h];
        let mut high = vec![0; half_w * half_h];
        for x in 0..half_w {
            let column: Vec<i32> = (0..height).map(|y| source[y * half_w + x]).collect();
            let (l, h) = forward_lifting(&column);
            for y in 0..half_h {
                low[y * half_w + x] = l[y];
                high[y * half_w + x] = h[y];
            }
        }
        (low, high)
    };

    let (b0, b2) = columns(&row_low);
    let (b1, b3) = columns(&row_high);
    [b0, b1, b2, b3]
}

/// Coefficients of one coded sub-band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedBand {
    pub subband: usize,
    pub width: usize,
    pub height: usize,
    pub level: u8,
    pub quantization: u16,
    pub encoding: BandEncoding,
    pub coefficients: Vec<i16>,
}

/// Runs the forward pyramid over centered frames (one per layout frame) and
/// returns every coded sub-band in sub-band order.
pub fn encode_pyramid(
    layout: &PyramidLayout,
    frames: &[Vec<i32>],
    width: usize,
    height: usize,
    prescale: &[u8],
) -> Vec<EncodedBand> {
    let count = layout.wavelet_count();
    let mut bands: Vec<Vec<Vec<i32>>> = vec![Vec::new(); count];
    let mut dims = vec![(0, 0); count];

    let input = |bands: &Vec<Vec<Vec<i32>>>, dims: &Vec<(usize, usize)>, target: Target| match target
    {
        Target::Frame(f) => (frames[f].clone(), width, height),
        Target::Band { wavelet, band } => {
            let (w, h) = dims[wavelet];
            (bands[wavelet][band].clone(), w, h)
        }
    };

    for index in 0..count {
        let spec = layout.wavelet(index);
        let shift = prescale.get(index).copied().unwrap_or(0);

        match spec.kind {
            WaveletKind::Temporal => {
                let (a, w, h) = input(&bands, &dims, spec.targets[0]);
                let (b, _, _) = input(&bands, &dims, spec.targets[1]);
                let low = a.iter().zip(&b).map(|(&a, &b)| (a >> shift) + (b >> shift)).collect();
                let high = a.iter().zip(&b).map(|(&a, &b)| (a >> shift) - (b >> shift)).collect();
                bands[index] = vec![low, high];
                dims[index] = (w, h);
            }
            WaveletKind::Frame | WaveletKind::Spatial => {
                let (source, w, h) = input(&bands, &dims, spec.targets[0]);
                let shifted: Vec<i32> = source.iter().map(|&v| v >> shift).collect();
                let clamp = |band: Vec<i32>| -> Vec<i32> {
                    band.into_iter()
                        .map(|v| v.clamp(i16::MIN as i32, i16::MAX as i32))
                        .collect()
                };
                bands[index] = forward_2d(&shifted, w, h).into_iter().map(clamp).collect();
                dims[index] = (w / 2, h / 2);
            }
        }
    }

    layout
        .subbands()
        .iter()
        .enumerate()
        .map(|(subband, &(wavelet, band))| {
            let (width, height) = dims[wavelet];
            EncodedBand {
                subband,
                width,
                height,
                level: layout.wavelet(wavelet).level,
                quantization: 1,
                encoding: BandEncoding::Lossy,
                coefficients: bands[wavelet][band].iter().map(|&v| v as i16).collect(),
            }
        })
        .collect()
}

/// Appends segments and chunks.
#[derive(Debug, Default, Clone)]
pub struct SampleBuilder {
    bytes: Vec<u8>,
}

impl SampleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw(&mut self, tag: i16, value: u16) -> &mut Self {
        self.bytes.extend_from_slice(&tag.to_be_bytes());
        self.bytes.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn tag(&mut self, tag: CodecTag, value: u16) -> &mut Self {
        self.raw(tag.id() as i16, value)
    }

    /// Appends already encoded segments.
    pub fn extend(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn optional(&mut self, id: u16, value: u16) -> &mut Self {
        self.raw(-(id as i16), value)
    }

    /// Writes a sized chunk, zero padding the payload to whole words.
    pub fn chunk_with_id(&mut self, id: u16, optional: bool, payload: &[u8]) -> &mut Self {
        let words = payload.len().div_ceil(4);
        let (raw, value) = SegmentHeader::encode(id, optional, Some(words as u32));
        self.raw(raw, value);
        self.bytes.extend_from_slice(payload);
        self.bytes.resize(self.bytes.len() + words * 4 - payload.len(), 0);
        self
    }

    pub fn chunk(&mut self, tag: CodecTag, payload: &[u8]) -> &mut Self {
        self.chunk_with_id(tag.id(), false, payload)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn build(&self) -> Vec<u8> {
        self.bytes.clone()
    }
}

/// Everything needed to write one picture-carrying sample.
#[derive(Debug, Clone)]
pub struct SampleSpec {
    pub kind: SampleKind,
    pub transform: TransformKind,
    pub spatial_levels: usize,
    pub width: usize,
    pub height: usize,
    pub precision: u8,
    pub format: EncodedFormat,
    pub frame_number: u16,
    pub prescale_table: Option<u16>,
    pub channels: Vec<Vec<EncodedBand>>,
    pub second_eye: Option<Vec<u8>>,
    /// Use large chunks for band payloads.
    pub large_chunks: bool,
}

impl SampleSpec {
    /// A spatial group with one zero lowpass band per channel.
    pub fn zero_lowpass(width: usize, height: usize, channels: usize) -> Self {
        let band = EncodedBand {
            subband: 0,
            width,
            height,
            level: 1,
            quantization: 1,
            encoding: BandEncoding::Lossy,
            coefficients: vec![0; width * height],
        };

        Self {
            kind: SampleKind::Group,
            transform: TransformKind::Spatial,
            spatial_levels: 1,
            width: width * 2,
            height: height * 2,
            precision: 8,
            format: EncodedFormat::Gray,
            frame_number: 0,
            prescale_table: None,
            channels: vec![vec![band]; channels],
            second_eye: None,
            large_chunks: false,
        }
    }

    /// Encodes pixel planes through the full pyramid.
    ///
    /// `planes` holds `frames × channels` planes, frame-major. Highpass bands
    /// use `quantization`; with 1 they are written lossless.
    pub fn from_planes(
        transform: TransformKind,
        spatial_levels: usize,
        width: usize,
        height: usize,
        precision: u8,
        planes: &[Vec<u16>],
        quantization: u16,
    ) -> Self {
        let prescale = Self::layout(transform, spatial_levels).default_prescale(precision);
        Self::encode_planes(
            transform,
            spatial_levels,
            (width, height),
            precision,
            planes,
            quantization,
            &prescale,
        )
    }

    /// Like [`SampleSpec::from_planes`], lossless, with the prescale shifts
    /// taken from an explicit `PrescaleTable` value that the header carries.
    pub fn from_planes_with_prescale_table(
        transform: TransformKind,
        spatial_levels: usize,
        width: usize,
        height: usize,
        precision: u8,
        planes: &[Vec<u16>],
        table: u16,
    ) -> Self {
        let prescale = Self::layout(transform, spatial_levels).prescale_from_table(table);
        let mut spec = Self::encode_planes(
            transform,
            spatial_levels,
            (width, height),
            precision,
            planes,
            1,
            &prescale,
        );
        spec.prescale_table = Some(table);
        spec
    }

    fn layout(transform: TransformKind, spatial_levels: usize) -> PyramidLayout {
        match transform {
            TransformKind::Spatial => PyramidLayout::spatial(spatial_levels),
            TransformKind::FieldPlus => Ok(PyramidLayout::field_plus()),
        }
        .expect("valid test layout")
    }

    fn encode_planes(
        transform: TransformKind,
        spatial_levels: usize,
        (width, height): (usize, usize),
        precision: u8,
        planes: &[Vec<u16>],
        quantization: u16,
        prescale: &[u8],
    ) -> Self {
        let layout = Self::layout(transform, spatial_levels);
        let frames = layout.frame_count();
        let channels = planes.len() / frames;
        let mid = 1i32 << (precision - 1);

        let encoded = (0..channels)
            .map(|c| {
                let centered: Vec<Vec<i32>> = (0..frames)
                    .map(|f| planes[f * channels + c].iter().map(|&p| p as i32 - mid).collect())
                    .collect();
                let mut bands = encode_pyramid(&layout, &centered, width, height, prescale);
                for band in bands.iter_mut().filter(|b| b.subband != 0) {
                    if quantization > 1 {
                        band.quantization = quantization;
                    } else {
                        band.encoding = BandEncoding::Lossless;
                    }
                }
                bands
            })
            .collect();

        Self {
            kind: SampleKind::Group,
            transform,
            spatial_levels,
            width,
            height,
            precision,
            format: if channels == 1 {
                EncodedFormat::Gray
            } else {
                EncodedFormat::Rgb444
            },
            frame_number: 1,
            prescale_table: None,
            channels: encoded,
            second_eye: None,
            large_chunks: false,
        }
    }

    fn write_band(&self, builder: &mut SampleBuilder, band: &EncodedBand) {
        let (data, peaks) = match band.encoding {
            BandEncoding::Lossy => encode_lossy_band(&band.coefficients, band.quantization),
            BandEncoding::Lossless => encode_lossless_band(&band.coefficients),
        };

        builder
            .tag(CodecTag::SubbandNumber, band.subband as u16)
            .tag(CodecTag::BandWidth, band.width as u16)
            .tag(CodecTag::BandHeight, band.height as u16)
            .tag(CodecTag::WaveletLevel, band.level as u16)
            .tag(CodecTag::Quantization, band.quantization)
            .tag(CodecTag::BandEncoding, band.encoding.code())
            .tag(CodecTag::Codebook, 0)
            .tag(CodecTag::PeakLevel, REFERENCE_PEAK_LEVEL);
        if !peaks.is_empty() {
            builder.chunk(CodecTag::PeakTable, &peaks);
        }
        builder.chunk(
            if self.large_chunks {
                CodecTag::LargeBandData
            } else {
                CodecTag::BandData
            },
            &data,
        );
    }

    /// Writes the header tags, up to but excluding the index.
    pub fn write_header(&self, builder: &mut SampleBuilder) {
        let wavelets = match self.transform {
            TransformKind::Spatial => self.spatial_levels,
            TransformKind::FieldPlus => 6,
        };
        let subbands = match self.transform {
            TransformKind::Spatial => 1 + 3 * self.spatial_levels,
            TransformKind::FieldPlus => 17,
        };

        builder
            .tag(CodecTag::SampleType, self.kind.code())
            .tag(CodecTag::TransformType, self.transform.code())
            .tag(CodecTag::NumChannels, self.channels.len() as u16)
            .tag(CodecTag::NumWavelets, wavelets as u16)
            .tag(CodecTag::NumSubbands, subbands as u16)
            .tag(CodecTag::NumSpatial, self.spatial_levels as u16)
            .tag(CodecTag::ImageWidth, self.width as u16)
            .tag(CodecTag::ImageHeight, self.height as u16)
            .tag(CodecTag::FrameNumber, self.frame_number)
            .tag(CodecTag::Precision, self.precision as u16)
            .tag(CodecTag::EncodedFormat, self.format.code());
        if let Some(table) = self.prescale_table {
            builder.optional(CodecTag::PrescaleTable.id(), table);
        }
    }

    /// Encoded bytes of each channel, starting with its `ChannelNumber`.
    pub fn channel_bytes(&self) -> Vec<Vec<u8>> {
        self.channels
            .iter()
            .enumerate()
            .map(|(c, bands)| {
                let mut builder = SampleBuilder::new();
                builder.tag(CodecTag::ChannelNumber, c as u16);
                for band in bands {
                    self.write_band(&mut builder, band);
                }
                builder.build()
            })
            .collect()
    }

    /// Segments and chunks of one band, as they appear inside a channel.
    pub fn band_bytes(&self, band: &EncodedBand) -> Vec<u8> {
        let mut builder = SampleBuilder::new();
        self.write_band(&mut builder, band);
        builder.build()
    }

    pub fn encode(&self) -> Vec<u8> {
        self.encode_channels(self.channel_bytes())
    }

    /// Wraps already encoded channels in this sample's header, index and
    /// trailer.
    pub fn encode_channels(&self, channels: Vec<Vec<u8>>) -> Vec<u8> {
        let mut builder = SampleBuilder::new();
        self.write_header(&mut builder);

        let index: Vec<u8> = channels
            .iter()
            .flat_map(|c| (c.len() as u32).to_be_bytes())
            .collect();
        builder.chunk(CodecTag::Index, &index);

        let mut bytes = builder.build();
        for channel in channels {
            bytes.extend_from_slice(&channel);
        }

        let mut tail = SampleBuilder::new();
        if let Some(eye) = &self.second_eye {
            tail.chunk(CodecTag::SecondEye, eye);
        }
        tail.tag(CodecTag::GroupTrailer, 0);
        bytes.extend_from_slice(tail.bytes());
        bytes
    }
}

/// Deterministic test picture.
pub fn gradient(width: usize, height: usize, precision: u8, seed: u32) -> Vec<u16> {
    let max = (1u32 << precision) - 1;
    (0..width * height)
        .map(|i| {
            let (x, y) = ((i % width) as u32, (i / width) as u32);
            ((x * 7 + y * 13 + seed * 31 + (x * y) % 5) % (max + 1)) as u16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nibbles_pack_high_first() {
        let mut writer = NibbleWriter::default();
        writer.push(0x7);
        writer.push(0x8);
        writer.push(0x9);
        writer.end_pass();
        assert_eq!(writer.finish(), vec![0x78, 0x90]);
    }

    #[test]
    fn forward_lifting_matches_definition() {
        let (low, high) = forward_lifting(&[4, 2, 6, 6, 1, 3]);
        assert_eq!(low, vec![6, 12, 4]);
        // p0 = (18 - 48 + 4 + 4) >> 3 = -3, p1 = (6 - 4 + 4) >> 3 = 0,
        // p2 = (-12 + 48 - 6 + 4) >> 3 = 4
        assert_eq!(high, vec![2 + 3, 0, -2 - 4]);
    }

    #[test]
    fn chunks_are_word_padded() {
        let mut builder = SampleBuilder::new();
        builder.chunk(CodecTag::BandData, &[1, 2, 3, 4, 5]);
        assert_eq!(builder.len(), 4 + 8);
        assert_eq!(&builder.bytes()[..4], &[0x40, 0x29, 0x00, 0x02]);
    }
}
