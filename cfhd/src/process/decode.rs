use std::ops::Range;
use std::sync::Arc;
use std::thread;

use anyhow::{Result, bail};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::log_or_err;
use crate::process::codec::Action;
use crate::process::entropy::{EntropyBackend, FsmBackend};
use crate::process::parse::Parser;
use crate::process::reconstruct::{CascadeJob, Reconstructor, axis_output, lowpass_output};
use crate::structs::band::BandPayload;
use crate::structs::codebook::{CodebookSupplier, ReferenceCodebooks};
use crate::structs::frame::{FrameBuffer, Plane};
use crate::structs::fsm::FsmTable;
use crate::structs::plan::{OutputSource, ReconstructionPlan, Resolution};
use crate::structs::sample::{SampleHeader, SampleInfo, SampleKind};
use crate::structs::transform::Transform;
use crate::utils::buffer_pool::BufferPool;
use crate::utils::errors::{CodecError, EntropyError, ReconstructError};

/// Decoder settings.
///
/// Every field has a default, so a partial YAML or JSON document is enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Output resolution requested for every sample.
    pub resolution: Resolution,
    /// Reconstruction worker threads; 0 reconstructs on the calling thread.
    pub threads: usize,
    /// Fail on conditions that are otherwise concealed with a warning.
    pub strict: bool,
    /// Decode the nested second-eye sample when one is present.
    pub decode_second_eye: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            resolution: Resolution::Full,
            threads: 0,
            strict: false,
            decode_second_eye: true,
        }
    }
}

/// What one call to [`Decoder::decode_sample`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleReport {
    pub kind: SampleKind,
    /// Header with stream defaults filled in.
    pub header: SampleHeader,
    /// Per channel, bit `s` set once sub-band `s` was seen.
    pub decoded_subbands: Vec<u32>,
    /// Byte range of each channel, from the index table.
    pub channel_ranges: Vec<Range<u64>>,
    /// Bytes passed over without entropy decoding.
    pub skipped_bytes: u64,
    /// Damaged bands replaced with zeros.
    pub concealed_bands: usize,
    pub reconstructed_wavelets: usize,
    /// Offset where parsing stopped.
    pub end_position: u64,
    /// Whether the output buffer holds a picture.
    pub frame_produced: bool,
    pub second_eye: Option<Box<SampleReport>>,
}

impl SampleReport {
    fn new(kind: SampleKind, header: SampleHeader) -> Self {
        Self {
            kind,
            header,
            decoded_subbands: Vec::new(),
            channel_ranges: Vec::new(),
            skipped_bytes: 0,
            concealed_bands: 0,
            reconstructed_wavelets: 0,
            end_position: 0,
            frame_produced: false,
            second_eye: None,
        }
    }
}

/// Decodes wavelet samples into planar pictures.
///
/// Keeps the channel pyramids, the stream defaults from the last sequence
/// header and the second frame of the last two-frame group between calls.
#[derive(Debug)]
pub struct Decoder {
    state: DecoderState,
}

impl Decoder {
    /// Builds a decoder with the reference codebook.
    pub fn new(config: DecoderConfig) -> Result<Self> {
        Self::with_codebooks(config, &ReferenceCodebooks)
    }

    /// Builds a decoder, consulting `supplier` once for its codebooks.
    pub fn with_codebooks(config: DecoderConfig, supplier: &dyn CodebookSupplier) -> Result<Self> {
        let codebooks = Arc::new(supplier.codebooks()?);
        info!(
            "decoder: {} codebook(s), {} resolution, {} thread(s)",
            codebooks.len(),
            config.resolution.name(),
            config.threads
        );
        Ok(Self::from_parts(config, codebooks, Arc::new(FsmBackend)))
    }

    fn from_parts(
        config: DecoderConfig,
        codebooks: Arc<Vec<FsmTable>>,
        entropy: Arc<dyn EntropyBackend>,
    ) -> Self {
        Self {
            state: DecoderState::new(config, codebooks, entropy),
        }
    }

    /// Replaces the entropy decoding strategy.
    pub fn with_entropy_backend(mut self, entropy: Arc<dyn EntropyBackend>) -> Self {
        self.state.entropy = entropy;
        self.state.second_eye = None;
        self
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.state.config
    }

    /// Stream defaults collected from sequence headers.
    pub fn defaults(&self) -> &SampleHeader {
        &self.state.defaults
    }

    /// Reads a sample's header without decoding it or changing any state.
    pub fn parse_header(&self, data: &[u8]) -> Result<SampleHeader> {
        Parser::new(data, &self.state.defaults).parse_header()
    }

    /// Decodes one sample into `output`.
    ///
    /// Errors raised before the channel index leave `output` and the decoder
    /// as they were. Later errors leave `output` zero-filled at the expected
    /// geometry.
    pub fn decode_sample(&mut self, data: &[u8], output: &mut FrameBuffer) -> Result<SampleReport> {
        self.state.decode_sample(data, output)
    }

    /// Sets the failure level for validation errors.
    ///
    /// - `log::Level::Error`: Only fail on Error level messages (default)
    /// - `log::Level::Warn`: Fail on Warning level and above (strict mode)
    pub fn set_fail_level(&mut self, level: log::Level) {
        self.state.fail_level = level;
        if let Some(eye) = &mut self.state.second_eye {
            eye.set_fail_level(level);
        }
    }
}

/// Counters gathered while the channels of one sample are decoded.
#[derive(Debug, Default)]
struct Progress {
    decoded: Vec<u32>,
    skipped: u64,
    concealed: usize,
}

/// Fixed for the duration of one key sample.
#[derive(Debug)]
struct SampleSetup {
    info: SampleInfo,
    plan: Arc<ReconstructionPlan>,
    prescale: Arc<[u8]>,
}

#[derive(Debug)]
pub struct DecoderState {
    pub config: DecoderConfig,
    pub fail_level: log::Level,

    codebooks: Arc<Vec<FsmTable>>,
    entropy: Arc<dyn EntropyBackend>,
    reconstructor: Reconstructor,
    scratch: BufferPool,

    defaults: SampleHeader,
    channels: Vec<Arc<Transform>>,
    pending_frame: Option<FrameBuffer>,
    second_eye: Option<Box<Decoder>>,
}

impl DecoderState {
    fn new(
        config: DecoderConfig,
        codebooks: Arc<Vec<FsmTable>>,
        entropy: Arc<dyn EntropyBackend>,
    ) -> Self {
        let fail_level = if config.strict {
            log::Level::Warn
        } else {
            log::Level::Error
        };

        Self {
            reconstructor: Reconstructor::new(config.threads),
            config,
            fail_level,
            codebooks,
            entropy,
            scratch: BufferPool::default(),
            defaults: SampleHeader::default(),
            channels: Vec::new(),
            pending_frame: None,
            second_eye: None,
        }
    }

    fn decode_sample(&mut self, data: &[u8], output: &mut FrameBuffer) -> Result<SampleReport> {
        let mut parser = Parser::new(data, &self.defaults);

        // Everything up to the index only touches the parser.
        let setup = loop {
            match parser.next_action()? {
                None => return self.finish_headerless(&mut parser, output, false),
                Some(Action::Trailer) => return self.finish_headerless(&mut parser, output, true),
                Some(Action::IndexParsed) => break self.prepare(&mut parser)?,
                Some(_) => {}
            }
        };

        let mut report = SampleReport::new(setup.info.kind, parser.state().effective_header());
        report.channel_ranges = parser.state().channel_ranges();

        match self.decode_channels(&mut parser, &setup, output, &mut report) {
            Ok(()) => {
                report.end_position = parser.position()?;
                report.frame_produced = true;
                debug!(
                    "{} sample {}: {} wavelet(s) reconstructed, {} byte(s) skipped",
                    setup.info.kind.name(),
                    setup.info.frame_number,
                    report.reconstructed_wavelets,
                    report.skipped_bytes
                );
                Ok(report)
            }
            Err(err) => {
                if let Err(pending) = self.reconstructor.wait_all() {
                    debug!("discarding reconstruction result: {pending}");
                }
                self.pending_frame = None;
                if let Err(blank) = Self::blank_output(&setup, output) {
                    warn!("could not blank output: {blank}");
                    output.zero_fill();
                }
                Err(err)
            }
        }
    }

    /// Samples without an index: sequence headers and second frames.
    fn finish_headerless(
        &mut self,
        parser: &mut Parser<'_>,
        output: &mut FrameBuffer,
        trailer: bool,
    ) -> Result<SampleReport> {
        let header = parser.state().effective_header();
        let kind = header
            .kind
            .ok_or(CodecError::MissingHeaderField("sample type"))?;
        let end_position = parser.position()?;

        let mut report = SampleReport::new(kind, header);
        report.end_position = end_position;

        match kind {
            SampleKind::SequenceHeader => {
                self.defaults.merge(&parser.state().header);
                debug!("sequence header updates stream defaults: {:?}", self.defaults);
            }
            SampleKind::Frame => {
                let frame = self.pending_frame.take().ok_or(CodecError::NoPendingFrame)?;
                *output = frame;
                report.frame_produced = true;
            }
            SampleKind::Group | SampleKind::IFrame => {
                if trailer {
                    bail!(CodecError::MissingIndex(kind.name()));
                }
                bail!(CodecError::IncompleteSample(0));
            }
        }

        Ok(report)
    }

    /// Resolves the header at the index and readies the channel pyramids.
    fn prepare(&mut self, parser: &mut Parser<'_>) -> Result<SampleSetup> {
        let info = parser.state().effective_header().resolve()?;
        if !info.kind.is_key() {
            bail!(CodecError::InvalidHeaderValue {
                field: "sample type with an index table",
                value: info.kind.code(),
            });
        }

        let plan = ReconstructionPlan::new(&info.layout, self.config.resolution)?;
        parser.state_mut().set_layout(info.layout.clone());

        let reusable = self.channels.len() == info.channels
            && self
                .channels
                .iter()
                .all(|transform| *transform.layout() == info.layout);
        if reusable {
            for transform in &self.channels {
                transform.reset();
            }
        } else {
            debug!(
                "allocating {} channel pyramid(s), {} transform",
                info.channels,
                info.layout.kind.name()
            );
            self.channels = (0..info.channels)
                .map(|channel| Arc::new(Transform::new(channel, info.layout.clone())))
                .collect();
        }

        Ok(SampleSetup {
            prescale: Arc::from(info.prescale.clone()),
            plan: Arc::new(plan),
            info,
        })
    }

    fn decode_channels(
        &mut self,
        parser: &mut Parser<'_>,
        setup: &SampleSetup,
        output: &mut FrameBuffer,
        report: &mut SampleReport,
    ) -> Result<()> {
        let mut progress = Progress {
            decoded: vec![0; setup.info.channels],
            ..Default::default()
        };
        let mut second_eye = None;

        while let Some(action) = parser.next_action()? {
            match action {
                Action::Continue => {}
                Action::IndexParsed => bail!(CodecError::DuplicateIndex),
                Action::EnterChannel(channel) => {
                    self.skip_if_satisfied(parser, setup, channel, &mut progress)?;
                }
                Action::DecodeBand(payload) => {
                    let channel = parser
                        .state()
                        .current_channel()
                        .ok_or(CodecError::BandOutsideChannel)?;
                    self.decode_band(setup, channel, &payload, &mut progress)?;
                    self.skip_if_satisfied(parser, setup, channel, &mut progress)?;
                }
                Action::SecondEye(nested) => second_eye = Some(nested),
                Action::Trailer => break,
            }
        }

        let entered = parser.state().channels_entered();
        if entered < setup.info.channels {
            bail!(CodecError::IncompleteSample(entered));
        }
        for (channel, &decoded) in progress.decoded.iter().enumerate() {
            if !setup.plan.is_satisfied(decoded) {
                bail!(CodecError::IncompleteSample(channel));
            }
        }

        let eye = match second_eye {
            Some(nested) if self.config.decode_second_eye => Some((self.second_eye_decoder(), nested)),
            _ => None,
        };

        // The second eye decodes while this thread waits for reconstruction.
        let (reconstructed, eye) = thread::scope(|scope| {
            let handle = eye.map(|(mut decoder, nested)| {
                scope.spawn(move || {
                    let mut frame = FrameBuffer::default();
                    let result = decoder.decode_sample(nested, &mut frame);
                    (decoder, result.map(|report| (report, frame)))
                })
            });
            let reconstructed = self.reconstructor.wait_all();
            (reconstructed, handle.map(|handle| handle.join()))
        });
        report.reconstructed_wavelets = reconstructed?;

        let eye = match eye {
            Some(Ok((decoder, result))) => {
                self.second_eye = Some(decoder);
                match result {
                    Ok(decoded) => Some(decoded),
                    Err(err) => {
                        log_or_err!(self, log::Level::Warn, err.context("second eye dropped"));
                        None
                    }
                }
            }
            Some(Err(_)) => bail!(ReconstructError::WorkerLost),
            None => None,
        };

        let mut frames = self.collect_outputs(setup)?.into_iter();
        let first = frames.next().ok_or_else(|| {
            ReconstructError::MissingOutput(format!("frame {}", setup.info.frame_number))
        })?;
        let second = frames.next();

        self.pending_frame = second.map(|planes| FrameBuffer {
            planes,
            frame_number: setup.info.frame_number.wrapping_add(1),
            precision: setup.info.precision,
            format: setup.info.format,
            second_eye: None,
        });

        output.planes = first;
        output.frame_number = setup.info.frame_number;
        output.precision = setup.info.precision;
        output.format = setup.info.format;
        output.second_eye = None;
        if let Some((eye_report, eye_frame)) = eye {
            output.second_eye = Some(Box::new(eye_frame));
            report.second_eye = Some(Box::new(eye_report));
        }

        report.decoded_subbands = progress.decoded;
        report.skipped_bytes = progress.skipped;
        report.concealed_bands = progress.concealed;
        Ok(())
    }

    fn second_eye_decoder(&mut self) -> Box<Decoder> {
        let mut decoder = self.second_eye.take().unwrap_or_else(|| {
            let mut config = self.config.clone();
            config.decode_second_eye = false;
            Box::new(Decoder::from_parts(
                config,
                Arc::clone(&self.codebooks),
                Arc::clone(&self.entropy),
            ))
        });
        decoder.state.fail_level = self.fail_level;
        decoder.state.defaults.clone_from(&self.defaults);
        decoder
    }

    /// Seeks to the end of the channel once the plan has every sub-band it
    /// needs from it.
    fn skip_if_satisfied(
        &self,
        parser: &mut Parser<'_>,
        setup: &SampleSetup,
        channel: usize,
        progress: &mut Progress,
    ) -> Result<()> {
        if !setup.plan.is_satisfied(progress.decoded[channel]) {
            return Ok(());
        }

        let Some(range) = parser.state().channel_range(channel) else {
            return Ok(());
        };

        let skipped = parser.skip_to(range.end)?;
        if skipped > 0 {
            debug!("channel {channel}: skipped {skipped} bytes of unneeded sub-bands");
        }
        progress.skipped += skipped;
        Ok(())
    }

    fn decode_band(
        &mut self,
        setup: &SampleSetup,
        channel: usize,
        payload: &BandPayload<'_>,
        progress: &mut Progress,
    ) -> Result<()> {
        let header = &payload.header;
        let subband = header.subband;
        let (index, band) = setup.info.layout.subband(subband)?;

        let info = &setup.info;
        let (width, height) = info.layout.band_dimensions(index, info.width, info.height);
        if (header.width, header.height) != (width, height) {
            bail!(CodecError::DimensionMismatch {
                wavelet: index,
                width,
                height,
                found_width: header.width,
                found_height: header.height,
            });
        }

        let transform = Arc::clone(&self.channels[channel]);
        let wavelet = transform.wavelet(index);
        if !wavelet.start_band(band) {
            bail!(CodecError::DuplicateSubband { channel, subband });
        }
        progress.decoded[channel] |= 1 << subband;

        if !setup.plan.needs(subband) {
            progress.skipped += (payload.data.len() + payload.peaks.len()) as u64;
            return Ok(());
        }

        wavelet.declare_geometry(header.width, header.height)?;

        let decoded = {
            let mut storage = wavelet.lock_band(band);
            storage.prepare(header.width, header.height, header.quantization)?;
            let decoded = self.entropy.decode_band(&self.codebooks, payload, &mut storage);
            if decoded.is_err() {
                storage.fill_zero();
            }
            decoded
        };

        if let Err(err) = decoded {
            let underflow = matches!(
                err.downcast_ref::<EntropyError>(),
                Some(EntropyError::Underflow { .. })
            );
            if !underflow {
                return Err(err);
            }

            log_or_err!(
                self,
                log::Level::Warn,
                err.context(format!("concealing sub-band {subband} of channel {channel}"))
            );
            progress.concealed += 1;
        }

        if wavelet.mark_band_valid(band) && setup.plan.reconstructs(index) {
            self.reconstructor.submit(CascadeJob {
                transform,
                wavelet: index,
                plan: Arc::clone(&setup.plan),
                prescale: Arc::clone(&setup.prescale),
                scratch: self.scratch.clone(),
            });
        }

        Ok(())
    }

    /// Converts every planned output of every channel to pixels, one plane
    /// list per output frame.
    fn collect_outputs(&self, setup: &SampleSetup) -> Result<Vec<Vec<Plane>>> {
        let mut frames = vec![Vec::with_capacity(self.channels.len()); setup.plan.outputs.len()];

        for transform in &self.channels {
            for (frame, &source) in setup.plan.outputs.iter().enumerate() {
                frames[frame].push(self.output_plane(setup, transform, source)?);
            }
        }

        Ok(frames)
    }

    fn output_plane(
        &self,
        setup: &SampleSetup,
        transform: &Transform,
        source: OutputSource,
    ) -> Result<Plane> {
        let info = &setup.info;
        let layout = &info.layout;
        let (width, height) = source.dimensions(layout, info.width, info.height);

        let (coefficients, source_width, shift) = match source {
            OutputSource::Frame(frame) => {
                let plane = transform.lock_frame(frame);
                if !plane.written {
                    bail!(ReconstructError::MissingOutput(format!(
                        "frame {frame} of channel {}",
                        transform.channel
                    )));
                }
                return Plane::from_coefficients(
                    &plane.data,
                    plane.width,
                    width,
                    height,
                    0,
                    info.precision,
                );
            }
            OutputSource::Lowpass(index) => {
                let (data, w, _) = lowpass_output(transform.wavelet(index), &self.scratch)?;
                (data, w, layout.lowpass_shift(index, &info.prescale))
            }
            OutputSource::Vertical(index) | OutputSource::Horizontal(index) => {
                let (data, w, _) = axis_output(transform.wavelet(index), source, &self.scratch)?;
                (data, w, layout.lowpass_shift(index, &info.prescale) - 1)
            }
        };

        let plane = Plane::from_coefficients(
            &coefficients,
            source_width,
            width,
            height,
            shift,
            info.precision,
        );
        self.scratch.release(coefficients);
        plane.map_err(|err| err.context(format!("output of channel {}", transform.channel)))
    }

    /// Zero-filled planes at the geometry the sample would have produced.
    fn blank_output(setup: &SampleSetup, output: &mut FrameBuffer) -> Result<()> {
        let info = &setup.info;
        let sizes: Vec<(usize, usize)> = match setup.plan.outputs.first() {
            Some(source) => {
                let size = source.dimensions(&info.layout, info.width, info.height);
                vec![size; info.channels]
            }
            None => Vec::new(),
        };

        output.blank(&sizes)?;
        output.frame_number = info.frame_number;
        output.precision = info.precision;
        output.format = info.format;
        Ok(())
    }
}
