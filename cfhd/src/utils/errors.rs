#[macro_export]
macro_rules! log_or_err {
    ($state:expr, $level:expr, $err:expr $(,)?) => {{
        if $level <= $state.fail_level {
            return Err($err);
        } else {
            match $level {
                ::log::Level::Error => ::log::error!("{}", $err),
                ::log::Level::Warn => ::log::warn!("{}", $err),
                ::log::Level::Info => ::log::info!("{}", $err),
                ::log::Level::Debug => ::log::debug!("{}", $err),
                ::log::Level::Trace => ::log::trace!("{}", $err),
            }
        }
    }};
}

/// Caller-facing classification of every failure the decoder can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Fewer input bytes than the bitstream declares.
    BitstreamUnderflow,
    /// A tag or header value violates the format.
    InvalidBitstream,
    /// Well-formed bitstream using an encoding or layout that is not implemented.
    UnsupportedFormat,
    /// A band or scratch buffer could not be allocated.
    AllocationFailure,
    /// The requested output resolution cannot be produced from this sample.
    InvalidResolution,
    /// An entropy decoding invariant was violated.
    EntropyDecodeFault,
}

/// Classifies an error produced anywhere in this crate.
///
/// Returns `None` for errors that did not originate from one of the
/// component error types (for example a panic payload from a worker).
pub fn error_kind(err: &anyhow::Error) -> Option<ErrorKind> {
    if let Some(e) = err.downcast_ref::<TagError>() {
        return Some(e.kind());
    }
    if let Some(e) = err.downcast_ref::<CodecError>() {
        return Some(e.kind());
    }
    if let Some(e) = err.downcast_ref::<EntropyError>() {
        return Some(e.kind());
    }
    if let Some(e) = err.downcast_ref::<ReconstructError>() {
        return Some(e.kind());
    }
    None
}

#[derive(thiserror::Error, Debug)]
pub enum TagError {
    #[error("Requested {requested} bytes at offset {position}, only {remaining} remain")]
    Underflow {
        position: u64,
        requested: u64,
        remaining: u64,
    },

    #[error("Unrecognized required tag {tag:#06X} at offset {position}")]
    UnknownRequiredTag { tag: u16, position: u64 },

    #[error("Tag {0:#06X} is reserved")]
    ReservedTag(u16),

    #[error("Chunk {tag:#06X} payload of {len} bytes is malformed")]
    MalformedChunk { tag: u16, len: usize },

    #[error("Cannot seek back from offset {position} to {target}")]
    BackwardSeek { position: u64, target: u64 },
}

impl TagError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TagError::Underflow { .. } => ErrorKind::BitstreamUnderflow,
            _ => ErrorKind::InvalidBitstream,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("Sub-band {subband} out of range, transform has {count}")]
    SubbandOutOfRange { subband: usize, count: usize },

    #[error("Index table lists {index} channels, header declares {declared}")]
    ChannelCountMismatch { index: usize, declared: usize },

    #[error("Channel {found} out of order, expected {expected}")]
    UnexpectedChannel { found: usize, expected: usize },

    #[error("Channel {channel} starts at offset {found}, index table places it at {expected}")]
    ChannelOffsetMismatch {
        channel: usize,
        found: u64,
        expected: u64,
    },

    #[error("Channel {channel} runs to offset {found}, index table ends it at {end}")]
    ChannelOverrun { channel: usize, found: u64, end: u64 },

    #[error("Index table repeated within one sample")]
    DuplicateIndex,

    #[error("Channel data before the index table")]
    ChannelBeforeIndex,

    #[error("Band data outside of a channel")]
    BandOutsideChannel,

    #[error("Band data without a sub-band number")]
    BandWithoutSubband,

    #[error("Band data for sub-band {0} without declared dimensions")]
    MissingBandDimensions(usize),

    #[error("Sub-band {subband} of channel {channel} decoded twice")]
    DuplicateSubband { channel: usize, subband: usize },

    #[error("Sub-band {subband} declares level {found}, pyramid places it at level {expected}")]
    LevelMismatch {
        subband: usize,
        found: u16,
        expected: u8,
    },

    #[error(
        "Wavelet {wavelet} band is {found_width}x{found_height}, expected {width}x{height}"
    )]
    DimensionMismatch {
        wavelet: usize,
        width: usize,
        height: usize,
        found_width: usize,
        found_height: usize,
    },

    #[error("Missing header field: {0}")]
    MissingHeaderField(&'static str),

    #[error("Invalid value {value} for {field}")]
    InvalidHeaderValue { field: &'static str, value: u16 },

    #[error("Header declares {declared} {field}, pyramid layout has {expected}")]
    LayoutMismatch {
        field: &'static str,
        declared: usize,
        expected: usize,
    },

    #[error("Sample kind {0} carries no index table")]
    MissingIndex(&'static str),

    #[error("Frame sample without a pending frame from a preceding group")]
    NoPendingFrame,

    #[error("Sample ended before channel {0} was complete")]
    IncompleteSample(usize),

    #[error("Unsupported {field}: {value}")]
    Unsupported { field: &'static str, value: u16 },

    #[error("Lossless band {0} must not be quantized")]
    QuantizedLosslessBand(usize),

    #[error("Resolution {resolution} is not available for a {transform} transform")]
    InvalidResolution {
        resolution: &'static str,
        transform: &'static str,
    },
}

impl CodecError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CodecError::Unsupported { .. } => ErrorKind::UnsupportedFormat,
            CodecError::InvalidResolution { .. } => ErrorKind::InvalidResolution,
            CodecError::IncompleteSample(_) => ErrorKind::BitstreamUnderflow,
            _ => ErrorKind::InvalidBitstream,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum EntropyError {
    #[error("Band data ran out after {consumed} bytes before the band-end code")]
    Underflow { consumed: usize },

    #[error("Cursor moved to {position}, band holds {capacity} coefficients")]
    CursorOverflow { position: usize, capacity: usize },

    #[error("Band ended at coefficient {position}, expected {capacity}")]
    SkipSumMismatch { position: usize, capacity: usize },

    #[error("Peak table exhausted after {0} literals")]
    PeakTableExhausted(usize),

    #[error("Codebook {0} is not loaded")]
    UnknownCodebook(u16),

    #[error("FSM state {state} has no entry for nibble {nibble}")]
    InvalidState { state: usize, nibble: u8 },

    #[error("FSM table is malformed: {0}")]
    MalformedTable(&'static str),
}

impl EntropyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EntropyError::UnknownCodebook(_) => ErrorKind::UnsupportedFormat,
            _ => ErrorKind::EntropyDecodeFault,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ReconstructError {
    #[error("Wavelet {wavelet} reconstructed before all of its bands were valid ({valid:#06b})")]
    BandsNotValid { wavelet: usize, valid: u8 },

    #[error("Could not allocate {0} coefficients")]
    AllocationFailure(usize),

    #[error("Output {0} was not produced")]
    MissingOutput(String),

    #[error("Reconstruction worker stopped without reporting")]
    WorkerLost,
}

impl ReconstructError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ReconstructError::AllocationFailure(_) => ErrorKind::AllocationFailure,
            ReconstructError::MissingOutput(_) => ErrorKind::InvalidBitstream,
            _ => ErrorKind::EntropyDecodeFault,
        }
    }
}
