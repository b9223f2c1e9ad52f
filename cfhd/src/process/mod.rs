/// Segment interpretation.
///
/// Provides the [`CodecState`](codec::CodecState) that turns tag-value
/// segments into header fields, channel boundaries and band payloads.
pub mod codec;

/// Sample walking and header-only parsing.
///
/// Provides the [`Parser`](parse::Parser) that feeds the segments of one
/// sample through the codec state machine.
pub mod parse;

/// Run/magnitude decoding of band payloads.
pub mod entropy;

/// Inverse wavelet transforms.
///
/// Provides the lifting kernels and the [`Reconstructor`](reconstruct::Reconstructor)
/// that runs per-channel cascades inline or on a worker pool.
pub mod reconstruct;

/// Sample decoding to planar pictures.
///
/// Provides the [`Decoder`](decode::Decoder) for turning complete samples into
/// [`FrameBuffer`](crate::structs::frame::FrameBuffer) objects.
pub mod decode;
