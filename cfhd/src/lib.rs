#![doc = include_str!("../README.md")]
//!
//! ## Technical Overview
//!
//! ### Bitstream Organization
//!
//! **Segments**: a signed 16-bit tag and a 16-bit value, big-endian. Negative
//! tags are optional and may be skipped; a few tags open chunks whose payload
//! follows the segment.
//! **Samples**: header tags, a channel index with the byte size of every
//! channel, then per channel the coded sub-bands of its pyramid.
//!
//! ### Transforms
//!
//! - Spatial: one to five 2-D levels over a single frame
//! - Field-plus: two frames joined by a temporal wavelet, then spatial levels
//!
//! ### Resolutions
//!
//! Full, half, quarter and lowpass-only outputs, plus half-width and
//! half-height. Sub-bands a resolution does not use are skipped without
//! entropy decoding.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cfhd::process::decode::{Decoder, DecoderConfig};
//! use cfhd::structs::frame::FrameBuffer;
//! use cfhd::structs::plan::Resolution;
//!
//! let mut decoder = Decoder::new(DecoderConfig {
//!     resolution: Resolution::Half,
//!     threads: 4,
//!     ..Default::default()
//! })?;
//!
//! let sample: Vec<u8> = std::fs::read("sample.cfhd")?;
//! let header = decoder.parse_header(&sample)?;
//! println!("{:?}x{:?}", header.width, header.height);
//!
//! let mut frame = FrameBuffer::default();
//! let report = decoder.decode_sample(&sample, &mut frame)?;
//! for plane in &frame.planes {
//!     println!("{}x{} plane, {} bytes skipped", plane.width, plane.height, report.skipped_bytes);
//! }
//! # Ok::<(), anyhow::Error>(())
//! ```

/// Processing of wavelet samples.
///
/// 1. **Codec state** ([`process::codec`]): Interprets segments.
///
/// 2. **Parsing** ([`process::parse`]): Walks one sample, or reads its header alone.
///
/// 3. **Entropy decoding** ([`process::entropy`]): Fills bands from their payloads.
///
/// 4. **Reconstruction** ([`process::reconstruct`]): Inverse wavelet transforms.
///
/// 5. **Decoding** ([`process::decode`]): Drives all of the above per sample.
pub mod process;

/// Data structures representing format components.
///
/// - **Tags** ([`structs::tag`]): Segment identifiers and chunk rules
/// - **Samples** ([`structs::sample`]): Header fields and their validation
/// - **Bands** ([`structs::band`]): Coefficient storage
/// - **Codebooks** ([`structs::codebook`], [`structs::fsm`]): Entropy tables
/// - **Pyramids** ([`structs::transform`], [`structs::wavelet`]): Layout and band validity
/// - **Plans** ([`structs::plan`]): What each resolution needs
/// - **Frames** ([`structs::frame`]): Output planes
pub mod structs;

/// Utility functions and supporting infrastructure.
///
/// - **Segment I/O** ([`utils::bitstream_io`]): Word-level reading
/// - **Band cursors** ([`utils::band_cursor`]): Run-length coefficient placement
/// - **Error Handling** ([`utils::errors`]): Error types
/// - **Buffer Management** ([`utils::buffer_pool`]): Memory allocation
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;
