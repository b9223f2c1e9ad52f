//! Data structures representing format components.
//!
//! Contains structured representations of bitstream elements including
//! tags, sample headers, coded bands, wavelet pyramids and output planes.

pub mod band;
pub mod codebook;
pub mod frame;
pub mod fsm;
pub mod plan;
pub mod sample;
pub mod tag;
pub mod transform;
pub mod wavelet;
