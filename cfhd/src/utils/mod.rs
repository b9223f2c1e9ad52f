//! Utility functions and supporting infrastructure.
//!
//! Provides segment reading, band cursors, scratch buffers and error handling.

pub mod band_cursor;
pub mod bitstream_io;
pub mod buffer_pool;
pub mod errors;
