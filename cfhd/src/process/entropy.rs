//! Run/magnitude entropy decoding of band payloads.
//!
//! The payload is consumed a byte at a time, high nibble first. Each nibble
//! selects an entry of the current FSM state: a run of zeros, up to two
//! magnitudes, another run, and the state for the next nibble. The band-end
//! entry stops the pass; whatever is left of its byte is padding.

use std::fmt::Debug;

use anyhow::{Result, bail};
use log::debug;

use crate::structs::band::{Band, BandEncoding, BandPayload, saturate};
use crate::structs::fsm::FsmTable;
use crate::utils::band_cursor::BandCursor;
use crate::utils::errors::{CodecError, EntropyError};

/// Strategy for turning one band payload into coefficients.
///
/// The band is already sized and zeroed when this is called. Implementations
/// must either fill it and return the payload bytes consumed, or fail.
pub trait EntropyBackend: Debug + Send + Sync {
    fn decode_band(
        &self,
        codebooks: &[FsmTable],
        payload: &BandPayload<'_>,
        band: &mut Band,
    ) -> Result<usize>;
}

/// Sequential peak-table reader.
#[derive(Debug)]
struct Peaks<'a> {
    data: &'a [u8],
    taken: usize,
}

impl<'a> Peaks<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, taken: 0 }
    }

    fn next(&mut self) -> Result<i32> {
        let offset = self.taken * 2;
        let Some(bytes) = self.data.get(offset..offset + 2) else {
            bail!(EntropyError::PeakTableExhausted(self.taken));
        };

        self.taken += 1;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]) as i32)
    }
}

/// Settings shared by every value of one pass.
struct Pass<'t> {
    table: &'t FsmTable,
    peak_level: u32,
}

impl Pass<'_> {
    /// Runs the FSM from `start` until the band-end entry, handing every
    /// magnitude to `store`. Returns the offset after the band-end byte.
    fn run(
        &self,
        data: &[u8],
        start: usize,
        cursor: &mut BandCursor<'_>,
        peaks: &mut Peaks<'_>,
        mut store: impl FnMut(&mut BandCursor<'_>, i32) -> Result<()>,
    ) -> Result<usize> {
        let mut state = 0usize;
        let mut offset = start;

        loop {
            let Some(&byte) = data.get(offset) else {
                bail!(EntropyError::Underflow { consumed: offset });
            };
            offset += 1;

            for nibble in [byte >> 4, byte & 0xF] {
                let entry = self.table.entry(state, nibble);
                if entry.is_band_end() {
                    return Ok(offset);
                }

                cursor.skip(entry.pre_skip as usize)?;
                for &magnitude in entry.magnitudes() {
                    let mut value = magnitude as i32;
                    if self.peak_level > 0 && value.unsigned_abs() > self.peak_level {
                        value = peaks.next()?;
                    }
                    store(cursor, value)?;
                }
                cursor.skip(entry.post_skip as usize)?;

                state = entry.next_state as usize;
            }
        }
    }
}

/// Table-driven decoder over the loaded codebooks.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsmBackend;

impl FsmBackend {
    fn decode_lossy(
        pass: &Pass<'_>,
        payload: &BandPayload<'_>,
        quantization: i32,
        band: &mut Band,
    ) -> Result<usize> {
        let mut cursor = BandCursor::new(band);
        let mut peaks = Peaks::new(payload.peaks);

        let consumed = pass.run(payload.data, 0, &mut cursor, &mut peaks, |cursor, value| {
            cursor.write(saturate(value * quantization))
        })?;
        cursor.finish()?;

        Ok(consumed)
    }

    fn decode_lossless(
        pass: &Pass<'_>,
        payload: &BandPayload<'_>,
        band: &mut Band,
    ) -> Result<usize> {
        let mut cursor = BandCursor::new(band);
        let mut peaks = Peaks::new(payload.peaks);

        let low_end = pass.run(payload.data, 0, &mut cursor, &mut peaks, |cursor, value| {
            cursor.write((value & 0xFF) as i16)
        })?;
        cursor.finish()?;

        cursor.rewind();
        let consumed = pass.run(payload.data, low_end, &mut cursor, &mut peaks, |cursor, value| {
            cursor.merge(|low| saturate((low as i32 & 0xFF) | (value << 8)))
        })?;
        cursor.finish()?;

        Ok(consumed)
    }
}

impl EntropyBackend for FsmBackend {
    fn decode_band(
        &self,
        codebooks: &[FsmTable],
        payload: &BandPayload<'_>,
        band: &mut Band,
    ) -> Result<usize> {
        let header = &payload.header;
        let Some(table) = codebooks.get(header.codebook as usize) else {
            bail!(EntropyError::UnknownCodebook(header.codebook));
        };

        let pass = Pass {
            table,
            peak_level: header.peak_level as u32,
        };

        let consumed = match header.encoding {
            BandEncoding::Lossy => {
                Self::decode_lossy(&pass, payload, header.quantization.max(1) as i32, band)?
            }
            BandEncoding::Lossless => {
                if header.quantization > 1 {
                    bail!(CodecError::QuantizedLosslessBand(header.subband));
                }
                Self::decode_lossless(&pass, payload, band)?
            }
        };

        debug!(
            "sub-band {}: {}x{} {:?} q{} from {consumed} of {} bytes",
            header.subband,
            header.width,
            header.height,
            header.encoding,
            header.quantization,
            payload.data.len(),
        );

        Ok(consumed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structs::band::BandHeader;
    use crate::structs::codebook::{REFERENCE_PEAK_LEVEL, ReferenceCodebooks};
    use crate::structs::fsm::{FSM_INDEX_ENTRIES, FsmEntry};
    use crate::testing::{encode_lossless_band, encode_lossy_band};
    use crate::utils::errors::{ErrorKind, error_kind};
    use proptest::prelude::*;

    fn header(width: usize, height: usize, quantization: u16) -> BandHeader {
        BandHeader {
            subband: 1,
            width,
            height,
            quantization,
            encoding: BandEncoding::Lossy,
            codebook: 0,
            peak_level: REFERENCE_PEAK_LEVEL,
        }
    }

    fn decode(
        codebooks: &[FsmTable],
        header: BandHeader,
        peaks: &[u8],
        data: &[u8],
    ) -> Result<Vec<i16>> {
        let mut band = Band::default();
        band.prepare(header.width, header.height, header.quantization)?;
        FsmBackend.decode_band(
            codebooks,
            &BandPayload {
                header,
                peaks,
                data,
            },
            &mut band,
        )?;
        Ok(band.to_vec())
    }

    /// Three states exercising empty, single and paired entries.
    fn literal_table() -> Result<FsmTable> {
        let mut first = [FsmEntry::BAND_END; FSM_INDEX_ENTRIES];
        first[1] = FsmEntry::single(5, 0);
        first[2] = FsmEntry::pair(-3, 7, 0);
        first[3] = FsmEntry::run(2, 0);
        first[4] = FsmEntry::single(1, 1).with_skips(1, 1);

        let mut second = [FsmEntry::BAND_END; FSM_INDEX_ENTRIES];
        second[2] = FsmEntry::run(3, 2);

        let mut third = [FsmEntry::BAND_END; FSM_INDEX_ENTRIES];
        third[5] = FsmEntry::single(-9, 0);

        FsmTable::new(vec![first, second, third])
    }

    #[test]
    fn hand_built_table_produces_literals() -> Result<()> {
        let table = literal_table()?;
        let mut header = header(4, 3, 1);
        header.peak_level = 0;

        // 5 | -3 7 | run 2 | skip, 1, skip | run 3 | -9 | end
        let data = [0x12, 0x34, 0x25, 0x00];
        assert_eq!(
            decode(&[table], header, &[], &data)?,
            vec![5, -3, 7, 0, 0, 0, 1, 0, 0, 0, 0, -9]
        );

        Ok(())
    }

    #[test]
    fn quantization_scales_after_lookup() -> Result<()> {
        let table = ReferenceCodebooks::table()?;
        // +1, -1, +1 +1, end
        let data = [0x78, 0x90];
        let values = decode(&[table], header(4, 1, 6), &[], &data)?;
        assert_eq!(values, vec![6, -6, 6, 6]);
        Ok(())
    }

    #[test]
    fn peak_override_reads_literals() -> Result<()> {
        let table = ReferenceCodebooks::table()?;
        // escape 7 (= 9, a peak marker), escape F (= -9), end
        let data = [0xF7, 0xFF, 0x00];
        let peaks = [0x01, 0x2C, 0xFE, 0x0C];
        let values = decode(&[table], header(2, 1, 2), &peaks, &data)?;
        assert_eq!(values, vec![600, -1000]);

        let err = decode(&[ReferenceCodebooks::table()?], header(2, 1, 1), &peaks[..2], &data)
            .unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::EntropyDecodeFault));
        Ok(())
    }

    #[test]
    fn short_band_is_a_skip_sum_mismatch() -> Result<()> {
        let table = ReferenceCodebooks::table()?;
        let err = decode(&[table], header(4, 1, 1), &[], &[0x70]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EntropyError>(),
            Some(EntropyError::SkipSumMismatch {
                position: 1,
                capacity: 4
            })
        ));
        Ok(())
    }

    #[test]
    fn long_run_overflows_the_cursor() -> Result<()> {
        let table = ReferenceCodebooks::table()?;
        let err = decode(&[table], header(4, 1, 1), &[], &[0x50]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EntropyError>(),
            Some(EntropyError::CursorOverflow { .. })
        ));
        Ok(())
    }

    #[test]
    fn missing_band_end_is_an_underflow() -> Result<()> {
        let table = ReferenceCodebooks::table()?;
        let err = decode(&[table], header(4, 1, 1), &[], &[0x77]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<EntropyError>(),
            Some(EntropyError::Underflow { consumed: 1 })
        ));
        Ok(())
    }

    #[test]
    fn unknown_codebook_is_unsupported() -> Result<()> {
        let mut header = header(1, 1, 1);
        header.codebook = 3;
        let err = decode(&[ReferenceCodebooks::table()?], header, &[], &[0x70]).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::UnsupportedFormat));
        Ok(())
    }

    #[test]
    fn lossless_rejects_quantization() -> Result<()> {
        let mut header = header(1, 1, 2);
        header.encoding = BandEncoding::Lossless;
        let err = decode(&[ReferenceCodebooks::table()?], header, &[], &[0x00]).unwrap_err();
        assert_eq!(error_kind(&err), Some(ErrorKind::InvalidBitstream));
        Ok(())
    }

    proptest! {
        #[test]
        fn lossless_round_trip_is_exact(
            (width, height, values) in (1usize..12, 1usize..6).prop_flat_map(|(w, h)| {
                (Just(w), Just(h), proptest::collection::vec(any::<i16>(), w * h))
            })
        ) {
            let table = ReferenceCodebooks::table().unwrap();
            let (data, peaks) = encode_lossless_band(&values);

            let mut header = header(width, height, 1);
            header.encoding = BandEncoding::Lossless;

            let decoded = decode(&[table], header, &peaks, &data).unwrap();
            prop_assert_eq!(decoded, values);
        }

        #[test]
        fn lossy_round_trip_within_divisor(
            (width, height, values) in (1usize..16, 1usize..8).prop_flat_map(|(w, h)| {
                (Just(w), Just(h), proptest::collection::vec(-2000i16..2000, w * h))
            }),
            quantization in 1u16..24,
        ) {
            let table = ReferenceCodebooks::table().unwrap();
            let (data, peaks) = encode_lossy_band(&values, quantization);

            let decoded = decode(&[table], header(width, height, quantization), &peaks, &data).unwrap();
            prop_assert_eq!(decoded.len(), values.len());
            for (&original, &restored) in values.iter().zip(&decoded) {
                prop_assert!((original as i32 - restored as i32).abs() < quantization as i32);
            }
        }

        #[test]
        fn skip_sum_covers_band_exactly(
            (width, height, values) in (1usize..20, 1usize..10).prop_flat_map(|(w, h)| {
                (Just(w), Just(h), proptest::collection::vec(
                    prop_oneof![4 => Just(0i16), 1 => -40i16..40], w * h))
            })
        ) {
            let table = ReferenceCodebooks::table().unwrap();
            let (data, peaks) = encode_lossy_band(&values, 1);

            let mut band = Band::default();
            band.prepare(width, height, 1).unwrap();
            let payload = BandPayload { header: header(width, height, 1), peaks: &peaks, data: &data };
            FsmBackend.decode_band(&[table], &payload, &mut band).unwrap();

            prop_assert_eq!(band.to_vec(), values);
            // Padding past each row stays untouched.
            let pitch = band.pitch();
            for row in band.storage_mut().chunks(pitch) {
                prop_assert!(row[width..].iter().all(|&v| v == 0));
            }
        }
    }
}
