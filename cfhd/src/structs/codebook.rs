//! Codebook supply.
//!
//! Decoders consult a [`CodebookSupplier`] once, when they are built, and keep
//! the returned tables immutable for their whole lifetime.

use anyhow::Result;

use crate::structs::fsm::{FSM_INDEX_ENTRIES, FsmEntry, FsmTable};

/// Source of the FSM tables, indexed by the `Codebook` tag value.
pub trait CodebookSupplier {
    fn codebooks(&self) -> Result<Vec<FsmTable>>;
}

/// Peak level that turns the largest reference magnitude into a peak marker.
pub const REFERENCE_PEAK_LEVEL: u16 = 8;

/// Zero run lengths of the reference codebook, by nibble 1..=6.
pub const REFERENCE_RUNS: [u16; 6] = [1, 2, 4, 8, 16, 64];

/// Supplies codebook 0, a compact two-state table.
///
/// State 0:
///
/// | nibble | meaning                  |
/// |--------|--------------------------|
/// | 0      | band end                 |
/// | 1..=6  | zero run of 1/2/4/8/16/64|
/// | 7, 8   | +1, -1                   |
/// | 9, A   | +1 +1, -1 -1             |
/// | B, C   | one zero, then +1 / -1   |
/// | D, E   | +1 / -1, then one zero   |
/// | F      | escape to state 1        |
///
/// State 1 yields `n + 2` for `n < 8` and `-(n - 6)` otherwise, then returns
/// to state 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReferenceCodebooks;

impl ReferenceCodebooks {
    pub fn table() -> Result<FsmTable> {
        let mut idle = [FsmEntry::BAND_END; FSM_INDEX_ENTRIES];
        for (i, &run) in REFERENCE_RUNS.iter().enumerate() {
            idle[i + 1] = FsmEntry::run(run, 0);
        }
        idle[0x7] = FsmEntry::single(1, 0);
        idle[0x8] = FsmEntry::single(-1, 0);
        idle[0x9] = FsmEntry::pair(1, 1, 0);
        idle[0xA] = FsmEntry::pair(-1, -1, 0);
        idle[0xB] = FsmEntry::single(1, 0).with_skips(1, 0);
        idle[0xC] = FsmEntry::single(-1, 0).with_skips(1, 0);
        idle[0xD] = FsmEntry::single(1, 0).with_skips(0, 1);
        idle[0xE] = FsmEntry::single(-1, 0).with_skips(0, 1);
        idle[0xF] = FsmEntry {
            values: [0; 2],
            count: 0,
            pre_skip: 0,
            post_skip: 0,
            next_state: 1,
        };

        let mut escape = [FsmEntry::BAND_END; FSM_INDEX_ENTRIES];
        for (n, entry) in escape.iter_mut().enumerate() {
            let value = if n < 8 { n as i16 + 2 } else { -(n as i16 - 6) };
            *entry = FsmEntry::single(value, 0);
        }

        FsmTable::new(vec![idle, escape])
    }
}

impl CodebookSupplier for ReferenceCodebooks {
    fn codebooks(&self) -> Result<Vec<FsmTable>> {
        Ok(vec![Self::table()?])
    }
}
