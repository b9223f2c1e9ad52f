//! Finite-state run/magnitude decoding tables.
//!
//! A table is a list of states, each holding one entry per 4-bit nibble.
//! Decoding a nibble in a state yields up to two magnitudes framed by a zero
//! run before and after them, and the state used for the next nibble.

use anyhow::{Result, bail};

use crate::utils::errors::EntropyError;

/// Entries per state, one for every nibble value.
pub const FSM_INDEX_ENTRIES: usize = 16;

/// Reserved `next_state` value marking the end of a band.
pub const BAND_END_STATE: u16 = 0xFFFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsmEntry {
    pub values: [i16; 2],
    /// Number of meaningful entries in `values` (0, 1 or 2).
    pub count: u8,
    pub pre_skip: u16,
    pub post_skip: u16,
    pub next_state: u16,
}

impl FsmEntry {
    pub const BAND_END: FsmEntry = FsmEntry {
        values: [0; 2],
        count: 0,
        pre_skip: 0,
        post_skip: 0,
        next_state: BAND_END_STATE,
    };

    /// A zero run with no magnitude.
    pub const fn run(len: u16, next_state: u16) -> Self {
        Self {
            values: [0; 2],
            count: 0,
            pre_skip: len,
            post_skip: 0,
            next_state,
        }
    }

    pub const fn single(value: i16, next_state: u16) -> Self {
        Self {
            values: [value, 0],
            count: 1,
            pre_skip: 0,
            post_skip: 0,
            next_state,
        }
    }

    pub const fn pair(first: i16, second: i16, next_state: u16) -> Self {
        Self {
            values: [first, second],
            count: 2,
            pre_skip: 0,
            post_skip: 0,
            next_state,
        }
    }

    pub const fn with_skips(mut self, pre_skip: u16, post_skip: u16) -> Self {
        self.pre_skip = pre_skip;
        self.post_skip = post_skip;
        self
    }

    #[inline(always)]
    pub fn is_band_end(&self) -> bool {
        self.next_state == BAND_END_STATE
    }

    #[inline(always)]
    pub fn magnitudes(&self) -> &[i16] {
        &self.values[..self.count as usize]
    }

    /// Coefficient positions this entry moves the cursor by.
    pub fn advance(&self) -> usize {
        self.pre_skip as usize + self.count as usize + self.post_skip as usize
    }
}

/// Immutable decoding table for one codebook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsmTable {
    states: Vec<[FsmEntry; FSM_INDEX_ENTRIES]>,
}

impl FsmTable {
    /// Builds a table, checking that every transition stays inside it.
    pub fn new(states: Vec<[FsmEntry; FSM_INDEX_ENTRIES]>) -> Result<Self> {
        if states.is_empty() {
            bail!(EntropyError::MalformedTable("no states"));
        }

        if states.len() >= BAND_END_STATE as usize {
            bail!(EntropyError::MalformedTable("too many states"));
        }

        let mut has_band_end = false;
        for (index, state) in states.iter().enumerate() {
            for entry in state {
                if entry.count > 2 {
                    bail!(EntropyError::MalformedTable("more than two magnitudes"));
                }

                if entry.is_band_end() {
                    has_band_end = true;
                } else if entry.next_state as usize >= states.len() {
                    bail!(EntropyError::MalformedTable("transition outside the table"));
                } else if entry.advance() == 0 && entry.next_state as usize == index {
                    bail!(EntropyError::MalformedTable("self loop without progress"));
                }
            }
        }

        if !has_band_end {
            bail!(EntropyError::MalformedTable("no band-end entry"));
        }

        Ok(Self { states })
    }

    #[inline(always)]
    pub fn entry(&self, state: usize, nibble: u8) -> &FsmEntry {
        &self.states[state][nibble as usize & 0xF]
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    /// Largest magnitude any entry produces.
    pub fn max_magnitude(&self) -> u16 {
        self.states
            .iter()
            .flatten()
            .flat_map(|entry| entry.magnitudes().iter())
            .map(|value| value.unsigned_abs())
            .max()
            .unwrap_or(0)
    }
}
