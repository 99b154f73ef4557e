//! Monotonic, time-derived request id generation.
//!
//! Ids pack a millisecond timestamp into the high bits so that requests
//! sort in reverse-chronological order when compared as plain integers.
//! The low bits are a per-millisecond sequence counter, guaranteeing
//! uniqueness within one process even when many requests land in the
//! same millisecond.

use std::sync::Mutex;

use crate::model::RequestId;

const SEQUENCE_BITS: u32 = 12;
const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;

struct State {
    last_millis: u64,
    sequence: u64,
}

/// Generates reverse-chronological request ids for a single process.
///
/// The high bits hold `u64::MAX - now_millis` so that later requests
/// produce *smaller* integers, and plain numeric ordering on `id` sorts
/// newest-first without a secondary timestamp comparison.
pub struct RequestIdGenerator {
    state: Mutex<State>,
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                last_millis: 0,
                sequence: 0,
            }),
        }
    }

    pub fn next(&self) -> RequestId {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        let mut state = self.state.lock().expect("id generator lock poisoned");

        let millis = if now > state.last_millis {
            state.sequence = 0;
            now
        } else {
            // Clock did not advance (or went backwards): stay on the last
            // millisecond and let the sequence counter provide uniqueness.
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            state.last_millis
        };
        state.last_millis = millis;

        let inverted_millis = u64::MAX - millis;
        (inverted_millis << SEQUENCE_BITS) | state.sequence
    }
}
