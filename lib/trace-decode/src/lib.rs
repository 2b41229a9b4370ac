//! Delta-sample to edge-transition decoding.
//!
//! A [`Decoder`] turns the compressed `[delta:24][pins:8]` sample stream
//! written by the coprocessor bridge into per-pin level-change events. It
//! carries no notion of wall-clock time — that's `timescale`'s job — only
//! accumulated tick counts.

use arrayvec::ArrayVec;
use std::io::Read;
use trace_proto::{Sample, PPS_BIT, TRACE_PIN_COUNT};

/// A single pin transition, timestamped in accumulated coprocessor ticks.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Edge {
    pub ticks: u64,
    pub pin: u8,
    pub level: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated sample stream: {0} trailing byte(s) after the last full word")]
    TruncatedWord(usize),
    #[error("i/o error reading sample stream: {0}")]
    Io(#[from] std::io::Error),
}

/// Stateful delta-sample decoder. One instance tracks one trace from its
/// first sample onward; construct a fresh one per trace, or use
/// [`Decoder::resume`] to seed it mid-stream (the stepwise timestamp
/// reconstructor rewinds and replays from a bookmarked offset, which needs
/// to reenter the decoder without re-triggering the first-sample fixup).
#[derive(Copy, Clone, Debug, Default)]
pub struct Decoder {
    accumulated_ticks: u64,
    previous_pins: Option<u8>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the decoder's running state without emitting edges, as if
    /// `ticks` samples totalling `ticks` accumulated delta had already been
    /// consumed and the pin state was last seen as `pins`.
    pub fn resume(&mut self, ticks: u64, pins: u8) {
        self.accumulated_ticks = ticks;
        self.previous_pins = Some(pins);
    }

    pub fn accumulated_ticks(&self) -> u64 {
        self.accumulated_ticks
    }

    /// Decodes one sample, returning the (possibly empty) set of pin
    /// transitions it caused. Call only with non-sentinel samples; the
    /// caller owns end-of-stream detection via [`Sample::is_sentinel`].
    pub fn decode_one(&mut self, sample: Sample) -> ArrayVec<Edge, TRACE_PIN_COUNT> {
        let mut edges = ArrayVec::new();
        debug_assert!(!sample.is_sentinel());

        self.accumulated_ticks += sample.delta() as u64;
        let pins = sample.pins();
        let is_first_sample = self.previous_pins.is_none();
        // On the very first sample there is no real prior state, so invert
        // the incoming pins to synthesize a rising/falling edge on every
        // pin at t=0 — including the PPS bit, which marks trace start.
        let previous = self.previous_pins.unwrap_or(!pins);
        let changed = pins ^ previous;

        for bit in 0..TRACE_PIN_COUNT as u8 {
            if changed & (1 << bit) != 0 {
                edges.push(Edge {
                    ticks: self.accumulated_ticks,
                    pin: bit,
                    level: pins & (1 << bit) != 0,
                });
            }
        }

        self.previous_pins = Some(if is_first_sample {
            // Fixup: force the PPS bit's remembered state low regardless of
            // its real value, so the next genuine PPS transition is always
            // reported rather than possibly being masked by the synthetic
            // t=0 edge above.
            pins & !(1 << PPS_BIT)
        } else {
            pins
        });

        edges
    }
}

/// Decodes an entire little-endian sample stream from `reader`, stopping at
/// the first sentinel word or at EOF, whichever comes first.
pub fn decode_stream<R: Read>(reader: &mut R) -> Result<Vec<Edge>, DecodeError> {
    let mut decoder = Decoder::new();
    let mut edges = Vec::new();
    let mut buf = [0u8; 4];

    loop {
        let mut read = 0;
        while read < 4 {
            match reader.read(&mut buf[read..])? {
                0 => {
                    if read == 0 {
                        return Ok(edges);
                    }
                    return Err(DecodeError::TruncatedWord(read));
                }
                n => read += n,
            }
        }
        let sample = Sample::from_le_bytes(buf);
        if sample.is_sentinel() {
            return Ok(edges);
        }
        edges.extend(decoder.decode_one(sample));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_synthesizes_edges_for_set_pins() {
        let mut d = Decoder::new();
        let edges = d.decode_one(Sample::new(10, 0b0000_0001));
        // Only bit 0 is set; previous was synthesized as !0b1 = 0b1111_1110,
        // so every other bit should also show as a (falling) synthetic edge.
        assert_eq!(edges.len(), 8);
        assert!(edges.iter().any(|e| e.pin == 0 && e.level));
        assert!(edges.iter().all(|e| e.ticks == 10));
    }

    #[test]
    fn accumulates_ticks_across_samples() {
        let mut d = Decoder::new();
        d.decode_one(Sample::new(10, 0b0000_0001));
        let edges = d.decode_one(Sample::new(10, 0b0000_0011));
        assert_eq!(d.accumulated_ticks(), 20);
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0], Edge { ticks: 20, pin: 1, level: true });
    }

    #[test]
    fn three_pin_scenario_matches_expected_transitions() {
        // Spec scenario: three pins, one edge each, unscaled.
        let mut d = Decoder::new();
        let mut all = Vec::new();
        all.extend(d.decode_one(Sample::new(10, 0b0000_0001)));
        all.extend(d.decode_one(Sample::new(10, 0b0000_0011)));
        all.extend(d.decode_one(Sample::new(10, 0b0000_0010)));

        let real = |e: &Edge| e.pin != PPS_BIT;
        let mut observed: Vec<_> = all.iter().filter(|e| real(e)).collect();
        observed.retain(|e| e.ticks >= 10); // drop nothing, just assert ordering below

        assert!(all.iter().any(|e| e.ticks == 10 && e.pin == 0 && e.level));
        assert!(all.iter().any(|e| e.ticks == 20 && e.pin == 1 && e.level));
        assert!(all.iter().any(|e| e.ticks == 30 && e.pin == 0 && !e.level));
    }

    #[test]
    fn decode_stream_stops_at_sentinel() {
        let mut data = Vec::new();
        data.extend_from_slice(&Sample::new(10, 0b0000_0001).to_le_bytes());
        data.extend_from_slice(&Sample::new(10, 0b0000_0011).to_le_bytes());
        data.extend_from_slice(&Sample::ZERO.to_le_bytes());
        // Trailing garbage after the sentinel must be ignored.
        data.extend_from_slice(&[0xFF; 4]);

        let mut cursor = std::io::Cursor::new(data);
        let edges = decode_stream(&mut cursor).unwrap();
        assert!(edges.iter().all(|e| e.ticks <= 20));
    }

    #[test]
    fn decode_stream_reports_truncated_trailing_bytes() {
        let mut data = Sample::new(10, 1).to_le_bytes().to_vec();
        data.push(0xAA); // one stray byte, not a full word
        let mut cursor = std::io::Cursor::new(data);
        let err = decode_stream(&mut cursor).unwrap_err();
        assert!(matches!(err, DecodeError::TruncatedWord(1)));
    }

    #[test]
    fn resume_seeds_state_without_emitting() {
        let mut d = Decoder::new();
        d.resume(1000, 0b0000_0101);
        assert_eq!(d.accumulated_ticks(), 1000);
        let edges = d.decode_one(Sample::new(5, 0b0000_0111));
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0], Edge { ticks: 1005, pin: 1, level: true });
    }
}
