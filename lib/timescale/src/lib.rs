//! Wall-clock timestamp reconstruction from PPS-synchronized trace data.
//!
//! Two strategies, both driven off the pin-7 (PPS/reset) edges a
//! [`trace_decode::Decoder`] reports: a single-factor [`reconstruct_flat`]
//! pass, and a per-second [`reconstruct_stepwise`] pass that rewinds and
//! replays the backing file segment by segment to correct for drift as it's
//! discovered rather than after the fact.

use std::io::{Read, Seek, SeekFrom};
use trace_decode::{Decoder, Edge};
use trace_proto::PPS_BIT;

#[derive(Debug, thiserror::Error)]
pub enum TimescaleError {
    #[error("i/o error replaying trace: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode error replaying trace: {0}")]
    Decode(#[from] trace_decode::DecodeError),
    #[error("trace contains no PPS rising edge; cannot establish a start time")]
    NoStartEdge,
    #[error("trace contains no PPS falling edge; cannot establish an end time")]
    NoEndEdge,
}

/// A decoded edge with a reconstructed wall-clock timestamp attached.
#[derive(Copy, Clone, Debug)]
pub struct RealtimeSample {
    pub realtime_s: f64,
    pub monotonic_ticks: u64,
    pub pin: u8,
    pub level: bool,
}

/// Non-fatal anomalies surfaced during reconstruction; the caller decides
/// whether to log them, surface them to the user, or both.
#[derive(Copy, Clone, Debug)]
pub enum ScaleWarning {
    /// The computed correction factor fell outside `1 ± 0.1%`; the pass
    /// fell back to an uncorrected `corr = 1.0` for the affected span.
    CorrOutOfRange { corr: f64 },
    /// Consecutive correction factors differ by more than 2e-6, which
    /// usually means a sample was dropped between sync points.
    CorrJump { delta: f64 },
    /// The final PPS sync second did not land on the expected `stop_s + 1`.
    FinalSyncMismatch { expected: u64, actual: u64 },
}

const CORR_TOLERANCE: f64 = 0.001;
const CORR_JUMP_TOLERANCE: f64 = 2e-6;

fn reject_out_of_range(corr: f64) -> bool {
    (corr - 1.0).abs() > CORR_TOLERANCE
}

/// Locates the accumulated-tick position of the first PPS rising edge and
/// the last PPS falling edge in an already-decoded edge stream.
pub fn pps_bounds(edges: &[Edge]) -> Result<(u64, u64), TimescaleError> {
    let start = edges
        .iter()
        .find(|e| e.pin == PPS_BIT && e.level)
        .map(|e| e.ticks)
        .ok_or(TimescaleError::NoStartEdge)?;
    let end = edges
        .iter()
        .rev()
        .find(|e| e.pin == PPS_BIT && !e.level)
        .map(|e| e.ticks)
        .ok_or(TimescaleError::NoEndEdge)?;
    Ok((start, end))
}

/// Single-factor ("flat") reconstruction: one correction ratio computed
/// from the first PPS rising edge and the last PPS falling edge, applied
/// uniformly to every sample in the trace.
pub fn reconstruct_flat(
    edges: &[Edge],
    start_s: u64,
    stop_s: u64,
    sampling_rate: u64,
) -> Result<(Vec<RealtimeSample>, Option<ScaleWarning>), TimescaleError> {
    let (t_start_ticks, t_end_ticks) = pps_bounds(edges)?;
    let elapsed_s = (t_end_ticks - t_start_ticks) as f64 / sampling_rate as f64;
    let target_s = (stop_s - start_s + 1) as f64;
    let raw_corr = target_s / elapsed_s;

    let (corr, warning) = if reject_out_of_range(raw_corr) {
        (1.0, Some(ScaleWarning::CorrOutOfRange { corr: raw_corr }))
    } else {
        (raw_corr, None)
    };

    let samples = edges
        .iter()
        .map(|e| RealtimeSample {
            realtime_s: start_s as f64 + (e.ticks as f64 / sampling_rate as f64) * corr,
            monotonic_ticks: e.ticks,
            pin: e.pin,
            level: e.level,
        })
        .collect();

    Ok((samples, warning))
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum PpsState {
    WaitRising,
    WaitFalling,
}

/// Result of a stepwise reconstruction pass.
pub struct StepwiseResult {
    pub samples: Vec<RealtimeSample>,
    pub warnings: Vec<ScaleWarning>,
}

/// Per-second ("stepwise") reconstruction. Walks the raw sample stream
/// looking for PPS rising edges; each one closes out a segment, computes a
/// fresh correction factor from the ticks elapsed since the previous sync
/// point, and rewinds the reader to replay that segment's samples with the
/// newly known factor before continuing forward.
///
/// The very first PPS pulse is skipped rather than used as a sync point:
/// its timing is perturbed by the coprocessor's own startup offset and
/// cannot be trusted as a boundary.
pub fn reconstruct_stepwise<R: Read + Seek>(
    reader: &mut R,
    sampling_rate: u64,
    start_s: u64,
    stop_s: u64,
) -> Result<StepwiseResult, TimescaleError> {
    let mut warnings = Vec::new();
    let mut out = Vec::new();

    let mut scan = Decoder::new();
    let mut state = PpsState::WaitRising;
    let mut first_pulse_skipped = false;

    let mut sync_byte_offset = reader.stream_position()?;
    let mut sync_ticks: u64 = 0;
    let mut sync_pins: Option<u8> = None;
    let mut segment_base_second = start_s;
    let mut prev_corr = 1.0f64;

    loop {
        let word_offset = reader.stream_position()?;
        let mut buf = [0u8; 4];
        if !read_full_or_eof(reader, &mut buf)? {
            let elapsed_ticks = scan.accumulated_ticks().saturating_sub(sync_ticks);
            if elapsed_ticks > 0 {
                let corr = close_segment(
                    elapsed_ticks,
                    sampling_rate,
                    &mut prev_corr,
                    &mut warnings,
                );
                replay_segment(
                    reader,
                    sync_byte_offset,
                    word_offset,
                    sync_ticks,
                    sync_pins,
                    segment_base_second,
                    corr,
                    sampling_rate,
                    &mut out,
                )?;
            }
            let expected_final = stop_s + 1;
            if segment_base_second != expected_final {
                warnings.push(ScaleWarning::FinalSyncMismatch {
                    expected: expected_final,
                    actual: segment_base_second,
                });
            }
            break;
        }

        let sample = trace_proto::Sample::from_le_bytes(buf);
        if sample.is_sentinel() {
            reader.seek(SeekFrom::Start(word_offset))?;
            let elapsed_ticks = scan.accumulated_ticks().saturating_sub(sync_ticks);
            if elapsed_ticks > 0 {
                let corr = close_segment(
                    elapsed_ticks,
                    sampling_rate,
                    &mut prev_corr,
                    &mut warnings,
                );
                replay_segment(
                    reader,
                    sync_byte_offset,
                    word_offset,
                    sync_ticks,
                    sync_pins,
                    segment_base_second,
                    corr,
                    sampling_rate,
                    &mut out,
                )?;
            }
            break;
        }

        let edges = scan.decode_one(sample);
        let word_end = word_offset + 4;

        for e in &edges {
            if e.pin != PPS_BIT {
                continue;
            }
            match (state, e.level) {
                (PpsState::WaitRising, true) => {
                    if !first_pulse_skipped {
                        first_pulse_skipped = true;
                    } else {
                        let elapsed_ticks = scan.accumulated_ticks() - sync_ticks;
                        let sec_elapsed =
                            (elapsed_ticks as f64 / sampling_rate as f64).round() as u64;
                        let corr = close_segment(
                            elapsed_ticks,
                            sampling_rate,
                            &mut prev_corr,
                            &mut warnings,
                        );
                        replay_segment(
                            reader,
                            sync_byte_offset,
                            word_end,
                            sync_ticks,
                            sync_pins,
                            segment_base_second,
                            corr,
                            sampling_rate,
                            &mut out,
                        )?;
                        segment_base_second += sec_elapsed;
                        sync_byte_offset = word_end;
                        sync_ticks = scan.accumulated_ticks();
                        sync_pins = Some(sample.pins());
                        state = PpsState::WaitFalling;
                    }
                }
                (PpsState::WaitFalling, false) => {
                    state = PpsState::WaitRising;
                }
                _ => {}
            }
        }
    }

    Ok(StepwiseResult {
        samples: out,
        warnings,
    })
}

fn close_segment(
    elapsed_ticks: u64,
    sampling_rate: u64,
    prev_corr: &mut f64,
    warnings: &mut Vec<ScaleWarning>,
) -> f64 {
    let sec_elapsed = (elapsed_ticks as f64 / sampling_rate as f64).round();
    let elapsed_s = elapsed_ticks as f64 / sampling_rate as f64;
    let raw_corr = sec_elapsed / elapsed_s;

    let corr = if reject_out_of_range(raw_corr) {
        warnings.push(ScaleWarning::CorrOutOfRange { corr: raw_corr });
        1.0
    } else {
        raw_corr
    };

    if (corr - *prev_corr).abs() > CORR_JUMP_TOLERANCE {
        warnings.push(ScaleWarning::CorrJump {
            delta: (corr - *prev_corr).abs(),
        });
    }
    *prev_corr = corr;
    corr
}

#[allow(clippy::too_many_arguments)]
fn replay_segment<R: Read + Seek>(
    reader: &mut R,
    start_off: u64,
    end_off: u64,
    sync_ticks: u64,
    sync_pins: Option<u8>,
    segment_base_second: u64,
    corr: f64,
    sampling_rate: u64,
    out: &mut Vec<RealtimeSample>,
) -> Result<(), TimescaleError> {
    reader.seek(SeekFrom::Start(start_off))?;
    let mut dec = Decoder::new();
    if let Some(pins) = sync_pins {
        dec.resume(sync_ticks, pins);
    }

    let mut pos = start_off;
    while pos < end_off {
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;
        pos += 4;
        let sample = trace_proto::Sample::from_le_bytes(buf);
        if sample.is_sentinel() {
            break;
        }
        for e in dec.decode_one(sample) {
            let ticks_in_segment = e.ticks - sync_ticks;
            let realtime = segment_base_second as f64
                + (ticks_in_segment as f64 / sampling_rate as f64) * corr;
            out.push(RealtimeSample {
                realtime_s: realtime,
                monotonic_ticks: e.ticks,
                pin: e.pin,
                level: e.level,
            });
        }
    }

    reader.seek(SeekFrom::Start(end_off))?;
    Ok(())
}

fn read_full_or_eof<R: Read>(reader: &mut R, buf: &mut [u8; 4]) -> std::io::Result<bool> {
    let mut read = 0;
    while read < 4 {
        match reader.read(&mut buf[read..])? {
            0 if read == 0 => return Ok(false),
            0 => return Ok(false), // truncated trailing bytes: treat like EOF upstream
            n => read += n,
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use trace_proto::Sample;

    fn edge(ticks: u64, pin: u8, level: bool) -> Edge {
        Edge { ticks, pin, level }
    }

    #[test]
    fn flat_reconstruction_accepts_in_range_correction() {
        // 10 seconds elapsed at 10_000_000 Hz between PPS rising and falling.
        let rate = 10_000_000u64;
        let edges = vec![
            edge(0, PPS_BIT, true),
            edge(5_000_000, 3, true),
            edge(10 * rate, PPS_BIT, false),
        ];
        let (samples, warning) = reconstruct_flat(&edges, 1000, 1009, rate).unwrap();
        assert!(warning.is_none());
        // 10s trace mapped onto (1009-1000+1)=10s wall clock: corr == 1.0.
        assert!((samples[1].realtime_s - 1000.5).abs() < 1e-6);
    }

    #[test]
    fn flat_reconstruction_rejects_large_deviation() {
        let rate = 10_000_000u64;
        let edges = vec![edge(0, PPS_BIT, true), edge(10 * rate, PPS_BIT, false)];
        // Demand 20s of wall clock over what the ticks say is 10s: corr = 2.0, rejected.
        let (_, warning) = reconstruct_flat(&edges, 1000, 1019, rate).unwrap();
        assert!(matches!(warning, Some(ScaleWarning::CorrOutOfRange { .. })));
    }

    #[test]
    fn pps_bounds_requires_both_edges() {
        let edges = vec![edge(0, 3, true)];
        assert!(matches!(pps_bounds(&edges), Err(TimescaleError::NoStartEdge)));
    }

    #[test]
    fn stepwise_reconstruction_runs_to_completion_on_short_trace() {
        let rate = 1_000_000u64;
        let mut data = Vec::new();
        // First pulse (skipped), a data sample, second pulse (sync point), EOF.
        data.extend_from_slice(&Sample::new(0, 0b1000_0000).to_le_bytes());
        data.extend_from_slice(&Sample::new(rate as u32 / 2, 0b0000_0001).to_le_bytes());
        data.extend_from_slice(&Sample::new(rate as u32 / 2, 0b1000_0001).to_le_bytes());
        data.extend_from_slice(&Sample::ZERO.to_le_bytes());

        let mut cursor = Cursor::new(data);
        let result = reconstruct_stepwise(&mut cursor, rate, 1000, 1001).unwrap();
        assert!(!result.samples.is_empty());
    }
}
