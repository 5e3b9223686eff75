// src/vrr/mod.rs
//! VRR Adjustment: turns flip-to-flip intervals into vertical-total tuples.
//!
//! In variable-refresh mode the timing generator stretches each frame
//! anywhere inside `[v_total_min, v_total_max]`. Three regimes:
//!
//! - **In range**: the full window is programmed; the hardware ends the
//!   frame when the next flip lands.
//! - **Below range** (interval longer than the longest frame): if the range
//!   spans at least a factor of two, the interval is split into N inserted
//!   frames of `v_total_mid` lines each (below-the-range compensation).
//! - **Fixed refresh**: once the flip cadence settles on a known video rate,
//!   the window collapses to one vertical total that divides the cadence.
//!
//! Every value produced is clamped into the stream's bounds.

use crate::config::VrrTuning;
use crate::model::{CrtcTiming, Stream, StreamId, VrrAdjust, VrrBounds, VrrRange};
use log::{debug, info};

/// Content rates the fixed-refresh detector locks onto, in millihertz.
pub const VIDEO_RATES_MHZ: [u32; 10] = [
    23_976, 24_000, 25_000, 29_970, 30_000, 47_952, 48_000, 50_000, 59_940, 60_000,
];

const MIN_INSERTED_FRAMES: u64 = 2;

fn period_us(rate_mhz: u32) -> u64 {
    1_000_000_000 / rate_mhz.max(1) as u64
}

/// Closest video rate whose period is within `tolerance_us` of `interval_us`.
pub fn match_video_rate(interval_us: u64, tolerance_us: u64) -> Option<u32> {
    VIDEO_RATES_MHZ
        .iter()
        .map(|&rate| (rate, period_us(rate).abs_diff(interval_us)))
        .filter(|(_, diff)| *diff <= tolerance_us)
        .min_by_key(|(_, diff)| *diff)
        .map(|(rate, _)| rate)
}

/// Constant vertical total for content at `rate_mhz`: the smallest integer
/// multiple of the rate that the sink accepts.
pub fn fixed_refresh_v_total(
    timing: &CrtcTiming,
    bounds: VrrBounds,
    range: VrrRange,
    rate_mhz: u32,
) -> Option<u32> {
    if rate_mhz == 0 {
        return None;
    }
    let multiple = range.min_refresh_mhz.div_ceil(rate_mhz).max(1);
    let refresh = rate_mhz.checked_mul(multiple)?;
    if refresh > range.max_refresh_mhz {
        return None;
    }
    Some(bounds.clamp(timing.v_total_for_refresh(refresh)))
}

/// Adjustment for one flip-to-flip interval.
pub fn compute_adjust(
    timing: &CrtcTiming,
    bounds: VrrBounds,
    range: VrrRange,
    interval_us: u64,
) -> VrrAdjust {
    let window = VrrAdjust {
        v_total_min: bounds.v_total_min,
        v_total_max: bounds.v_total_max,
        v_total_mid: 0,
        v_total_mid_frame_num: 0,
    };
    let max_frame_us = timing.frame_duration_us(bounds.v_total_max);
    if max_frame_us == 0 || interval_us <= max_frame_us || !range.supports_btr() {
        return window;
    }

    let min_frame_us = timing.frame_duration_us(bounds.v_total_min);
    let mid_frame_us = (min_frame_us + max_frame_us) / 2;
    let frames = interval_us
        .div_ceil(mid_frame_us.max(1))
        .max(MIN_INSERTED_FRAMES)
        .min(u8::MAX as u64);
    let v_total_mid = bounds.clamp(timing.v_total_for_duration_us(interval_us / frames));
    VrrAdjust {
        v_total_mid,
        v_total_mid_frame_num: frames as u8,
        ..window
    }
}

// --- Per-stream tracking ---

/// A page-flip completion as reported to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlipCompletion {
    pub stream_id: StreamId,
    pub frame_count: u64,
    pub timestamp_us: u64,
    /// Held back from the front porch until the next vertical update.
    pub deferred: bool,
}

/// Observable VRR state of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VrrStatus {
    pub last_applied: Option<VrrAdjust>,
    pub last_interval_us: Option<u64>,
    pub fixed_rate_mhz: Option<u32>,
    pub completion_pending: bool,
    pub frame_count: u64,
}

#[derive(Debug, Clone)]
pub struct VrrTracker {
    stream_id: StreamId,
    tuning: VrrTuning,
    last_flip_us: Option<u64>,
    last_interval_us: Option<u64>,
    candidate_rate: Option<u32>,
    streak: usize,
    fixed_rate: Option<u32>,
    mismatches: u32,
    last_applied: Option<VrrAdjust>,
    pending_completion: Option<FlipCompletion>,
    frame_count: u64,
}

impl VrrTracker {
    pub fn new(stream_id: StreamId, tuning: VrrTuning) -> Self {
        Self {
            stream_id,
            tuning,
            last_flip_us: None,
            last_interval_us: None,
            candidate_rate: None,
            streak: 0,
            fixed_rate: None,
            mismatches: 0,
            last_applied: None,
            pending_completion: None,
            frame_count: 0,
        }
    }

    pub fn status(&self) -> VrrStatus {
        VrrStatus {
            last_applied: self.last_applied,
            last_interval_us: self.last_interval_us,
            fixed_rate_mhz: self.fixed_rate,
            completion_pending: self.pending_completion.is_some(),
            frame_count: self.frame_count,
        }
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    /// Counts one vertical interrupt.
    pub fn tick(&mut self) -> u64 {
        self.frame_count += 1;
        self.frame_count
    }

    /// Records a flip and returns the interval since the previous one.
    pub fn record_flip(&mut self, timestamp_us: u64) -> Option<u64> {
        let interval = self
            .last_flip_us
            .map(|last| timestamp_us.saturating_sub(last));
        self.last_flip_us = Some(timestamp_us);
        if let Some(interval) = interval {
            self.last_interval_us = Some(interval);
            self.update_cadence(interval);
        }
        interval
    }

    fn update_cadence(&mut self, interval_us: u64) {
        let matched = match_video_rate(interval_us, self.tuning.cadence_tolerance_us);

        if let Some(fixed) = self.fixed_rate {
            if matched == Some(fixed) {
                self.mismatches = 0;
                return;
            }
            self.mismatches += 1;
            if self.mismatches >= self.tuning.fixed_refresh_exit_frames {
                info!(
                    "Vrr: {} leaves fixed refresh at {} mHz",
                    self.stream_id, fixed
                );
                self.fixed_rate = None;
                self.mismatches = 0;
                self.candidate_rate = matched;
                self.streak = usize::from(matched.is_some());
            }
            return;
        }

        match matched {
            Some(rate) if self.candidate_rate == Some(rate) => self.streak += 1,
            Some(rate) => {
                self.candidate_rate = Some(rate);
                self.streak = 1;
            }
            None => {
                self.candidate_rate = None;
                self.streak = 0;
            }
        }
        if self.streak >= self.tuning.fixed_refresh_detect_frames {
            if let Some(rate) = self.candidate_rate {
                info!("Vrr: {} locks to {} mHz content", self.stream_id, rate);
                self.fixed_rate = Some(rate);
                self.mismatches = 0;
            }
        }
    }

    pub fn fixed_rate_mhz(&self) -> Option<u32> {
        self.fixed_rate
    }

    /// The adjustment to program for `stream`, if it differs from the last
    /// one applied. Nothing is recorded until `mark_applied`.
    pub fn next_adjust(&self, stream: &Stream) -> Option<VrrAdjust> {
        if !stream.vrr_active() {
            return None;
        }
        let bounds = stream.vrr_bounds()?;
        let range = stream.config().vrr?;
        let timing = stream.timing();

        let fixed = self
            .fixed_rate
            .and_then(|rate| fixed_refresh_v_total(timing, bounds, range, rate));
        let adjust = match (fixed, self.last_interval_us) {
            (Some(v_total), _) => VrrAdjust::fixed(v_total),
            (None, Some(interval)) => compute_adjust(timing, bounds, range, interval),
            (None, None) => return None,
        };
        if self.last_applied == Some(adjust) {
            return None;
        }
        debug!("Vrr: {} next adjustment {:?}", self.stream_id, adjust);
        Some(adjust)
    }

    /// Records that `adjust` reached the timing generator.
    pub fn mark_applied(&mut self, adjust: VrrAdjust) {
        self.last_applied = Some(adjust);
    }

    /// Holds a completion until the next vertical update; a newer one
    /// replaces an older one still waiting.
    pub fn defer_completion(&mut self, completion: FlipCompletion) {
        self.pending_completion = Some(FlipCompletion {
            deferred: true,
            ..completion
        });
    }

    pub fn take_deferred(&mut self) -> Option<FlipCompletion> {
        self.pending_completion.take()
    }
}

#[cfg(test)]
mod tests;
