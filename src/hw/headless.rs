// src/hw/headless.rs
//! Headless back-end: records every programming call instead of touching
//! registers.
//!
//! Used by the demo binary and the tests. Knobs inject the failures a real
//! controller can produce: rejected clock reservations, a stream whose pipes
//! refuse programming, flips that stay pending, and slow programming.

use super::{HwBackend, HwProgram};
use crate::error::HwError;
use crate::model::{PlaneId, StreamId, VrrAdjust};
use crate::resource::{PipeCtx, MAX_PIPES};
use crate::state::State;
use crate::sync::lock;
use log::{info, trace, warn};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// Pending-flip count that never drains on its own.
pub const STUCK_FLIP: u32 = u32::MAX;

const FLIP_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// One recorded back-end call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HwCall {
    ReserveBandwidth {
        state: u64,
    },
    OptimizeBandwidth {
        state: u64,
    },
    ProgramPipe {
        pipe: usize,
        stream: Option<StreamId>,
        plane: Option<PlaneId>,
        what: HwProgram,
        address: Option<u64>,
    },
    DisablePipe {
        pipe: usize,
    },
    PipeLock {
        pipe: usize,
        lock: bool,
    },
    ApplyTimingAdjustment {
        pipe: usize,
        adjust: VrrAdjust,
    },
}

#[derive(Debug, Default)]
pub struct HeadlessBackend {
    calls: Mutex<Vec<HwCall>>,
    reject_reservations: AtomicBool,
    failing_streams: Mutex<HashSet<StreamId>>,
    flip_pending: Mutex<HashMap<usize, u32>>,
    scanout: [AtomicU32; MAX_PIPES],
    program_delay: Mutex<Duration>,
}

impl HeadlessBackend {
    pub fn new() -> Self {
        info!("HeadlessBackend: created");
        Self::default()
    }

    // --- Knobs ---

    pub fn reject_reservations(&self, reject: bool) {
        self.reject_reservations.store(reject, Ordering::Release);
    }

    /// Every pipe driving `stream` refuses programming from now on.
    pub fn fail_stream(&self, stream: StreamId) {
        lock(&self.failing_streams).insert(stream);
    }

    pub fn heal_stream(&self, stream: StreamId) {
        lock(&self.failing_streams).remove(&stream);
    }

    /// The pipe reports a pending flip for the next `polls` polls;
    /// `STUCK_FLIP` keeps it pending until `complete_flip`.
    pub fn set_flip_pending(&self, pipe: usize, polls: u32) {
        lock(&self.flip_pending).insert(pipe, polls);
    }

    pub fn complete_flip(&self, pipe: usize) {
        lock(&self.flip_pending).remove(&pipe);
    }

    pub fn set_scanout_position(&self, pipe: usize, vpos: u32) {
        if let Some(slot) = self.scanout.get(pipe) {
            slot.store(vpos, Ordering::Release);
        }
    }

    /// Sleeps this long inside every `program_pipe`.
    pub fn set_program_delay(&self, delay: Duration) {
        *lock(&self.program_delay) = delay;
    }

    // --- Probes ---

    pub fn calls(&self) -> Vec<HwCall> {
        lock(&self.calls).clone()
    }

    pub fn take_calls(&self) -> Vec<HwCall> {
        std::mem::take(&mut *lock(&self.calls))
    }

    fn record(&self, call: HwCall) {
        trace!("HeadlessBackend: {:?}", call);
        lock(&self.calls).push(call);
    }

    /// Consumes one poll of a draining flip; true while still pending.
    fn poll_flip(&self, pipe: usize) -> bool {
        let mut pending = lock(&self.flip_pending);
        match pending.get_mut(&pipe) {
            Some(polls) if *polls == STUCK_FLIP => true,
            Some(polls) if *polls > 0 => {
                *polls -= 1;
                true
            }
            _ => false,
        }
    }
}

impl HwBackend for HeadlessBackend {
    fn reserve_bandwidth(&self, state: &State) -> Result<(), HwError> {
        self.record(HwCall::ReserveBandwidth { state: state.id() });
        if self.reject_reservations.load(Ordering::Acquire) {
            warn!("HeadlessBackend: rejecting reservation for state {}", state.id());
            return Err(HwError::Rejected(format!(
                "dispclk {} kHz refused",
                state.clocks().dispclk_khz
            )));
        }
        Ok(())
    }

    fn optimize_bandwidth(&self, state: &State) {
        self.record(HwCall::OptimizeBandwidth { state: state.id() });
    }

    fn program_pipe(&self, pipe_idx: usize, pipe: &PipeCtx, what: HwProgram) -> Result<(), HwError> {
        let delay = *lock(&self.program_delay);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        self.record(HwCall::ProgramPipe {
            pipe: pipe_idx,
            stream: pipe.stream_id(),
            plane: pipe.plane_id(),
            what,
            address: pipe.plane.as_ref().map(|p| p.address().address),
        });
        if let Some(stream) = pipe.stream_id() {
            if lock(&self.failing_streams).contains(&stream) {
                return Err(HwError::PipeProgramming {
                    pipe: pipe_idx,
                    reason: format!("{} refused by headless back-end", stream),
                });
            }
        }
        Ok(())
    }

    fn disable_pipe(&self, pipe_idx: usize) -> Result<(), HwError> {
        self.record(HwCall::DisablePipe { pipe: pipe_idx });
        Ok(())
    }

    fn pipe_lock(&self, pipe_idx: usize, lock: bool) {
        self.record(HwCall::PipeLock {
            pipe: pipe_idx,
            lock,
        });
    }

    fn apply_timing_adjustment(&self, pipe_idx: usize, adjust: &VrrAdjust) -> Result<(), HwError> {
        self.record(HwCall::ApplyTimingAdjustment {
            pipe: pipe_idx,
            adjust: *adjust,
        });
        Ok(())
    }

    fn wait_flip_pending(&self, pipe_idx: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.poll_flip(pipe_idx) {
            if Instant::now() >= deadline {
                warn!("HeadlessBackend: flip still pending on pipe {} after {:?}", pipe_idx, timeout);
                return false;
            }
            thread::sleep(FLIP_POLL_INTERVAL);
        }
        true
    }

    fn is_flip_pending(&self, pipe_idx: usize) -> bool {
        lock(&self.flip_pending)
            .get(&pipe_idx)
            .is_some_and(|polls| *polls > 0)
    }

    fn scanout_position(&self, pipe_idx: usize) -> u32 {
        self.scanout
            .get(pipe_idx)
            .map(|slot| slot.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}
