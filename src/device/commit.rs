// src/device/commit.rs
//! Commit Pipeline: programs a VALIDATED container and installs it as LIVE.
//!
//! 1. Refuse a container whose pipe graph is inconsistent.
//! 2. FULL: reserve clocks/bandwidth for the target before any register
//!    write; a rejection aborts with the LIVE container untouched.
//! 3. Per stream, in target order, under that stream's lock: disable its
//!    dangling pipes, then program only the flagged categories. A stream
//!    that fails is disabled and the rest proceed.
//! 4. Wait (bounded) for flips on streams outside the commit, then lower
//!    clocks, or defer that to a later FAST update.
//! 5. Swap the LIVE pointer; the previous container retires only after the
//!    new one is LIVE.

use super::Device;
use crate::classify::UpdateType;
use crate::error::{CommitError, FirmwareError, TxnError};
use crate::firmware::FirmwareCommand;
use crate::hw::HwProgram;
use crate::model::{Stream, StreamId, StreamUpdateFlags};
use crate::resource::PipeCtx;
use crate::state::{State, StatePhase};
use crate::sync::{lock, write};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::{Arc, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CommitOutcome {
    pub state_id: u64,
    pub failed: Vec<StreamId>,
    pub optimize_deferred: bool,
}

impl Device {
    /// Runs the Commit Pipeline for `target`.
    ///
    /// `affected` names the streams this commit changes; flips on every
    /// other stream are waited for before clocks are lowered.
    pub(crate) fn run_commit(
        &self,
        _commit: &MutexGuard<'_, ()>,
        target: State,
        tier: UpdateType,
        affected: &HashSet<StreamId>,
    ) -> Result<CommitOutcome, TxnError> {
        let current = self.current_state()?;
        Self::check_consistency(&target)?;

        if tier == UpdateType::Full {
            if let Err(e) = self.backend.reserve_bandwidth(&target) {
                warn!("Commit: state {} aborted before programming: {}", target.id(), e);
                return Err(CommitError::BandwidthReservation(e).into());
            }
        }
        let old_mask = current.stream_mask();

        // Streams leaving the device release their pipes first.
        for stream in current
            .streams()
            .iter()
            .filter(|s| target.stream(s.id()).is_none())
        {
            let stream_lock = self.stream_lock(stream.id());
            let _guard = lock(&stream_lock);
            if let Err(e) = self.disable_dangling(&current, &target, stream.id()) {
                warn!("Commit: releasing {} failed: {}", stream.id(), e);
            }
        }

        let mut failed = Vec::new();
        for stream in target.streams() {
            let stream_lock = self.stream_lock(stream.id());
            let _guard = lock(&stream_lock);
            Self::carry_flips(&current, &target, stream.id());
            match self.program_stream(&current, &target, stream, tier) {
                Ok(()) => {
                    stream.clear_update_flags();
                    for plane in target.planes(stream.id()) {
                        plane.clear_update_flags();
                    }
                }
                Err(e) => {
                    error!("Commit: {} failed to program, disabling it: {}", stream.id(), e);
                    self.disable_stream(&target, stream);
                    for plane in target.planes(stream.id()) {
                        plane.request_full_update();
                    }
                    failed.push(stream.id());
                }
            }
        }

        let optimize_deferred = !self.wait_for_other_flips(&target, affected);
        if optimize_deferred {
            warn!(
                "Commit: flips still pending after {:?}, deferring clock optimization",
                self.config.timeouts.flip_wait()
            );
            self.optimize_pending.store(true, Ordering::Release);
        } else {
            self.backend.optimize_bandwidth(&target);
            self.optimize_pending.store(false, Ordering::Release);
        }

        let reset_trackers: Vec<StreamId> = current
            .streams()
            .iter()
            .filter(|old| {
                target.stream(old.id()).map_or(true, |new| {
                    new.config().timing != old.config().timing
                        || new.config().vrr != old.config().vrr
                })
            })
            .map(|s| s.id())
            .collect();

        let state_id = target.id();
        let stream_count = target.streams().len();
        let new_mask = target.stream_mask();
        let live: HashSet<StreamId> = target.streams().iter().map(|s| s.id()).collect();
        self.install(target);

        lock(&self.irq)
            .trackers
            .retain(|id, _| live.contains(id) && !reset_trackers.contains(id));
        lock(&self.stream_locks).retain(|id, _| live.contains(id));
        if new_mask != old_mask {
            self.notify_stream_mask(new_mask);
        }

        info!(
            "Commit: state {} is LIVE ({:?}, {} stream(s), {} failed)",
            state_id,
            tier,
            stream_count,
            failed.len()
        );
        if !failed.is_empty() && failed.len() == stream_count {
            return Err(CommitError::AllStreamsFailed { failed }.into());
        }
        Ok(CommitOutcome {
            state_id,
            failed,
            optimize_deferred,
        })
    }

    fn check_consistency(target: &State) -> Result<(), CommitError> {
        let problem = match target.res_ctx().verify_links() {
            Err(e) => Some(e.to_string()),
            Ok(()) if target.phase() != StatePhase::Validated => {
                Some(format!("state {} is {:?}, not validated", target.id(), target.phase()))
            }
            Ok(()) => None,
        };
        match problem {
            None => Ok(()),
            Some(reason) => {
                error!("Commit: refusing state {}: {}", target.id(), reason);
                if cfg!(debug_assertions) {
                    panic!("inconsistent state reached the commit pipeline: {reason}");
                }
                Err(CommitError::InconsistentState(reason))
            }
        }
    }

    /// Swaps the LIVE pointer. Readers see either container, never none.
    fn install(&self, target: State) {
        let target = Arc::new(target);
        let mut current = write(&self.current);
        target.transition(StatePhase::Validated, StatePhase::Live);
        if let Some(old) = current.replace(target) {
            old.transition(StatePhase::Live, StatePhase::Retired);
        }
    }

    // --- Per-stream programming ---

    /// Copies addresses flipped in place since a plane was derived without
    /// an address of its own.
    pub(super) fn carry_flips(current: &State, target: &State, stream: StreamId) {
        for plane in target.planes(stream) {
            let Some(old) = current.plane(stream, plane.id()) else {
                continue;
            };
            if !Arc::ptr_eq(old, plane) && plane.inherited_address() {
                plane.flip(old.address());
            }
        }
    }

    fn program_stream(
        &self,
        current: &State,
        target: &State,
        stream: &Arc<Stream>,
        tier: UpdateType,
    ) -> Result<(), TxnError> {
        let id = stream.id();
        let pipes = target.res_ctx().stream_pipes(id);
        let flags = stream.update_flags();
        let firmware_lock = tier == UpdateType::Full
            && flags.contains(StreamUpdateFlags::DSC_CHANGED)
            && stream.config().link.firmware_lock;
        let tg_mask = pipes
            .iter()
            .filter_map(|&i| target.res_ctx().pipe(i)?.hw.tg)
            .fold(0u32, |mask, tg| mask | 1 << tg);

        if firmware_lock {
            self.firmware_hw_lock(tg_mask, true)?;
        }
        for &i in &pipes {
            self.backend.pipe_lock(i, true);
        }

        let result = self.program_pipes(current, target, stream, &pipes);

        for &i in &pipes {
            self.backend.pipe_lock(i, false);
        }
        if firmware_lock {
            let unlocked = self.firmware_hw_lock(tg_mask, false);
            return result.and(unlocked.map_err(TxnError::from));
        }
        result
    }

    fn program_pipes(
        &self,
        current: &State,
        target: &State,
        stream: &Arc<Stream>,
        pipes: &[usize],
    ) -> Result<(), TxnError> {
        self.disable_dangling(current, target, stream.id())?;
        let is_new = current.stream(stream.id()).is_none();
        let stream_flags = stream.update_flags();
        for &i in pipes {
            let Some(pipe) = target.res_ctx().pipe(i) else {
                continue;
            };
            let what = Self::pipe_program(current.res_ctx().pipe(i), pipe, is_new, stream_flags);
            if what.is_empty() {
                continue;
            }
            debug!("Commit: pipe {} ({}) program {:?}", i, stream.id(), what);
            self.backend.program_pipe(i, pipe, what)?;
        }
        Ok(())
    }

    /// Sections of a pipe to reprogram. A pipe whose binding changed is
    /// programmed in full; otherwise only flagged categories are.
    fn pipe_program(
        old: Option<&PipeCtx>,
        new: &PipeCtx,
        is_new_stream: bool,
        stream_flags: StreamUpdateFlags,
    ) -> HwProgram {
        let same_binding = old.is_some_and(|old| {
            old.stream_id() == new.stream_id()
                && old.plane_id() == new.plane_id()
                && old.top_pipe == new.top_pipe
                && old.prev_odm_pipe == new.prev_odm_pipe
        });
        if is_new_stream || !same_binding {
            let mut what = HwProgram::STREAM_ALL;
            if new.plane.is_some() {
                what |= HwProgram::PLANE_ALL;
            }
            return what;
        }
        let mut what = HwProgram::from_stream(stream_flags);
        if let Some(plane) = &new.plane {
            what |= HwProgram::from_surface(plane.update_flags());
        }
        what
    }

    /// Disables every pipe the current container binds to `stream` that
    /// the target no longer binds the same way.
    fn disable_dangling(
        &self,
        current: &State,
        target: &State,
        stream: StreamId,
    ) -> Result<(), TxnError> {
        for (i, old) in current
            .res_ctx()
            .pipes()
            .filter(|(_, p)| p.stream_id() == Some(stream))
        {
            let dangling = match target.res_ctx().pipe(i) {
                None => true,
                Some(new) => {
                    new.stream_id() != Some(stream)
                        || new.top_pipe != old.top_pipe
                        || (old.plane.is_some() && new.plane.is_none())
                }
            };
            if dangling {
                debug!("Commit: pipe {} of {} is dangling, disabling", i, stream);
                self.backend.disable_pipe(i)?;
            }
        }
        Ok(())
    }

    fn disable_stream(&self, target: &State, stream: &Stream) {
        for i in target.res_ctx().stream_pipes(stream.id()) {
            if let Err(e) = self.backend.disable_pipe(i) {
                warn!("Commit: could not disable pipe {}: {}", i, e);
            }
        }
        stream.set_dpms_off(true);
    }

    /// False if some flip outside `affected` is still pending at timeout.
    fn wait_for_other_flips(&self, target: &State, affected: &HashSet<StreamId>) -> bool {
        let timeout = self.config.timeouts.flip_wait();
        target
            .streams()
            .iter()
            .filter(|s| !affected.contains(&s.id()))
            .flat_map(|s| target.res_ctx().stream_pipes(s.id()))
            .all(|i| self.backend.wait_flip_pending(i, timeout))
    }

    // --- Firmware ---

    fn firmware_hw_lock(&self, tg_mask: u32, lock: bool) -> Result<(), FirmwareError> {
        let firmware = self.firmware.as_ref().ok_or(FirmwareError::NotAttached)?;
        firmware.send_command_sync(
            FirmwareCommand::HwLock { tg_mask, lock },
            self.config.timeouts.firmware_sync(),
        )?;
        Ok(())
    }

    pub(crate) fn notify_stream_mask(&self, mask: u32) {
        let Some(firmware) = self.firmware.as_ref() else {
            return;
        };
        debug!("Commit: stream mask now {:#b}", mask);
        if let Err(e) = firmware.send_command(FirmwareCommand::NotifyStreamMask { mask }) {
            warn!("Commit: stream mask notification dropped: {}", e);
        }
    }
}
