// src/device/update.rs
//! Update entry points of the compositor-facing interface.
//!
//! `propose_update` classifies a batch of changes for one stream. FAST
//! changes are written into the LIVE container's planes in place under the
//! stream's lock only. MEDIUM and FULL changes take the device-wide commit
//! lock, build a copy-on-write candidate, validate it and run the Commit
//! Pipeline.

use super::{Device, TransactionReport};
use crate::classify::{classify, Classification, StreamUpdate, SurfaceUpdate, UpdateType};
use crate::error::{TxnError, ValidationError};
use crate::hw::HwProgram;
use crate::model::{ColorDepth, FlipAddress, PlaneId, StreamId};
use crate::state::State;
use crate::sync::{lock, try_lock};
use crate::validate::ValidationMode;
use log::{debug, info};
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

impl Device {
    /// Applies a batch of plane changes and an optional stream change to
    /// one stream.
    pub fn propose_update(
        &self,
        stream_id: StreamId,
        updates: &[SurfaceUpdate],
        stream_update: Option<&StreamUpdate>,
    ) -> Result<TransactionReport, TxnError> {
        let stream_lock = self.stream_lock(stream_id);
        {
            let guard = lock(&stream_lock);
            let current = self.current_state()?;
            let classification = classify(&current, stream_id, updates, stream_update)?;
            if classification.tier == UpdateType::Fast {
                let report = self.apply_fast(&current, stream_id, updates, &classification)?;
                drop(guard);
                self.post_update_surfaces();
                return Ok(report);
            }
        }

        let commit = lock(&self.commit_lock);
        let (current, mut candidate, tier, applied_depth) = {
            let guard = lock(&stream_lock);
            // Another commit may have replaced the container meanwhile.
            let current = self.current_state()?;
            let classification = classify(&current, stream_id, updates, stream_update)?;
            if classification.tier == UpdateType::Fast {
                drop(commit);
                let report = self.apply_fast(&current, stream_id, updates, &classification)?;
                drop(guard);
                self.post_update_surfaces();
                return Ok(report);
            }
            let (candidate, applied_depth) = self.build_candidate(
                &current,
                stream_id,
                updates,
                stream_update,
                &classification,
            )?;
            (current, candidate, classification.tier, applied_depth)
        };

        let mode = match tier {
            UpdateType::Full => ValidationMode::Full,
            _ => ValidationMode::FastPass,
        };
        let clocks = self
            .validator
            .validate(&candidate, mode, current.clocks())?;
        candidate.mark_validated(clocks);

        let affected = HashSet::from([stream_id]);
        let outcome = self.run_commit(&commit, candidate, tier, &affected)?;
        Ok(TransactionReport {
            tier,
            state_replaced: true,
            state_id: outcome.state_id,
            applied_color_depth: applied_depth,
            failed_streams: outcome.failed,
            optimize_deferred: outcome.optimize_deferred,
        })
    }

    /// Flips several planes of one stream to new scanout addresses.
    pub fn flip_plane_addrs(
        &self,
        stream_id: StreamId,
        flips: &[(PlaneId, FlipAddress)],
    ) -> Result<TransactionReport, TxnError> {
        let updates: Vec<SurfaceUpdate> = flips
            .iter()
            .map(|&(plane, addr)| SurfaceUpdate {
                flip_addr: Some(addr),
                ..SurfaceUpdate::new(plane)
            })
            .collect();
        self.propose_update(stream_id, &updates, None)
    }

    fn apply_fast(
        &self,
        current: &State,
        stream_id: StreamId,
        updates: &[SurfaceUpdate],
        classification: &Classification,
    ) -> Result<TransactionReport, TxnError> {
        for update in updates {
            let plane = current
                .plane(stream_id, update.plane_id)
                .ok_or(TxnError::UnknownPlane {
                    stream: stream_id,
                    plane: update.plane_id,
                })?;
            if let Some(addr) = update.flip_addr {
                plane.flip(addr);
            }
            let what = HwProgram::from_surface(classification.surface_flags(plane.id()));
            if !what.is_empty() {
                for i in current.res_ctx().pipes_with_plane(plane.id()) {
                    if let Some(pipe) = current.res_ctx().pipe(i) {
                        self.backend.program_pipe(i, pipe, what)?;
                    }
                }
            }
            plane.clear_update_flags();
        }
        if let Some(stream) = current.stream(stream_id) {
            stream.clear_update_flags();
        }
        debug!(
            "Update: {} applied {} surface update(s) in place",
            stream_id,
            updates.len()
        );
        Ok(TransactionReport {
            tier: UpdateType::Fast,
            state_replaced: false,
            state_id: current.id(),
            applied_color_depth: None,
            failed_streams: Vec::new(),
            optimize_deferred: self.optimize_pending.load(Ordering::Acquire),
        })
    }

    /// Copy of `current` with the updated stream and planes swapped in and
    /// flagged.
    ///
    /// Every flagged object is derived for the candidate, so the LIVE
    /// objects never carry flags of an update that may still be rejected.
    /// Returns the candidate and, when the stream configuration changed,
    /// the color depth it ended up with.
    fn build_candidate(
        &self,
        current: &State,
        stream_id: StreamId,
        updates: &[SurfaceUpdate],
        stream_update: Option<&StreamUpdate>,
        classification: &Classification,
    ) -> Result<(State, Option<ColorDepth>), TxnError> {
        let pool = self.validator.pool();
        let mut candidate = current.copy_construct();
        let mut applied_depth = None;

        let stream = current
            .stream(stream_id)
            .ok_or(TxnError::UnknownStream(stream_id))?;
        let mut config = *stream.config();
        let mut dpms = None;
        if let Some(update) = stream_update {
            config = update.apply_to(stream.config());
            if config != *stream.config() {
                config = self.validator.fit_color_depth(stream_id, config)?;
                applied_depth = Some(config.color_depth);
            }
            dpms = update.dpms_off.filter(|&off| off != stream.dpms_off());
        }
        if config != *stream.config() || dpms.is_some() || !classification.stream.is_empty() {
            let derived = Arc::new(stream.derive(config));
            if let Some(off) = dpms {
                derived.set_dpms_off(off);
            }
            candidate
                .replace_stream(derived, pool)
                .map_err(ValidationError::from)?;
        }

        for update in updates {
            let plane = current
                .plane(stream_id, update.plane_id)
                .ok_or(TxnError::UnknownPlane {
                    stream: stream_id,
                    plane: update.plane_id,
                })?;
            let derived = plane.derive(update.apply_to(plane.props()), update.flip_addr);
            candidate.replace_plane(stream_id, Arc::new(derived))?;
        }
        classification.mark(&candidate, stream_id);
        Ok((candidate, applied_depth))
    }

    /// Blanks or unblanks a stream without a new container, holding only
    /// that stream's lock.
    pub fn set_stream_blanked(&self, stream_id: StreamId, blanked: bool) -> Result<(), TxnError> {
        let stream_lock = self.stream_lock(stream_id);
        let _guard = lock(&stream_lock);
        let current = self.current_state()?;
        let stream = current
            .stream(stream_id)
            .ok_or(TxnError::UnknownStream(stream_id))?;
        if stream.dpms_off() == blanked {
            return Ok(());
        }

        let old_mask = current.stream_mask();
        stream.set_dpms_off(blanked);
        for i in current.res_ctx().stream_pipes(stream_id) {
            if let Some(pipe) = current.res_ctx().pipe(i) {
                self.backend.program_pipe(i, pipe, HwProgram::STREAM_DPMS)?;
            }
        }
        let new_mask = current.stream_mask();
        if new_mask != old_mask {
            self.notify_stream_mask(new_mask);
        }
        info!(
            "Update: {} {}",
            stream_id,
            if blanked { "blanked" } else { "unblanked" }
        );
        Ok(())
    }

    /// Performs a clock optimization a commit had to defer, once no flip is
    /// pending. True if it ran.
    pub fn post_update_surfaces(&self) -> bool {
        if !self.optimize_pending.load(Ordering::Acquire) {
            return false;
        }
        // A commit in flight optimizes on its own.
        let Some(_commit) = try_lock(&self.commit_lock) else {
            return false;
        };
        let Ok(current) = self.current_state() else {
            return false;
        };
        let busy = current
            .res_ctx()
            .pipes()
            .any(|(i, p)| !p.is_idle() && self.backend.is_flip_pending(i));
        if busy {
            return false;
        }
        self.backend.optimize_bandwidth(&current);
        self.optimize_pending.store(false, Ordering::Release);
        debug!("Update: deferred clock optimization done for state {}", current.id());
        true
    }
}
