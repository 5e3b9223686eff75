// src/device/irq.rs
//! Interrupt entry points: page-flip completion, vertical update and
//! vertical blank.
//!
//! These run concurrently with the Commit Pipeline and only take the `irq`
//! lock plus short reads of the LIVE pointer, the latter possibly while
//! `irq` is held. The one hardware write, a
//! VRR adjustment, is made under a non-blocking attempt on the commit lock.
//! Failures have no caller to report to, so they are dropped with a
//! rate-limited warning.

use super::{Device, IrqState};
use crate::config::VrrTuning;
use crate::model::StreamId;
use crate::state::State;
use crate::sync::{lock, read, try_lock};
use crate::vrr::{FlipCompletion, VrrStatus, VrrTracker};
use log::{trace, warn};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, RwLock};

static DROPPED_IRQ: AtomicU32 = AtomicU32::new(0);

fn drop_irq(what: &str, stream: StreamId, reason: &str) {
    let count = DROPPED_IRQ.fetch_add(1, Ordering::Relaxed);
    if count % 100 == 0 {
        warn!(
            "Irq: dropped {} for {}: {} ({} total)",
            what,
            stream,
            reason,
            count + 1
        );
    }
}

impl IrqState {
    /// The tracker of `id`. A missing one is created only while `id` is in
    /// the LIVE container, so a late interrupt cannot revive a stream the
    /// Commit Pipeline already pruned.
    pub(super) fn tracker(
        &mut self,
        id: StreamId,
        tuning: &VrrTuning,
        live: &RwLock<Option<Arc<State>>>,
    ) -> Option<&mut VrrTracker> {
        if !self.trackers.contains_key(&id) {
            let active = read(live)
                .as_ref()
                .is_some_and(|state| state.stream(id).is_some());
            if !active {
                return None;
            }
        }
        Some(
            self.trackers
                .entry(id)
                .or_insert_with(|| VrrTracker::new(id, tuning.clone())),
        )
    }

    /// Sends to every subscriber, forgetting those that hung up.
    fn deliver(&mut self, completion: FlipCompletion) {
        self.subscribers.retain(|tx| tx.send(completion).is_ok());
    }
}

impl Device {
    /// Page-flip completion for `stream_id` at `timestamp_us`.
    ///
    /// A completion that lands in the front porch of a variable-refresh
    /// frame is held until the next vertical update.
    pub fn on_pflip(&self, stream_id: StreamId, timestamp_us: u64) {
        let Ok(current) = self.current_state() else {
            drop_irq("page flip", stream_id, "device is powered off");
            return;
        };
        let Some(stream) = current.stream(stream_id) else {
            drop_irq("page flip", stream_id, "stream is not active");
            return;
        };
        let vpos = current
            .res_ctx()
            .head_pipe(stream_id)
            .map(|pipe| self.backend.scanout_position(pipe))
            .unwrap_or(0);

        let mut irq = lock(&self.irq);
        let Some(tracker) = irq.tracker(stream_id, &self.config.vrr, &self.current) else {
            drop_irq("page flip", stream_id, "stream was removed");
            return;
        };
        tracker.record_flip(timestamp_us);
        let completion = FlipCompletion {
            stream_id,
            frame_count: tracker.frame_count(),
            timestamp_us,
            deferred: false,
        };
        if stream.vrr_active() && stream.timing().is_in_front_porch(vpos) {
            trace!("Irq: {} flip in front porch (line {}), deferring", stream_id, vpos);
            tracker.defer_completion(completion);
            return;
        }
        irq.deliver(completion);
    }

    /// Vertical-update interrupt of a variable-refresh stream: releases a
    /// deferred completion and programs the next adjustment.
    ///
    /// The adjustment is written only while no commit runs and only if the
    /// snapshot it was computed from is still LIVE; otherwise it is dropped
    /// and recomputed on the next vertical update.
    pub fn on_vupdate(&self, stream_id: StreamId) {
        let Ok(current) = self.current_state() else {
            drop_irq("vertical update", stream_id, "device is powered off");
            return;
        };
        let Some(stream) = current.stream(stream_id) else {
            drop_irq("vertical update", stream_id, "stream is not active");
            return;
        };

        let adjust = {
            let mut irq = lock(&self.irq);
            let Some(tracker) = irq.tracker(stream_id, &self.config.vrr, &self.current) else {
                drop_irq("vertical update", stream_id, "stream was removed");
                return;
            };
            let frame_count = tracker.tick();
            let released = tracker.take_deferred();
            let adjust = tracker.next_adjust(stream);
            if let Some(completion) = released {
                irq.deliver(FlipCompletion {
                    frame_count,
                    ..completion
                });
            }
            adjust
        };
        let Some(adjust) = adjust else {
            return;
        };

        {
            // A commit in flight may be handing these pipes to another stream.
            let Some(_commit) = try_lock(&self.commit_lock) else {
                drop_irq("timing adjustment", stream_id, "commit in progress");
                return;
            };
            let still_live = read(&self.current)
                .as_ref()
                .is_some_and(|live| Arc::ptr_eq(live, &current));
            if !still_live {
                drop_irq("timing adjustment", stream_id, "state was replaced");
                return;
            }
            for pipe in current.res_ctx().segment_heads(stream_id) {
                if let Err(e) = self.backend.apply_timing_adjustment(pipe, &adjust) {
                    drop_irq("timing adjustment", stream_id, &e.to_string());
                    return;
                }
            }
            stream.set_adjust(adjust);
        }

        let mut irq = lock(&self.irq);
        if let Some(tracker) = irq.trackers.get_mut(&stream_id) {
            tracker.mark_applied(adjust);
        }
        trace!("Irq: {} adjusted to {:?}", stream_id, adjust);
    }

    /// Vertical-blank interrupt of a fixed-refresh stream.
    pub fn on_vblank(&self, stream_id: StreamId) {
        let Ok(current) = self.current_state() else {
            drop_irq("vertical blank", stream_id, "device is powered off");
            return;
        };
        if current.stream(stream_id).is_none() {
            drop_irq("vertical blank", stream_id, "stream is not active");
            return;
        }
        let mut irq = lock(&self.irq);
        let Some(tracker) = irq.tracker(stream_id, &self.config.vrr, &self.current) else {
            drop_irq("vertical blank", stream_id, "stream was removed");
            return;
        };
        let frame_count = tracker.tick();
        if let Some(completion) = tracker.take_deferred() {
            irq.deliver(FlipCompletion {
                frame_count,
                ..completion
            });
        }
    }

    /// Receives every flip completion delivered from now on.
    pub fn subscribe_flip_events(&self) -> Receiver<FlipCompletion> {
        let (tx, rx) = mpsc::channel();
        lock(&self.irq).subscribers.push(tx);
        rx
    }

    pub fn vrr_status(&self, stream_id: StreamId) -> Option<VrrStatus> {
        lock(&self.irq).trackers.get(&stream_id).map(VrrTracker::status)
    }
}
