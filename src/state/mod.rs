// src/state/mod.rs
//! State Container: a versioned snapshot of every stream, plane and pipe
//! binding on the device.
//!
//! ## Lifecycle
//! `Fresh` (copy-constructed) → `Validated` (validator accepted it) →
//! `Live` (installed as the device's current state) → `Retired` (replaced
//! by a newer LIVE container). A container is released when its last `Arc`
//! drops; streams and planes it retained are released with it.
//!
//! Mutation is only possible while the container is owned (`&mut State`),
//! i.e. before it is wrapped in an `Arc` and shared. The phase itself is an
//! atomic so the commit pipeline can promote and retire shared containers.

use crate::error::ResourceError;
use crate::model::{Plane, PlaneId, Stream, StreamId};
use crate::resource::{ResourceContext, ResourcePool};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StatePhase {
    Fresh = 0,
    Validated = 1,
    Live = 2,
    Retired = 3,
}

impl StatePhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => StatePhase::Fresh,
            1 => StatePhase::Validated,
            2 => StatePhase::Live,
            _ => StatePhase::Retired,
        }
    }
}

/// Clock state the validator settled on for a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClockState {
    pub dispclk_khz: u32,
    /// Memory fetch bandwidth in kB/s.
    pub fetch_kbps: u64,
}

/// Planes bound to one stream, in blending order.
#[derive(Debug, Clone)]
pub struct StreamStatus {
    pub stream_id: StreamId,
    pub planes: Vec<Arc<Plane>>,
}

#[derive(Debug)]
pub struct State {
    id: u64,
    res_ctx: ResourceContext,
    streams: Vec<Arc<Stream>>,
    stream_status: Vec<StreamStatus>,
    clocks: ClockState,
    phase: AtomicU8,
}

impl State {
    /// An empty container for a device with `pipe_count` pipes.
    pub fn new(pipe_count: usize) -> Self {
        Self {
            id: NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed),
            res_ctx: ResourceContext::new(pipe_count),
            streams: Vec::new(),
            stream_status: Vec::new(),
            clocks: ClockState::default(),
            phase: AtomicU8::new(StatePhase::Fresh as u8),
        }
    }

    /// Copy-construction: the pipe array is cloned flat, streams and planes
    /// are retained, the result starts out `Fresh`.
    pub fn copy_construct(&self) -> Self {
        Self {
            id: NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed),
            res_ctx: self.res_ctx.clone(),
            streams: self.streams.clone(),
            stream_status: self.stream_status.clone(),
            clocks: self.clocks,
            phase: AtomicU8::new(StatePhase::Fresh as u8),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn phase(&self) -> StatePhase {
        StatePhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn res_ctx(&self) -> &ResourceContext {
        &self.res_ctx
    }

    #[cfg(test)]
    pub(crate) fn res_ctx_mut(&mut self) -> &mut ResourceContext {
        &mut self.res_ctx
    }

    pub fn clocks(&self) -> ClockState {
        self.clocks
    }

    /// Streams in programming order.
    pub fn streams(&self) -> &[Arc<Stream>] {
        &self.streams
    }

    pub fn stream(&self, id: StreamId) -> Option<&Arc<Stream>> {
        self.streams.iter().find(|s| s.id() == id)
    }

    pub fn stream_status(&self, id: StreamId) -> Option<&StreamStatus> {
        self.stream_status.iter().find(|s| s.stream_id == id)
    }

    pub fn planes(&self, id: StreamId) -> &[Arc<Plane>] {
        self.stream_status(id)
            .map(|s| s.planes.as_slice())
            .unwrap_or(&[])
    }

    pub fn plane(&self, stream: StreamId, plane: PlaneId) -> Option<&Arc<Plane>> {
        self.planes(stream).iter().find(|p| p.id() == plane)
    }

    /// Bit per timing generator driving a lit stream.
    pub fn stream_mask(&self) -> u32 {
        self.res_ctx
            .pipes()
            .filter(|(_, p)| p.stream.as_ref().is_some_and(|s| !s.dpms_off()))
            .filter_map(|(_, p)| p.hw.tg)
            .fold(0, |mask, tg| mask | 1 << tg)
    }

    // --- Lifecycle ---

    /// FRESH → VALIDATED, recording the validator's clock decision.
    pub(crate) fn mark_validated(&mut self, clocks: ClockState) {
        self.clocks = clocks;
        self.phase
            .store(StatePhase::Validated as u8, Ordering::Release);
    }

    /// Moves `from` → `to`; false if the container was not in `from`.
    pub(crate) fn transition(&self, from: StatePhase, to: StatePhase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Any mutation sends a validated container back to FRESH.
    fn touch(&mut self) {
        self.phase.store(StatePhase::Fresh as u8, Ordering::Release);
    }

    // --- Topology ---

    pub(crate) fn add_stream(
        &mut self,
        stream: Arc<Stream>,
        pool: &ResourcePool,
    ) -> Result<(), ResourceError> {
        if self.stream(stream.id()).is_some() {
            return Err(ResourceError::DuplicateStream(stream.id()));
        }
        self.res_ctx.add_stream(&stream, pool)?;
        self.stream_status.push(StreamStatus {
            stream_id: stream.id(),
            planes: Vec::new(),
        });
        self.streams.push(stream);
        self.touch();
        Ok(())
    }

    pub(crate) fn remove_stream(&mut self, id: StreamId) -> Result<Arc<Stream>, ResourceError> {
        let pos = self
            .streams
            .iter()
            .position(|s| s.id() == id)
            .ok_or(ResourceError::UnknownStream(id))?;
        self.res_ctx.remove_stream(id);
        self.stream_status.retain(|s| s.stream_id != id);
        self.touch();
        Ok(self.streams.remove(pos))
    }

    pub(crate) fn add_plane(
        &mut self,
        stream: StreamId,
        plane: Arc<Plane>,
        pool: &ResourcePool,
    ) -> Result<(), ResourceError> {
        if self.stream(stream).is_none() {
            return Err(ResourceError::UnknownStream(stream));
        }
        self.res_ctx.add_plane(stream, &plane, pool)?;
        if let Some(status) = self.stream_status.iter_mut().find(|s| s.stream_id == stream) {
            status.planes.push(plane);
        }
        self.touch();
        Ok(())
    }

    /// Unbinds one plane and re-lays the remaining ones from the top.
    pub(crate) fn remove_plane(
        &mut self,
        stream: StreamId,
        plane: PlaneId,
        pool: &ResourcePool,
    ) -> Result<Arc<Plane>, ResourceError> {
        let status = self
            .stream_status
            .iter_mut()
            .find(|s| s.stream_id == stream)
            .ok_or(ResourceError::UnknownStream(stream))?;
        let pos = status
            .planes
            .iter()
            .position(|p| p.id() == plane)
            .ok_or(ResourceError::UnknownPlane { stream, plane })?;
        let removed = status.planes.remove(pos);
        let remaining = status.planes.clone();

        self.res_ctx.strip_planes(stream);
        for p in &remaining {
            // Re-adding into pipes that were just released cannot run short.
            self.res_ctx.add_plane(stream, p, pool)?;
        }
        self.touch();
        Ok(removed)
    }

    /// Swaps in a structurally changed stream object with the same id,
    /// re-acquiring pipes when the horizontal split changes.
    pub(crate) fn replace_stream(
        &mut self,
        stream: Arc<Stream>,
        pool: &ResourcePool,
    ) -> Result<(), ResourceError> {
        let id = stream.id();
        let pos = self
            .streams
            .iter()
            .position(|s| s.id() == id)
            .ok_or(ResourceError::UnknownStream(id))?;
        let old_segments = self.res_ctx.segment_heads(id).len();
        if pool.odm_segments(stream.timing()) == old_segments {
            self.res_ctx.replace_stream(&stream);
        } else {
            let planes = self.planes(id).to_vec();
            let mut res_ctx = self.res_ctx.clone();
            res_ctx.remove_stream(id);
            res_ctx.add_stream(&stream, pool)?;
            for plane in &planes {
                res_ctx.add_plane(id, plane, pool)?;
            }
            self.res_ctx = res_ctx;
        }
        self.streams[pos] = stream;
        self.touch();
        Ok(())
    }

    /// Swaps in a copy-on-write plane with the same id.
    pub(crate) fn replace_plane(
        &mut self,
        stream: StreamId,
        plane: Arc<Plane>,
    ) -> Result<(), ResourceError> {
        let slot = self
            .stream_status
            .iter_mut()
            .find(|s| s.stream_id == stream)
            .ok_or(ResourceError::UnknownStream(stream))?
            .planes
            .iter_mut()
            .find(|p| p.id() == plane.id())
            .ok_or(ResourceError::UnknownPlane {
                stream,
                plane: plane.id(),
            })?;
        self.res_ctx.replace_plane(&plane);
        *slot = plane;
        self.touch();
        Ok(())
    }
}
