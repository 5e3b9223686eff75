// src/hw/mod.rs
//! HwBackend trait - the per-hardware-generation programming interface.
//!
//! The commit pipeline decides *what* must be reprogrammed; a back-end only
//! knows *how* to touch its registers. Every method is a primitive the
//! pipeline composes: reserve clocks, program or disable one pipe, lock a
//! pipe for an interdependent update, apply a VRR adjustment, and wait for
//! an outstanding flip.
//!
//! ## Threading Model
//! Back-ends are shared between the committing thread and interrupt
//! context, so every method takes `&self` and implementations synchronize
//! internally.

pub mod headless;

pub use headless::{HeadlessBackend, HwCall};

use crate::error::HwError;
use crate::model::{StreamUpdateFlags, SurfaceUpdateFlags, VrrAdjust};
use crate::resource::PipeCtx;
use crate::state::State;
use bitflags::bitflags;
use std::time::Duration;

bitflags! {
    /// Hardware sections of one pipe to reprogram.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HwProgram: u32 {
        /// Surface scanout address.
        const PLANE_ADDR     = 1 << 0;
        /// Viewport, scaler and position.
        const PLANE_GEOMETRY = 1 << 1;
        /// Pixel format, tiling, compression, rotation.
        const PLANE_FORMAT   = 1 << 2;
        /// Per-plane color stages.
        const PLANE_COLOR    = 1 << 3;
        /// Alpha and blending order.
        const PLANE_BLEND    = 1 << 4;
        /// Timing generator and VRR window.
        const STREAM_TIMING  = 1 << 5;
        /// Output color space, transfer function, CSC, backlight.
        const STREAM_OUTPUT  = 1 << 6;
        const STREAM_DSC     = 1 << 7;
        const STREAM_DPMS    = 1 << 8;
    }
}

impl HwProgram {
    pub fn from_surface(flags: SurfaceUpdateFlags) -> Self {
        let mut out = HwProgram::empty();
        if flags.contains(SurfaceUpdateFlags::ADDR) {
            out |= HwProgram::PLANE_ADDR;
        }
        if flags.intersects(
            SurfaceUpdateFlags::POSITION
                | SurfaceUpdateFlags::SCALING
                | SurfaceUpdateFlags::CLOCK
                | SurfaceUpdateFlags::BANDWIDTH
                | SurfaceUpdateFlags::HORIZONTAL_MIRROR,
        ) {
            out |= HwProgram::PLANE_GEOMETRY;
        }
        if flags.intersects(
            SurfaceUpdateFlags::PIXEL_FORMAT
                | SurfaceUpdateFlags::BPP
                | SurfaceUpdateFlags::SWIZZLE
                | SurfaceUpdateFlags::DCC
                | SurfaceUpdateFlags::ROTATION
                | SurfaceUpdateFlags::STEREO_FORMAT
                | SurfaceUpdateFlags::PLANE_SIZE,
        ) {
            out |= HwProgram::PLANE_FORMAT;
        }
        if flags.intersects(
            SurfaceUpdateFlags::COLOR_SPACE
                | SurfaceUpdateFlags::IN_TRANSFER_FUNC
                | SurfaceUpdateFlags::HDR_MULT
                | SurfaceUpdateFlags::INPUT_CSC
                | SurfaceUpdateFlags::COEFF_REDUCTION
                | SurfaceUpdateFlags::GAMUT_REMAP
                | SurfaceUpdateFlags::GAMMA
                | SurfaceUpdateFlags::LUT_3D,
        ) {
            out |= HwProgram::PLANE_COLOR;
        }
        if flags.intersects(SurfaceUpdateFlags::PER_PIXEL_ALPHA | SurfaceUpdateFlags::GLOBAL_ALPHA)
        {
            out |= HwProgram::PLANE_BLEND;
        }
        if flags.contains(SurfaceUpdateFlags::FULL_UPDATE) {
            out |= Self::PLANE_ALL;
        }
        out
    }

    pub fn from_stream(flags: StreamUpdateFlags) -> Self {
        let mut out = HwProgram::empty();
        if flags.intersects(
            StreamUpdateFlags::MODE_CHANGED
                | StreamUpdateFlags::VRR_RANGE
                | StreamUpdateFlags::SCALING
                | StreamUpdateFlags::COLOR_DEPTH,
        ) {
            out |= HwProgram::STREAM_TIMING;
        }
        if flags.intersects(
            StreamUpdateFlags::OUT_CSC
                | StreamUpdateFlags::OUTPUT_COLOR_SPACE
                | StreamUpdateFlags::OUT_TF
                | StreamUpdateFlags::GAMUT_REMAP
                | StreamUpdateFlags::ABM_LEVEL
                | StreamUpdateFlags::COLOR_DEPTH,
        ) {
            out |= HwProgram::STREAM_OUTPUT;
        }
        if flags.contains(StreamUpdateFlags::DSC_CHANGED) {
            out |= HwProgram::STREAM_DSC;
        }
        if flags.contains(StreamUpdateFlags::DPMS_OFF) {
            out |= HwProgram::STREAM_DPMS;
        }
        out
    }

    pub const PLANE_ALL: Self = Self::PLANE_ADDR
        .union(Self::PLANE_GEOMETRY)
        .union(Self::PLANE_FORMAT)
        .union(Self::PLANE_COLOR)
        .union(Self::PLANE_BLEND);

    pub const STREAM_ALL: Self = Self::STREAM_TIMING
        .union(Self::STREAM_OUTPUT)
        .union(Self::STREAM_DSC)
        .union(Self::STREAM_DPMS);
}

/// Hardware programming primitives for one display controller.
pub trait HwBackend: Send + Sync {
    /// Raises clocks and bandwidth for `state` before any pipe is touched.
    fn reserve_bandwidth(&self, state: &State) -> Result<(), HwError>;

    /// Lowers clocks to what `state` needs in steady state.
    fn optimize_bandwidth(&self, state: &State);

    /// Reprograms the sections of `pipe` named by `what`.
    fn program_pipe(&self, pipe_idx: usize, pipe: &PipeCtx, what: HwProgram)
        -> Result<(), HwError>;

    /// Powers a pipe down and detaches it from its timing generator.
    fn disable_pipe(&self, pipe_idx: usize) -> Result<(), HwError>;

    /// Holds (or releases) double-buffered register latching of a pipe.
    fn pipe_lock(&self, pipe_idx: usize, lock: bool);

    /// Writes a VRR vertical-total tuple into the pipe's timing generator.
    fn apply_timing_adjustment(&self, pipe_idx: usize, adjust: &VrrAdjust)
        -> Result<(), HwError>;

    /// Waits until no flip is pending on the pipe; false on timeout.
    fn wait_flip_pending(&self, pipe_idx: usize, timeout: Duration) -> bool;

    fn is_flip_pending(&self, pipe_idx: usize) -> bool;

    /// Current scanline of the pipe's timing generator.
    fn scanout_position(&self, pipe_idx: usize) -> u32;
}
