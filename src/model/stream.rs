// src/model/stream.rs
//! Streams: one active display output each.
//!
//! Like planes, a `Stream` is shared between containers and its
//! configuration only changes through copy-on-write. The VRR adjustment
//! tuple and the DPMS state are written in place, the former from interrupt
//! context.

use super::{ColorMatrix, ColorSpace, CrtcTiming, Rect, TransferFunction};
use crate::sync::lock;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkId(pub u32);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// Capabilities of the physical link a stream is driven over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkInfo {
    pub id: LinkId,
    /// Payload bandwidth of the trained link in kbit/s.
    pub max_link_rate_kbps: u64,
    pub supports_dsc: bool,
    pub supports_vrr: bool,
    /// Sink accepts compressed streams while refresh rate varies.
    pub dsc_with_vrr: bool,
    /// Pipe locking for this link is arbitrated by the firmware.
    pub firmware_lock: bool,
}

impl LinkInfo {
    /// A DisplayPort HBR3 x4 link.
    pub fn hbr3(id: LinkId) -> Self {
        Self {
            id,
            max_link_rate_kbps: 25_920_000,
            supports_dsc: true,
            supports_vrr: true,
            dsc_with_vrr: true,
            firmware_lock: false,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum ColorDepth {
    Bpc6,
    #[default]
    Bpc8,
    Bpc10,
    Bpc12,
}

impl ColorDepth {
    pub fn bits_per_component(self) -> u32 {
        match self {
            ColorDepth::Bpc6 => 6,
            ColorDepth::Bpc8 => 8,
            ColorDepth::Bpc10 => 10,
            ColorDepth::Bpc12 => 12,
        }
    }

    /// Next depth to try when the link cannot carry this one.
    pub fn lower(self) -> Option<ColorDepth> {
        match self {
            ColorDepth::Bpc12 => Some(ColorDepth::Bpc10),
            ColorDepth::Bpc10 => Some(ColorDepth::Bpc8),
            ColorDepth::Bpc8 => Some(ColorDepth::Bpc6),
            ColorDepth::Bpc6 => None,
        }
    }
}

/// Display stream compression parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DscConfig {
    pub num_slices_h: u8,
    pub num_slices_v: u8,
    /// Compressed bits per pixel in 1/16 units.
    pub bits_per_pixel_x16: u32,
}

/// Refresh range the sink accepts while in variable-refresh mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VrrRange {
    pub min_refresh_mhz: u32,
    pub max_refresh_mhz: u32,
}

impl VrrRange {
    pub fn is_valid(&self) -> bool {
        self.min_refresh_mhz > 0 && self.min_refresh_mhz < self.max_refresh_mhz
    }

    /// Low framerate compensation needs room for at least a doubled frame.
    pub fn supports_btr(&self) -> bool {
        u64::from(self.max_refresh_mhz) >= u64::from(self.min_refresh_mhz) * 2
    }
}

/// Vertical-total limits derived from a `VrrRange` and the stream timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VrrBounds {
    pub v_total_min: u32,
    pub v_total_max: u32,
}

impl VrrBounds {
    pub fn clamp(&self, v_total: u32) -> u32 {
        v_total.clamp(self.v_total_min, self.v_total_max)
    }

    pub fn contains(&self, v_total: u32) -> bool {
        (self.v_total_min..=self.v_total_max).contains(&v_total)
    }
}

/// Vertical-total tuple programmed into a timing generator.
///
/// `v_total_mid` is used for `v_total_mid_frame_num` frames before the
/// generator returns to the `[v_total_min, v_total_max]` window; a zero
/// frame count disables it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VrrAdjust {
    pub v_total_min: u32,
    pub v_total_max: u32,
    pub v_total_mid: u32,
    pub v_total_mid_frame_num: u8,
}

impl VrrAdjust {
    pub fn fixed(v_total: u32) -> Self {
        Self {
            v_total_min: v_total,
            v_total_max: v_total,
            v_total_mid: 0,
            v_total_mid_frame_num: 0,
        }
    }
}

/// Output configuration of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamConfig {
    pub timing: CrtcTiming,
    pub link: LinkInfo,
    pub output_color_space: ColorSpace,
    pub color_depth: ColorDepth,
    pub dsc: Option<DscConfig>,
    pub vrr: Option<VrrRange>,
    /// Composition viewport and its placement on the output.
    pub src: Rect,
    pub dst: Rect,
    pub out_transfer_func: TransferFunction,
    pub abm_level: u8,
    pub gamut_remap: Option<ColorMatrix>,
    pub output_csc: Option<ColorMatrix>,
}

impl StreamConfig {
    /// An 8 bpc sRGB output driving `timing` over `link`.
    pub fn new(timing: CrtcTiming, link: LinkInfo) -> Self {
        let full = Rect::new(0, 0, timing.h_addressable, timing.v_addressable);
        Self {
            timing,
            link,
            output_color_space: ColorSpace::Srgb,
            color_depth: ColorDepth::Bpc8,
            dsc: None,
            vrr: None,
            src: full,
            dst: full,
            out_transfer_func: TransferFunction::Srgb,
            abm_level: 0,
            gamut_remap: None,
            output_csc: None,
        }
    }

    pub fn with_vrr(mut self, range: VrrRange) -> Self {
        self.vrr = Some(range);
        self
    }

    pub fn with_color_depth(mut self, depth: ColorDepth) -> Self {
        self.color_depth = depth;
        self
    }

    /// Bits per pixel on the wire, after compression when enabled.
    pub fn link_bits_per_pixel_x16(&self) -> u64 {
        match self.dsc {
            Some(dsc) => dsc.bits_per_pixel_x16 as u64,
            None => self.color_depth.bits_per_component() as u64 * 3 * 16,
        }
    }

    /// Link bandwidth this stream consumes in kbit/s.
    pub fn link_bandwidth_kbps(&self) -> u64 {
        self.timing.pix_clk_khz() * self.link_bits_per_pixel_x16() / 16
    }

    /// Vertical-total window for the configured VRR range.
    ///
    /// The shortest frame never goes below the nominal timing.
    pub fn vrr_bounds(&self) -> Option<VrrBounds> {
        let range = self.vrr?;
        let timing = &self.timing;
        let v_total_min = timing
            .v_total_for_refresh(range.max_refresh_mhz)
            .max(timing.v_total);
        let v_total_max = timing
            .v_total_for_refresh(range.min_refresh_mhz)
            .max(v_total_min);
        Some(VrrBounds {
            v_total_min,
            v_total_max,
        })
    }

    fn initial_adjust(&self) -> VrrAdjust {
        match self.vrr_bounds() {
            Some(bounds) => VrrAdjust {
                v_total_min: bounds.v_total_min,
                v_total_max: bounds.v_total_max,
                ..VrrAdjust::default()
            },
            None => VrrAdjust::fixed(self.timing.v_total),
        }
    }
}

// --- Update Flags ---

bitflags! {
    /// Stream attribute categories that changed since the last commit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StreamUpdateFlags: u32 {
        const OUT_CSC            = 1 << 0;
        const OUTPUT_COLOR_SPACE = 1 << 1;
        const SCALING            = 1 << 2;
        const OUT_TF             = 1 << 3;
        const ABM_LEVEL          = 1 << 4;
        const DPMS_OFF           = 1 << 5;
        const GAMUT_REMAP        = 1 << 6;
        const DSC_CHANGED        = 1 << 7;
        const MODE_CHANGED       = 1 << 8;
        const COLOR_DEPTH        = 1 << 9;
        const VRR_RANGE          = 1 << 10;
    }
}

impl StreamUpdateFlags {
    pub const MEDIUM_MASK: Self = Self::OUT_CSC.union(Self::OUTPUT_COLOR_SPACE);

    pub const FULL_MASK: Self = Self::SCALING
        .union(Self::OUT_TF)
        .union(Self::ABM_LEVEL)
        .union(Self::DPMS_OFF)
        .union(Self::GAMUT_REMAP)
        .union(Self::DSC_CHANGED)
        .union(Self::MODE_CHANGED)
        .union(Self::COLOR_DEPTH)
        .union(Self::VRR_RANGE);
}

// --- Stream ---

/// One display output.
#[derive(Debug)]
pub struct Stream {
    id: StreamId,
    config: StreamConfig,
    adjust: Mutex<VrrAdjust>,
    dpms_off: AtomicBool,
    update_flags: AtomicU32,
}

impl Stream {
    pub fn new(id: StreamId, config: StreamConfig) -> Self {
        Self {
            id,
            config,
            adjust: Mutex::new(config.initial_adjust()),
            dpms_off: AtomicBool::new(false),
            update_flags: AtomicU32::new(0),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    pub fn timing(&self) -> &CrtcTiming {
        &self.config.timing
    }

    pub fn vrr_bounds(&self) -> Option<VrrBounds> {
        self.config.vrr_bounds()
    }

    /// True when the output is lit and running in variable-refresh mode.
    pub fn vrr_active(&self) -> bool {
        self.config.vrr.is_some() && self.config.link.supports_vrr && !self.dpms_off()
    }

    pub fn adjust(&self) -> VrrAdjust {
        *lock(&self.adjust)
    }

    pub(crate) fn set_adjust(&self, adjust: VrrAdjust) {
        *lock(&self.adjust) = adjust;
    }

    pub fn dpms_off(&self) -> bool {
        self.dpms_off.load(Ordering::Acquire)
    }

    pub(crate) fn set_dpms_off(&self, off: bool) {
        self.dpms_off.store(off, Ordering::Release);
    }

    pub fn update_flags(&self) -> StreamUpdateFlags {
        StreamUpdateFlags::from_bits_truncate(self.update_flags.load(Ordering::Acquire))
    }

    pub(crate) fn set_update_flags(&self, flags: StreamUpdateFlags) {
        self.update_flags.store(flags.bits(), Ordering::Release);
    }

    pub(crate) fn clear_update_flags(&self) {
        self.update_flags.store(0, Ordering::Release);
    }

    /// Copy-on-write: a new stream object with the same id.
    ///
    /// The VRR adjustment survives as long as the timing does.
    pub(crate) fn derive(&self, config: StreamConfig) -> Stream {
        let adjust = if config.timing == self.config.timing && config.vrr == self.config.vrr {
            self.adjust()
        } else {
            config.initial_adjust()
        };
        Stream {
            id: self.id,
            config,
            adjust: Mutex::new(adjust),
            dpms_off: AtomicBool::new(self.dpms_off()),
            update_flags: AtomicU32::new(self.update_flags.load(Ordering::Acquire)),
        }
    }
}
