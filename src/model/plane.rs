// src/model/plane.rs
//! Planes: visible surfaces bound to a stream.
//!
//! A `Plane` is shared between state containers through `Arc`. Its
//! properties are immutable; a MEDIUM or FULL update derives a new `Plane`
//! with the same id (copy-on-write) so that the LIVE container keeps pointing
//! at the old properties until the commit swaps. Only the scanout address and
//! the update-flag bitset are written in place.

use super::{ColorMatrix, ColorSpace, Rect, TransferFunction};
use crate::sync::lock;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlaneId(pub u32);

impl fmt::Display for PlaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "plane#{}", self.0)
    }
}

// --- Surface Attributes ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum PixelFormat {
    #[default]
    Argb8888,
    Abgr8888,
    Argb2101010,
    Abgr2101010,
    Rgb565,
    Argb16161616F,
    Nv12,
    P010,
}

impl PixelFormat {
    /// Bits fetched per pixel, counting chroma for the 4:2:0 video formats.
    pub fn bits_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Rgb565 => 16,
            PixelFormat::Argb8888
            | PixelFormat::Abgr8888
            | PixelFormat::Argb2101010
            | PixelFormat::Abgr2101010 => 32,
            PixelFormat::Argb16161616F => 64,
            PixelFormat::Nv12 => 12,
            PixelFormat::P010 => 24,
        }
    }

    pub fn is_video(self) -> bool {
        matches!(self, PixelFormat::Nv12 | PixelFormat::P010)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Swizzle {
    #[default]
    Linear,
    Standard4K,
    Standard64K,
    Display64K,
    Render64KX,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TilingInfo {
    pub swizzle: Swizzle,
    pub num_pipes: u8,
    pub num_banks: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DccParams {
    pub enable: bool,
    pub independent_64b_blks: bool,
    pub meta_pitch: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    R0,
    R90,
    R180,
    R270,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StereoFormat {
    #[default]
    Mono,
    SideBySide,
    TopBottom,
}

/// Surface pitch in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PlaneSize {
    pub surface_pitch: u32,
    pub chroma_pitch: u32,
}

/// Format and memory layout of a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaneInfo {
    pub color_space: ColorSpace,
    pub format: PixelFormat,
    pub plane_size: PlaneSize,
    pub rotation: Rotation,
    pub horizontal_mirror: bool,
    pub stereo_format: StereoFormat,
    pub tiling: TilingInfo,
    pub dcc: DccParams,
    pub per_pixel_alpha: bool,
    pub global_alpha_value: u16,
    pub visible: bool,
    pub layer_index: u8,
}

impl Default for PlaneInfo {
    fn default() -> Self {
        Self {
            color_space: ColorSpace::Srgb,
            format: PixelFormat::Argb8888,
            plane_size: PlaneSize::default(),
            rotation: Rotation::R0,
            horizontal_mirror: false,
            stereo_format: StereoFormat::Mono,
            tiling: TilingInfo::default(),
            dcc: DccParams::default(),
            per_pixel_alpha: false,
            global_alpha_value: 0xff,
            visible: true,
            layer_index: 0,
        }
    }
}

/// Source, destination and clip rectangles of a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ScalingInfo {
    pub src_rect: Rect,
    pub dst_rect: Rect,
    pub clip_rect: Rect,
    pub integer_scaling: bool,
}

impl ScalingInfo {
    /// Unscaled full-surface presentation at the origin.
    pub fn identity(width: u32, height: u32) -> Self {
        let rect = Rect::new(0, 0, width, height);
        Self {
            src_rect: rect,
            dst_rect: rect,
            clip_rect: rect,
            integer_scaling: false,
        }
    }
}

/// Per-plane color pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColorPipeline {
    pub in_transfer_func: TransferFunction,
    pub input_csc: Option<ColorMatrix>,
    pub coeff_reduction: Option<u32>,
    pub gamut_remap: Option<ColorMatrix>,
    /// Identifier of the uploaded gamma ramp.
    pub gamma: Option<u32>,
    /// Identifier of the uploaded 3D LUT.
    pub lut3d: Option<u32>,
    /// HDR multiplier in 31.32 fixed point, `1 << 32` is unity.
    pub hdr_mult: u64,
}

impl Default for ColorPipeline {
    fn default() -> Self {
        Self {
            in_transfer_func: TransferFunction::Srgb,
            input_csc: None,
            coeff_reduction: None,
            gamut_remap: None,
            gamma: None,
            lut3d: None,
            hdr_mult: 1 << 32,
        }
    }
}

/// Requested color pipeline changes; `None` leaves a stage untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColorUpdate {
    pub in_transfer_func: Option<TransferFunction>,
    pub input_csc: Option<Option<ColorMatrix>>,
    pub coeff_reduction: Option<Option<u32>>,
    pub gamut_remap: Option<Option<ColorMatrix>>,
    pub gamma: Option<Option<u32>>,
    pub lut3d: Option<Option<u32>>,
    pub hdr_mult: Option<u64>,
}

impl ColorUpdate {
    pub fn is_empty(&self) -> bool {
        *self == ColorUpdate::default()
    }

    pub fn apply_to(&self, color: &mut ColorPipeline) {
        if let Some(tf) = self.in_transfer_func {
            color.in_transfer_func = tf;
        }
        if let Some(csc) = self.input_csc {
            color.input_csc = csc;
        }
        if let Some(cr) = self.coeff_reduction {
            color.coeff_reduction = cr;
        }
        if let Some(remap) = self.gamut_remap {
            color.gamut_remap = remap;
        }
        if let Some(gamma) = self.gamma {
            color.gamma = gamma;
        }
        if let Some(lut) = self.lut3d {
            color.lut3d = lut;
        }
        if let Some(mult) = self.hdr_mult {
            color.hdr_mult = mult;
        }
    }
}

/// Everything about a plane that only changes through copy-on-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PlaneProps {
    pub info: PlaneInfo,
    pub scaling: ScalingInfo,
    pub color: ColorPipeline,
}

impl PlaneProps {
    /// Linear ARGB8888 surface covering `width` x `height` with no scaling.
    pub fn simple(width: u32, height: u32) -> Self {
        Self {
            info: PlaneInfo {
                plane_size: PlaneSize {
                    surface_pitch: width,
                    chroma_pitch: 0,
                },
                ..PlaneInfo::default()
            },
            scaling: ScalingInfo::identity(width, height),
            color: ColorPipeline::default(),
        }
    }
}

/// Scanout address of a surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FlipAddress {
    pub address: u64,
    pub flip_immediate: bool,
    pub flip_timestamp_us: u64,
}

// --- Update Flags ---

bitflags! {
    /// Attribute categories that changed on a plane since its last commit.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SurfaceUpdateFlags: u32 {
        const ADDR             = 1 << 0;
        const POSITION         = 1 << 1;
        const COLOR_SPACE      = 1 << 2;
        const HORIZONTAL_MIRROR = 1 << 3;
        const PER_PIXEL_ALPHA  = 1 << 4;
        const GLOBAL_ALPHA     = 1 << 5;
        const PLANE_SIZE       = 1 << 6;
        const IN_TRANSFER_FUNC = 1 << 7;
        const HDR_MULT         = 1 << 8;
        const ROTATION         = 1 << 9;
        const PIXEL_FORMAT     = 1 << 10;
        const STEREO_FORMAT    = 1 << 11;
        const DCC              = 1 << 12;
        const BPP              = 1 << 13;
        const SWIZZLE          = 1 << 14;
        const BANDWIDTH        = 1 << 15;
        const CLOCK            = 1 << 16;
        const SCALING          = 1 << 17;
        const INPUT_CSC        = 1 << 18;
        const COEFF_REDUCTION  = 1 << 19;
        const GAMUT_REMAP      = 1 << 20;
        const GAMMA            = 1 << 21;
        const LUT_3D           = 1 << 22;
        const FULL_UPDATE      = 1 << 23;
    }
}

impl SurfaceUpdateFlags {
    /// Categories that need a synchronized update but no bandwidth change.
    pub const MEDIUM_MASK: Self = Self::POSITION
        .union(Self::COLOR_SPACE)
        .union(Self::HORIZONTAL_MIRROR)
        .union(Self::PER_PIXEL_ALPHA)
        .union(Self::GLOBAL_ALPHA)
        .union(Self::PLANE_SIZE)
        .union(Self::IN_TRANSFER_FUNC)
        .union(Self::HDR_MULT);

    /// Categories that need bandwidth revalidation.
    pub const FULL_MASK: Self = Self::ROTATION
        .union(Self::PIXEL_FORMAT)
        .union(Self::STEREO_FORMAT)
        .union(Self::DCC)
        .union(Self::BPP)
        .union(Self::SWIZZLE)
        .union(Self::BANDWIDTH)
        .union(Self::CLOCK)
        .union(Self::SCALING)
        .union(Self::INPUT_CSC)
        .union(Self::COEFF_REDUCTION)
        .union(Self::GAMUT_REMAP)
        .union(Self::GAMMA)
        .union(Self::LUT_3D)
        .union(Self::FULL_UPDATE);
}

// --- Plane ---

/// One visible surface.
#[derive(Debug)]
pub struct Plane {
    id: PlaneId,
    props: PlaneProps,
    address: Mutex<FlipAddress>,
    /// Derived without an address of its own; flips the parent takes
    /// before this plane is committed still apply to it.
    inherited_address: bool,
    update_flags: AtomicU32,
    force_full_update: AtomicBool,
}

impl Plane {
    pub fn new(id: PlaneId, props: PlaneProps, address: u64) -> Self {
        Self {
            id,
            props,
            address: Mutex::new(FlipAddress {
                address,
                ..FlipAddress::default()
            }),
            inherited_address: false,
            update_flags: AtomicU32::new(0),
            force_full_update: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> PlaneId {
        self.id
    }

    pub fn props(&self) -> &PlaneProps {
        &self.props
    }

    pub fn address(&self) -> FlipAddress {
        *lock(&self.address)
    }

    pub fn update_flags(&self) -> SurfaceUpdateFlags {
        SurfaceUpdateFlags::from_bits_truncate(self.update_flags.load(Ordering::Acquire))
    }

    pub fn force_full_update(&self) -> bool {
        self.force_full_update.load(Ordering::Acquire)
    }

    /// Forces the next classification of this plane to FULL.
    pub fn request_full_update(&self) {
        self.force_full_update.store(true, Ordering::Release);
    }

    pub(crate) fn set_update_flags(&self, flags: SurfaceUpdateFlags) {
        self.update_flags.store(flags.bits(), Ordering::Release);
    }

    /// Called once a commit has programmed this plane.
    pub(crate) fn clear_update_flags(&self) {
        self.update_flags.store(0, Ordering::Release);
        self.force_full_update.store(false, Ordering::Release);
    }

    pub(crate) fn inherited_address(&self) -> bool {
        self.inherited_address
    }

    /// In-place scanout address update used by the FAST path.
    pub(crate) fn flip(&self, address: FlipAddress) {
        *lock(&self.address) = address;
    }

    /// Copy-on-write: a new plane with the same id and new properties.
    pub(crate) fn derive(&self, props: PlaneProps, address: Option<FlipAddress>) -> Plane {
        Plane {
            id: self.id,
            props,
            address: Mutex::new(address.unwrap_or_else(|| self.address())),
            inherited_address: address.is_none(),
            update_flags: AtomicU32::new(self.update_flags.load(Ordering::Acquire)),
            force_full_update: AtomicBool::new(self.force_full_update()),
        }
    }
}
