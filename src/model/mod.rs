// src/model/mod.rs
//! Value types shared by every layer of the transaction engine.
//!
//! `Stream` and `Plane` are the two reference-counted objects that state
//! containers share. Everything a container copies is immutable once wrapped
//! in an `Arc`, except for the few fields that are updated in place on the
//! FAST path or from interrupt context (plane address, update flags, VRR
//! adjustment, DPMS). Those live behind atomics or a short mutex.

pub mod plane;
pub mod stream;
pub mod timing;

pub use plane::{
    ColorPipeline, ColorUpdate, DccParams, FlipAddress, PixelFormat, Plane, PlaneId, PlaneInfo,
    PlaneProps, PlaneSize, Rotation, ScalingInfo, StereoFormat, SurfaceUpdateFlags, Swizzle,
    TilingInfo,
};
pub use stream::{
    ColorDepth, DscConfig, LinkId, LinkInfo, Stream, StreamConfig, StreamId, StreamUpdateFlags,
    VrrAdjust, VrrBounds, VrrRange,
};
pub use timing::CrtcTiming;

use serde::{Deserialize, Serialize};

/// Screen-space rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub const fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn same_size(&self, other: &Rect) -> bool {
        self.width == other.width && self.height == other.height
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ColorSpace {
    #[default]
    Srgb,
    SrgbLimited,
    Bt601,
    Bt709,
    Bt2020,
    Bt2020Pq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TransferFunction {
    #[default]
    Srgb,
    Bt709,
    Linear,
    Pq,
    Hlg,
}

/// 3x4 fixed-point color matrix.
pub type ColorMatrix = [i32; 12];

