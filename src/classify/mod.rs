// src/classify/mod.rs
//! Change Classifier: decides how much hardware an update touches.
//!
//! Every comparison produces update flags; the tier is the highest severity
//! among the flags that are set. Any attribute that can alter fetch
//! bandwidth (bytes per element, swizzle, compression, visibility, scaling
//! ratio) carries a FULL-severity flag, so a surface whose geometry is
//! otherwise identical still escalates when its memory layout changes.
//!
//! Classification is read-only. `Classification::mark` stamps the flags onto
//! the derived objects of a candidate container, so a rejected candidate
//! leaves the LIVE objects clean.

use crate::error::TxnError;
use crate::model::{
    ColorDepth, ColorMatrix, ColorPipeline, ColorSpace, ColorUpdate, CrtcTiming, DscConfig,
    FlipAddress, PlaneId, PlaneInfo, PlaneProps, Rect, ScalingInfo, Stream, StreamConfig,
    StreamId, StreamUpdateFlags, SurfaceUpdateFlags, Swizzle, TransferFunction, VrrRange,
};
use crate::state::State;
use log::debug;

/// Reprogramming cost of an update, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UpdateType {
    /// Address or flip timing only.
    Fast,
    /// Geometry or color pipeline; synchronized but no bandwidth change.
    Medium,
    /// Format, layout, bandwidth or topology; full revalidation.
    Full,
}

impl UpdateType {
    pub fn of_surface_flags(flags: SurfaceUpdateFlags) -> Self {
        if flags.intersects(SurfaceUpdateFlags::FULL_MASK) {
            UpdateType::Full
        } else if flags.intersects(SurfaceUpdateFlags::MEDIUM_MASK) {
            UpdateType::Medium
        } else {
            UpdateType::Fast
        }
    }

    pub fn of_stream_flags(flags: StreamUpdateFlags) -> Self {
        if flags.intersects(StreamUpdateFlags::FULL_MASK) {
            UpdateType::Full
        } else if flags.intersects(StreamUpdateFlags::MEDIUM_MASK) {
            UpdateType::Medium
        } else {
            UpdateType::Fast
        }
    }
}

// --- Update Requests ---

/// Proposed change to one plane; `None` fields are left as committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceUpdate {
    pub plane_id: PlaneId,
    pub flip_addr: Option<FlipAddress>,
    pub plane_info: Option<PlaneInfo>,
    pub scaling_info: Option<ScalingInfo>,
    pub color: ColorUpdate,
}

impl SurfaceUpdate {
    pub fn new(plane_id: PlaneId) -> Self {
        Self {
            plane_id,
            flip_addr: None,
            plane_info: None,
            scaling_info: None,
            color: ColorUpdate::default(),
        }
    }

    /// Address-only update.
    pub fn flip(plane_id: PlaneId, address: u64) -> Self {
        Self {
            flip_addr: Some(FlipAddress {
                address,
                ..FlipAddress::default()
            }),
            ..Self::new(plane_id)
        }
    }

    /// Properties after applying this update to `props`.
    pub fn apply_to(&self, props: &PlaneProps) -> PlaneProps {
        let mut out = *props;
        if let Some(info) = self.plane_info {
            out.info = info;
        }
        if let Some(scaling) = self.scaling_info {
            out.scaling = scaling;
        }
        self.color.apply_to(&mut out.color);
        out
    }
}

/// Proposed change to a stream; `None` fields are left as committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamUpdate {
    pub src: Option<Rect>,
    pub dst: Option<Rect>,
    pub out_transfer_func: Option<TransferFunction>,
    pub abm_level: Option<u8>,
    pub dpms_off: Option<bool>,
    pub gamut_remap: Option<Option<ColorMatrix>>,
    pub dsc: Option<Option<DscConfig>>,
    pub output_color_space: Option<ColorSpace>,
    pub output_csc: Option<Option<ColorMatrix>>,
    pub timing: Option<CrtcTiming>,
    pub color_depth: Option<ColorDepth>,
    pub vrr: Option<Option<VrrRange>>,
}

impl StreamUpdate {
    pub fn is_empty(&self) -> bool {
        *self == StreamUpdate::default()
    }

    /// Configuration after applying this update; DPMS is not part of it.
    pub fn apply_to(&self, config: &StreamConfig) -> StreamConfig {
        let mut out = *config;
        if let Some(src) = self.src {
            out.src = src;
        }
        if let Some(dst) = self.dst {
            out.dst = dst;
        }
        if let Some(tf) = self.out_transfer_func {
            out.out_transfer_func = tf;
        }
        if let Some(level) = self.abm_level {
            out.abm_level = level;
        }
        if let Some(remap) = self.gamut_remap {
            out.gamut_remap = remap;
        }
        if let Some(dsc) = self.dsc {
            out.dsc = dsc;
        }
        if let Some(cs) = self.output_color_space {
            out.output_color_space = cs;
        }
        if let Some(csc) = self.output_csc {
            out.output_csc = csc;
        }
        if let Some(timing) = self.timing {
            out.timing = timing;
        }
        if let Some(depth) = self.color_depth {
            out.color_depth = depth;
        }
        if let Some(vrr) = self.vrr {
            out.vrr = vrr;
        }
        out
    }
}

// --- Attribute Comparison ---

pub fn plane_info_update_flags(old: &PlaneInfo, new: &PlaneInfo) -> SurfaceUpdateFlags {
    let mut flags = SurfaceUpdateFlags::empty();

    if old.color_space != new.color_space {
        flags |= SurfaceUpdateFlags::COLOR_SPACE;
    }
    if old.horizontal_mirror != new.horizontal_mirror {
        flags |= SurfaceUpdateFlags::HORIZONTAL_MIRROR;
    }
    if old.per_pixel_alpha != new.per_pixel_alpha {
        flags |= SurfaceUpdateFlags::PER_PIXEL_ALPHA;
    }
    if old.global_alpha_value != new.global_alpha_value {
        flags |= SurfaceUpdateFlags::GLOBAL_ALPHA;
    }
    if old.plane_size != new.plane_size {
        flags |= SurfaceUpdateFlags::PLANE_SIZE;
    }
    if old.layer_index != new.layer_index {
        flags |= SurfaceUpdateFlags::POSITION;
    }
    if old.rotation != new.rotation {
        flags |= SurfaceUpdateFlags::ROTATION;
    }
    if old.format != new.format {
        flags |= SurfaceUpdateFlags::PIXEL_FORMAT;
        if old.format.bits_per_pixel() != new.format.bits_per_pixel() {
            flags |= SurfaceUpdateFlags::BPP;
        }
    }
    if old.stereo_format != new.stereo_format {
        flags |= SurfaceUpdateFlags::STEREO_FORMAT;
    }
    if old.dcc != new.dcc {
        flags |= SurfaceUpdateFlags::DCC;
    }
    if old.tiling != new.tiling {
        flags |= SurfaceUpdateFlags::SWIZZLE;
        if new.tiling.swizzle != Swizzle::Linear {
            flags |= SurfaceUpdateFlags::BANDWIDTH;
        }
    }
    if old.visible != new.visible {
        flags |= SurfaceUpdateFlags::BANDWIDTH;
    }
    flags
}

pub fn scaling_info_update_flags(old: &ScalingInfo, new: &ScalingInfo) -> SurfaceUpdateFlags {
    let mut flags = SurfaceUpdateFlags::empty();

    if !old.clip_rect.same_size(&new.clip_rect) || !old.dst_rect.same_size(&new.dst_rect) {
        flags |= SurfaceUpdateFlags::SCALING;
        // A smaller destination fetches the same source in less time.
        if new.dst_rect.width < old.dst_rect.width || new.dst_rect.height < old.dst_rect.height
        {
            flags |= SurfaceUpdateFlags::BANDWIDTH;
        }
    }
    if !old.src_rect.same_size(&new.src_rect) {
        flags |= SurfaceUpdateFlags::SCALING;
        if new.src_rect.width > old.src_rect.width || new.src_rect.height > old.src_rect.height {
            flags |= SurfaceUpdateFlags::CLOCK;
        }
    }
    if old.integer_scaling != new.integer_scaling {
        flags |= SurfaceUpdateFlags::SCALING;
    }
    if (old.src_rect.x, old.src_rect.y) != (new.src_rect.x, new.src_rect.y)
        || (old.dst_rect.x, old.dst_rect.y) != (new.dst_rect.x, new.dst_rect.y)
        || (old.clip_rect.x, old.clip_rect.y) != (new.clip_rect.x, new.clip_rect.y)
    {
        flags |= SurfaceUpdateFlags::POSITION;
    }
    flags
}

pub fn color_update_flags(old: &ColorPipeline, update: &ColorUpdate) -> SurfaceUpdateFlags {
    let mut flags = SurfaceUpdateFlags::empty();

    if update.in_transfer_func.is_some_and(|tf| tf != old.in_transfer_func) {
        flags |= SurfaceUpdateFlags::IN_TRANSFER_FUNC;
    }
    if update.hdr_mult.is_some_and(|m| m != old.hdr_mult) {
        flags |= SurfaceUpdateFlags::HDR_MULT;
    }
    if update.input_csc.is_some_and(|csc| csc != old.input_csc) {
        flags |= SurfaceUpdateFlags::INPUT_CSC;
    }
    if update.coeff_reduction.is_some_and(|cr| cr != old.coeff_reduction) {
        flags |= SurfaceUpdateFlags::COEFF_REDUCTION;
    }
    if update.gamut_remap.is_some_and(|r| r != old.gamut_remap) {
        flags |= SurfaceUpdateFlags::GAMUT_REMAP;
    }
    if update.gamma.is_some_and(|g| g != old.gamma) {
        flags |= SurfaceUpdateFlags::GAMMA;
    }
    if update.lut3d.is_some_and(|l| l != old.lut3d) {
        flags |= SurfaceUpdateFlags::LUT_3D;
    }
    flags
}

/// Flags for one surface update against the plane's committed properties.
pub fn surface_update_flags(old: &PlaneProps, update: &SurfaceUpdate) -> SurfaceUpdateFlags {
    let mut flags = SurfaceUpdateFlags::empty();
    if update.flip_addr.is_some() {
        flags |= SurfaceUpdateFlags::ADDR;
    }
    if let Some(info) = &update.plane_info {
        flags |= plane_info_update_flags(&old.info, info);
    }
    if let Some(scaling) = &update.scaling_info {
        flags |= scaling_info_update_flags(&old.scaling, scaling);
    }
    flags | color_update_flags(&old.color, &update.color)
}

pub fn stream_update_flags(old: &Stream, update: &StreamUpdate) -> StreamUpdateFlags {
    let config = old.config();
    let mut flags = StreamUpdateFlags::empty();

    if update.src.is_some_and(|r| r != config.src) || update.dst.is_some_and(|r| r != config.dst)
    {
        flags |= StreamUpdateFlags::SCALING;
    }
    if update
        .out_transfer_func
        .is_some_and(|tf| tf != config.out_transfer_func)
    {
        flags |= StreamUpdateFlags::OUT_TF;
    }
    if update.abm_level.is_some_and(|l| l != config.abm_level) {
        flags |= StreamUpdateFlags::ABM_LEVEL;
    }
    if update.dpms_off.is_some_and(|off| off != old.dpms_off()) {
        flags |= StreamUpdateFlags::DPMS_OFF;
    }
    if update.gamut_remap.is_some_and(|r| r != config.gamut_remap) {
        flags |= StreamUpdateFlags::GAMUT_REMAP;
    }
    if update.dsc.is_some_and(|d| d != config.dsc) {
        flags |= StreamUpdateFlags::DSC_CHANGED;
    }
    if update
        .output_color_space
        .is_some_and(|cs| cs != config.output_color_space)
    {
        flags |= StreamUpdateFlags::OUTPUT_COLOR_SPACE;
    }
    if update.output_csc.is_some_and(|csc| csc != config.output_csc) {
        flags |= StreamUpdateFlags::OUT_CSC;
    }
    if update.timing.is_some_and(|t| t != config.timing) {
        flags |= StreamUpdateFlags::MODE_CHANGED;
    }
    if update.color_depth.is_some_and(|d| d != config.color_depth) {
        flags |= StreamUpdateFlags::COLOR_DEPTH;
    }
    if update.vrr.is_some_and(|v| v != config.vrr) {
        flags |= StreamUpdateFlags::VRR_RANGE;
    }
    flags
}

// --- Classification ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub tier: UpdateType,
    pub surfaces: Vec<(PlaneId, SurfaceUpdateFlags)>,
    pub stream: StreamUpdateFlags,
}

impl Classification {
    pub fn surface_flags(&self, plane: PlaneId) -> SurfaceUpdateFlags {
        self.surfaces
            .iter()
            .find(|(id, _)| *id == plane)
            .map(|(_, flags)| *flags)
            .unwrap_or_default()
    }

    /// Writes the flags onto `stream_id` and the classified planes of
    /// `state`.
    ///
    /// Only call this on a candidate whose classified objects were derived
    /// for it; objects shared with the LIVE container would carry the flags
    /// into unrelated commits.
    pub fn mark(&self, state: &State, stream_id: StreamId) {
        for (id, flags) in &self.surfaces {
            if let Some(plane) = state.plane(stream_id, *id) {
                plane.set_update_flags(*flags);
            }
        }
        if let Some(stream) = state.stream(stream_id) {
            stream.set_update_flags(self.stream);
        }
    }
}

/// Classifies a batch of updates for one stream against `current`.
///
/// A plane that is no longer bound in `current`'s pipes, or that was marked
/// for a forced full update, gets every flag. When the aggregate tier is
/// FULL every involved object gets every flag, except that the stream's
/// compression flag keeps its computed value.
pub fn classify(
    current: &State,
    stream_id: StreamId,
    updates: &[SurfaceUpdate],
    stream_update: Option<&StreamUpdate>,
) -> Result<Classification, TxnError> {
    let stream = current
        .stream(stream_id)
        .ok_or(TxnError::UnknownStream(stream_id))?;

    let mut tier = UpdateType::Fast;
    let mut surfaces = Vec::with_capacity(updates.len());
    for update in updates {
        let plane = current
            .plane(stream_id, update.plane_id)
            .ok_or(TxnError::UnknownPlane {
                stream: stream_id,
                plane: update.plane_id,
            })?;
        let flags = if !current.res_ctx().contains_plane(plane.id()) || plane.force_full_update()
        {
            SurfaceUpdateFlags::all()
        } else {
            surface_update_flags(plane.props(), update)
        };
        tier = tier.max(UpdateType::of_surface_flags(flags));
        surfaces.push((plane.id(), flags));
    }

    let mut stream_flags = stream_update
        .map(|su| stream_update_flags(stream, su))
        .unwrap_or_default();
    tier = tier.max(UpdateType::of_stream_flags(stream_flags));

    if tier == UpdateType::Full {
        for (_, flags) in surfaces.iter_mut() {
            *flags = SurfaceUpdateFlags::all();
        }
        let dsc = stream_flags & StreamUpdateFlags::DSC_CHANGED;
        stream_flags = (StreamUpdateFlags::all() - StreamUpdateFlags::DSC_CHANGED) | dsc;
    }

    debug!(
        "Classifier: {} with {} surface update(s) classified {:?}",
        stream_id,
        updates.len(),
        tier
    );
    Ok(Classification {
        tier,
        surfaces,
        stream: stream_flags,
    })
}

#[cfg(test)]
mod tests;
