// src/validate/mod.rs
//! Resource Validator: decides whether a candidate container is realizable.
//!
//! Checks run in a fixed order and the first failure is returned:
//! 1. resources: every pipe chain is consistent and maps onto hardware
//!    blocks that exist and are booked once;
//! 2. bandwidth: display clock and memory fetch fit the platform ceiling
//!    (skipped by a fast-pass validation);
//! 3. features: per-stream link capacity, compression and variable-refresh
//!    preconditions.
//!
//! Validation borrows the candidate immutably; the caller records the
//! resulting clock state when it marks the container validated.

use crate::config::{BandwidthConfig, Config, ValidationConfig};
use crate::error::{BandwidthKind, FeatureReason, ResourceError, ValidationError};
use crate::model::{PlaneProps, StreamConfig, StreamId};
use crate::resource::ResourcePool;
use crate::state::{ClockState, State};
use log::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Every check, bandwidth model included.
    Full,
    /// Skips the bandwidth model; only for FAST/MEDIUM changes.
    FastPass,
}

#[derive(Debug, Clone)]
pub struct Validator {
    pool: ResourcePool,
    bandwidth: BandwidthConfig,
    policy: ValidationConfig,
}

impl Validator {
    pub fn new(config: &Config) -> Self {
        Self {
            pool: ResourcePool::from_config(config),
            bandwidth: config.bandwidth.clone(),
            policy: config.validation.clone(),
        }
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    /// Validates `state`, returning the clock state it needs.
    ///
    /// A fast pass keeps `baseline`, the clocks of the LIVE container.
    pub fn validate(
        &self,
        state: &State,
        mode: ValidationMode,
        baseline: ClockState,
    ) -> Result<ClockState, ValidationError> {
        let result = self.check_resources(state).and_then(|()| {
            let clocks = match mode {
                ValidationMode::Full => self.check_bandwidth(state)?,
                ValidationMode::FastPass => baseline,
            };
            self.check_features(state)?;
            Ok(clocks)
        });
        match &result {
            Ok(clocks) => debug!(
                "Validator: state {} accepted ({:?}, dispclk {} kHz, fetch {} kB/s)",
                state.id(),
                mode,
                clocks.dispclk_khz,
                clocks.fetch_kbps
            ),
            Err(e) => warn!("Validator: state {} rejected: {}", state.id(), e),
        }
        result
    }

    // --- (a) Resources ---

    fn check_resources(&self, state: &State) -> Result<(), ValidationError> {
        state.res_ctx().verify(&self.pool)?;
        for stream in state.streams() {
            if state.res_ctx().head_pipe(stream.id()).is_none() {
                return Err(ResourceError::UnknownStream(stream.id()).into());
            }
            for plane in state.planes(stream.id()) {
                if !state.res_ctx().contains_plane(plane.id()) {
                    return Err(ResourceError::UnknownPlane {
                        stream: stream.id(),
                        plane: plane.id(),
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    // --- (b) Bandwidth ---

    /// Display clock the busiest pipe needs, in kHz.
    pub fn required_dispclk_khz(&self, state: &State) -> u64 {
        state
            .streams()
            .iter()
            .map(|s| {
                let segments = state.res_ctx().segment_heads(s.id()).len().max(1) as u64;
                s.timing().pix_clk_khz().div_ceil(segments)
            })
            .max()
            .unwrap_or(0)
    }

    /// Memory fetch bandwidth of every visible plane on a lit stream, kB/s.
    pub fn fetch_bandwidth_kbps(&self, state: &State) -> u64 {
        state
            .streams()
            .iter()
            .filter(|s| !s.dpms_off())
            .flat_map(|s| {
                let refresh = s.timing().refresh_mhz();
                state
                    .planes(s.id())
                    .iter()
                    .map(move |p| self.plane_fetch_kbps(p.props(), refresh))
            })
            .fold(0, u64::saturating_add)
    }

    /// Fetch bandwidth of one surface in kB/s.
    pub fn plane_fetch_kbps(&self, props: &PlaneProps, refresh_mhz: u32) -> u64 {
        if !props.info.visible {
            return 0;
        }
        let src = props.scaling.src_rect;
        let dst = props.scaling.dst_rect;
        // Client sizes are not bounded here.
        let bytes_per_frame = src
            .area()
            .saturating_mul(props.info.format.bits_per_pixel() as u64)
            / 8;
        let mut kbps = bytes_per_frame.saturating_mul(refresh_mhz as u64) / 1_000_000;
        // Vertical downscaling fetches several source lines per output line.
        if dst.height > 0 && src.height > dst.height {
            kbps = kbps.saturating_mul(src.height as u64) / dst.height as u64;
        }
        if props.info.dcc.enable {
            kbps = kbps.saturating_mul(self.bandwidth.dcc_ratio_percent as u64) / 100;
        }
        kbps
    }

    fn check_bandwidth(&self, state: &State) -> Result<ClockState, ValidationError> {
        let required = self.required_dispclk_khz(state);
        let dispclk_khz = self
            .bandwidth
            .dispclk_levels_khz
            .iter()
            .copied()
            .find(|&level| level as u64 >= required)
            .ok_or(ValidationError::Bandwidth {
                kind: BandwidthKind::DisplayClock,
                required,
                available: self.bandwidth.max_dispclk_khz() as u64,
            })?;

        let fetch_kbps = self.fetch_bandwidth_kbps(state);
        if fetch_kbps > self.bandwidth.dram_bandwidth_kbps {
            return Err(ValidationError::Bandwidth {
                kind: BandwidthKind::Memory,
                required: fetch_kbps,
                available: self.bandwidth.dram_bandwidth_kbps,
            });
        }
        Ok(ClockState {
            dispclk_khz,
            fetch_kbps,
        })
    }

    // --- (c) Features ---

    fn check_features(&self, state: &State) -> Result<(), ValidationError> {
        state
            .streams()
            .iter()
            .try_for_each(|s| self.validate_stream_config(s.id(), s.config()))
    }

    /// Link capacity and feature preconditions of a single stream.
    pub fn validate_stream_config(
        &self,
        id: StreamId,
        config: &StreamConfig,
    ) -> Result<(), ValidationError> {
        let feature = |reason| Err(ValidationError::Feature { stream: id, reason });
        let link = &config.link;

        if let Some(range) = config.vrr {
            if !range.is_valid() {
                return feature(FeatureReason::InvalidVrrRange);
            }
            if !link.supports_vrr {
                return feature(FeatureReason::VrrUnsupported);
            }
        }
        if config.dsc.is_some() {
            if !link.supports_dsc {
                return feature(FeatureReason::DscUnsupported);
            }
            if config.vrr.is_some() && !link.dsc_with_vrr {
                return feature(FeatureReason::DscWithVrr);
            }
        }
        let required = config.link_bandwidth_kbps();
        if required > link.max_link_rate_kbps {
            return Err(ValidationError::Bandwidth {
                kind: BandwidthKind::Link,
                required,
                available: link.max_link_rate_kbps,
            });
        }
        Ok(())
    }

    /// Validates a stream against its link, lowering the color depth two
    /// bits at a time while the link is the only obstacle.
    ///
    /// The returned configuration carries the depth that was applied.
    pub fn fit_color_depth(
        &self,
        id: StreamId,
        mut config: StreamConfig,
    ) -> Result<StreamConfig, ValidationError> {
        let requested = config.color_depth;
        loop {
            let err = match self.validate_stream_config(id, &config) {
                Ok(()) => break,
                Err(e) => e,
            };
            let link_limited = matches!(
                err,
                ValidationError::Bandwidth {
                    kind: BandwidthKind::Link,
                    ..
                }
            );
            let lower = config
                .color_depth
                .lower()
                .filter(|d| *d >= self.policy.min_color_depth);
            match lower {
                Some(depth)
                    if link_limited && self.policy.color_depth_fallback && config.dsc.is_none() =>
                {
                    debug!(
                        "Validator: {} link rejects {:?}, retrying at {:?}",
                        id, config.color_depth, depth
                    );
                    config.color_depth = depth;
                }
                _ => return Err(err),
            }
        }
        if config.color_depth != requested {
            info!(
                "Validator: {} color depth reduced from {:?} to {:?} to fit {}",
                id, requested, config.color_depth, config.link.id
            );
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests;
