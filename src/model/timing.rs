// src/model/timing.rs
//! CRTC timing and the vertical-total arithmetic shared by validation and VRR.
//!
//! All refresh rates are carried in millihertz and all durations in
//! microseconds so that integer math stays exact for the common video rates
//! (23.976 Hz is `23_976` mHz).

use serde::{Deserialize, Serialize};

/// Raster timing of one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrtcTiming {
    pub h_addressable: u32,
    pub h_front_porch: u32,
    pub h_sync_width: u32,
    pub h_total: u32,
    pub v_addressable: u32,
    pub v_front_porch: u32,
    pub v_sync_width: u32,
    pub v_total: u32,
    /// Pixel clock in units of 100 Hz.
    pub pix_clk_100hz: u32,
}

impl CrtcTiming {
    /// CEA 1920x1080@60.
    pub fn fhd_60() -> Self {
        Self {
            h_addressable: 1920,
            h_front_porch: 88,
            h_sync_width: 44,
            h_total: 2200,
            v_addressable: 1080,
            v_front_porch: 4,
            v_sync_width: 5,
            v_total: 1125,
            pix_clk_100hz: 1_485_000,
        }
    }

    /// 2560x1440@144 with reduced blanking.
    pub fn qhd_144() -> Self {
        Self {
            h_addressable: 2560,
            h_front_porch: 48,
            h_sync_width: 32,
            h_total: 2720,
            v_addressable: 1440,
            v_front_porch: 3,
            v_sync_width: 5,
            v_total: 1525,
            pix_clk_100hz: 5_973_120,
        }
    }

    pub fn pix_clk_hz(&self) -> u64 {
        self.pix_clk_100hz as u64 * 100
    }

    pub fn pix_clk_khz(&self) -> u64 {
        self.pix_clk_100hz as u64 / 10
    }

    /// Nominal refresh rate in millihertz.
    pub fn refresh_mhz(&self) -> u32 {
        let denom = self.h_total as u64 * self.v_total as u64;
        if denom == 0 {
            return 0;
        }
        (self.pix_clk_hz() * 1000 / denom) as u32
    }

    /// Vertical total that produces `refresh_mhz` at this pixel clock.
    pub fn v_total_for_refresh(&self, refresh_mhz: u32) -> u32 {
        let denom = self.h_total as u64 * refresh_mhz as u64;
        if denom == 0 {
            return self.v_total;
        }
        (self.pix_clk_hz() * 1000 / denom) as u32
    }

    /// Vertical total whose frame lasts `duration_us`.
    pub fn v_total_for_duration_us(&self, duration_us: u64) -> u32 {
        let denom = self.h_total as u64 * 1_000_000;
        if denom == 0 {
            return self.v_total;
        }
        let v = self.pix_clk_hz() * duration_us / denom;
        v.min(u32::MAX as u64) as u32
    }

    /// Duration of one frame scanned out with `v_total` lines.
    pub fn frame_duration_us(&self, v_total: u32) -> u64 {
        let clk = self.pix_clk_hz();
        if clk == 0 {
            return 0;
        }
        v_total as u64 * self.h_total as u64 * 1_000_000 / clk
    }

    /// True when scanline `vpos` lies between the end of active scanout and
    /// the start of vertical sync.
    pub fn is_in_front_porch(&self, vpos: u32) -> bool {
        let porch_end = u64::from(self.v_addressable) + u64::from(self.v_front_porch);
        vpos >= self.v_addressable && u64::from(vpos) < porch_end
    }
}

impl Default for CrtcTiming {
    fn default() -> Self {
        Self::fhd_60()
    }
}
