// src/config.rs

//! Configuration of the display transaction engine.
//!
//! Every section derives `Serialize`/`Deserialize` with `#[serde(default)]`,
//! so a JSON file only needs to name the values it overrides. The
//! process-wide `CONFIG` reads the file named by `DISPLAY_TXN_CONFIG` on
//! first use and falls back to the defaults when it is unset or unreadable.

use anyhow::{Context, Result};
use log::warn;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::model::ColorDepth;
use crate::resource::MAX_PIPES;

/// Environment variable naming a JSON configuration file.
pub const CONFIG_ENV_VAR: &str = "DISPLAY_TXN_CONFIG";

/// Lazily loaded process-wide configuration.
pub static CONFIG: Lazy<Config> = Lazy::new(Config::load_from_env);

// --- Top-Level Configuration Structure ---

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Hardware block counts.
    pub pool: PoolConfig,
    /// Clock levels and memory ceiling used by the bandwidth model.
    pub bandwidth: BandwidthConfig,
    /// Bounded waits of the commit pipeline.
    pub timeouts: TimeoutConfig,
    /// Cadence detection for the VRR subsystem.
    pub vrr: VrrTuning,
    /// Deferred notification workers.
    pub workers: WorkerConfig,
    /// Link validation policy.
    pub validation: ValidationConfig,
}

impl Config {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config =
            serde_json::from_str(json).context("Failed to parse configuration JSON")?;
        config.check()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file {}", path.display()))?;
        Self::from_json_str(&text)
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    fn load_from_env() -> Self {
        let Ok(path) = std::env::var(CONFIG_ENV_VAR) else {
            return Config::default();
        };
        match Config::from_file(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Config: {:#}; using defaults", e);
                Config::default()
            }
        }
    }

    /// Rejects configurations the engine cannot represent.
    pub fn check(&self) -> Result<()> {
        if self.pool.pipe_count == 0 || self.pool.pipe_count > MAX_PIPES {
            anyhow::bail!(
                "pool.pipe_count must be between 1 and {}, got {}",
                MAX_PIPES,
                self.pool.pipe_count
            );
        }
        if self.bandwidth.dispclk_levels_khz.is_empty() {
            anyhow::bail!("bandwidth.dispclk_levels_khz must not be empty");
        }
        if self
            .bandwidth
            .dispclk_levels_khz
            .windows(2)
            .any(|w| w[0] >= w[1])
        {
            anyhow::bail!("bandwidth.dispclk_levels_khz must be strictly ascending");
        }
        if self.workers.num_workers == 0 || self.workers.queue_capacity == 0 {
            anyhow::bail!("workers.num_workers and workers.queue_capacity must be non-zero");
        }
        Ok(())
    }
}

// --- Resource Pool ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    pub pipe_count: usize,
    pub timing_generators: u8,
    pub scalers: u8,
    pub compositors: u8,
    pub link_encoders: u8,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pipe_count: 4,
            timing_generators: 4,
            scalers: 4,
            compositors: 4,
            link_encoders: 4,
        }
    }
}

// --- Bandwidth Model ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BandwidthConfig {
    /// Achievable display clock states, ascending.
    pub dispclk_levels_khz: Vec<u32>,
    /// Memory fetch ceiling in kB/s.
    pub dram_bandwidth_kbps: u64,
    /// Fetch cost of a compressed surface relative to uncompressed.
    pub dcc_ratio_percent: u32,
}

impl BandwidthConfig {
    pub fn max_dispclk_khz(&self) -> u32 {
        self.dispclk_levels_khz.last().copied().unwrap_or(0)
    }
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            dispclk_levels_khz: vec![300_000, 600_000, 900_000, 1_200_000],
            dram_bandwidth_kbps: 12_000_000,
            dcc_ratio_percent: 75,
        }
    }
}

// --- Timeouts ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Bounded wait for outstanding flips before the optimize step.
    pub flip_wait_ms: u64,
    /// Bounded wait for a synchronous firmware reply.
    pub firmware_sync_ms: u64,
}

impl TimeoutConfig {
    pub fn flip_wait(&self) -> Duration {
        Duration::from_millis(self.flip_wait_ms)
    }

    pub fn firmware_sync(&self) -> Duration {
        Duration::from_millis(self.firmware_sync_ms)
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            flip_wait_ms: 100,
            firmware_sync_ms: 50,
        }
    }
}

// --- VRR ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VrrTuning {
    /// Consecutive matching intervals before locking to a video rate.
    pub fixed_refresh_detect_frames: usize,
    /// How far an interval may stray from a video rate and still match.
    pub cadence_tolerance_us: u64,
    /// Consecutive mismatching intervals before leaving fixed refresh.
    pub fixed_refresh_exit_frames: u32,
}

impl Default for VrrTuning {
    fn default() -> Self {
        Self {
            fixed_refresh_detect_frames: 8,
            cadence_tolerance_us: 200,
            fixed_refresh_exit_frames: 2,
        }
    }
}

// --- Workers ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub num_workers: usize,
    /// Bound on queued deferred handlers.
    pub queue_capacity: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: 2,
            queue_capacity: 64,
        }
    }
}

// --- Validation ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ValidationConfig {
    /// Lower the requested color depth until the link accepts the stream.
    pub color_depth_fallback: bool,
    /// Lowest depth the fallback may reach.
    pub min_color_depth: ColorDepth,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            color_depth_fallback: true,
            min_color_depth: ColorDepth::Bpc6,
        }
    }
}
