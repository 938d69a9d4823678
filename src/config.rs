//! Device configuration.
//!
//! Configuration is a flat key/value map deserialized from TOML. Keys
//! use the conventional device-parameter spellings (`tRCD`, `EIDD0`,
//! `HighWaterMark`, ...) so config files read like a datasheet:
//!
//! ```toml
//! # nvmem-sim device config
//! ROWS = 65536
//! COLS = 1024
//! BANKS = 8
//! tRCD = 10
//! tRAS = 24
//! EnergyModel = "current"
//! EnduranceModel = "BitModel"
//! ```
//!
//! Every key has a default; absent keys fall back silently. Keys that
//! violate sanity rules are clamped with a logged warning rather than
//! rejected, so a sloppy config still simulates.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Full device + controller configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    // Geometry
    #[serde(rename = "CHANNELS")]
    pub channels: u64,
    #[serde(rename = "RANKS")]
    pub ranks: u64,
    #[serde(rename = "BANKS")]
    pub banks: u64,
    #[serde(rename = "ROWS")]
    pub rows: u64,
    #[serde(rename = "COLS")]
    pub cols: u64,
    /// Rows per subarray MAT. 0 means one subarray spanning the bank.
    #[serde(rename = "MATHeight")]
    pub mat_height: u64,

    // Bus
    #[serde(rename = "BusWidth")]
    pub bus_width: u64,
    #[serde(rename = "tBURST")]
    pub t_burst: u64,
    #[serde(rename = "RATE")]
    pub rate: u64,
    #[serde(rename = "CLK")]
    pub clk_mhz: f64,
    #[serde(rename = "MULT")]
    pub mult: f64,
    #[serde(rename = "BPC")]
    pub bytes_per_clock: f64,
    #[serde(rename = "Voltage")]
    pub voltage: f64,

    // Command timing (cycles)
    #[serde(rename = "tRCD")]
    pub t_rcd: u64,
    #[serde(rename = "tRAS")]
    pub t_ras: u64,
    #[serde(rename = "tRP")]
    pub t_rp: u64,
    #[serde(rename = "tCAS")]
    pub t_cas: u64,
    #[serde(rename = "tCCD")]
    pub t_ccd: u64,
    #[serde(rename = "tAL")]
    pub t_al: u64,
    #[serde(rename = "tCWD")]
    pub t_cwd: u64,
    #[serde(rename = "tWTR")]
    pub t_wtr: u64,
    #[serde(rename = "tWR")]
    pub t_wr: u64,
    #[serde(rename = "tRTP")]
    pub t_rtp: u64,
    #[serde(rename = "tRRDR")]
    pub t_rrdr: u64,
    #[serde(rename = "tRRD")]
    pub t_rrd: u64,
    #[serde(rename = "tFAW")]
    pub t_faw: u64,

    // Power-down timing
    #[serde(rename = "tPD")]
    pub t_pd: u64,
    #[serde(rename = "tXP")]
    pub t_xp: u64,
    #[serde(rename = "tXPDLL")]
    pub t_xpdll: u64,

    // Refresh
    #[serde(rename = "UseRefresh")]
    pub use_refresh: bool,
    #[serde(rename = "RankRefresh")]
    pub rank_refresh: bool,
    #[serde(rename = "RefreshRows")]
    pub refresh_rows: u64,
    #[serde(rename = "tRFI")]
    pub t_rfi: u64,
    #[serde(rename = "tRFC")]
    pub t_rfc: u64,

    // Energy
    #[serde(rename = "EnergyModel")]
    pub energy_model: EnergyModel,
    #[serde(rename = "EIDD0")]
    pub eidd0: f64,
    #[serde(rename = "EIDD2N")]
    pub eidd2n: f64,
    #[serde(rename = "EIDD3N")]
    pub eidd3n: f64,
    #[serde(rename = "EIDD4R")]
    pub eidd4r: f64,
    #[serde(rename = "EIDD4W")]
    pub eidd4w: f64,
    #[serde(rename = "EIDD5B")]
    pub eidd5b: f64,
    #[serde(rename = "Erd")]
    pub e_rd: f64,
    #[serde(rename = "Eopenrd")]
    pub e_openrd: f64,
    #[serde(rename = "Ewr")]
    pub e_wr: f64,
    #[serde(rename = "Eref")]
    pub e_ref: f64,

    // Endurance
    #[serde(rename = "EnduranceModel")]
    pub endurance_model: String,
    #[serde(rename = "EnduranceBudget")]
    pub endurance_budget: u64,

    // Controller
    #[serde(rename = "ReadQueueSize")]
    pub read_queue_size: usize,
    #[serde(rename = "WriteQueueSize")]
    pub write_queue_size: usize,
    #[serde(rename = "StarvationThreshold")]
    pub starvation_threshold: u32,
    /// Write-drain start level. Absent means "write queue size".
    #[serde(rename = "HighWaterMark")]
    pub high_water_mark: Option<usize>,
    #[serde(rename = "LowWaterMark")]
    pub low_water_mark: usize,

    /// Start every bank in fast-exit precharge power-down.
    #[serde(rename = "InitPD")]
    pub init_powered_down: bool,
}

/// Which energy accounting runs in the banks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnergyModel {
    /// IDD-current based accounting (DRAM datasheet style, mA·cycles).
    Current,
    /// Fixed energy per event (Eopenrd/Ewr/Eref, nJ).
    #[default]
    Flat,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            channels: 1,
            ranks: 1,
            banks: 8,
            rows: 65536,
            cols: 1024,
            mat_height: 0,

            bus_width: 64,
            t_burst: 8,
            rate: 2,
            clk_mhz: 666.0,
            mult: 1.0,
            bytes_per_clock: 8.0,
            voltage: 1.5,

            t_rcd: 9,
            t_ras: 24,
            t_rp: 9,
            t_cas: 9,
            t_ccd: 4,
            t_al: 0,
            t_cwd: 7,
            t_wtr: 5,
            t_wr: 10,
            t_rtp: 5,
            t_rrdr: 5,
            t_rrd: 4,
            t_faw: 20,

            t_pd: 4,
            t_xp: 4,
            t_xpdll: 17,

            use_refresh: false,
            rank_refresh: false,
            refresh_rows: 4,
            t_rfi: 42_666_667,
            t_rfc: 107,

            energy_model: EnergyModel::Flat,
            eidd0: 85.0,
            eidd2n: 45.0,
            eidd3n: 67.0,
            eidd4r: 220.0,
            eidd4w: 240.0,
            eidd5b: 255.0,
            e_rd: 3.405_401,
            e_openrd: 1.081_080,
            e_wr: 1.023_750,
            e_ref: 38.558_533,

            endurance_model: String::new(),
            endurance_budget: 100_000_000,

            read_queue_size: 32,
            write_queue_size: 8,
            starvation_threshold: 4,
            high_water_mark: None,
            low_water_mark: 0,

            init_powered_down: false,
        }
    }
}

impl DeviceConfig {
    /// Load from a TOML file and apply sanity rules.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Parse from TOML text and apply sanity rules.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let mut cfg: DeviceConfig = toml::from_str(text)?;
        cfg.sanitize()?;
        Ok(cfg)
    }

    /// Validate hard requirements and clamp soft ones.
    ///
    /// Watermark rules follow the controller's contract: the high
    /// watermark cannot exceed the write queue size and the low
    /// watermark cannot exceed the high watermark. Violations are
    /// clamped and logged, not fatal.
    pub fn sanitize(&mut self) -> Result<(), ConfigError> {
        for (name, v) in [
            ("CHANNELS", self.channels),
            ("RANKS", self.ranks),
            ("BANKS", self.banks),
            ("ROWS", self.rows),
            ("COLS", self.cols),
            ("BusWidth", self.bus_width),
            ("tBURST", self.t_burst),
            ("RATE", self.rate),
        ] {
            if v == 0 {
                return Err(ConfigError::Invalid(format!("{} must be nonzero", name)));
            }
        }

        if self.mat_height == 0 || self.mat_height > self.rows {
            self.mat_height = self.rows;
        }

        if let Some(high) = self.high_water_mark {
            if high > self.write_queue_size {
                log::warn!(
                    "HighWaterMark {} exceeds WriteQueueSize {}; clamping",
                    high,
                    self.write_queue_size
                );
                self.high_water_mark = Some(self.write_queue_size);
            }
        }
        let high = self.drain_high_watermark();
        if self.low_water_mark > high {
            log::warn!(
                "LowWaterMark {} exceeds HighWaterMark {}; resetting to 0",
                self.low_water_mark,
                high
            );
            self.low_water_mark = 0;
        }

        if self.use_refresh {
            if self.refresh_rows == 0 || self.refresh_rows > self.rows {
                log::warn!("RefreshRows {} out of range; using 1", self.refresh_rows);
                self.refresh_rows = 1;
            }
            if self.t_rfi == 0 {
                return Err(ConfigError::Invalid("tRFI must be nonzero".into()));
            }
        }

        Ok(())
    }

    /// Bytes moved by one full burst (the data-block size).
    pub fn block_bytes(&self) -> usize {
        (self.bus_width / 8 * self.t_burst * self.rate) as usize
    }

    /// Column addresses per row at burst granularity.
    pub fn burst_cols(&self) -> u64 {
        (self.cols / (self.t_burst * self.rate)).max(1)
    }

    /// Subarrays per bank.
    pub fn subarrays(&self) -> u64 {
        (self.rows / self.mat_height.max(1)).max(1)
    }

    /// Effective write-drain start level.
    pub fn drain_high_watermark(&self) -> usize {
        self.high_water_mark.unwrap_or(self.write_queue_size)
    }

    /// Peak bus bandwidth in MB/s.
    pub fn ideal_bandwidth(&self) -> f64 {
        self.clk_mhz * self.mult * self.rate as f64 * self.bytes_per_clock
    }

    /// Cycles between refresh commands when refresh is spread over
    /// `RefreshRows`-sized row groups.
    pub fn refresh_interval(&self) -> u64 {
        (self.t_rfi / (self.rows / self.refresh_rows).max(1)).max(1)
    }
}
