//! Configuration Module
//!
//! Runtime knobs for command construction, scalability and status readback,
//! read from a TOML file.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::encoder::{CodecKind, CodingDirection, Generation, RowStoreSupport};
use crate::error::MediaError;
use crate::protocol::{MAX_COMMAND_BUFFER_SIZE, MAX_PIPES};
use crate::scalability::ScalabilityOptions;
use crate::status_report::StatusOptions;

/// Backend configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Hardware generation: "gen11" or "gen12"
    #[serde(default = "default_generation")]
    pub generation: Generation,

    /// Pipe count to force (0 = derive from tiling)
    #[serde(default)]
    pub forced_pipes: u32,

    /// Upper bound on pipes when derived automatically
    #[serde(default = "default_max_pipes")]
    pub max_pipes: u32,

    /// Run on one pipe if semaphores cannot be allocated
    #[serde(default = "default_true")]
    pub allow_single_pipe_fallback: bool,

    /// Initial command buffer size in bytes
    #[serde(default = "default_cmdbuf_initial_size")]
    pub cmdbuf_initial_size: usize,

    /// Largest command buffer ever allocated
    #[serde(default = "default_cmdbuf_max_size")]
    pub cmdbuf_max_size: usize,

    /// Initial patch-list entries per buffer
    #[serde(default = "default_patch_list_size")]
    pub patch_list_initial_size: usize,

    /// Grow attempts before a unit of work is rejected
    #[serde(default = "default_resize_retries")]
    pub resize_retries: u32,

    /// Dummy writes inserted after each all-pipes rendezvous
    #[serde(default = "default_semaphore_delay")]
    pub semaphore_delay_writes: u32,

    /// Let the submission path write the completion tag
    #[serde(default = "default_true")]
    pub frame_tracking: bool,

    /// Capture the frame CRC register into status records
    #[serde(default)]
    pub report_crc: bool,

    /// Status records in flight (power of two)
    #[serde(default = "default_status_ring_depth")]
    pub status_ring_depth: u32,

    #[serde(default)]
    pub row_store: RowStoreConfig,

    #[serde(default)]
    pub demo: DemoConfig,
}

/// Per-buffer row-store cache disables.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RowStoreConfig {
    #[serde(default)]
    pub disable_all: bool,
    #[serde(default)]
    pub disable_hevc_dat: bool,
    #[serde(default)]
    pub disable_hevc_df: bool,
    #[serde(default)]
    pub disable_hevc_sao: bool,
    #[serde(default)]
    pub disable_vp9_hvd: bool,
    #[serde(default)]
    pub disable_vp9_dat: bool,
    #[serde(default)]
    pub disable_vp9_df: bool,
}

/// Workload the demo binary drives through the simulated engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemoConfig {
    /// "hevc" or "vp9"
    #[serde(default = "default_codec")]
    pub codec: CodecKind,

    /// "decode" or "encode"
    #[serde(default = "default_direction")]
    pub direction: CodingDirection,

    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,

    /// Uniform tile columns
    #[serde(default = "default_tile_columns")]
    pub tile_columns: u32,

    /// Frames to run (0 = until interrupted)
    #[serde(default = "default_frames")]
    pub frames: u32,

    /// Status poll period in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_generation() -> Generation {
    Generation::Gen12
}

fn default_max_pipes() -> u32 {
    MAX_PIPES as u32
}

fn default_true() -> bool {
    true
}

fn default_cmdbuf_initial_size() -> usize {
    0x4000
}

fn default_cmdbuf_max_size() -> usize {
    MAX_COMMAND_BUFFER_SIZE
}

fn default_patch_list_size() -> usize {
    128
}

fn default_resize_retries() -> u32 {
    2
}

fn default_semaphore_delay() -> u32 {
    4
}

fn default_status_ring_depth() -> u32 {
    64
}

fn default_codec() -> CodecKind {
    CodecKind::Hevc
}

fn default_direction() -> CodingDirection {
    CodingDirection::Decode
}

fn default_width() -> u32 {
    3840
}

fn default_height() -> u32 {
    2160
}

fn default_tile_columns() -> u32 {
    2
}

fn default_frames() -> u32 {
    8
}

fn default_poll_interval_ms() -> u64 {
    2
}

impl Default for Config {
    fn default() -> Self {
        Self {
            generation: default_generation(),
            forced_pipes: 0,
            max_pipes: default_max_pipes(),
            allow_single_pipe_fallback: true,
            cmdbuf_initial_size: default_cmdbuf_initial_size(),
            cmdbuf_max_size: default_cmdbuf_max_size(),
            patch_list_initial_size: default_patch_list_size(),
            resize_retries: default_resize_retries(),
            semaphore_delay_writes: default_semaphore_delay(),
            frame_tracking: true,
            report_crc: false,
            status_ring_depth: default_status_ring_depth(),
            row_store: RowStoreConfig::default(),
            demo: DemoConfig::default(),
        }
    }
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            codec: default_codec(),
            direction: default_direction(),
            width: default_width(),
            height: default_height(),
            tile_columns: default_tile_columns(),
            frames: default_frames(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> std::result::Result<(), MediaError> {
        let fail = |msg: String| -> std::result::Result<(), MediaError> { Err(MediaError::Config(msg)) };
        if self.forced_pipes as usize > MAX_PIPES {
            return fail(format!("forced_pipes {} exceeds {}", self.forced_pipes, MAX_PIPES));
        }
        if self.max_pipes == 0 || self.max_pipes as usize > MAX_PIPES {
            return fail(format!("max_pipes must be 1..={}, got {}", MAX_PIPES, self.max_pipes));
        }
        if self.cmdbuf_initial_size == 0 || self.cmdbuf_initial_size > self.cmdbuf_max_size {
            return fail(format!(
                "cmdbuf_initial_size {} must be nonzero and at most cmdbuf_max_size {}",
                self.cmdbuf_initial_size, self.cmdbuf_max_size
            ));
        }
        if self.cmdbuf_max_size > MAX_COMMAND_BUFFER_SIZE {
            return fail(format!("cmdbuf_max_size is capped at {:#x}", MAX_COMMAND_BUFFER_SIZE));
        }
        if !self.status_ring_depth.is_power_of_two() {
            return fail(format!("status_ring_depth {} is not a power of two", self.status_ring_depth));
        }
        if self.demo.tile_columns == 0 {
            return fail("demo.tile_columns must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn row_store_support(&self) -> RowStoreSupport {
        let rs = &self.row_store;
        RowStoreSupport {
            enabled: !rs.disable_all,
            hevc_dat: !rs.disable_hevc_dat,
            hevc_df: !rs.disable_hevc_df,
            hevc_sao: !rs.disable_hevc_sao,
            vp9_hvd: !rs.disable_vp9_hvd,
            vp9_dat: !rs.disable_vp9_dat,
            vp9_df: !rs.disable_vp9_df,
        }
    }

    pub fn status_options(&self) -> StatusOptions {
        StatusOptions {
            frame_tracking: self.frame_tracking,
            report_crc: self.report_crc,
        }
    }

    pub fn scalability_options(&self) -> ScalabilityOptions {
        ScalabilityOptions {
            forced_pipes: self.forced_pipes as usize,
            max_pipes: self.max_pipes as usize,
            allow_single_pipe_fallback: self.allow_single_pipe_fallback,
            semaphore_delay_writes: self.semaphore_delay_writes,
            frame_tracking: self.frame_tracking,
            resize_retries: self.resize_retries,
            initial_buffer_size: self.cmdbuf_initial_size,
            initial_patch_entries: self.patch_list_initial_size,
            max_buffer_size: self.cmdbuf_max_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.row_store_support(), RowStoreSupport::all());
        assert_eq!(config.scalability_options(), ScalabilityOptions::default());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            generation = "gen11"
            forced_pipes = 2

            [row_store]
            disable_hevc_sao = true

            [demo]
            codec = "vp9"
            "#,
        )
        .unwrap();
        assert_eq!(config.generation, Generation::Gen11);
        assert_eq!(config.forced_pipes, 2);
        assert_eq!(config.status_ring_depth, 64);
        assert!(!config.row_store_support().hevc_sao);
        assert!(config.row_store_support().hevc_dat);
        assert_eq!(config.demo.codec, CodecKind::Vp9);
        assert_eq!(config.demo.direction, CodingDirection::Decode);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vdbox.toml");
        let mut config = Config::default();
        config.report_crc = true;
        config.demo.frames = 3;
        config.save(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.status_ring_depth = 6;
        assert!(matches!(config.validate(), Err(MediaError::Config(_))));

        let mut config = Config::default();
        config.max_pipes = 5;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.cmdbuf_initial_size = config.cmdbuf_max_size + 1;
        assert!(config.validate().is_err());

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "forced_pipes = 9\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
