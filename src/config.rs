//! Configuration loading using Figment.
//!
//! Configuration is loaded from:
//! 1. Built-in defaults (every field has one)
//! 2. A TOML file (`config/aoloop.toml` unless another path is given)
//! 3. Environment variables prefixed with `AOLOOP_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use aoloop_camin::config::CaminConfig;
//!
//! // AOLOOP_CAMERA_INPUT__DARK_SUBTRACT_THREADS=4 overrides the file value
//! let config = CaminConfig::load()?;
//! config.validate()?;
//! println!("loop {}", config.camera_input.loop_index);
//! # Ok::<(), aoloop_camin::error::CaminError>(())
//! ```

use crate::error::{AppResult, CaminError};
use aol_stream::{DataType, SEMAPHORE_MAXVAL};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/aoloop.toml";

/// Upper bound on dark-subtraction workers.
pub const MAX_DARK_SUBTRACT_THREADS: usize = 32;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaminConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Read-frame pipeline settings
    #[serde(default)]
    pub camera_input: CameraInputConfig,
    /// Crop/correct republish loop, if one should run
    #[serde(default)]
    pub extract: Option<ExtractConfig>,
    /// Built-in simulated camera
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_app_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

/// Settings of one read-frame pipeline instance.
///
/// Stream names default to the `aol{loop}_*` convention of the control loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraInputConfig {
    /// Control loop index
    #[serde(default)]
    pub loop_index: u32,
    /// Source stream (default `aol{loop}_wfsim`)
    #[serde(default)]
    pub source_stream: Option<String>,
    /// Dark frame stream (default `aol{loop}_wfsdark`)
    #[serde(default)]
    pub dark_stream: Option<String>,
    /// Flux mask stream (default `aol{loop}_wfsmask`)
    #[serde(default)]
    pub mask_stream: Option<String>,
    /// Number of persistent dark-subtraction workers (1 = inline)
    #[serde(default = "default_dark_threads")]
    pub dark_subtract_threads: usize,
    /// Compute the total flux on a background thread
    #[serde(default)]
    pub total_async: bool,
    /// Pending-trigger cap of the background totalizer
    #[serde(default = "default_trigger_cap")]
    pub total_trigger_cap: u32,
    /// Bound the frame wait by the running average wait time
    #[serde(default)]
    pub regulated_timing: bool,
    /// Multiple of the average wait time allowed before giving up on a frame
    #[serde(default = "default_timing_margin")]
    pub regulated_timing_margin: f64,
    /// Samples in the unweighted bootstrap phase of the wait-time average
    #[serde(default = "default_estimate_samples")]
    pub wait_estimate_samples: u64,
    /// Per-pixel normalization floor (added flux = floor * nelem)
    #[serde(default)]
    pub norm_floor: f32,
    /// Normalization done downstream on an accelerator; skip it here
    #[serde(default)]
    pub gpu_all: bool,
    /// Poll interval when the source has no semaphore, microseconds
    #[serde(default = "default_source_poll_us")]
    pub poll_interval_us: u64,
}

impl Default for CameraInputConfig {
    fn default() -> Self {
        Self {
            loop_index: 0,
            source_stream: None,
            dark_stream: None,
            mask_stream: None,
            dark_subtract_threads: default_dark_threads(),
            total_async: false,
            total_trigger_cap: default_trigger_cap(),
            regulated_timing: false,
            regulated_timing_margin: default_timing_margin(),
            wait_estimate_samples: default_estimate_samples(),
            norm_floor: 0.0,
            gpu_all: false,
            poll_interval_us: default_source_poll_us(),
        }
    }
}

impl CameraInputConfig {
    /// Default configuration for loop `loop_index`.
    #[must_use]
    pub fn for_loop(loop_index: u32) -> Self {
        Self {
            loop_index,
            ..Default::default()
        }
    }

    fn stream_name(&self, suffix: &str) -> String {
        format!("aol{}_{}", self.loop_index, suffix)
    }

    /// Source (camera) stream name.
    #[must_use]
    pub fn source_name(&self) -> String {
        self.source_stream
            .clone()
            .unwrap_or_else(|| self.stream_name("wfsim"))
    }

    /// Dark frame stream name.
    #[must_use]
    pub fn dark_name(&self) -> String {
        self.dark_stream
            .clone()
            .unwrap_or_else(|| self.stream_name("wfsdark"))
    }

    /// Mask stream name.
    #[must_use]
    pub fn mask_name(&self) -> String {
        self.mask_stream
            .clone()
            .unwrap_or_else(|| self.stream_name("wfsmask"))
    }

    /// Dark-subtracted output stream name.
    #[must_use]
    pub fn imwfs0_name(&self) -> String {
        self.stream_name("imWFS0")
    }

    /// Total flux stream name.
    #[must_use]
    pub fn imwfs0tot_name(&self) -> String {
        self.stream_name("imWFS0tot")
    }

    /// Normalized output stream name.
    #[must_use]
    pub fn imwfs1_name(&self) -> String {
        self.stream_name("imWFS1")
    }

    /// Loop timing telemetry stream name.
    #[must_use]
    pub fn looptiming_name(&self) -> String {
        self.stream_name("looptiming")
    }
}

/// Crop/correct republish loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    /// Source stream
    pub input: String,
    /// Optional dark frame stream (same size as the input)
    #[serde(default)]
    pub dark: Option<String>,
    /// Output stream (created)
    pub output: String,
    /// Crop width
    pub size_x: u32,
    /// Crop height
    pub size_y: u32,
    /// Crop x offset in the input
    #[serde(default)]
    pub xstart: u32,
    /// Crop y offset in the input
    #[serde(default)]
    pub ystart: u32,
    /// Optional mask stream (same size as the output)
    #[serde(default = "default_extract_mask")]
    pub mask: String,
    /// Poll interval, microseconds
    #[serde(default = "default_extract_poll_us")]
    pub poll_interval_us: u64,
}

/// Element type accepted in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleKind {
    /// 16-bit unsigned
    U16,
    /// 16-bit signed
    I16,
    /// 32-bit float
    F32,
}

impl From<SampleKind> for DataType {
    fn from(kind: SampleKind) -> Self {
        match kind {
            SampleKind::U16 => DataType::U16,
            SampleKind::I16 => DataType::I16,
            SampleKind::F32 => DataType::F32,
        }
    }
}

/// Built-in simulated camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Start the simulated camera in `run` mode
    #[serde(default)]
    pub enabled: bool,
    /// Frame width
    #[serde(default = "default_sim_size")]
    pub size_x: u32,
    /// Frame height
    #[serde(default = "default_sim_size")]
    pub size_y: u32,
    /// Ring depth
    #[serde(default = "default_sim_depth")]
    pub depth: u32,
    /// Sample type
    #[serde(default = "default_sim_kind")]
    pub datatype: SampleKind,
    /// Frame period, microseconds
    #[serde(default = "default_sim_period_us")]
    pub frame_period_us: u64,
    /// Constant background level (what the dark frame removes)
    #[serde(default = "default_sim_background")]
    pub background: f32,
    /// Spot peak above background
    #[serde(default = "default_sim_amplitude")]
    pub amplitude: f32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            size_x: default_sim_size(),
            size_y: default_sim_size(),
            depth: default_sim_depth(),
            datatype: default_sim_kind(),
            frame_period_us: default_sim_period_us(),
            background: default_sim_background(),
            amplitude: default_sim_amplitude(),
        }
    }
}

// Default value functions
fn default_app_name() -> String {
    "aoloop-camin".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_dark_threads() -> usize {
    1
}

fn default_trigger_cap() -> u32 {
    SEMAPHORE_MAXVAL
}

fn default_timing_margin() -> f64 {
    1.1
}

fn default_estimate_samples() -> u64 {
    1000
}

fn default_source_poll_us() -> u64 {
    5
}

fn default_extract_mask() -> String {
    "csmask".to_string()
}

fn default_extract_poll_us() -> u64 {
    10
}

fn default_sim_size() -> u32 {
    16
}

fn default_sim_depth() -> u32 {
    4
}

fn default_sim_kind() -> SampleKind {
    SampleKind::U16
}

fn default_sim_period_us() -> u64 {
    1000
}

fn default_sim_background() -> f32 {
    100.0
}

fn default_sim_amplitude() -> f32 {
    1000.0
}

impl CaminConfig {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and environment variables.
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path (missing file = defaults).
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Figment::from(Serialized::defaults(CaminConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("AOLOOP_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Effective configuration as TOML, in the layout of the config file.
    pub fn to_toml_string(&self) -> AppResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check that a standalone process has a frame source.
    ///
    /// Streams live in an in-process registry, so the binary only sees frames
    /// from the built-in simulated camera: either `[simulation] enabled` or
    /// `force_simulation` (the `--simulate` flag) is required.
    pub fn require_frame_source(&self, force_simulation: bool) -> AppResult<()> {
        if force_simulation || self.simulation.enabled {
            return Ok(());
        }
        Err(CaminError::Configuration(
            "no frame source: streams are in-process, so the standalone binary needs \
             the simulated camera ([simulation] enabled = true or --simulate)"
                .to_string(),
        ))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let invalid = |msg: String| Err(CaminError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return invalid(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        let cam = &self.camera_input;
        if cam.dark_subtract_threads == 0 || cam.dark_subtract_threads > MAX_DARK_SUBTRACT_THREADS {
            return invalid(format!(
                "Invalid dark_subtract_threads {}. Must be 1-{}",
                cam.dark_subtract_threads, MAX_DARK_SUBTRACT_THREADS
            ));
        }
        if !(cam.regulated_timing_margin.is_finite() && cam.regulated_timing_margin > 0.0) {
            return invalid(format!(
                "Invalid regulated_timing_margin {}. Must be positive",
                cam.regulated_timing_margin
            ));
        }
        if cam.total_trigger_cap == 0 {
            return invalid("total_trigger_cap must be at least 1".to_string());
        }
        if cam.wait_estimate_samples == 0 {
            return invalid("wait_estimate_samples must be at least 1".to_string());
        }
        if !(cam.norm_floor.is_finite() && cam.norm_floor >= 0.0) {
            return invalid(format!(
                "Invalid norm_floor {}. Must be non-negative",
                cam.norm_floor
            ));
        }

        if let Some(extract) = &self.extract {
            if extract.size_x == 0 || extract.size_y == 0 {
                return invalid("extract size_x and size_y must be positive".to_string());
            }
            if extract.input == extract.output {
                return invalid(format!(
                    "extract output '{}' must differ from its input",
                    extract.output
                ));
            }
        }

        let sim = &self.simulation;
        if sim.size_x == 0 || sim.size_y == 0 || sim.depth == 0 {
            return invalid("simulation size_x, size_y and depth must be positive".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_source_requires_simulation() {
        let mut config = CaminConfig::default();
        assert!(matches!(
            config.require_frame_source(false),
            Err(CaminError::Configuration(msg)) if msg.contains("--simulate")
        ));
        assert!(config.require_frame_source(true).is_ok());

        config.simulation.enabled = true;
        assert!(config.require_frame_source(false).is_ok());
    }

    #[test]
    fn test_toml_dump_reloads() {
        let mut config = CaminConfig::default();
        config.camera_input.loop_index = 3;
        config.camera_input.total_async = true;
        let dumped = config.to_toml_string().unwrap();
        assert!(dumped.contains("[camera_input]"));

        let reloaded: CaminConfig = toml::from_str(&dumped).unwrap();
        assert_eq!(reloaded.camera_input.loop_index, 3);
        assert!(reloaded.camera_input.total_async);
        assert_eq!(reloaded.simulation.datatype, SampleKind::U16);
    }

    #[test]
    fn test_defaults_validate() {
        let config = CaminConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.camera_input.dark_subtract_threads, 1);
        assert_eq!(config.camera_input.wait_estimate_samples, 1000);
        assert!((config.camera_input.regulated_timing_margin - 1.1).abs() < 1e-12);
    }

    #[test]
    fn test_stream_names_follow_loop_index() {
        let cam = CameraInputConfig::for_loop(3);
        assert_eq!(cam.source_name(), "aol3_wfsim");
        assert_eq!(cam.dark_name(), "aol3_wfsdark");
        assert_eq!(cam.mask_name(), "aol3_wfsmask");
        assert_eq!(cam.imwfs0_name(), "aol3_imWFS0");
        assert_eq!(cam.imwfs0tot_name(), "aol3_imWFS0tot");
        assert_eq!(cam.imwfs1_name(), "aol3_imWFS1");
        assert_eq!(cam.looptiming_name(), "aol3_looptiming");

        let custom = CameraInputConfig {
            source_stream: Some("cam0".into()),
            ..CameraInputConfig::for_loop(3)
        };
        assert_eq!(custom.source_name(), "cam0");
    }

    #[test]
    fn test_parse_toml_sections() {
        let config: CaminConfig = toml::from_str(
            r#"
            [application]
            log_level = "debug"

            [camera_input]
            loop_index = 2
            dark_subtract_threads = 4
            total_async = true

            [extract]
            input = "cam"
            output = "cam_crop"
            size_x = 8
            size_y = 8
            xstart = 2

            [simulation]
            datatype = "i16"
            "#,
        )
        .unwrap();

        assert_eq!(config.application.log_level, "debug");
        assert_eq!(config.application.log_format, "pretty");
        assert_eq!(config.camera_input.loop_index, 2);
        assert_eq!(config.camera_input.dark_subtract_threads, 4);
        assert!(config.camera_input.total_async);
        let extract = config.extract.as_ref().unwrap();
        assert_eq!(extract.mask, "csmask");
        assert_eq!(extract.ystart, 0);
        assert_eq!(DataType::from(config.simulation.datatype), DataType::I16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_thread_count() {
        let mut config = CaminConfig::default();
        config.camera_input.dark_subtract_threads = 0;
        assert!(config.validate().is_err());
        config.camera_input.dark_subtract_threads = MAX_DARK_SUBTRACT_THREADS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = CaminConfig::default();
        config.application.log_level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_floor_rejected() {
        let mut config = CaminConfig::default();
        config.camera_input.norm_floor = -0.5;
        assert!(matches!(
            config.validate(),
            Err(CaminError::Configuration(_))
        ));
    }
}
