//! Configuration for the frame graph.
//!
//! The configuration is read from a TOML file. Every field has a default, so a
//! missing file or an empty table yields a usable [`FrameGraphConfig`]. Unknown
//! keys are rejected so typos do not silently fall back to defaults.
//!
//! ```toml
//! [renderer]
//! frames_in_flight = 2
//! fence_timeout_ms = 500
//!
//! [passes]
//! disabled = ["bloom"]
//! ```

use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Largest ring of frame slots accepted by [`FrameGraphConfig::validate`].
pub const MAX_FRAMES_IN_FLIGHT: u32 = 4;

/// Default values for configuration fields.
pub mod defaults {
    pub fn application_name() -> String {
        "novade-frame-graph".to_string()
    }
    pub fn frames_in_flight() -> u32 {
        3
    }
    pub fn swapchain_images() -> u32 {
        3
    }
    pub fn fence_timeout_ms() -> u64 {
        2_000
    }
    pub fn enable_validation() -> bool {
        cfg!(debug_assertions)
    }
    pub fn initial_width() -> u32 {
        1280
    }
    pub fn initial_height() -> u32 {
        720
    }
    pub fn block_size_mib() -> u64 {
        64
    }
    pub fn log_level() -> String {
        "info".to_string()
    }
    pub fn log_format() -> String {
        "text".to_string()
    }
}

/// Presentation mode requested for the swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PresentMode {
    /// Low latency without tearing; falls back to FIFO when unsupported.
    #[default]
    Mailbox,
    /// Vsync, always available.
    Fifo,
    /// No vsync.
    Immediate,
}

impl PresentMode {
    pub fn to_vk(self) -> ash::vk::PresentModeKHR {
        match self {
            PresentMode::Mailbox => ash::vk::PresentModeKHR::MAILBOX,
            PresentMode::Fifo => ash::vk::PresentModeKHR::FIFO,
            PresentMode::Immediate => ash::vk::PresentModeKHR::IMMEDIATE,
        }
    }
}

/// Device and frame loop settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RendererConfig {
    #[serde(default = "defaults::application_name")]
    pub application_name: String,
    /// Size of the frame-slot ring.
    #[serde(default = "defaults::frames_in_flight")]
    pub frames_in_flight: u32,
    /// Requested number of swap targets. The surface may clamp it.
    #[serde(default = "defaults::swapchain_images")]
    pub swapchain_images: u32,
    /// Bound on every fence wait. Exceeding it ends the session.
    #[serde(default = "defaults::fence_timeout_ms")]
    pub fence_timeout_ms: u64,
    #[serde(default = "defaults::enable_validation")]
    pub enable_validation: bool,
    #[serde(default)]
    pub present_mode: PresentMode,
    #[serde(default = "defaults::initial_width")]
    pub initial_width: u32,
    #[serde(default = "defaults::initial_height")]
    pub initial_height: u32,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            application_name: defaults::application_name(),
            frames_in_flight: defaults::frames_in_flight(),
            swapchain_images: defaults::swapchain_images(),
            fence_timeout_ms: defaults::fence_timeout_ms(),
            enable_validation: defaults::enable_validation(),
            present_mode: PresentMode::default(),
            initial_width: defaults::initial_width(),
            initial_height: defaults::initial_height(),
        }
    }
}

impl RendererConfig {
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }
}

/// Memory allocator settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryConfig {
    /// Size of the device memory blocks that small allocations are carved from.
    #[serde(default = "defaults::block_size_mib")]
    pub block_size_mib: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            block_size_mib: defaults::block_size_mib(),
        }
    }
}

impl MemoryConfig {
    pub fn block_size_bytes(&self) -> u64 {
        self.block_size_mib * 1024 * 1024
    }
}

/// Logging settings consumed by [`crate::logging::init_logging`].
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// One of "trace", "debug", "info", "warn", "error". `RUST_LOG` overrides it.
    #[serde(default = "defaults::log_level")]
    pub level: String,
    /// "text" or "json".
    #[serde(default = "defaults::log_format")]
    pub format: String,
    /// Optional log file, rotated daily. Console output is kept.
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: defaults::log_level(),
            format: defaults::log_format(),
            file_path: None,
        }
    }
}

/// Pass selection.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PassesConfig {
    /// Names of optional passes to leave disabled.
    #[serde(default)]
    pub disabled: Vec<String>,
}

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrameGraphConfig {
    #[serde(default)]
    pub renderer: RendererConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub passes: PassesConfig,
}

impl FrameGraphConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: FrameGraphConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration at `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match std::fs::read_to_string(path) {
            Ok(source) => {
                info!("Loading frame graph configuration from {:?}", path);
                Self::from_toml_str(&source)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No configuration at {:?}, using defaults", path);
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
            Err(source) => Err(ConfigError::ReadError {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Checks value ranges and returns the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.renderer;
        if r.frames_in_flight == 0 || r.frames_in_flight > MAX_FRAMES_IN_FLIGHT {
            return Err(ConfigError::ValidationError(format!(
                "renderer.frames_in_flight must be in 1..={}, got {}",
                MAX_FRAMES_IN_FLIGHT, r.frames_in_flight
            )));
        }
        if r.swapchain_images == 0 {
            return Err(ConfigError::ValidationError(
                "renderer.swapchain_images must be at least 1".to_string(),
            ));
        }
        if r.fence_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "renderer.fence_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.memory.block_size_mib == 0 {
            return Err(ConfigError::ValidationError(
                "memory.block_size_mib must be greater than 0".to_string(),
            ));
        }
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "logging.level '{}' is not one of trace, debug, info, warn, error",
                    other
                )))
            }
        }
        match self.logging.format.to_lowercase().as_str() {
            "text" | "json" => Ok(()),
            other => Err(ConfigError::ValidationError(format!(
                "logging.format '{}' is not one of text, json",
                other
            ))),
        }
    }

    pub fn is_pass_disabled(&self, name: &str) -> bool {
        self.passes.disabled.iter().any(|p| p == name)
    }
}
