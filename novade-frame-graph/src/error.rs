//! Defines the error type and `Result` alias for the frame graph.
//!
//! Errors raised while registering passes (pipeline builds, allocations) are
//! reported synchronously to the caller. Errors raised while running a frame
//! carry the name of the pass or resource involved. `DeviceLost` and `Timeout`
//! are the only kinds that end a session; see [`RenderGraphError::is_fatal`].

use ash::vk;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A specialized `Result` type for frame graph operations.
pub type Result<T> = std::result::Result<T, RenderGraphError>;

/// Error type for the frame graph, its backends and its configuration.
#[derive(Debug, Error)]
pub enum RenderGraphError {
    /// No compatible memory type had room for the request.
    #[error("out of device memory: {requested} bytes requested with properties {flags:?}")]
    OutOfDeviceMemory {
        requested: u64,
        flags: vk::MemoryPropertyFlags,
    },

    /// A shader stage was rejected before or during module creation.
    #[error("shader compile error ({stage:?}): {message}")]
    ShaderCompile {
        stage: vk::ShaderStageFlags,
        message: String,
    },

    /// The pipeline description is inconsistent with its shaders or targets.
    #[error("invalid pipeline state for '{pipeline}': {reason}")]
    InvalidPipelineState { pipeline: String, reason: String },

    /// The GPU context is gone. Not recoverable without re-creating the device.
    #[error("device lost: {0}")]
    DeviceLost(String),

    /// A bounded fence wait expired.
    #[error("timed out after {waited:?} waiting for frame slot {slot}")]
    Timeout { slot: usize, waited: Duration },

    /// The swapchain no longer matches the surface and must be rebuilt.
    #[error("swapchain is out of date and must be rebuilt")]
    ResizeRequired,

    /// Any other Vulkan API error.
    #[error("Vulkan API error: {0}")]
    Vk(vk::Result),

    /// A handle whose slot was freed or never existed.
    #[error("stale or unknown {kind} handle")]
    InvalidHandle { kind: &'static str },

    /// A pass read a resource that nothing had written.
    #[error("pass '{pass}' reads '{resource}' before any pass has written it")]
    UninitializedRead { pass: String, resource: String },

    /// One half of a queue family ownership transfer is missing.
    #[error(
        "ownership transfer of '{resource}' from queue family {src_family} to {dst_family} \
         is missing its {missing} barrier"
    )]
    IncompleteOwnershipTransfer {
        resource: String,
        src_family: u32,
        dst_family: u32,
        missing: &'static str,
    },

    /// A pass declaration that cannot be scheduled.
    #[error("invalid pass '{pass}': {reason}")]
    InvalidPass { pass: String, reason: String },

    /// An error raised while recording the named pass.
    #[error("pass '{pass}' failed: {source}")]
    PassFailed {
        pass: String,
        #[source]
        source: Box<RenderGraphError>,
    },

    /// Configuration could not be read or validated.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Backend bring-up failed (instance, device, surface).
    #[error("initialization error: {0}")]
    Initialization(String),
}

impl RenderGraphError {
    /// Returns `true` for errors that end the running session.
    pub fn is_fatal(&self) -> bool {
        match self {
            RenderGraphError::DeviceLost(_) | RenderGraphError::Timeout { .. } => true,
            RenderGraphError::PassFailed { source, .. } => source.is_fatal(),
            _ => false,
        }
    }

    /// Wraps `self` with the name of the pass that raised it. Fatal errors
    /// are passed through so callers can match on them directly.
    pub fn in_pass(self, pass: &str) -> Self {
        if self.is_fatal() || matches!(self, RenderGraphError::PassFailed { .. }) {
            return self;
        }
        RenderGraphError::PassFailed {
            pass: pass.to_owned(),
            source: Box::new(self),
        }
    }
}

impl From<vk::Result> for RenderGraphError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => RenderGraphError::DeviceLost(result.to_string()),
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => RenderGraphError::OutOfDeviceMemory {
                requested: 0,
                flags: vk::MemoryPropertyFlags::empty(),
            },
            vk::Result::ERROR_OUT_OF_DATE_KHR => RenderGraphError::ResizeRequired,
            other => RenderGraphError::Vk(other),
        }
    }
}

/// Error type for configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file exists but could not be read.
    #[error("failed to read configuration file {path:?}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or has unknown keys.
    #[error("failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A value parsed but is out of range.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vk_results_are_classified() {
        assert!(matches!(
            RenderGraphError::from(vk::Result::ERROR_DEVICE_LOST),
            RenderGraphError::DeviceLost(_)
        ));
        assert!(matches!(
            RenderGraphError::from(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY),
            RenderGraphError::OutOfDeviceMemory { .. }
        ));
        assert!(matches!(
            RenderGraphError::from(vk::Result::ERROR_OUT_OF_DATE_KHR),
            RenderGraphError::ResizeRequired
        ));
        assert!(matches!(
            RenderGraphError::from(vk::Result::ERROR_INITIALIZATION_FAILED),
            RenderGraphError::Vk(vk::Result::ERROR_INITIALIZATION_FAILED)
        ));
    }

    #[test]
    fn fatal_errors_are_not_wrapped_by_pass_context() {
        let lost = RenderGraphError::DeviceLost("gone".into()).in_pass("lighting");
        assert!(matches!(lost, RenderGraphError::DeviceLost(_)));
        assert!(lost.is_fatal());

        let wrapped = RenderGraphError::ResizeRequired.in_pass("lighting");
        assert!(!wrapped.is_fatal());
        assert_eq!(
            wrapped.to_string(),
            "pass 'lighting' failed: swapchain is out of date and must be rebuilt"
        );
    }
}
