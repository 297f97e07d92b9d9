//! Unified error handling for Aquilo
//!
//! This crate provides a single error type used across all Aquilo components.
//! It uses thiserror for ergonomic error definitions with proper Display and Error trait impls.

use std::io;
use std::path::PathBuf;

/// Result type alias using AquiloError
pub type Result<T> = std::result::Result<T, AquiloError>;

/// Unified error type for all Aquilo operations
#[derive(thiserror::Error, Debug)]
pub enum AquiloError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    #[error("File too large: {path} ({size} bytes, max {max_size} bytes)")]
    FileTooLarge {
        path: PathBuf,
        size: u64,
        max_size: u64,
    },

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    // ============================================================================
    // Device Errors
    // ============================================================================
    #[error("Device discovery failed for {device}: {reason}")]
    Discovery {
        device: String,
        reason: String,
    },

    #[error("I/O timed out on device {device} after {timeout_ms}ms")]
    IoTimeout {
        device: String,
        timeout_ms: u64,
    },

    #[error("Device I/O failed on {device}: {reason}")]
    DeviceIo {
        device: String,
        reason: String,
    },

    #[error("Unknown device: {0}")]
    UnknownDevice(String),

    #[error("Unknown channel: {0}")]
    UnknownChannel(String),

    #[error("Channel {channel} does not support {operation}")]
    UnsupportedOperation {
        channel: String,
        operation: &'static str,
    },

    // ============================================================================
    // Validation Errors
    // ============================================================================
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Duty {duty}% outside supported range {min}%-{max}% for channel {channel}")]
    OutOfRange {
        channel: String,
        duty: f64,
        min: f64,
        max: f64,
    },

    #[error("Profile not found: {0}")]
    ProfileNotFound(String),

    // ============================================================================
    // Configuration and Store Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Profile store error: {0}")]
    Store(String),

    // ============================================================================
    // Daemon and IPC Errors
    // ============================================================================
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Message too large: {size} bytes (max {max_size} bytes)")]
    MessageTooLarge {
        size: usize,
        max_size: usize,
    },

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),
}

impl AquiloError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error from a string
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a device I/O error
    pub fn device_io(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DeviceIo {
            device: device.into(),
            reason: reason.into(),
        }
    }

    /// Create a discovery error
    pub fn discovery(device: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Discovery {
            device: device.into(),
            reason: reason.into(),
        }
    }

    /// True for faults that should count against a device's failure threshold
    pub fn is_device_fault(&self) -> bool {
        matches!(
            self,
            Self::IoTimeout { .. } | Self::DeviceIo { .. } | Self::Discovery { .. }
        )
    }
}

// Allow converting from String to AquiloError
impl From<String> for AquiloError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to AquiloError
impl From<&str> for AquiloError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}
