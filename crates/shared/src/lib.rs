//! Shared runtime configuration for the poolscale autoscaler.

pub mod config;

pub use config::{
    AwsConfig, AzureConfig, ConfigError, GcpConfig, Platform, PlatformConfig, RuntimeConfig,
    ScalingLimits, SpaceliftConfig,
};
