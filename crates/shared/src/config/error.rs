use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration errors, raised before the tick ever runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {var}")]
    MissingRequired { var: String },

    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },

    #[error("more than one scale-set identity variable is set: {vars}")]
    ConflictingPlatforms { vars: String },

    #[error("AUTOSCALING_MAX_SIZE ({max}) must be greater than or equal to AUTOSCALING_MIN_SIZE ({min})")]
    MinMaxInverted { min: i32, max: i32 },
}
