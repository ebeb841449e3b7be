//! Runtime configuration.
//!
//! Every invocation is configured entirely through environment variables set
//! by the timer/function runtime that triggers it. The scale-set identity
//! variable doubles as the platform selector: exactly one of
//! `AUTOSCALING_GROUP_ARN`, `AZURE_VMSS_RESOURCE_ID` or `GCP_IGM_SELF_LINK`
//! must be present.

mod error;

pub use error::{ConfigError, Result};

const AWS_GROUP_VAR: &str = "AUTOSCALING_GROUP_ARN";
const AZURE_GROUP_VAR: &str = "AZURE_VMSS_RESOURCE_ID";
const GCP_GROUP_VAR: &str = "GCP_IGM_SELF_LINK";

/// The cloud platform hosting the scale set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Aws,
    Azure,
    Gcp,
}

impl Platform {
    /// Detects the platform from which scale-set identity variable is set.
    ///
    /// Setting more than one is a configuration error; setting none falls
    /// back to AWS, whose own required variables then produce a precise
    /// error message.
    pub fn detect() -> Result<Self> {
        let set: Vec<&str> = [GCP_GROUP_VAR, AZURE_GROUP_VAR, AWS_GROUP_VAR]
            .into_iter()
            .filter(|var| non_empty_var(var).is_some())
            .collect();

        match set.as_slice() {
            [GCP_GROUP_VAR] => Ok(Platform::Gcp),
            [AZURE_GROUP_VAR] => Ok(Platform::Azure),
            [] | [AWS_GROUP_VAR] => Ok(Platform::Aws),
            vars => Err(ConfigError::ConflictingPlatforms {
                vars: vars.join(", "),
            }),
        }
    }
}

/// Per-invocation configuration, assembled from the environment.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub spacelift: SpaceliftConfig,
    pub scaling: ScalingLimits,
    pub platform: PlatformConfig,
}

/// Spacelift API access and the worker pool under reconciliation.
#[derive(Debug, Clone)]
pub struct SpaceliftConfig {
    pub api_key_id: String,
    /// Secret-store pointer to the API key secret; resolved by the platform
    /// controller (SSM parameter, Key Vault secret or Secret Manager secret).
    pub api_key_secret_name: String,
    pub api_endpoint: String,
    pub worker_pool_id: String,
}

/// Per-tick scaling limits.
#[derive(Debug, Clone, Copy)]
pub struct ScalingLimits {
    /// Upper bound on capacity added per tick.
    pub max_create: i32,
    /// Upper bound on workers terminated per tick.
    pub max_kill: i32,
    /// Minutes a worker must live before it is eligible for scale-in.
    pub scale_down_delay: i64,
    /// Excess-capacity threshold that triggers the desired-capacity reset.
    pub capacity_sanity_threshold: i32,
}

impl Default for ScalingLimits {
    fn default() -> Self {
        Self {
            max_create: 1,
            max_kill: 1,
            scale_down_delay: 0,
            capacity_sanity_threshold: 10,
        }
    }
}

/// Platform-specific configuration. The variant selects the controller.
#[derive(Debug, Clone)]
pub enum PlatformConfig {
    Aws(AwsConfig),
    Azure(AzureConfig),
    Gcp(GcpConfig),
}

#[derive(Debug, Clone)]
pub struct AwsConfig {
    /// Full ARN of the autoscaling group.
    pub group_arn: String,
    pub region: String,
}

#[derive(Debug, Clone)]
pub struct AzureConfig {
    /// Full VMSS resource ID
    /// (`/subscriptions/{s}/resourceGroups/{g}/providers/Microsoft.Compute/virtualMachineScaleSets/{n}`).
    pub vmss_resource_id: String,
    pub key_vault_name: String,
    /// VMSS carries only a capacity, so min/max come from the environment.
    pub min_size: i32,
    pub max_size: i32,
}

#[derive(Debug, Clone)]
pub struct GcpConfig {
    /// IGM self-link, zonal or regional
    /// (`projects/{p}/(zones|regions)/{l}/instanceGroupManagers/{n}`).
    pub igm_self_link: String,
    pub min_size: i32,
    pub max_size: i32,
}

impl RuntimeConfig {
    /// Builds the configuration for the detected platform.
    pub fn from_env(platform: Platform) -> Result<Self> {
        let platform = match platform {
            Platform::Aws => PlatformConfig::Aws(AwsConfig::from_env()?),
            Platform::Azure => PlatformConfig::Azure(AzureConfig::from_env()?),
            Platform::Gcp => PlatformConfig::Gcp(GcpConfig::from_env()?),
        };

        Ok(Self {
            spacelift: SpaceliftConfig::from_env()?,
            scaling: ScalingLimits::from_env()?,
            platform,
        })
    }

    /// The platform-appropriate log key and scale-set identifier, used to
    /// stamp every log line of the tick.
    pub fn group_key_and_id(&self) -> (&'static str, &str) {
        match &self.platform {
            PlatformConfig::Aws(aws) => ("asg_arn", aws.group_arn.as_str()),
            PlatformConfig::Azure(azure) => ("vmss_resource_id", azure.vmss_resource_id.as_str()),
            PlatformConfig::Gcp(gcp) => ("igm_self_link", gcp.igm_self_link.as_str()),
        }
    }
}

impl SpaceliftConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            api_key_id: require_var("SPACELIFT_API_KEY_ID")?,
            api_key_secret_name: require_var("SPACELIFT_API_KEY_SECRET_NAME")?,
            api_endpoint: require_var("SPACELIFT_API_KEY_ENDPOINT")?,
            worker_pool_id: require_var("SPACELIFT_WORKER_POOL_ID")?,
        })
    }
}

impl ScalingLimits {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            max_create: parse_optional_var("AUTOSCALING_MAX_CREATE", 1)?,
            max_kill: parse_optional_var("AUTOSCALING_MAX_KILL", 1)?,
            scale_down_delay: parse_optional_var("AUTOSCALING_SCALE_DOWN_DELAY", 0)?,
            capacity_sanity_threshold: parse_optional_var("AUTOSCALING_CAPACITY_SANITY_CHECK", 10)?,
        })
    }
}

impl AwsConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            group_arn: require_var(AWS_GROUP_VAR)?,
            region: require_var("AUTOSCALING_REGION")?,
        })
    }
}

impl AzureConfig {
    pub fn from_env() -> Result<Self> {
        let (min_size, max_size) = min_max_from_env()?;

        Ok(Self {
            vmss_resource_id: require_var(AZURE_GROUP_VAR)?,
            key_vault_name: require_var("AZURE_KEY_VAULT_NAME")?,
            min_size,
            max_size,
        })
    }
}

impl GcpConfig {
    pub fn from_env() -> Result<Self> {
        let (min_size, max_size) = min_max_from_env()?;

        Ok(Self {
            igm_self_link: require_var(GCP_GROUP_VAR)?,
            min_size,
            max_size,
        })
    }
}

/// AWS ASGs carry their own min/max; Azure and GCP scale sets do not, so
/// both are read from the environment. The maximum is required, the minimum
/// defaults to zero.
fn min_max_from_env() -> Result<(i32, i32)> {
    let min_size = parse_optional_var("AUTOSCALING_MIN_SIZE", 0)?;
    let max_size: i32 = require_var("AUTOSCALING_MAX_SIZE").and_then(|value| {
        value.parse().map_err(|_| ConfigError::InvalidValue {
            var: "AUTOSCALING_MAX_SIZE".to_string(),
            value,
        })
    })?;

    if max_size < min_size {
        return Err(ConfigError::MinMaxInverted {
            min: min_size,
            max: max_size,
        });
    }

    Ok((min_size, max_size))
}

fn non_empty_var(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|value| !value.is_empty())
}

fn require_var(var: &str) -> Result<String> {
    non_empty_var(var).ok_or_else(|| ConfigError::MissingRequired {
        var: var.to_string(),
    })
}

fn parse_optional_var<T>(var: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
{
    match non_empty_var(var) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::InvalidValue {
            var: var.to_string(),
            value,
        }),
    }
}
