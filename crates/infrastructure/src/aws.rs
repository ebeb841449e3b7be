//! AWS back-end: EC2 Auto Scaling Group + SSM-held Spacelift credentials.

use async_trait::async_trait;
use aws_sdk_autoscaling::error::{DisplayErrorContext, ProvideErrorMetadata};
use chrono::DateTime;
use tracing::{debug, info};

use poolscale_domain::{
    Controller, DomainError, GroupId, Instance, InstanceId, InstanceIdentity, LifecycleState,
    Result, ScaleSet, Worker, WorkerPool,
};
use poolscale_shared::{AwsConfig, SpaceliftConfig};

use crate::spacelift::SpaceliftClient;

const GROUP_METADATA_KEY: &str = "asg_id";
const INSTANCE_METADATA_KEY: &str = "instance_id";

/// DetachInstances returns this when the instance already left the group, in
/// which case a previous partially failed scale-down did the detaching and
/// the termination should simply proceed.
const NOT_PART_OF_GROUP: &str = "is not part of Auto Scaling group";

pub struct AwsController {
    spacelift: SpaceliftClient,
    autoscaling: aws_sdk_autoscaling::Client,
    ec2: aws_sdk_ec2::Client,
    group_name: String,
}

impl AwsController {
    /// Loads the AWS configuration, pulls the Spacelift API key secret from
    /// SSM and opens the Spacelift session.
    pub async fn new(spacelift_cfg: &SpaceliftConfig, aws_cfg: &AwsConfig) -> Result<Self> {
        let group_name = group_name_from_arn(&aws_cfg.group_arn)?;

        let sdk_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(aws_cfg.region.clone()))
            .load()
            .await;

        let ssm = aws_sdk_ssm::Client::new(&sdk_config);
        let output = ssm
            .get_parameter()
            .name(&spacelift_cfg.api_key_secret_name)
            .with_decryption(true)
            .send()
            .await
            .map_err(|err| {
                DomainError::Secrets(format!(
                    "could not get the Spacelift API key secret from SSM: {}",
                    DisplayErrorContext(err)
                ))
            })?;

        let api_key_secret = output
            .parameter
            .and_then(|parameter| parameter.value)
            .ok_or_else(|| {
                DomainError::Secrets("could not find the Spacelift API key secret value in SSM".to_string())
            })?;

        let spacelift = SpaceliftClient::connect(
            &spacelift_cfg.api_endpoint,
            &spacelift_cfg.api_key_id,
            &api_key_secret,
            &spacelift_cfg.worker_pool_id,
        )
        .await?;

        info!(%group_name, "AWS controller ready");

        Ok(Self {
            spacelift,
            autoscaling: aws_sdk_autoscaling::Client::new(&sdk_config),
            ec2: aws_sdk_ec2::Client::new(&sdk_config),
            group_name,
        })
    }
}

impl InstanceIdentity for AwsController {
    fn instance_identity(&self, worker: &Worker) -> Result<(GroupId, InstanceId)> {
        Ok((
            GroupId(worker.metadata_value(GROUP_METADATA_KEY)?),
            InstanceId(worker.metadata_value(INSTANCE_METADATA_KEY)?),
        ))
    }
}

#[async_trait]
impl Controller for AwsController {
    async fn get_worker_pool(&self) -> Result<WorkerPool> {
        self.spacelift.get_worker_pool().await
    }

    async fn drain_worker(&self, worker_id: &str) -> Result<bool> {
        self.spacelift.drain_worker(worker_id).await
    }

    async fn get_scale_set(&self) -> Result<ScaleSet> {
        let output = self
            .autoscaling
            .describe_auto_scaling_groups()
            .auto_scaling_group_names(&self.group_name)
            .send()
            .await
            .map_err(|err| {
                DomainError::Cloud(format!(
                    "could not get autoscaling group details: {}",
                    DisplayErrorContext(err)
                ))
            })?;

        let group = match output.auto_scaling_groups() {
            [] => {
                return Err(DomainError::Cloud(format!(
                    "could not find autoscaling group {}",
                    self.group_name
                )));
            }
            [group] => group,
            _ => {
                return Err(DomainError::Cloud(format!(
                    "found more than one autoscaling group with name {}",
                    self.group_name
                )));
            }
        };

        let name = group
            .auto_scaling_group_name()
            .ok_or_else(|| missing_field("name"))?
            .to_string();
        let min_size = group.min_size().ok_or_else(|| missing_field("minimum size"))?;
        let max_size = group.max_size().ok_or_else(|| missing_field("maximum size"))?;
        let desired_capacity = group
            .desired_capacity()
            .ok_or_else(|| missing_field("desired capacity"))?;

        let mut instances = Vec::with_capacity(group.instances().len());
        for instance in group.instances() {
            let id = instance.instance_id().ok_or_else(|| {
                DomainError::Cloud("autoscaling group contains an instance without an ID".to_string())
            })?;

            instances.push(Instance {
                id: InstanceId(id.to_string()),
                launch_time: None,
                lifecycle_state: instance
                    .lifecycle_state()
                    .map(|state| lifecycle_state(state.as_str()))
                    .unwrap_or(LifecycleState::Unknown),
            });
        }

        debug!(
            %name,
            min_size, max_size, desired_capacity,
            instances = instances.len(),
            "fetched autoscaling group"
        );

        Ok(ScaleSet {
            name,
            min_size,
            max_size,
            desired_capacity,
            instances,
        })
    }

    async fn describe_instances(&self, instance_ids: &[InstanceId]) -> Result<Vec<Instance>> {
        let output = self
            .ec2
            .describe_instances()
            .set_instance_ids(Some(
                instance_ids.iter().map(|id| id.0.clone()).collect(),
            ))
            .send()
            .await
            .map_err(|err| {
                DomainError::Cloud(format!(
                    "could not describe instances: {}",
                    DisplayErrorContext(err)
                ))
            })?;

        let mut instances = Vec::new();
        for reservation in output.reservations() {
            for instance in reservation.instances() {
                let id = instance.instance_id().ok_or_else(|| {
                    DomainError::Cloud("could not find instance ID".to_string())
                })?;

                let launch_time = instance.launch_time().ok_or_else(|| {
                    DomainError::Cloud(format!("could not find launch time for instance {id}"))
                })?;
                let launch_time = DateTime::from_timestamp(
                    launch_time.secs(),
                    launch_time.subsec_nanos(),
                )
                .ok_or_else(|| {
                    DomainError::Cloud(format!("launch time of instance {id} is out of range"))
                })?;

                instances.push(Instance {
                    id: InstanceId(id.to_string()),
                    launch_time: Some(launch_time),
                    lifecycle_state: LifecycleState::Unknown,
                });
            }
        }

        Ok(instances)
    }

    async fn kill_instance(&self, instance_id: &InstanceId) -> Result<()> {
        let detached = self
            .autoscaling
            .detach_instances()
            .auto_scaling_group_name(&self.group_name)
            .instance_ids(&instance_id.0)
            .should_decrement_desired_capacity(true)
            .send()
            .await;

        if let Err(err) = detached {
            let benign = err
                .as_service_error()
                .and_then(|service_err| service_err.message())
                .is_some_and(|message| message.contains(NOT_PART_OF_GROUP));

            if !benign {
                return Err(DomainError::Cloud(format!(
                    "could not detach instance from the autoscaling group: {}",
                    DisplayErrorContext(err)
                )));
            }

            debug!(instance_id = %instance_id, "instance already detached, proceeding to terminate");
        }

        self.ec2
            .terminate_instances()
            .instance_ids(&instance_id.0)
            .send()
            .await
            .map_err(|err| {
                DomainError::Cloud(format!(
                    "could not terminate detached instance: {}",
                    DisplayErrorContext(err)
                ))
            })?;

        Ok(())
    }

    async fn scale_up(&self, desired_capacity: i32) -> Result<()> {
        self.autoscaling
            .set_desired_capacity()
            .auto_scaling_group_name(&self.group_name)
            .desired_capacity(desired_capacity)
            .send()
            .await
            .map_err(|err| {
                DomainError::Cloud(format!(
                    "could not set desired capacity: {}",
                    DisplayErrorContext(err)
                ))
            })?;

        Ok(())
    }
}

fn missing_field(field: &str) -> DomainError {
    DomainError::ScaleSetValidation {
        reason: format!("autoscaling group {field} is not set"),
    }
}

/// ARN format:
/// `arn:aws:autoscaling:{region}:{account}:autoScalingGroup:{uuid}:autoScalingGroupName/{name}`.
fn group_name_from_arn(arn: &str) -> Result<String> {
    match arn.split_once('/') {
        Some((_, name)) if !name.is_empty() => Ok(name.to_string()),
        _ => Err(DomainError::Cloud(
            "could not parse the autoscaling group ARN".to_string(),
        )),
    }
}

fn lifecycle_state(raw: &str) -> LifecycleState {
    match raw {
        "InService" => LifecycleState::InService,
        raw if raw.starts_with("Pending") => LifecycleState::Pending,
        raw if raw.starts_with("Terminating") => LifecycleState::Terminating,
        _ => LifecycleState::Unknown,
    }
}
