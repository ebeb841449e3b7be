//! Azure back-end: Virtual Machine Scale Set over the ARM REST API, with
//! managed-identity tokens from IMDS and the Spacelift credential held in
//! Key Vault.
//!
//! A VMSS only carries a capacity; the min/max bounds come from the runtime
//! configuration. Deleting a VM auto-adjusts the capacity, which is what
//! gives `kill_instance` its decrement-on-termination contract.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use poolscale_domain::{
    Controller, DomainError, GroupId, Instance, InstanceId, InstanceIdentity, LifecycleState,
    Result, ScaleSet, Worker, WorkerPool,
};
use poolscale_shared::{AzureConfig, SpaceliftConfig};

use crate::spacelift::SpaceliftClient;

const GROUP_METADATA_KEY: &str = "vmss_id";
const INSTANCE_METADATA_KEY: &str = "vm_id";

const MANAGEMENT_BASE: &str = "https://management.azure.com";
const MANAGEMENT_RESOURCE: &str = "https://management.azure.com/";
const VAULT_RESOURCE: &str = "https://vault.azure.net";
const COMPUTE_API_VERSION: &str = "2024-07-01";
const KEY_VAULT_API_VERSION: &str = "7.4";
const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AzureController {
    spacelift: SpaceliftClient,
    http: reqwest::Client,
    management_token: String,
    /// `{MANAGEMENT_BASE}{vmss resource ID}`.
    vmss_url: String,
    vmss_name: String,
    min_size: i32,
    max_size: i32,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct SecretResponse {
    value: Option<String>,
}

#[derive(Deserialize)]
struct VmssResponse {
    name: Option<String>,
    sku: Option<VmssSku>,
}

#[derive(Deserialize)]
struct VmssSku {
    capacity: Option<i64>,
}

#[derive(Deserialize)]
struct VmListResponse {
    #[serde(default)]
    value: Vec<VmResponse>,
    #[serde(rename = "nextLink")]
    next_link: Option<String>,
}

#[derive(Deserialize)]
struct VmResponse {
    #[serde(rename = "instanceId")]
    instance_id: Option<String>,
    properties: Option<VmProperties>,
}

#[derive(Deserialize)]
struct VmProperties {
    #[serde(rename = "provisioningState")]
    provisioning_state: Option<String>,
    #[serde(rename = "timeCreated")]
    time_created: Option<DateTime<Utc>>,
}

impl AzureController {
    /// Acquires managed-identity tokens, pulls the Spacelift API key from
    /// Key Vault and opens the Spacelift session.
    pub async fn new(spacelift_cfg: &SpaceliftConfig, azure_cfg: &AzureConfig) -> Result<Self> {
        let vmss_name = vmss_name_from_resource_id(&azure_cfg.vmss_resource_id)?;

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| DomainError::Cloud(format!("could not build HTTP client: {err}")))?;

        let management_token = imds_token(&http, MANAGEMENT_RESOURCE).await?;
        let vault_token = imds_token(&http, VAULT_RESOURCE).await?;

        let api_key_secret = key_vault_secret(
            &http,
            &azure_cfg.key_vault_name,
            &spacelift_cfg.api_key_secret_name,
            &vault_token,
        )
        .await?;

        let spacelift = SpaceliftClient::connect(
            &spacelift_cfg.api_endpoint,
            &spacelift_cfg.api_key_id,
            &api_key_secret,
            &spacelift_cfg.worker_pool_id,
        )
        .await?;

        info!(%vmss_name, "Azure controller ready");

        Ok(Self {
            spacelift,
            http,
            management_token,
            vmss_url: format!("{MANAGEMENT_BASE}{}", azure_cfg.vmss_resource_id),
            vmss_name,
            min_size: azure_cfg.min_size,
            max_size: azure_cfg.max_size,
        })
    }

    /// GET against the management API. The URL must already carry its
    /// `api-version` (pagination `nextLink`s come with one baked in).
    async fn management_get<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        what: &str,
    ) -> Result<T> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.management_token)
            .send()
            .await
            .map_err(|err| DomainError::Cloud(format!("could not {what}: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DomainError::Cloud(format!(
                "could not {what}: unexpected response status {status}"
            )));
        }

        response
            .json()
            .await
            .map_err(|err| DomainError::Cloud(format!("could not decode {what} response: {err}")))
    }
}

impl InstanceIdentity for AzureController {
    fn instance_identity(&self, worker: &Worker) -> Result<(GroupId, InstanceId)> {
        Ok((
            GroupId(worker.metadata_value(GROUP_METADATA_KEY)?),
            InstanceId(worker.metadata_value(INSTANCE_METADATA_KEY)?),
        ))
    }
}

#[async_trait]
impl Controller for AzureController {
    async fn get_worker_pool(&self) -> Result<WorkerPool> {
        self.spacelift.get_worker_pool().await
    }

    async fn drain_worker(&self, worker_id: &str) -> Result<bool> {
        self.spacelift.drain_worker(worker_id).await
    }

    async fn get_scale_set(&self) -> Result<ScaleSet> {
        let vmss: VmssResponse = self
            .management_get(
                &format!("{}?api-version={COMPUTE_API_VERSION}", self.vmss_url),
                "get VMSS details",
            )
            .await?;

        let name = vmss.name.unwrap_or_else(|| self.vmss_name.clone());
        let desired_capacity = vmss
            .sku
            .and_then(|sku| sku.capacity)
            .ok_or_else(|| DomainError::ScaleSetValidation {
                reason: format!("VMSS {name} carries no SKU capacity"),
            })? as i32;

        let mut instances = Vec::new();
        let mut url = format!(
            "{}/virtualMachines?api-version={COMPUTE_API_VERSION}",
            self.vmss_url
        );
        loop {
            let page: VmListResponse = self.management_get(&url, "list VMSS VMs").await?;

            for vm in page.value {
                let Some(instance_id) = vm.instance_id else {
                    continue;
                };

                let state = vm
                    .properties
                    .and_then(|properties| properties.provisioning_state)
                    .map(|state| provisioning_state(&state))
                    .unwrap_or(LifecycleState::Unknown);

                instances.push(Instance {
                    id: InstanceId(instance_id),
                    launch_time: None,
                    lifecycle_state: state,
                });
            }

            match page.next_link {
                Some(next) => url = next,
                None => break,
            }
        }

        debug!(
            %name,
            desired_capacity,
            instances = instances.len(),
            "fetched VMSS"
        );

        Ok(ScaleSet {
            name,
            min_size: self.min_size,
            max_size: self.max_size,
            desired_capacity,
            instances,
        })
    }

    async fn describe_instances(&self, instance_ids: &[InstanceId]) -> Result<Vec<Instance>> {
        let mut instances = Vec::with_capacity(instance_ids.len());

        for instance_id in instance_ids {
            let url = format!(
                "{}/virtualMachines/{}?api-version={COMPUTE_API_VERSION}",
                self.vmss_url, instance_id.0
            );
            let vm: VmResponse = self
                .management_get(&url, &format!("describe VMSS VM {instance_id}"))
                .await?;

            let id = vm.instance_id.ok_or_else(|| {
                DomainError::Cloud("could not find VMSS VM instance ID".to_string())
            })?;

            let time_created = vm
                .properties
                .and_then(|properties| properties.time_created)
                .ok_or_else(|| {
                    DomainError::Cloud(format!("could not find creation time for VMSS VM {id}"))
                })?;

            instances.push(Instance {
                id: InstanceId(id),
                launch_time: Some(time_created),
                lifecycle_state: LifecycleState::Unknown,
            });
        }

        Ok(instances)
    }

    /// Deletes the VM; the VMSS adjusts its capacity by itself. The deletion
    /// completes asynchronously on the Azure side, which the next tick
    /// observes.
    async fn kill_instance(&self, instance_id: &InstanceId) -> Result<()> {
        let url = format!("{}/virtualMachines/{}", self.vmss_url, instance_id.0);
        let response = self
            .http
            .delete(&url)
            .query(&[("api-version", COMPUTE_API_VERSION)])
            .bearer_auth(&self.management_token)
            .send()
            .await
            .map_err(|err| DomainError::Cloud(format!("could not delete VMSS VM: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DomainError::Cloud(format!(
                "could not delete VMSS VM: unexpected response status {status}"
            )));
        }

        Ok(())
    }

    async fn scale_up(&self, desired_capacity: i32) -> Result<()> {
        let response = self
            .http
            .patch(&self.vmss_url)
            .query(&[("api-version", COMPUTE_API_VERSION)])
            .bearer_auth(&self.management_token)
            .json(&json!({ "sku": { "capacity": desired_capacity } }))
            .send()
            .await
            .map_err(|err| DomainError::Cloud(format!("could not update VMSS capacity: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DomainError::Cloud(format!(
                "could not update VMSS capacity: unexpected response status {status}"
            )));
        }

        Ok(())
    }
}

async fn imds_token(http: &reqwest::Client, resource: &str) -> Result<String> {
    let response = http
        .get(IMDS_TOKEN_URL)
        .query(&[("api-version", "2018-02-01"), ("resource", resource)])
        .header("Metadata", "true")
        .send()
        .await
        .map_err(|err| {
            DomainError::Cloud(format!("could not acquire a managed identity token: {err}"))
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(DomainError::Cloud(format!(
            "could not acquire a managed identity token: unexpected response status {status}"
        )));
    }

    let token: TokenResponse = response.json().await.map_err(|err| {
        DomainError::Cloud(format!("could not decode the managed identity token: {err}"))
    })?;

    Ok(token.access_token)
}

async fn key_vault_secret(
    http: &reqwest::Client,
    vault_name: &str,
    secret_name: &str,
    token: &str,
) -> Result<String> {
    let url = format!("https://{vault_name}.vault.azure.net/secrets/{secret_name}");
    let response = http
        .get(&url)
        .query(&[("api-version", KEY_VAULT_API_VERSION)])
        .bearer_auth(token)
        .send()
        .await
        .map_err(|err| {
            DomainError::Secrets(format!(
                "could not get the Spacelift API key secret from Key Vault: {err}"
            ))
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(DomainError::Secrets(format!(
            "could not get the Spacelift API key secret from Key Vault: unexpected response status {status}"
        )));
    }

    let secret: SecretResponse = response.json().await.map_err(|err| {
        DomainError::Secrets(format!("could not decode the Key Vault secret: {err}"))
    })?;

    secret.value.ok_or_else(|| {
        DomainError::Secrets("could not find the Spacelift API key secret value in Key Vault".to_string())
    })
}

/// Validates the resource ID shape and extracts the VMSS name. Expected
/// format:
/// `/subscriptions/{s}/resourceGroups/{g}/providers/Microsoft.Compute/virtualMachineScaleSets/{n}`.
fn vmss_name_from_resource_id(resource_id: &str) -> Result<String> {
    let segments: Vec<&str> = resource_id.trim_matches('/').split('/').collect();

    match segments.as_slice() {
        [
            "subscriptions",
            subscription,
            "resourceGroups",
            resource_group,
            "providers",
            "Microsoft.Compute",
            "virtualMachineScaleSets",
            name,
        ] if !subscription.is_empty() && !resource_group.is_empty() && !name.is_empty() => {
            Ok(name.to_string())
        }
        _ => Err(DomainError::Cloud(format!(
            "could not parse the VMSS resource ID: {resource_id}"
        ))),
    }
}

fn provisioning_state(raw: &str) -> LifecycleState {
    match raw {
        "Succeeded" => LifecycleState::InService,
        "Creating" | "Updating" => LifecycleState::Pending,
        "Deleting" => LifecycleState::Terminating,
        _ => LifecycleState::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_vmss_name_out_of_the_resource_id() {
        let id = "/subscriptions/0000-1111/resourceGroups/workers-rg/providers/Microsoft.Compute/virtualMachineScaleSets/spacelift-workers";
        assert_eq!(vmss_name_from_resource_id(id).unwrap(), "spacelift-workers");
    }

    #[test]
    fn rejects_malformed_resource_ids() {
        for id in [
            "",
            "/subscriptions/s",
            "/subscriptions/s/resourceGroups/g/providers/Microsoft.Network/virtualMachineScaleSets/n",
            "/subscriptions/s/resourceGroups/g/providers/Microsoft.Compute/virtualMachines/n",
        ] {
            assert!(vmss_name_from_resource_id(id).is_err(), "should reject {id:?}");
        }
    }

    #[test]
    fn maps_provisioning_states() {
        assert_eq!(provisioning_state("Succeeded"), LifecycleState::InService);
        assert_eq!(provisioning_state("Creating"), LifecycleState::Pending);
        assert_eq!(provisioning_state("Updating"), LifecycleState::Pending);
        assert_eq!(provisioning_state("Deleting"), LifecycleState::Terminating);
        assert_eq!(provisioning_state("Failed"), LifecycleState::Unknown);
    }
}
