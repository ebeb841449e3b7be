//! GCP back-end: Instance Group Manager over the Compute REST API, with
//! service-account tokens from the metadata server and the Spacelift
//! credential held in Secret Manager.
//!
//! IGMs come in zonal and regional flavors; the self-link decides which.
//! Managed instances are always zonal regardless, so instance IDs are kept
//! as `projects/{p}/zones/{z}/instances/{n}` resource paths, with any API
//! URL prefix stripped.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use poolscale_domain::{
    Controller, DomainError, GroupId, Instance, InstanceId, InstanceIdentity, LifecycleState,
    Result, ScaleSet, Worker, WorkerPool,
};
use poolscale_shared::{GcpConfig, SpaceliftConfig};

use crate::spacelift::SpaceliftClient;

const GROUP_METADATA_KEY: &str = "gcp_igm_self_link";
const INSTANCE_METADATA_KEY: &str = "gcp_instance_self_link";

const COMPUTE_BASE: &str = "https://compute.googleapis.com/compute/v1";
const SECRET_MANAGER_BASE: &str = "https://secretmanager.googleapis.com/v1";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Matches IGM self-links in both zonal and regional form:
/// `projects/{p}/zones/{z}/instanceGroupManagers/{n}` or
/// `projects/{p}/regions/{r}/instanceGroupManagers/{n}`.
static IGM_SELF_LINK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^projects/([^/]+)/(zones|regions)/([^/]+)/instanceGroupManagers/([^/]+)$")
        .expect("IGM self-link regex is valid")
});

/// Matches instance resource paths: `projects/{p}/zones/{z}/instances/{n}`.
static INSTANCE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^projects/([^/]+)/zones/([^/]+)/instances/([^/]+)$")
        .expect("instance path regex is valid")
});

/// URL prefixes the API may attach to self-links; stripped before storage
/// and comparison.
const URL_PREFIXES: [&str; 2] = [
    "https://www.googleapis.com/compute/v1/",
    "https://compute.googleapis.com/compute/v1/",
];

pub struct GcpController {
    spacelift: SpaceliftClient,
    http: reqwest::Client,
    token: String,
    igm: IgmSelfLink,
    min_size: i32,
    max_size: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct IgmSelfLink {
    project: String,
    /// Zone for zonal IGMs, region for regional ones.
    location: String,
    name: String,
    regional: bool,
}

impl IgmSelfLink {
    /// The resource path, also used as the scale set name the workers'
    /// metadata must match.
    fn resource_path(&self) -> String {
        let collection = if self.regional { "regions" } else { "zones" };
        format!(
            "projects/{}/{collection}/{}/instanceGroupManagers/{}",
            self.project, self.location, self.name
        )
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct SecretPayloadResponse {
    payload: Option<SecretPayload>,
}

#[derive(Deserialize)]
struct SecretPayload {
    data: Option<String>,
}

#[derive(Deserialize)]
struct IgmResponse {
    #[serde(rename = "targetSize")]
    target_size: Option<i32>,
}

#[derive(Deserialize)]
struct ManagedInstancesResponse {
    #[serde(default, rename = "managedInstances")]
    managed_instances: Vec<ManagedInstance>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ManagedInstance {
    instance: Option<String>,
    #[serde(rename = "currentAction")]
    current_action: Option<String>,
    #[serde(rename = "instanceStatus")]
    instance_status: Option<String>,
}

#[derive(Deserialize)]
struct InstanceResponse {
    #[serde(rename = "creationTimestamp")]
    creation_timestamp: Option<DateTime<Utc>>,
}

impl GcpController {
    /// Acquires a service-account token, pulls the Spacelift API key from
    /// Secret Manager and opens the Spacelift session.
    pub async fn new(spacelift_cfg: &SpaceliftConfig, gcp_cfg: &GcpConfig) -> Result<Self> {
        let igm = parse_igm_self_link(&gcp_cfg.igm_self_link)?;

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| DomainError::Cloud(format!("could not build HTTP client: {err}")))?;

        let token = metadata_token(&http).await?;

        let api_key_secret = secret_manager_secret(
            &http,
            &token,
            &igm.project,
            &spacelift_cfg.api_key_secret_name,
        )
        .await?;

        let spacelift = SpaceliftClient::connect(
            &spacelift_cfg.api_endpoint,
            &spacelift_cfg.api_key_id,
            &api_key_secret,
            &spacelift_cfg.worker_pool_id,
        )
        .await?;

        info!(
            igm_name = %igm.name,
            regional = igm.regional,
            "GCP controller ready"
        );

        Ok(Self {
            spacelift,
            http,
            token,
            igm,
            min_size: gcp_cfg.min_size,
            max_size: gcp_cfg.max_size,
        })
    }

    fn igm_url(&self) -> String {
        format!("{COMPUTE_BASE}/{}", self.igm.resource_path())
    }

    async fn check_status(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        let status = response.status();
        if !status.is_success() {
            return Err(DomainError::Cloud(format!(
                "could not {what}: unexpected response status {status}"
            )));
        }
        Ok(response)
    }

    async fn compute_get<T: serde::de::DeserializeOwned>(&self, url: &str, what: &str) -> Result<T> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|err| DomainError::Cloud(format!("could not {what}: {err}")))?;

        Self::check_status(response, what)
            .await?
            .json()
            .await
            .map_err(|err| DomainError::Cloud(format!("could not decode {what} response: {err}")))
    }
}

impl InstanceIdentity for GcpController {
    /// Self-links in worker metadata may or may not carry the API URL
    /// prefix; both are normalized to bare resource paths so they compare
    /// equal to what the IGM listing produced.
    fn instance_identity(&self, worker: &Worker) -> Result<(GroupId, InstanceId)> {
        let group = worker.metadata_value(GROUP_METADATA_KEY)?;
        let instance = worker.metadata_value(INSTANCE_METADATA_KEY)?;

        Ok((
            GroupId(strip_url_prefix(&group).to_string()),
            InstanceId(strip_url_prefix(&instance).to_string()),
        ))
    }
}

#[async_trait]
impl Controller for GcpController {
    async fn get_worker_pool(&self) -> Result<WorkerPool> {
        self.spacelift.get_worker_pool().await
    }

    async fn drain_worker(&self, worker_id: &str) -> Result<bool> {
        self.spacelift.drain_worker(worker_id).await
    }

    async fn get_scale_set(&self) -> Result<ScaleSet> {
        let igm: IgmResponse = self.compute_get(&self.igm_url(), "get IGM details").await?;

        let desired_capacity = igm.target_size.ok_or_else(|| DomainError::ScaleSetValidation {
            reason: format!("IGM {} carries no target size", self.igm.name),
        })?;

        let mut instances = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let url = format!("{}/listManagedInstances", self.igm_url());
            let mut request = self.http.post(&url).bearer_auth(&self.token);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = request.send().await.map_err(|err| {
                DomainError::Cloud(format!("could not list managed instances: {err}"))
            })?;
            let page: ManagedInstancesResponse =
                Self::check_status(response, "list managed instances")
                    .await?
                    .json()
                    .await
                    .map_err(|err| {
                        DomainError::Cloud(format!(
                            "could not decode the managed instances response: {err}"
                        ))
                    })?;

            for managed in page.managed_instances {
                let Some(instance_url) = managed.instance else {
                    continue;
                };

                instances.push(Instance {
                    id: InstanceId(strip_url_prefix(&instance_url).to_string()),
                    launch_time: None,
                    lifecycle_state: managed_instance_state(
                        managed.current_action.as_deref(),
                        managed.instance_status.as_deref(),
                    ),
                });
            }

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        debug!(
            igm_name = %self.igm.name,
            desired_capacity,
            instances = instances.len(),
            "fetched IGM"
        );

        Ok(ScaleSet {
            name: self.igm.resource_path(),
            min_size: self.min_size,
            max_size: self.max_size,
            desired_capacity,
            instances,
        })
    }

    async fn describe_instances(&self, instance_ids: &[InstanceId]) -> Result<Vec<Instance>> {
        let mut instances = Vec::with_capacity(instance_ids.len());

        for instance_id in instance_ids {
            // Validates the path shape before hitting the API.
            parse_instance_path(&instance_id.0)?;

            let url = format!("{COMPUTE_BASE}/{}", instance_id.0);
            let details: InstanceResponse = self
                .compute_get(&url, &format!("describe instance {instance_id}"))
                .await?;

            let creation_timestamp = details.creation_timestamp.ok_or_else(|| {
                DomainError::Cloud(format!(
                    "could not find creation time for instance {instance_id}"
                ))
            })?;

            instances.push(Instance {
                id: instance_id.clone(),
                launch_time: Some(creation_timestamp),
                lifecycle_state: LifecycleState::Unknown,
            });
        }

        Ok(instances)
    }

    /// Deletes the instance through the IGM; the group's target size
    /// adjusts by itself. The operation completes asynchronously on the GCP
    /// side, which the next tick observes.
    async fn kill_instance(&self, instance_id: &InstanceId) -> Result<()> {
        let (_, zone, name) = parse_instance_path(&instance_id.0)?;

        let url = format!("{}/deleteInstances", self.igm_url());
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .json(&json!({ "instances": [format!("zones/{zone}/instances/{name}")] }))
            .send()
            .await
            .map_err(|err| DomainError::Cloud(format!("could not delete instance: {err}")))?;

        Self::check_status(response, "delete instance").await?;
        Ok(())
    }

    async fn scale_up(&self, desired_capacity: i32) -> Result<()> {
        let url = format!("{}/resize", self.igm_url());
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.token)
            .query(&[("size", desired_capacity)])
            .send()
            .await
            .map_err(|err| DomainError::Cloud(format!("could not resize the IGM: {err}")))?;

        Self::check_status(response, "resize the IGM").await?;
        Ok(())
    }
}

async fn metadata_token(http: &reqwest::Client) -> Result<String> {
    let response = http
        .get(METADATA_TOKEN_URL)
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .map_err(|err| {
            DomainError::Cloud(format!("could not acquire a service account token: {err}"))
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(DomainError::Cloud(format!(
            "could not acquire a service account token: unexpected response status {status}"
        )));
    }

    let token: TokenResponse = response.json().await.map_err(|err| {
        DomainError::Cloud(format!("could not decode the service account token: {err}"))
    })?;

    Ok(token.access_token)
}

async fn secret_manager_secret(
    http: &reqwest::Client,
    token: &str,
    project: &str,
    secret_name: &str,
) -> Result<String> {
    // Either a bare secret name scoped to the IGM's project, or a full
    // `projects/{p}/secrets/{s}` resource name.
    let resource = if secret_name.contains('/') {
        secret_name.to_string()
    } else {
        format!("projects/{project}/secrets/{secret_name}")
    };

    let url = format!("{SECRET_MANAGER_BASE}/{resource}/versions/latest:access");
    let response = http.get(&url).bearer_auth(token).send().await.map_err(|err| {
        DomainError::Secrets(format!(
            "could not get the Spacelift API key secret from Secret Manager: {err}"
        ))
    })?;

    let status = response.status();
    if !status.is_success() {
        return Err(DomainError::Secrets(format!(
            "could not get the Spacelift API key secret from Secret Manager: unexpected response status {status}"
        )));
    }

    let secret: SecretPayloadResponse = response.json().await.map_err(|err| {
        DomainError::Secrets(format!("could not decode the Secret Manager response: {err}"))
    })?;

    let data = secret
        .payload
        .and_then(|payload| payload.data)
        .ok_or_else(|| {
            DomainError::Secrets(
                "could not find the Spacelift API key secret value in Secret Manager".to_string(),
            )
        })?;

    let decoded = BASE64.decode(data.as_bytes()).map_err(|err| {
        DomainError::Secrets(format!("could not decode the Secret Manager payload: {err}"))
    })?;

    String::from_utf8(decoded).map_err(|err| {
        DomainError::Secrets(format!("the Secret Manager payload is not valid UTF-8: {err}"))
    })
}

fn strip_url_prefix(link: &str) -> &str {
    for prefix in URL_PREFIXES {
        if let Some(stripped) = link.strip_prefix(prefix) {
            return stripped;
        }
    }
    link
}

fn parse_igm_self_link(self_link: &str) -> Result<IgmSelfLink> {
    let path = strip_url_prefix(self_link);

    let captures = IGM_SELF_LINK.captures(path).ok_or_else(|| {
        DomainError::Cloud(format!("could not parse the IGM self-link: {self_link}"))
    })?;

    Ok(IgmSelfLink {
        project: captures[1].to_string(),
        location: captures[3].to_string(),
        name: captures[4].to_string(),
        regional: &captures[2] == "regions",
    })
}

fn parse_instance_path(path: &str) -> Result<(String, String, String)> {
    let captures = INSTANCE_PATH.captures(path).ok_or_else(|| {
        DomainError::Cloud(format!("could not parse the instance resource path: {path}"))
    })?;

    Ok((
        captures[1].to_string(),
        captures[2].to_string(),
        captures[3].to_string(),
    ))
}

/// An instance only takes part in the correspondence checks once the IGM has
/// nothing in flight for it and the VM itself is running.
fn managed_instance_state(current_action: Option<&str>, status: Option<&str>) -> LifecycleState {
    match (current_action, status) {
        (Some("NONE"), Some("RUNNING")) => LifecycleState::InService,
        (Some("CREATING") | Some("RECREATING") | Some("VERIFYING"), _) => LifecycleState::Pending,
        (Some("DELETING") | Some("ABANDONING"), _) => LifecycleState::Terminating,
        _ => LifecycleState::Unknown,
    }
}
