//! Spacelift API access over GraphQL.
//!
//! The client exchanges an API key for a JWT once at construction and sends
//! every subsequent request with a bearer header. The drain operation hides
//! the busy-worker race behind a single `(drained, err)`-style result: a
//! worker that picked up a run between the snapshot and the drain is
//! undrained again and reported as not drained.

use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};

use poolscale_domain::{DomainError, Result, Worker, WorkerPool};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const API_KEY_USER_MUTATION: &str = "\
mutation GetSpaceliftToken($id: ID!, $secret: String!) {
  apiKeyUser(id: $id, secret: $secret) {
    jwt
  }
}";

const WORKER_POOL_QUERY: &str = "\
query GetWorkerPool($workerPool: ID!) {
  workerPool(id: $workerPool) {
    pendingRuns
    workers {
      id
      busy
      drained
      createdAt
      metadata
    }
  }
}";

const WORKER_DRAIN_SET_MUTATION: &str = "\
mutation SetWorkerDrain($workerPoolId: ID!, $workerId: ID!, $drain: Boolean!) {
  workerDrainSet(workerPool: $workerPoolId, id: $workerId, drain: $drain) {
    id
    busy
    drained
    createdAt
    metadata
  }
}";

pub struct SpaceliftClient {
    http: reqwest::Client,
    graphql_url: String,
    jwt: String,
    worker_pool_id: String,
}

#[derive(Deserialize)]
struct GraphQlEnvelope<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Deserialize)]
struct GraphQlError {
    message: String,
}

#[derive(Deserialize)]
struct ApiKeyUserData {
    #[serde(rename = "apiKeyUser")]
    api_key_user: Option<ApiKeyUser>,
}

#[derive(Deserialize)]
struct ApiKeyUser {
    jwt: String,
}

#[derive(Deserialize)]
struct WorkerPoolData {
    #[serde(rename = "workerPool")]
    worker_pool: Option<WorkerPool>,
}

#[derive(Deserialize)]
struct WorkerDrainSetData {
    #[serde(rename = "workerDrainSet")]
    worker: Worker,
}

impl SpaceliftClient {
    /// Builds a session against the given Spacelift endpoint by exchanging
    /// the API key for a JWT.
    pub async fn connect(
        endpoint: &str,
        api_key_id: &str,
        api_key_secret: &str,
        worker_pool_id: &str,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| DomainError::Scheduler(format!("could not build HTTP client: {err}")))?;

        let graphql_url = graphql_url(endpoint);

        let data: ApiKeyUserData = execute(
            &http,
            &graphql_url,
            None,
            API_KEY_USER_MUTATION,
            json!({ "id": api_key_id, "secret": api_key_secret }),
        )
        .await
        .map_err(|err| DomainError::Scheduler(format!("could not create session: {err}")))?;

        let jwt = data
            .api_key_user
            .ok_or_else(|| {
                DomainError::Scheduler("could not exchange the API key for a token".to_string())
            })?
            .jwt;

        Ok(Self {
            http,
            graphql_url,
            jwt,
            worker_pool_id: worker_pool_id.to_string(),
        })
    }

    /// Fetches the worker pool and normalizes it: drained workers are set
    /// aside and the live ones are sorted oldest-first, the order the
    /// scale-down protocol relies on.
    pub async fn get_worker_pool(&self) -> Result<WorkerPool> {
        let data: WorkerPoolData = self
            .execute(
                WORKER_POOL_QUERY,
                json!({ "workerPool": self.worker_pool_id }),
            )
            .await
            .map_err(|err| {
                DomainError::Scheduler(format!("could not get worker pool details: {err}"))
            })?;

        let mut pool = data.worker_pool.ok_or_else(|| {
            DomainError::Scheduler("worker pool not found or not accessible".to_string())
        })?;

        pool.normalize();

        debug!(
            workers = pool.workers.len(),
            drained_workers = pool.drained_workers.len(),
            pending_runs = pool.pending_runs,
            "fetched worker pool"
        );

        Ok(pool)
    }

    /// Drains a worker. Returns `false` without an error when the worker
    /// turned out to be busy: the drain is compensated with an immediate
    /// undrain so the worker can keep processing the run it just received.
    pub async fn drain_worker(&self, worker_id: &str) -> Result<bool> {
        let worker = self
            .worker_drain_set(worker_id, true)
            .await
            .map_err(|err| DomainError::Scheduler(format!("could not drain worker: {err}")))?;

        if !worker.busy {
            return Ok(true);
        }

        warn!(worker_id, "worker received a run while being drained, undraining it");

        self.worker_drain_set(worker_id, false)
            .await
            .map_err(|err| {
                DomainError::Scheduler(format!("could not undrain a busy worker: {err}"))
            })?;

        Ok(false)
    }

    async fn worker_drain_set(&self, worker_id: &str, drain: bool) -> Result<Worker> {
        let data: WorkerDrainSetData = self
            .execute(
                WORKER_DRAIN_SET_MUTATION,
                json!({
                    "workerPoolId": self.worker_pool_id,
                    "workerId": worker_id,
                    "drain": drain,
                }),
            )
            .await?;

        Ok(data.worker)
    }

    async fn execute<T: DeserializeOwned>(&self, query: &str, variables: Value) -> Result<T> {
        execute(&self.http, &self.graphql_url, Some(&self.jwt), query, variables).await
    }
}

fn graphql_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.ends_with("/graphql") {
        endpoint.to_string()
    } else {
        format!("{endpoint}/graphql")
    }
}

async fn execute<T: DeserializeOwned>(
    http: &reqwest::Client,
    url: &str,
    jwt: Option<&str>,
    query: &str,
    variables: Value,
) -> Result<T> {
    let mut request = http
        .post(url)
        .json(&json!({ "query": query, "variables": variables }));

    if let Some(jwt) = jwt {
        request = request.bearer_auth(jwt);
    }

    let response = request
        .send()
        .await
        .map_err(|err| DomainError::Scheduler(format!("request failed: {err}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(DomainError::Scheduler(format!(
            "unexpected response status: {status}"
        )));
    }

    let envelope: GraphQlEnvelope<T> = response
        .json()
        .await
        .map_err(|err| DomainError::Scheduler(format!("could not decode response: {err}")))?;

    if !envelope.errors.is_empty() {
        let messages: Vec<&str> = envelope
            .errors
            .iter()
            .map(|error| error.message.as_str())
            .collect();
        return Err(DomainError::Scheduler(messages.join("; ")));
    }

    envelope
        .data
        .ok_or_else(|| DomainError::Scheduler("response carried no data".to_string()))
}
