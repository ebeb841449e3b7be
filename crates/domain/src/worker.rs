use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, Result};

/// Identifier of the scale set a worker claims to belong to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(pub String);

impl GroupId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of the cloud instance a worker claims to run on. For GCP this
/// is the resource path `projects/{p}/zones/{z}/instances/{n}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A logical worker on the Spacelift side of the fence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Worker {
    pub id: String,
    pub busy: bool,
    pub drained: bool,
    /// Epoch seconds; the API serializes an int32, widened on read.
    pub created_at: i64,
    /// JSON object of string values, reported by the worker at registration.
    /// The platform-specific keys inside are the controllers' business.
    pub metadata: String,
}

impl Worker {
    /// The worker's creation time as a timestamp.
    pub fn created(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.created_at, 0).unwrap_or_default()
    }

    /// Extracts a single metadata value. Malformed metadata or an absent key
    /// is fatal for the worker: without it the instance correspondence
    /// cannot be established.
    pub fn metadata_value(&self, key: &str) -> Result<String> {
        let metadata: HashMap<String, String> =
            serde_json::from_str(&self.metadata).map_err(|err| DomainError::WorkerMetadata {
                worker_id: self.id.clone(),
                reason: format!("invalid metadata JSON: {err}"),
            })?;

        metadata
            .get(key)
            .cloned()
            .ok_or_else(|| DomainError::WorkerMetadata {
                worker_id: self.id.clone(),
                reason: format!("metadata key {key} not present"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(metadata: &str) -> Worker {
        Worker {
            id: "worker-1".to_string(),
            metadata: metadata.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn extracts_metadata_values() {
        let worker = worker(r#"{"asg_id": "group", "instance_id": "i-123"}"#);
        assert_eq!(worker.metadata_value("asg_id").unwrap(), "group");
        assert_eq!(worker.metadata_value("instance_id").unwrap(), "i-123");
    }

    #[test]
    fn missing_key_is_an_error() {
        let worker = worker(r#"{"asg_id": "group"}"#);
        let err = worker.metadata_value("instance_id").unwrap_err();
        assert!(matches!(err, DomainError::WorkerMetadata { worker_id, .. } if worker_id == "worker-1"));
    }

    #[test]
    fn malformed_metadata_is_an_error() {
        let worker = worker("not json");
        assert!(worker.metadata_value("asg_id").is_err());
    }

    #[test]
    fn created_widens_epoch_seconds() {
        let mut worker = worker("{}");
        worker.created_at = 1_700_000_000;
        assert_eq!(worker.created().timestamp(), 1_700_000_000);
    }
}
