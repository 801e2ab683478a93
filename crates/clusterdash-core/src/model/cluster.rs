// Scalar cluster facts served as plain text or tiny JSON documents.

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use clusterdash_api::Error;
use serde::{Deserialize, Serialize};

/// How the cluster is deployed (`docker-compose`, `docker-swarm`, `kubernetes`...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeploymentMode(pub String);

/// Active scheduling policy (`static`, `dynamic-v3`, `fcfs-batch`...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchedulingPolicy(pub String);

/// Address of the Jupyter server fronting the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JupyterAddress {
    pub jupyter_address: String,
}

/// When the cluster was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterAge {
    pub created_at: DateTime<Utc>,
}

impl ClusterAge {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// Body as trimmed text, with one pair of surrounding quotes removed.
pub fn decode_text(body: &Bytes) -> Result<String, Error> {
    let text = std::str::from_utf8(body)
        .map_err(|e| Error::decode(e, String::from_utf8_lossy(body)))?
        .trim();
    let unquoted = text
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(text);
    Ok(unquoted.to_owned())
}

pub fn decode_deployment_mode(body: &Bytes) -> Result<DeploymentMode, Error> {
    decode_text(body).map(DeploymentMode)
}

pub fn decode_scheduling_policy(body: &Bytes) -> Result<SchedulingPolicy, Error> {
    decode_text(body).map(SchedulingPolicy)
}

/// Unix milliseconds. Zero, negative, or future timestamps mean the
/// cluster has not finished starting and are rejected.
pub fn decode_cluster_age(body: &Bytes) -> Result<ClusterAge, Error> {
    let text = decode_text(body)?;
    let millis: i64 = text
        .parse()
        .map_err(|e| Error::decode(format!("cluster age is not an integer: {e}"), text.clone()))?;
    let created_at = Utc
        .timestamp_millis_opt(millis)
        .single()
        .filter(|t| millis > 0 && *t <= Utc::now())
        .ok_or_else(|| Error::decode("cluster age is not a valid past timestamp", text.clone()))?;
    Ok(ClusterAge { created_at })
}
