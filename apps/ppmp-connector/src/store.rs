mod influx;

#[cfg(test)]
pub(crate) mod recording;

pub use influx::InfluxClient;

use crate::line_protocol::WriteRecord;
use std::future::Future;
use thiserror::Error;

pub const MANAGED_POLICY: &str = "autogen";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub name: String,
    pub duration: String,
    pub shard_group_duration: String,
    pub replica_n: Option<u64>,
    pub default: bool,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("store returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("query error: {0}")]
    Query(String),
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("invalid duration literal {0:?}")]
    InvalidDuration(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The time-series store as seen by the write stage and the retention reconciler.
pub trait TimeSeriesStore: Send + Sync + 'static {
    fn write_batch(
        &self,
        records: &[WriteRecord],
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn list_retention_policies(
        &self,
    ) -> impl Future<Output = Result<Vec<RetentionPolicy>, StoreError>> + Send;

    fn alter_retention_policy(
        &self,
        name: &str,
        duration: &str,
        shard_group_duration: &str,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Database the store writes into; used for log context only.
    fn database(&self) -> &str;
}
