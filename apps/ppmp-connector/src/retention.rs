//! Startup reconciliation of the store's `autogen` retention policy.
//!
//! Each configured duration is one of three things: unset, empty (keep what the
//! store has), or an explicit value. Both unset disables reconciliation; both
//! empty means no change was requested.

use crate::store::{RetentionPolicy, TimeSeriesStore, MANAGED_POLICY};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DurationSetting {
    #[default]
    Unset,
    Keep,
    Explicit(String),
}

impl DurationSetting {
    pub fn from_raw(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            None => DurationSetting::Unset,
            Some("") => DurationSetting::Keep,
            Some(value) => DurationSetting::Explicit(value.to_string()),
        }
    }

    /// The desired value, deferring to `current` unless explicit.
    fn resolve<'a>(&'a self, current: &'a str) -> &'a str {
        match self {
            DurationSetting::Explicit(value) => value.as_str(),
            DurationSetting::Keep | DurationSetting::Unset => current,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RetentionConfig {
    pub duration: DurationSetting,
    pub shard_group_duration: DurationSetting,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    PolicyMissing,
    Disabled,
    NoChangeRequested,
    InSync,
    Altered,
    Failed,
}

pub async fn reconcile<S: TimeSeriesStore>(store: &S, config: &RetentionConfig) -> ReconcileOutcome {
    let database = store.database();
    let current = match find_managed_policy(store).await {
        Ok(Some(policy)) => policy,
        Ok(None) => {
            tracing::info!(database, policy = MANAGED_POLICY, "retention policy not found; nothing to reconcile");
            return ReconcileOutcome::PolicyMissing;
        }
        Err(err) => {
            tracing::error!(error = %err, database, "failed to list retention policies");
            return ReconcileOutcome::Failed;
        }
    };
    log_policy(database, "retention-autogen", &current);

    match (&config.duration, &config.shard_group_duration) {
        (DurationSetting::Unset, DurationSetting::Unset) => {
            tracing::debug!(database, "retention reconciliation disabled");
            return ReconcileOutcome::Disabled;
        }
        (DurationSetting::Keep, DurationSetting::Keep) => {
            tracing::debug!(database, "no retention change requested");
            return ReconcileOutcome::NoChangeRequested;
        }
        _ => {}
    }

    let duration = config.duration.resolve(&current.duration);
    let shard_group_duration = config
        .shard_group_duration
        .resolve(&current.shard_group_duration);

    if duration == current.duration && shard_group_duration == current.shard_group_duration {
        return ReconcileOutcome::InSync;
    }

    tracing::info!(
        database,
        policy = MANAGED_POLICY,
        from_duration = %current.duration,
        to_duration = %duration,
        from_shard_group_duration = %current.shard_group_duration,
        to_shard_group_duration = %shard_group_duration,
        "altering retention policy"
    );
    if let Err(err) = store
        .alter_retention_policy(MANAGED_POLICY, duration, shard_group_duration)
        .await
    {
        tracing::error!(error = %err, database, policy = MANAGED_POLICY, "failed to alter retention policy");
        return ReconcileOutcome::Failed;
    }

    match find_managed_policy(store).await {
        Ok(Some(policy)) => log_policy(database, "retention-autogen-Set", &policy),
        Ok(None) => {
            tracing::error!(database, policy = MANAGED_POLICY, "retention policy vanished after alter")
        }
        Err(err) => {
            tracing::error!(error = %err, database, "failed to re-list retention policies after alter")
        }
    }
    ReconcileOutcome::Altered
}

async fn find_managed_policy<S: TimeSeriesStore>(
    store: &S,
) -> Result<Option<RetentionPolicy>, crate::store::StoreError> {
    let policies = store.list_retention_policies().await?;
    Ok(policies.into_iter().find(|p| p.name == MANAGED_POLICY))
}

fn log_policy(database: &str, label: &str, policy: &RetentionPolicy) {
    tracing::info!(
        "{database}-{label}: duration : {}, shardGroupDuration : {}, replicaN : {}, default : {}",
        policy.duration,
        policy.shard_group_duration,
        policy
            .replica_n
            .map(|n| n.to_string())
            .unwrap_or_else(|| "-".to_string()),
        policy.default
    );
}
