//! Durable registries for gaming instances and streaming sessions.
//!
//! Writers use point updates keyed by `instance_id`/`instance_arn`/`user_id`; nothing takes a
//! table-wide lock. Per-user mutual exclusion for deploys is a conditional insert on a lock row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use playdock_common::{GamingInstance, InstanceStatus, StreamingSession};

use crate::error::Result;

mod memory;
mod postgres;

pub use memory::MemoryRegistry;
pub use postgres::PgRegistry;

#[async_trait]
pub trait RegistryStore: Send + Sync {
    /// Insert or replace an instance record.
    async fn put_instance(&self, instance: &GamingInstance) -> Result<()>;

    async fn get_instance(&self, instance_id: &str) -> Result<Option<GamingInstance>>;

    /// All records of a user, most recent `creation_time` first.
    async fn instances_for_user(&self, user_id: &str) -> Result<Vec<GamingInstance>>;

    async fn latest_instance_for_user(&self, user_id: &str) -> Result<Option<GamingInstance>> {
        Ok(self.instances_for_user(user_id).await?.into_iter().next())
    }

    /// Most recent non-terminated record, falling back to the most recent record of any status.
    async fn active_instance_for_user(&self, user_id: &str) -> Result<Option<GamingInstance>> {
        let records = self.instances_for_user(user_id).await?;
        let active = records.iter().position(|r| r.status.is_active());
        Ok(match active {
            Some(i) => records.into_iter().nth(i),
            None => records.into_iter().next(),
        })
    }

    /// Record most recently touched by a workflow; its `execution_id` is the user's current workflow.
    async fn latest_tracked_instance_for_user(&self, user_id: &str) -> Result<Option<GamingInstance>> {
        Ok(self
            .instances_for_user(user_id)
            .await?
            .into_iter()
            .filter(|r| r.execution_id.is_some())
            .max_by_key(|r| r.last_modified_time))
    }

    /// Point update of the status. Sets `terminated_at` when moving to `terminated`.
    /// Returns false when no record exists.
    async fn update_instance_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    async fn set_instance_execution(
        &self,
        instance_id: &str,
        execution_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Replace the placeholder record with the real one in a single atomic write.
    /// `execution_id` and `creation_time` are carried over from the placeholder when it exists.
    async fn swap_placeholder(
        &self,
        placeholder_id: &str,
        real: GamingInstance,
    ) -> Result<GamingInstance>;

    /// Upsert keyed by `instance_arn`; an existing record keeps its `created_at`.
    async fn put_session(&self, session: &StreamingSession) -> Result<()>;

    async fn get_session(&self, instance_arn: &str) -> Result<Option<StreamingSession>>;

    /// All sessions of a user, most recently updated first.
    async fn sessions_for_user(&self, user_id: &str) -> Result<Vec<StreamingSession>>;

    async fn delete_session(&self, instance_arn: &str) -> Result<bool>;

    /// Compare-and-swap acquisition of the per-user deploy lock. A lock acquired before
    /// `stale_before` is considered abandoned and can be taken over.
    async fn try_acquire_user_lock(
        &self,
        user_id: &str,
        execution_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool>;

    /// Releases the lock only if `execution_id` still holds it.
    async fn release_user_lock(&self, user_id: &str, execution_id: &str) -> Result<bool>;
}

/// Copy the fields a placeholder owns onto the real record.
pub(crate) fn merge_placeholder(placeholder: Option<&GamingInstance>, mut real: GamingInstance) -> GamingInstance {
    if let Some(p) = placeholder {
        if real.execution_id.is_none() {
            real.execution_id = p.execution_id.clone();
        }
        real.creation_time = p.creation_time;
    }
    real
}
