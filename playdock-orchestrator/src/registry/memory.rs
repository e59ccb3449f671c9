use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use playdock_common::{GamingInstance, InstanceStatus, StreamingSession};

use super::{merge_placeholder, RegistryStore};
use crate::error::Result;

#[derive(Default)]
struct Tables {
    instances: HashMap<String, GamingInstance>,
    sessions: HashMap<String, StreamingSession>,
    user_locks: HashMap<String, (String, DateTime<Utc>)>,
}

/// Process-local registry. Used when no DATABASE_URL is configured and by tests.
#[derive(Default)]
pub struct MemoryRegistry {
    tables: RwLock<Tables>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Holder of the per-user lock, if any.
    pub async fn lock_holder(&self, user_id: &str) -> Option<String> {
        self.tables
            .read()
            .await
            .user_locks
            .get(user_id)
            .map(|(exec, _)| exec.clone())
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistry {
    async fn put_instance(&self, instance: &GamingInstance) -> Result<()> {
        self.tables
            .write()
            .await
            .instances
            .insert(instance.instance_id.clone(), instance.clone());
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<GamingInstance>> {
        Ok(self.tables.read().await.instances.get(instance_id).cloned())
    }

    async fn instances_for_user(&self, user_id: &str) -> Result<Vec<GamingInstance>> {
        let tables = self.tables.read().await;
        let mut out: Vec<GamingInstance> = tables
            .instances
            .values()
            .filter(|i| i.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.creation_time.cmp(&a.creation_time));
        Ok(out)
    }

    async fn update_instance_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(rec) = tables.instances.get_mut(instance_id) else {
            return Ok(false);
        };
        rec.status = status;
        rec.last_modified_time = at;
        if status == InstanceStatus::Terminated && rec.terminated_at.is_none() {
            rec.terminated_at = Some(at);
        }
        Ok(true)
    }

    async fn set_instance_execution(
        &self,
        instance_id: &str,
        execution_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(rec) = tables.instances.get_mut(instance_id) else {
            return Ok(false);
        };
        rec.execution_id = Some(execution_id.to_string());
        rec.last_modified_time = at;
        Ok(true)
    }

    async fn swap_placeholder(
        &self,
        placeholder_id: &str,
        real: GamingInstance,
    ) -> Result<GamingInstance> {
        // Single write lock: readers never observe the gap between delete and insert.
        let mut tables = self.tables.write().await;
        let placeholder = tables.instances.remove(placeholder_id);
        let merged = merge_placeholder(placeholder.as_ref(), real);
        tables
            .instances
            .insert(merged.instance_id.clone(), merged.clone());
        Ok(merged)
    }

    async fn put_session(&self, session: &StreamingSession) -> Result<()> {
        let mut tables = self.tables.write().await;
        let mut rec = session.clone();
        if let Some(existing) = tables.sessions.get(&session.instance_arn) {
            rec.created_at = existing.created_at;
        }
        tables.sessions.insert(rec.instance_arn.clone(), rec);
        Ok(())
    }

    async fn get_session(&self, instance_arn: &str) -> Result<Option<StreamingSession>> {
        Ok(self.tables.read().await.sessions.get(instance_arn).cloned())
    }

    async fn sessions_for_user(&self, user_id: &str) -> Result<Vec<StreamingSession>> {
        let tables = self.tables.read().await;
        let mut out: Vec<StreamingSession> = tables
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(out)
    }

    async fn delete_session(&self, instance_arn: &str) -> Result<bool> {
        Ok(self
            .tables
            .write()
            .await
            .sessions
            .remove(instance_arn)
            .is_some())
    }

    async fn try_acquire_user_lock(
        &self,
        user_id: &str,
        execution_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.user_locks.get(user_id) {
            Some((holder, acquired_at)) if holder != execution_id && *acquired_at >= stale_before => {
                Ok(false)
            }
            _ => {
                tables
                    .user_locks
                    .insert(user_id.to_string(), (execution_id.to_string(), Utc::now()));
                Ok(true)
            }
        }
    }

    async fn release_user_lock(&self, user_id: &str, execution_id: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.user_locks.get(user_id) {
            Some((holder, _)) if holder == execution_id => {
                tables.user_locks.remove(user_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(id: &str, user: &str, created: DateTime<Utc>) -> GamingInstance {
        GamingInstance {
            instance_id: id.to_string(),
            user_id: user.to_string(),
            arn: format!("arn:{}", id),
            status: InstanceStatus::Running,
            execution_id: None,
            creation_time: created,
            last_modified_time: created,
            terminated_at: None,
        }
    }

    #[tokio::test]
    async fn instances_for_user_newest_first() {
        let reg = MemoryRegistry::new();
        let t0 = Utc::now();
        reg.put_instance(&record("i-old", "u1", t0 - Duration::minutes(10))).await.unwrap();
        reg.put_instance(&record("i-new", "u1", t0)).await.unwrap();
        reg.put_instance(&record("i-other", "u2", t0)).await.unwrap();

        let list = reg.instances_for_user("u1").await.unwrap();
        assert_eq!(
            list.iter().map(|i| i.instance_id.as_str()).collect::<Vec<_>>(),
            vec!["i-new", "i-old"]
        );
        let latest = reg.latest_instance_for_user("u1").await.unwrap().unwrap();
        assert_eq!(latest.instance_id, "i-new");
    }

    #[tokio::test]
    async fn active_record_wins_over_newer_terminated_one() {
        let reg = MemoryRegistry::new();
        let t0 = Utc::now();
        reg.put_instance(&record("i-live", "u1", t0 - Duration::minutes(10))).await.unwrap();
        let mut closed = GamingInstance::placeholder("u1", "exec-2", t0);
        closed.status = InstanceStatus::Terminated;
        reg.put_instance(&closed).await.unwrap();

        let active = reg.active_instance_for_user("u1").await.unwrap().unwrap();
        assert_eq!(active.instance_id, "i-live");

        // The placeholder carries an execution id and is the most recently touched.
        let tracked = reg.latest_tracked_instance_for_user("u1").await.unwrap().unwrap();
        assert_eq!(tracked.instance_id, "pending-exec-2");
        reg.set_instance_execution("i-live", "exec-3", Utc::now()).await.unwrap();
        let tracked = reg.latest_tracked_instance_for_user("u1").await.unwrap().unwrap();
        assert_eq!(tracked.execution_id.as_deref(), Some("exec-3"));
    }

    #[tokio::test]
    async fn swap_carries_execution_and_creation_time() {
        let reg = MemoryRegistry::new();
        let t0 = Utc::now() - Duration::minutes(3);
        let placeholder = GamingInstance::placeholder("u1", "exec-9", t0);
        reg.put_instance(&placeholder).await.unwrap();

        let real = record("i-real", "u1", Utc::now());
        let stored = reg.swap_placeholder(&placeholder.instance_id, real).await.unwrap();
        assert_eq!(stored.execution_id.as_deref(), Some("exec-9"));
        assert_eq!(stored.creation_time, t0);
        assert!(reg.get_instance("pending-exec-9").await.unwrap().is_none());
        assert!(reg.get_instance("i-real").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn terminated_status_stamps_terminated_at() {
        let reg = MemoryRegistry::new();
        reg.put_instance(&record("i-1", "u1", Utc::now())).await.unwrap();
        let at = Utc::now();
        assert!(reg.update_instance_status("i-1", InstanceStatus::Terminated, at).await.unwrap());
        let rec = reg.get_instance("i-1").await.unwrap().unwrap();
        assert_eq!(rec.terminated_at, Some(at));
        assert!(!reg.update_instance_status("i-missing", InstanceStatus::Terminated, at).await.unwrap());
    }

    #[tokio::test]
    async fn user_lock_is_compare_and_swap() {
        let reg = MemoryRegistry::new();
        let long_ago = Utc::now() - Duration::hours(2);
        assert!(reg.try_acquire_user_lock("u1", "e1", long_ago).await.unwrap());
        assert!(!reg.try_acquire_user_lock("u1", "e2", long_ago).await.unwrap());
        // Only the holder releases.
        assert!(!reg.release_user_lock("u1", "e2").await.unwrap());
        assert!(reg.release_user_lock("u1", "e1").await.unwrap());
        assert!(reg.try_acquire_user_lock("u1", "e2", long_ago).await.unwrap());
        // A stale lock can be taken over.
        assert!(reg.try_acquire_user_lock("u1", "e3", Utc::now() + Duration::seconds(1)).await.unwrap());
        assert_eq!(reg.lock_holder("u1").await.as_deref(), Some("e3"));
    }

    #[tokio::test]
    async fn session_upsert_keeps_created_at() {
        let reg = MemoryRegistry::new();
        let t0 = Utc::now() - Duration::minutes(5);
        let mut s = StreamingSession {
            instance_arn: "arn:i-1".into(),
            user_id: "u1".into(),
            session_id: "user-u1-session".into(),
            host: "198.51.100.1".into(),
            port: 8443,
            username: "Administrator".into(),
            password: "pw".into(),
            streaming_link: "https://198-51-100-1.nip.io:8443/#user-u1-session".into(),
            created_at: t0,
            updated_at: t0,
        };
        reg.put_session(&s).await.unwrap();
        s.created_at = Utc::now();
        s.updated_at = Utc::now();
        reg.put_session(&s).await.unwrap();
        let stored = reg.get_session("arn:i-1").await.unwrap().unwrap();
        assert_eq!(stored.created_at, t0);
        assert_eq!(reg.sessions_for_user("u1").await.unwrap().len(), 1);
        assert!(reg.delete_session("arn:i-1").await.unwrap());
        assert!(!reg.delete_session("arn:i-1").await.unwrap());
    }
}
