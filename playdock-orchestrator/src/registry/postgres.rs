use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use tracing::info;

use playdock_common::{GamingInstance, InstanceStatus, StreamingSession};

use super::{merge_placeholder, RegistryStore};
use crate::error::Result;

const INSTANCE_COLUMNS: &str = "instance_id, user_id, arn, status, execution_id, creation_time, last_modified_time, terminated_at";
const SESSION_COLUMNS: &str = "instance_arn, user_id, session_id, host, port, username, password, streaming_link, created_at, updated_at";

/// Postgres-backed registry using runtime-checked queries (no DATABASE_URL at build time).
#[derive(Clone)]
pub struct PgRegistry {
    db: Pool<Postgres>,
}

impl PgRegistry {
    pub fn new(db: Pool<Postgres>) -> Self {
        Self { db }
    }

    /// Idempotent inline schema. Safe to run on every start.
    pub async fn run_migrations(&self) -> Result<()> {
        info!("[registry] running inline migrations");
        let statements = [
            r#"
            DO $$ BEGIN
                CREATE TYPE gaming_instance_status AS ENUM ('deploying', 'running', 'terminating', 'terminated');
            EXCEPTION WHEN duplicate_object THEN NULL;
            END $$
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS gaming_instances (
                instance_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                arn TEXT NOT NULL,
                status gaming_instance_status NOT NULL DEFAULT 'deploying',
                execution_id TEXT,
                creation_time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_modified_time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                terminated_at TIMESTAMPTZ
            )
            "#,
            "CREATE INDEX IF NOT EXISTS gaming_instances_user_idx ON gaming_instances (user_id, creation_time DESC)",
            r#"
            CREATE TABLE IF NOT EXISTS streaming_sessions (
                instance_arn TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                host TEXT NOT NULL,
                port INTEGER NOT NULL,
                username TEXT NOT NULL,
                password TEXT NOT NULL,
                streaming_link TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            "CREATE INDEX IF NOT EXISTS streaming_sessions_user_idx ON streaming_sessions (user_id, updated_at DESC)",
            r#"
            CREATE TABLE IF NOT EXISTS user_deploy_locks (
                user_id TEXT PRIMARY KEY,
                execution_id TEXT NOT NULL,
                acquired_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        ];
        for stmt in statements {
            sqlx::query(stmt).execute(&self.db).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryStore for PgRegistry {
    async fn put_instance(&self, instance: &GamingInstance) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO gaming_instances
                (instance_id, user_id, arn, status, execution_id, creation_time, last_modified_time, terminated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (instance_id) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                arn = EXCLUDED.arn,
                status = EXCLUDED.status,
                execution_id = EXCLUDED.execution_id,
                last_modified_time = EXCLUDED.last_modified_time,
                terminated_at = EXCLUDED.terminated_at
            "#,
        )
        .bind(&instance.instance_id)
        .bind(&instance.user_id)
        .bind(&instance.arn)
        .bind(instance.status)
        .bind(instance.execution_id.as_deref())
        .bind(instance.creation_time)
        .bind(instance.last_modified_time)
        .bind(instance.terminated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_instance(&self, instance_id: &str) -> Result<Option<GamingInstance>> {
        let row = sqlx::query_as::<_, GamingInstance>(&format!(
            "SELECT {} FROM gaming_instances WHERE instance_id = $1",
            INSTANCE_COLUMNS
        ))
        .bind(instance_id)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn instances_for_user(&self, user_id: &str) -> Result<Vec<GamingInstance>> {
        let rows = sqlx::query_as::<_, GamingInstance>(&format!(
            "SELECT {} FROM gaming_instances WHERE user_id = $1 ORDER BY creation_time DESC",
            INSTANCE_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn update_instance_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            UPDATE gaming_instances
            SET status = $2,
                last_modified_time = $3,
                terminated_at = CASE WHEN $2 = 'terminated'::gaming_instance_status
                                     THEN COALESCE(terminated_at, $3)
                                     ELSE terminated_at END
            WHERE instance_id = $1
            "#,
        )
        .bind(instance_id)
        .bind(status)
        .bind(at)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn set_instance_execution(
        &self,
        instance_id: &str,
        execution_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let res = sqlx::query(
            "UPDATE gaming_instances SET execution_id = $2, last_modified_time = $3 WHERE instance_id = $1",
        )
        .bind(instance_id)
        .bind(execution_id)
        .bind(at)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn swap_placeholder(
        &self,
        placeholder_id: &str,
        real: GamingInstance,
    ) -> Result<GamingInstance> {
        let mut tx = self.db.begin().await?;

        let placeholder = sqlx::query_as::<_, GamingInstance>(&format!(
            "DELETE FROM gaming_instances WHERE instance_id = $1 RETURNING {}",
            INSTANCE_COLUMNS
        ))
        .bind(placeholder_id)
        .fetch_optional(&mut *tx)
        .await?;

        let merged = merge_placeholder(placeholder.as_ref(), real);
        sqlx::query(
            r#"
            INSERT INTO gaming_instances
                (instance_id, user_id, arn, status, execution_id, creation_time, last_modified_time, terminated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (instance_id) DO UPDATE SET
                status = EXCLUDED.status,
                execution_id = EXCLUDED.execution_id,
                last_modified_time = EXCLUDED.last_modified_time
            "#,
        )
        .bind(&merged.instance_id)
        .bind(&merged.user_id)
        .bind(&merged.arn)
        .bind(merged.status)
        .bind(merged.execution_id.as_deref())
        .bind(merged.creation_time)
        .bind(merged.last_modified_time)
        .bind(merged.terminated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(merged)
    }

    async fn put_session(&self, session: &StreamingSession) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO streaming_sessions
                (instance_arn, user_id, session_id, host, port, username, password, streaming_link, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (instance_arn) DO UPDATE SET
                user_id = EXCLUDED.user_id,
                session_id = EXCLUDED.session_id,
                host = EXCLUDED.host,
                port = EXCLUDED.port,
                username = EXCLUDED.username,
                password = EXCLUDED.password,
                streaming_link = EXCLUDED.streaming_link,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&session.instance_arn)
        .bind(&session.user_id)
        .bind(&session.session_id)
        .bind(&session.host)
        .bind(session.port)
        .bind(&session.username)
        .bind(&session.password)
        .bind(&session.streaming_link)
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn get_session(&self, instance_arn: &str) -> Result<Option<StreamingSession>> {
        let row = sqlx::query_as::<_, StreamingSession>(&format!(
            "SELECT {} FROM streaming_sessions WHERE instance_arn = $1",
            SESSION_COLUMNS
        ))
        .bind(instance_arn)
        .fetch_optional(&self.db)
        .await?;
        Ok(row)
    }

    async fn sessions_for_user(&self, user_id: &str) -> Result<Vec<StreamingSession>> {
        let rows = sqlx::query_as::<_, StreamingSession>(&format!(
            "SELECT {} FROM streaming_sessions WHERE user_id = $1 ORDER BY updated_at DESC",
            SESSION_COLUMNS
        ))
        .bind(user_id)
        .fetch_all(&self.db)
        .await?;
        Ok(rows)
    }

    async fn delete_session(&self, instance_arn: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM streaming_sessions WHERE instance_arn = $1")
            .bind(instance_arn)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn try_acquire_user_lock(
        &self,
        user_id: &str,
        execution_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let res = sqlx::query(
            r#"
            INSERT INTO user_deploy_locks (user_id, execution_id, acquired_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (user_id) DO UPDATE
            SET execution_id = EXCLUDED.execution_id,
                acquired_at = EXCLUDED.acquired_at
            WHERE user_deploy_locks.execution_id = EXCLUDED.execution_id
               OR user_deploy_locks.acquired_at < $3
            "#,
        )
        .bind(user_id)
        .bind(execution_id)
        .bind(stale_before)
        .execute(&self.db)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn release_user_lock(&self, user_id: &str, execution_id: &str) -> Result<bool> {
        let res = sqlx::query("DELETE FROM user_deploy_locks WHERE user_id = $1 AND execution_id = $2")
            .bind(user_id)
            .bind(execution_id)
            .execute(&self.db)
            .await?;
        Ok(res.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::postgres::PgPoolOptions;

    fn test_database_url() -> Option<String> {
        std::env::var("DATABASE_URL")
            .ok()
            .filter(|s| !s.trim().is_empty())
    }

    async fn setup_registry() -> Option<PgRegistry> {
        let Some(url) = test_database_url() else {
            eprintln!("skipping integration test: DATABASE_URL not set");
            return None;
        };
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await
            .ok()?;
        let reg = PgRegistry::new(pool);
        reg.run_migrations().await.ok()?;
        Some(reg)
    }

    #[tokio::test]
    async fn test_placeholder_swap_roundtrip() {
        let Some(reg) = setup_registry().await else {
            return;
        };
        let user_id = format!("u-{}", uuid::Uuid::new_v4());
        let execution_id = uuid::Uuid::new_v4().to_string();
        let placeholder = GamingInstance::placeholder(&user_id, &execution_id, Utc::now());
        reg.put_instance(&placeholder).await.unwrap();

        let real_id = format!("i-{}", uuid::Uuid::new_v4().simple());
        let real = GamingInstance {
            instance_id: real_id.clone(),
            arn: format!("arn:test:{}", real_id),
            execution_id: None,
            ..placeholder.clone()
        };
        let stored = reg.swap_placeholder(&placeholder.instance_id, real).await.unwrap();
        assert_eq!(stored.execution_id.as_deref(), Some(execution_id.as_str()));

        let all = reg.instances_for_user(&user_id).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].instance_id, real_id);
    }

    #[tokio::test]
    async fn test_user_lock_cas() {
        let Some(reg) = setup_registry().await else {
            return;
        };
        let user_id = format!("u-{}", uuid::Uuid::new_v4());
        let long_ago = Utc::now() - chrono::Duration::hours(1);
        assert!(reg.try_acquire_user_lock(&user_id, "e1", long_ago).await.unwrap());
        assert!(!reg.try_acquire_user_lock(&user_id, "e2", long_ago).await.unwrap());
        assert!(reg.release_user_lock(&user_id, "e1").await.unwrap());
        assert!(reg.try_acquire_user_lock(&user_id, "e2", long_ago).await.unwrap());
        assert!(reg.release_user_lock(&user_id, "e2").await.unwrap());
    }
}
