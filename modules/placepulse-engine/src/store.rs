//! RunStore implementations.
//!
//! Every mutation goes through read-current / merge-one-key / write-back on
//! the stored document; the store never blindly overwrites the whole run.
//! The Postgres store serializes concurrent merges with a row lock, so two
//! stages completing at once both land.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use placepulse_common::{AuditRun, PlacePulseError, StageResult, StageStatus};

type Result<T> = std::result::Result<T, PlacePulseError>;

// ---------------------------------------------------------------------------
// RunStore
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert_run(&self, run: &AuditRun) -> Result<()>;
    async fn get_run(&self, id: Uuid) -> Result<Option<AuditRun>>;

    /// Record a status transition. Returns the merged run.
    async fn set_stage_status(
        &self,
        id: Uuid,
        stage: &str,
        status: StageStatus,
    ) -> Result<AuditRun>;

    /// Merge one StageResult under its stage key. Returns the merged run.
    async fn merge_stage_result(
        &self,
        id: Uuid,
        result: StageResult,
        status: StageStatus,
    ) -> Result<AuditRun>;

    /// Apply a reviewer-confirmed subset to a parked stage.
    async fn merge_confirmation(
        &self,
        id: Uuid,
        stage: &str,
        confirmed: serde_json::Value,
    ) -> Result<AuditRun>;
}

// ---------------------------------------------------------------------------
// MemoryRunStore (tests — no database required)
// ---------------------------------------------------------------------------

/// In-memory store for tests. Thread-safe.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: Mutex<HashMap<Uuid, AuditRun>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutate<F>(&self, id: Uuid, f: F) -> Result<AuditRun>
    where
        F: FnOnce(&mut AuditRun) -> Result<()>,
    {
        let mut runs = self.runs.lock().expect("run store poisoned");
        let run = runs.get_mut(&id).ok_or(PlacePulseError::RunNotFound(id))?;
        f(run)?;
        Ok(run.clone())
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn insert_run(&self, run: &AuditRun) -> Result<()> {
        let mut runs = self.runs.lock().expect("run store poisoned");
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<AuditRun>> {
        let runs = self.runs.lock().expect("run store poisoned");
        Ok(runs.get(&id).cloned())
    }

    async fn set_stage_status(
        &self,
        id: Uuid,
        stage: &str,
        status: StageStatus,
    ) -> Result<AuditRun> {
        self.mutate(id, |run| {
            run.set_stage_status(stage, status);
            Ok(())
        })
    }

    async fn merge_stage_result(
        &self,
        id: Uuid,
        result: StageResult,
        status: StageStatus,
    ) -> Result<AuditRun> {
        self.mutate(id, |run| {
            run.merge_stage_result(result, status);
            Ok(())
        })
    }

    async fn merge_confirmation(
        &self,
        id: Uuid,
        stage: &str,
        confirmed: serde_json::Value,
    ) -> Result<AuditRun> {
        self.mutate(id, |run| run.merge_confirmation(stage, confirmed))
    }
}

// ---------------------------------------------------------------------------
// PgRunStore (production — postgres, JSONB document per run)
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgRunStore {
    pool: PgPool,
}

impl PgRunStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the audit_runs table if absent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS audit_runs (
                id UUID PRIMARY KEY,
                doc JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| PlacePulseError::Store(e.to_string()))?;
        Ok(())
    }

    /// Row-locked read-merge-write.
    async fn mutate<F>(&self, id: Uuid, f: F) -> Result<AuditRun>
    where
        F: FnOnce(&mut AuditRun) -> Result<()> + Send,
    {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| PlacePulseError::Store(e.to_string()))?;

        let row = sqlx::query_as::<_, (serde_json::Value,)>(
            "SELECT doc FROM audit_runs WHERE id = $1 FOR UPDATE",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| PlacePulseError::Store(e.to_string()))?;

        let doc = row.ok_or(PlacePulseError::RunNotFound(id))?.0;
        let mut run: AuditRun =
            serde_json::from_value(doc).map_err(|e| PlacePulseError::Store(e.to_string()))?;

        f(&mut run)?;

        let doc =
            serde_json::to_value(&run).map_err(|e| PlacePulseError::Store(e.to_string()))?;
        sqlx::query("UPDATE audit_runs SET doc = $2, updated_at = now() WHERE id = $1")
            .bind(id)
            .bind(doc)
            .execute(&mut *tx)
            .await
            .map_err(|e| PlacePulseError::Store(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| PlacePulseError::Store(e.to_string()))?;
        Ok(run)
    }
}

#[async_trait]
impl RunStore for PgRunStore {
    async fn insert_run(&self, run: &AuditRun) -> Result<()> {
        let doc =
            serde_json::to_value(run).map_err(|e| PlacePulseError::Store(e.to_string()))?;
        sqlx::query(
            "INSERT INTO audit_runs (id, doc, created_at) VALUES ($1, $2, $3)
             ON CONFLICT (id) DO UPDATE SET doc = $2, updated_at = now()",
        )
        .bind(run.id)
        .bind(doc)
        .bind(run.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| PlacePulseError::Store(e.to_string()))?;
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<AuditRun>> {
        let row =
            sqlx::query_as::<_, (serde_json::Value,)>("SELECT doc FROM audit_runs WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| PlacePulseError::Store(e.to_string()))?;
        match row {
            Some((doc,)) => Ok(Some(
                serde_json::from_value(doc).map_err(|e| PlacePulseError::Store(e.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    async fn set_stage_status(
        &self,
        id: Uuid,
        stage: &str,
        status: StageStatus,
    ) -> Result<AuditRun> {
        self.mutate(id, |run| {
            run.set_stage_status(stage, status);
            Ok(())
        })
        .await
    }

    async fn merge_stage_result(
        &self,
        id: Uuid,
        result: StageResult,
        status: StageStatus,
    ) -> Result<AuditRun> {
        self.mutate(id, |run| {
            run.merge_stage_result(result, status);
            Ok(())
        })
        .await
    }

    async fn merge_confirmation(
        &self,
        id: Uuid,
        stage: &str,
        confirmed: serde_json::Value,
    ) -> Result<AuditRun> {
        self.mutate(id, |run| run.merge_confirmation(stage, confirmed))
            .await
    }
}

// ---------------------------------------------------------------------------
// Arc<S> blanket — lets tests share the store for assertions
// ---------------------------------------------------------------------------

#[async_trait]
impl<S: RunStore + ?Sized> RunStore for Arc<S> {
    async fn insert_run(&self, run: &AuditRun) -> Result<()> {
        (**self).insert_run(run).await
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<AuditRun>> {
        (**self).get_run(id).await
    }

    async fn set_stage_status(
        &self,
        id: Uuid,
        stage: &str,
        status: StageStatus,
    ) -> Result<AuditRun> {
        (**self).set_stage_status(id, stage, status).await
    }

    async fn merge_stage_result(
        &self,
        id: Uuid,
        result: StageResult,
        status: StageStatus,
    ) -> Result<AuditRun> {
        (**self).merge_stage_result(id, result, status).await
    }

    async fn merge_confirmation(
        &self,
        id: Uuid,
        stage: &str,
        confirmed: serde_json::Value,
    ) -> Result<AuditRun> {
        (**self).merge_confirmation(id, stage, confirmed).await
    }
}
