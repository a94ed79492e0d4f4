//! PostgreSQL mirror backend.
//!
//! Production backend behind the `postgres` feature. Schema setup is
//! idempotent; call [`PostgresStore::init_schema`] once at startup.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use crate::error::{StoreError, StoreResult};
use crate::model::{ExperimentRecord, MetricRecord, NewExperiment, NewMetric, NewRun, RunRecord};
use crate::traits::{ExperimentStore, MetricStore, RunStore};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS graft_experiments (
        id BIGSERIAL PRIMARY KEY,
        experiment_id TEXT NOT NULL UNIQUE,
        remote_experiment_id TEXT,
        name TEXT NOT NULL,
        created BOOLEAN NOT NULL DEFAULT FALSE,
        updated BOOLEAN NOT NULL DEFAULT FALSE,
        deleted BOOLEAN NOT NULL DEFAULT FALSE,
        created_ts TIMESTAMPTZ NOT NULL,
        updated_ts TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS graft_runs (
        id BIGSERIAL PRIMARY KEY,
        experiment_id TEXT NOT NULL,
        run_id TEXT NOT NULL,
        remote_run_id TEXT,
        created BOOLEAN NOT NULL DEFAULT FALSE,
        updated BOOLEAN NOT NULL DEFAULT FALSE,
        deleted BOOLEAN NOT NULL DEFAULT FALSE,
        reconcile_metrics BOOLEAN NOT NULL DEFAULT FALSE,
        created_ts TIMESTAMPTZ NOT NULL,
        updated_ts TIMESTAMPTZ NOT NULL,
        UNIQUE (experiment_id, run_id)
    )",
    "CREATE TABLE IF NOT EXISTS graft_metrics (
        id BIGSERIAL PRIMARY KEY,
        experiment_id TEXT NOT NULL,
        run_id TEXT NOT NULL,
        name TEXT NOT NULL,
        kind TEXT NOT NULL,
        value_numeric DOUBLE PRECISION,
        value_text TEXT,
        tags JSONB NOT NULL DEFAULT '{}'::jsonb,
        ts TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS idx_graft_runs_experiment
        ON graft_runs (experiment_id)",
    "CREATE INDEX IF NOT EXISTS idx_graft_metrics_lookup
        ON graft_metrics (experiment_id, run_id, name)",
];

/// Mirror store backed by a PostgreSQL database.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connects with default pool settings.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
        Ok(PostgresStore { pool })
    }

    /// Connects with explicit pool sizing and acquire timeout.
    pub async fn connect_with_options(
        url: &str,
        max_connections: u32,
        connect_timeout: Duration,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(connect_timeout)
            .connect(url)
            .await?;
        Ok(PostgresStore { pool })
    }

    /// Wraps an existing pool, e.g. one shared with other subsystems.
    pub fn from_pool(pool: PgPool) -> Self {
        PostgresStore { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the mirror tables and indexes if they do not exist.
    pub async fn init_schema(&self) -> StoreResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ExperimentStore for PostgresStore {
    async fn create_experiment(&self, experiment: NewExperiment) -> StoreResult<ExperimentRecord> {
        let row = sqlx::query(
            "INSERT INTO graft_experiments
                (experiment_id, name, created, updated, created_ts, updated_ts)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
        )
        .bind(&experiment.experiment_id)
        .bind(&experiment.name)
        .bind(experiment.created)
        .bind(experiment.updated)
        .bind(experiment.created_ts)
        .bind(experiment.updated_ts)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| {
            map_sqlx_conflict(err, &format!("experiment {}", experiment.experiment_id))
        })?;
        let id: i64 = row.try_get("id")?;
        Ok(ExperimentRecord {
            id,
            experiment_id: experiment.experiment_id,
            remote_experiment_id: None,
            name: experiment.name,
            created: experiment.created,
            updated: experiment.updated,
            deleted: false,
            created_ts: experiment.created_ts,
            updated_ts: experiment.updated_ts,
        })
    }

    async fn get_experiment(&self, experiment_id: &str) -> StoreResult<Option<ExperimentRecord>> {
        let row = sqlx::query(
            "SELECT id, experiment_id, remote_experiment_id, name,
                    created, updated, deleted, created_ts, updated_ts
             FROM graft_experiments
             WHERE experiment_id = $1",
        )
        .bind(experiment_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(experiment_from_row).transpose()
    }

    async fn get_experiment_by_id(&self, id: i64) -> StoreResult<Option<ExperimentRecord>> {
        let row = sqlx::query(
            "SELECT id, experiment_id, remote_experiment_id, name,
                    created, updated, deleted, created_ts, updated_ts
             FROM graft_experiments
             WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(experiment_from_row).transpose()
    }

    async fn list_experiments(&self) -> StoreResult<Vec<ExperimentRecord>> {
        let rows = sqlx::query(
            "SELECT id, experiment_id, remote_experiment_id, name,
                    created, updated, deleted, created_ts, updated_ts
             FROM graft_experiments
             WHERE NOT deleted
             ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(experiment_from_row).collect()
    }

    async fn list_ids_for_run_reconciliation(&self, max_items: usize) -> StoreResult<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT id FROM graft_experiments
             WHERE NOT deleted AND (created OR updated)
             ORDER BY id
             LIMIT $1",
        )
        .bind(to_i64(max_items)?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(StoreError::from))
            .collect()
    }

    async fn set_remote_experiment_id(
        &self,
        id: i64,
        remote_experiment_id: &str,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE graft_experiments SET remote_experiment_id = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(remote_experiment_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("experiment {id}")));
        }
        Ok(())
    }

    async fn set_experiment_updated(
        &self,
        id: i64,
        updated: bool,
        updated_ts: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE graft_experiments SET updated = $2, updated_ts = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(updated)
        .bind(updated_ts)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("experiment {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl RunStore for PostgresStore {
    async fn create_run(&self, run: NewRun) -> StoreResult<RunRecord> {
        let row = sqlx::query(
            "INSERT INTO graft_runs
                (experiment_id, run_id, created, updated, created_ts, updated_ts)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING id",
        )
        .bind(&run.experiment_id)
        .bind(&run.run_id)
        .bind(run.created)
        .bind(run.updated)
        .bind(run.created_ts)
        .bind(run.updated_ts)
        .fetch_one(&self.pool)
        .await
        .map_err(|err| map_sqlx_conflict(err, &format!("run {}/{}", run.experiment_id, run.run_id)))?;
        let id: i64 = row.try_get("id")?;
        Ok(RunRecord {
            id,
            experiment_id: run.experiment_id,
            run_id: run.run_id,
            remote_run_id: None,
            created: run.created,
            updated: run.updated,
            deleted: false,
            reconcile_metrics: false,
            created_ts: run.created_ts,
            updated_ts: run.updated_ts,
        })
    }

    async fn get_run(&self, experiment_id: &str, run_id: &str) -> StoreResult<Option<RunRecord>> {
        let row = sqlx::query(
            "SELECT id, experiment_id, run_id, remote_run_id,
                    created, updated, deleted, reconcile_metrics, created_ts, updated_ts
             FROM graft_runs
             WHERE experiment_id = $1 AND run_id = $2",
        )
        .bind(experiment_id)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn get_run_by_id(&self, id: i64) -> StoreResult<Option<RunRecord>> {
        let row = sqlx::query(
            "SELECT id, experiment_id, run_id, remote_run_id,
                    created, updated, deleted, reconcile_metrics, created_ts, updated_ts
             FROM graft_runs
             WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn list_runs(&self, experiment_id: &str) -> StoreResult<Vec<RunRecord>> {
        let rows = sqlx::query(
            "SELECT id, experiment_id, run_id, remote_run_id,
                    created, updated, deleted, reconcile_metrics, created_ts, updated_ts
             FROM graft_runs
             WHERE NOT deleted AND experiment_id = $1
             ORDER BY id",
        )
        .bind(experiment_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn list_ids_for_metric_reconciliation(&self, max_items: usize) -> StoreResult<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT id FROM graft_runs
             WHERE NOT deleted AND reconcile_metrics
             ORDER BY id
             LIMIT $1",
        )
        .bind(to_i64(max_items)?)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| row.try_get("id").map_err(StoreError::from))
            .collect()
    }

    async fn set_remote_run_id(&self, id: i64, remote_run_id: &str) -> StoreResult<()> {
        let result = sqlx::query("UPDATE graft_runs SET remote_run_id = $2 WHERE id = $1")
            .bind(id)
            .bind(remote_run_id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("run {id}")));
        }
        Ok(())
    }

    async fn set_reconcile_metrics(&self, id: i64, reconcile: bool) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE graft_runs SET reconcile_metrics = $2, updated_ts = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(reconcile)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("run {id}")));
        }
        Ok(())
    }

    async fn delete_run(&self, experiment_id: &str, run_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM graft_runs WHERE experiment_id = $1 AND run_id = $2")
            .bind(experiment_id)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MetricStore for PostgresStore {
    async fn create_metric(&self, metric: NewMetric) -> StoreResult<MetricRecord> {
        metric.validate()?;
        let tags = serde_json::to_value(&metric.tags)?;
        // JSONB equality is structural, so the full tag set participates in
        // the duplicate check.
        let existing = sqlx::query(
            "SELECT id, experiment_id, run_id, name, kind,
                    value_numeric, value_text, tags, ts
             FROM graft_metrics
             WHERE experiment_id = $1 AND run_id = $2 AND name = $3 AND tags = $4
             ORDER BY id
             LIMIT 1",
        )
        .bind(&metric.experiment_id)
        .bind(&metric.run_id)
        .bind(&metric.name)
        .bind(&tags)
        .fetch_optional(&self.pool)
        .await?;
        if let Some(row) = existing {
            return metric_from_row(&row);
        }

        let row = sqlx::query(
            "INSERT INTO graft_metrics
                (experiment_id, run_id, name, kind, value_numeric, value_text, tags, ts)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id",
        )
        .bind(&metric.experiment_id)
        .bind(&metric.run_id)
        .bind(&metric.name)
        .bind(metric.kind.as_str())
        .bind(metric.value_numeric)
        .bind(metric.value_text.as_deref())
        .bind(&tags)
        .bind(metric.ts)
        .fetch_one(&self.pool)
        .await?;
        let id: i64 = row.try_get("id")?;
        Ok(MetricRecord {
            id,
            experiment_id: metric.experiment_id,
            run_id: metric.run_id,
            name: metric.name,
            kind: metric.kind,
            value_numeric: metric.value_numeric,
            value_text: metric.value_text,
            tags: metric.tags,
            ts: metric.ts,
        })
    }

    async fn get_metric_by_name(
        &self,
        experiment_id: &str,
        run_id: &str,
        name: &str,
    ) -> StoreResult<Option<MetricRecord>> {
        let row = sqlx::query(
            "SELECT id, experiment_id, run_id, name, kind,
                    value_numeric, value_text, tags, ts
             FROM graft_metrics
             WHERE experiment_id = $1 AND run_id = $2 AND name = $3
             ORDER BY id
             LIMIT 1",
        )
        .bind(experiment_id)
        .bind(run_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(metric_from_row).transpose()
    }

    async fn list_metrics(
        &self,
        name: Option<&str>,
        experiment_ids: &[String],
        run_ids: &[String],
    ) -> StoreResult<Vec<MetricRecord>> {
        let rows = sqlx::query(
            "SELECT id, experiment_id, run_id, name, kind,
                    value_numeric, value_text, tags, ts
             FROM graft_metrics
             WHERE ($1::text IS NULL OR name = $1)
               AND (cardinality($2::text[]) = 0 OR experiment_id = ANY($2))
               AND (cardinality($3::text[]) = 0 OR run_id = ANY($3))
             ORDER BY id",
        )
        .bind(name)
        .bind(experiment_ids)
        .bind(run_ids)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(metric_from_row).collect()
    }

    async fn update_metric(&self, metric: &MetricRecord) -> StoreResult<()> {
        metric.validate()?;
        let tags = serde_json::to_value(&metric.tags)?;
        let result = sqlx::query(
            "UPDATE graft_metrics
             SET experiment_id = $2, run_id = $3, name = $4, kind = $5,
                 value_numeric = $6, value_text = $7, tags = $8, ts = $9
             WHERE id = $1",
        )
        .bind(metric.id)
        .bind(&metric.experiment_id)
        .bind(&metric.run_id)
        .bind(&metric.name)
        .bind(metric.kind.as_str())
        .bind(metric.value_numeric)
        .bind(metric.value_text.as_deref())
        .bind(&tags)
        .bind(metric.ts)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("metric {}", metric.id)));
        }
        Ok(())
    }
}

fn experiment_from_row(row: &PgRow) -> StoreResult<ExperimentRecord> {
    Ok(ExperimentRecord {
        id: row.try_get("id")?,
        experiment_id: row.try_get("experiment_id")?,
        remote_experiment_id: row.try_get("remote_experiment_id")?,
        name: row.try_get("name")?,
        created: row.try_get("created")?,
        updated: row.try_get("updated")?,
        deleted: row.try_get("deleted")?,
        created_ts: row.try_get("created_ts")?,
        updated_ts: row.try_get("updated_ts")?,
    })
}

fn run_from_row(row: &PgRow) -> StoreResult<RunRecord> {
    Ok(RunRecord {
        id: row.try_get("id")?,
        experiment_id: row.try_get("experiment_id")?,
        run_id: row.try_get("run_id")?,
        remote_run_id: row.try_get("remote_run_id")?,
        created: row.try_get("created")?,
        updated: row.try_get("updated")?,
        deleted: row.try_get("deleted")?,
        reconcile_metrics: row.try_get("reconcile_metrics")?,
        created_ts: row.try_get("created_ts")?,
        updated_ts: row.try_get("updated_ts")?,
    })
}

fn metric_from_row(row: &PgRow) -> StoreResult<MetricRecord> {
    let kind: String = row.try_get("kind")?;
    let tags: serde_json::Value = row.try_get("tags")?;
    let tags: BTreeMap<String, String> = serde_json::from_value(tags)?;
    Ok(MetricRecord {
        id: row.try_get("id")?,
        experiment_id: row.try_get("experiment_id")?,
        run_id: row.try_get("run_id")?,
        name: row.try_get("name")?,
        kind: crate::model::MetricKind::parse(&kind)?,
        value_numeric: row.try_get("value_numeric")?,
        value_text: row.try_get("value_text")?,
        tags,
        ts: row.try_get("ts")?,
    })
}

fn map_sqlx_conflict(err: sqlx::Error, what: &str) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = err {
        if db_err.code().as_deref() == Some("23505") {
            return StoreError::Conflict(what.to_string());
        }
    }
    StoreError::Backend(err.to_string())
}

fn to_i64(value: usize) -> StoreResult<i64> {
    i64::try_from(value).map_err(|_| StoreError::InvalidInput("limit value too large".into()))
}
