//! Postgres-backed timer store and data-object provider.
//!
//! Uses runtime-checked queries so the crate builds without a live database.
//! `ensure_schema` creates the two tables when missing.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::providers::{DataObjectProvider, TimerStoreProvider};
use crate::types::{Timestamp, TimerRecord};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS bpmn_actor_timers (
        actor_address TEXT NOT NULL,
        instance_id   UUID NOT NULL,
        fire_at       BIGINT NOT NULL,
        PRIMARY KEY (actor_address, instance_id, fire_at)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS bpmn_actor_timers_due
        ON bpmn_actor_timers (actor_address, fire_at)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS bpmn_actor_data_objects (
        process_id  TEXT NOT NULL,
        object_id   TEXT NOT NULL,
        instance_id UUID NOT NULL,
        value       JSONB NOT NULL,
        updated_at  TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (process_id, object_id, instance_id)
    )
    "#,
];

pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(*statement)
            .execute(pool)
            .await
            .context("Failed to create bpmn-actor schema")?;
    }
    Ok(())
}

// ─── Timer store ──────────────────────────────────────────────

pub struct PgTimerStore {
    pool: PgPool,
}

impl PgTimerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TimerStoreProvider for PgTimerStore {
    async fn save(&self, record: &TimerRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bpmn_actor_timers (actor_address, instance_id, fire_at)
            VALUES ($1, $2, $3)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(&record.actor_address)
        .bind(record.instance_id)
        .bind(record.fire_at)
        .execute(&self.pool)
        .await
        .context("Failed to save timer record")?;
        Ok(())
    }

    async fn load_due(&self, actor_address: &str, now: Timestamp) -> Result<Vec<TimerRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT actor_address, instance_id, fire_at
            FROM bpmn_actor_timers
            WHERE actor_address = $1 AND fire_at <= $2
            ORDER BY fire_at ASC
            "#,
        )
        .bind(actor_address)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load due timers")?;

        rows.iter()
            .map(|row| {
                Ok(TimerRecord {
                    actor_address: row.try_get("actor_address")?,
                    instance_id: row.try_get("instance_id")?,
                    fire_at: row.try_get("fire_at")?,
                })
            })
            .collect()
    }

    async fn delete(&self, actor_address: &str, instance_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM bpmn_actor_timers WHERE actor_address = $1 AND instance_id = $2")
            .bind(actor_address)
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete timer record")?;
        Ok(())
    }
}

// ─── Data objects ─────────────────────────────────────────────

pub struct PgDataObjects {
    pool: PgPool,
}

impl PgDataObjects {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DataObjectProvider for PgDataObjects {
    async fn save(
        &self,
        process_id: &str,
        object_id: &str,
        instance_id: Uuid,
        value: &Value,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bpmn_actor_data_objects (process_id, object_id, instance_id, value)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (process_id, object_id, instance_id)
            DO UPDATE SET value = EXCLUDED.value, updated_at = now()
            "#,
        )
        .bind(process_id)
        .bind(object_id)
        .bind(instance_id)
        .bind(Json(value))
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save data object {object_id}"))?;
        Ok(())
    }

    async fn load(
        &self,
        process_id: &str,
        object_id: &str,
        instance_id: Uuid,
    ) -> Result<Option<Value>> {
        let row = sqlx::query(
            r#"
            SELECT value FROM bpmn_actor_data_objects
            WHERE process_id = $1 AND object_id = $2 AND instance_id = $3
            "#,
        )
        .bind(process_id)
        .bind(object_id)
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("Failed to load data object {object_id}"))?;

        match row {
            Some(row) => {
                let Json(value): Json<Value> = row.try_get("value")?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, process_id: &str, object_id: &str, instance_id: Uuid) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM bpmn_actor_data_objects
            WHERE process_id = $1 AND object_id = $2 AND instance_id = $3
            "#,
        )
        .bind(process_id)
        .bind(object_id)
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to delete data object {object_id}"))?;
        Ok(())
    }
}
