//! PostgreSQL存储实现
//!
//! 索引列 + JSONB数据列的持久化布局; 查询全部为运行时绑定。
//! 移动按(venue, 时间)索引, 消息日志按(状态, 端点, 时间倒序)与
//! 关联ID索引, 标识符(类型, system, 值)唯一。

use crate::repository::Store;
use async_trait::async_trait;
use medbridge_core::models::{
    Diagnostic, Dossier, IdentifierKind, IdentifierRecord, MessageLogEntry, MessageStatus,
    Movement, NodeKind, Patient, ScenarioRun, ScenarioTemplate, StructureNode, Venue,
};
use medbridge_core::{BridgeError, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

fn db_err(e: sqlx::Error) -> BridgeError {
    BridgeError::Database(e.to_string())
}

fn status_str(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Pending => "PENDING",
        MessageStatus::Success => "SUCCESS",
        MessageStatus::Error => "ERROR",
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

fn from_data<T: DeserializeOwned>(row: &PgRow) -> Result<T> {
    let data: serde_json::Value = row.try_get("data").map_err(db_err)?;
    Ok(serde_json::from_value(data)?)
}

/// PostgreSQL存储
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// 创建连接池
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(db_err)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 检查数据库连接
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// 创建数据库表
    pub async fn create_tables(&self) -> Result<()> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS patients (
                id UUID PRIMARY KEY,
                data JSONB NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS dossiers (
                id UUID PRIMARY KEY,
                patient_id UUID NOT NULL,
                data JSONB NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS venues (
                id UUID PRIMARY KEY,
                dossier_id UUID NOT NULL,
                data JSONB NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS movements (
                id UUID PRIMARY KEY,
                venue_id UUID NOT NULL,
                occurred_at TIMESTAMP WITH TIME ZONE NOT NULL,
                sequence BIGINT NOT NULL,
                data JSONB NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS identifiers (
                id UUID PRIMARY KEY,
                kind VARCHAR(16) NOT NULL,
                system VARCHAR(255) NOT NULL,
                value VARCHAR(128) NOT NULL,
                subject_id UUID,
                created_at TIMESTAMP WITH TIME ZONE DEFAULT NOW(),
                UNIQUE(kind, system, value)
            )"#,
            r#"CREATE TABLE IF NOT EXISTS structure_nodes (
                id UUID PRIMARY KEY,
                kind VARCHAR(32) NOT NULL,
                code VARCHAR(64) NOT NULL,
                juridical_entity_id UUID,
                data JSONB NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS message_log (
                id UUID PRIMARY KEY,
                control_id VARCHAR(199) UNIQUE NOT NULL,
                correlation_id VARCHAR(199),
                status VARCHAR(16) NOT NULL,
                endpoint_id UUID,
                logged_at TIMESTAMP WITH TIME ZONE NOT NULL,
                data JSONB NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS scenario_templates (
                key VARCHAR(255) PRIMARY KEY,
                data JSONB NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS scenario_runs (
                id UUID PRIMARY KEY,
                template_key VARCHAR(255) NOT NULL,
                started_at TIMESTAMP WITH TIME ZONE NOT NULL,
                data JSONB NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS sequences (
                scope VARCHAR(128) PRIMARY KEY,
                value BIGINT NOT NULL
            )"#,
        ];
        for sql in statements {
            sqlx::query(sql).execute(&self.pool).await.map_err(db_err)?;
        }
        self.create_indexes().await?;
        tracing::info!("数据库表创建完成");
        Ok(())
    }

    /// 创建数据库索引
    async fn create_indexes(&self) -> Result<()> {
        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_dossiers_patient ON dossiers(patient_id)",
            "CREATE INDEX IF NOT EXISTS idx_venues_dossier ON venues(dossier_id)",
            "CREATE INDEX IF NOT EXISTS idx_movements_venue_time ON movements(venue_id, occurred_at)",
            "CREATE INDEX IF NOT EXISTS idx_identifiers_lookup ON identifiers(kind, value)",
            "CREATE INDEX IF NOT EXISTS idx_nodes_kind_code ON structure_nodes(kind, code)",
            "CREATE INDEX IF NOT EXISTS idx_log_status_endpoint ON message_log(status, endpoint_id, logged_at DESC)",
            "CREATE INDEX IF NOT EXISTS idx_log_correlation ON message_log(correlation_id)",
            "CREATE INDEX IF NOT EXISTS idx_runs_template ON scenario_runs(template_key)",
        ];
        for sql in indexes {
            sqlx::query(sql).execute(&self.pool).await.map_err(db_err)?;
        }
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn insert_patient(&self, patient: Patient) -> Result<()> {
        sqlx::query("INSERT INTO patients (id, data) VALUES ($1, $2)")
            .bind(patient.id)
            .bind(to_json(&patient)?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn update_patient(&self, patient: Patient) -> Result<()> {
        let result = sqlx::query("UPDATE patients SET data = $2 WHERE id = $1")
            .bind(patient.id)
            .bind(to_json(&patient)?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(BridgeError::PatientNotFound(patient.id.to_string()));
        }
        Ok(())
    }

    async fn get_patient(&self, id: Uuid) -> Result<Option<Patient>> {
        let row = sqlx::query("SELECT data FROM patients WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| from_data(&r)).transpose()
    }

    async fn insert_dossier(&self, dossier: Dossier) -> Result<()> {
        sqlx::query("INSERT INTO dossiers (id, patient_id, data) VALUES ($1, $2, $3)")
            .bind(dossier.id)
            .bind(dossier.patient_id)
            .bind(to_json(&dossier)?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn update_dossier(&self, dossier: Dossier) -> Result<()> {
        let result = sqlx::query("UPDATE dossiers SET patient_id = $2, data = $3 WHERE id = $1")
            .bind(dossier.id)
            .bind(dossier.patient_id)
            .bind(to_json(&dossier)?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(BridgeError::NotFound(format!("dossier {}", dossier.id)));
        }
        Ok(())
    }

    async fn get_dossier(&self, id: Uuid) -> Result<Option<Dossier>> {
        let row = sqlx::query("SELECT data FROM dossiers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| from_data(&r)).transpose()
    }

    async fn dossiers_of_patient(&self, patient_id: Uuid) -> Result<Vec<Dossier>> {
        let rows = sqlx::query("SELECT data FROM dossiers WHERE patient_id = $1")
            .bind(patient_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(from_data).collect()
    }

    async fn delete_dossier(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(
            "DELETE FROM movements WHERE venue_id IN (SELECT id FROM venues WHERE dossier_id = $1)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query("DELETE FROM venues WHERE dossier_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM dossiers WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn insert_venue(&self, venue: Venue) -> Result<()> {
        sqlx::query("INSERT INTO venues (id, dossier_id, data) VALUES ($1, $2, $3)")
            .bind(venue.id)
            .bind(venue.dossier_id)
            .bind(to_json(&venue)?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn update_venue(&self, venue: Venue) -> Result<()> {
        let result = sqlx::query("UPDATE venues SET data = $2 WHERE id = $1")
            .bind(venue.id)
            .bind(to_json(&venue)?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(BridgeError::VenueNotFound(venue.id.to_string()));
        }
        Ok(())
    }

    async fn get_venue(&self, id: Uuid) -> Result<Option<Venue>> {
        let row = sqlx::query("SELECT data FROM venues WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| from_data(&r)).transpose()
    }

    async fn venues_of_dossier(&self, dossier_id: Uuid) -> Result<Vec<Venue>> {
        let rows = sqlx::query("SELECT data FROM venues WHERE dossier_id = $1")
            .bind(dossier_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        let mut venues: Vec<Venue> = rows
            .iter()
            .map(from_data)
            .collect::<Result<Vec<Venue>>>()?;
        venues.sort_by_key(|v| v.sequence);
        Ok(venues)
    }

    async fn insert_movement(&self, movement: Movement) -> Result<()> {
        sqlx::query(
            "INSERT INTO movements (id, venue_id, occurred_at, sequence, data) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(movement.id)
        .bind(movement.venue_id)
        .bind(movement.when)
        .bind(movement.sequence)
        .bind(to_json(&movement)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_movement(&self, movement: Movement) -> Result<()> {
        let result = sqlx::query("UPDATE movements SET occurred_at = $2, data = $3 WHERE id = $1")
            .bind(movement.id)
            .bind(movement.when)
            .bind(to_json(&movement)?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(BridgeError::NotFound(format!("movement {}", movement.id)));
        }
        Ok(())
    }

    async fn movements_of_venue(&self, venue_id: Uuid) -> Result<Vec<Movement>> {
        let rows = sqlx::query(
            "SELECT data FROM movements WHERE venue_id = $1 ORDER BY occurred_at ASC, sequence ASC",
        )
        .bind(venue_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(from_data).collect()
    }

    async fn insert_identifier(&self, record: IdentifierRecord) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO identifiers (id, kind, system, value, subject_id, created_at) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(record.id)
        .bind(record.kind.as_str())
        .bind(&record.system)
        .bind(&record.value)
        .bind(record.subject_id)
        .bind(record.created_at)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let unique_violation = e
                    .as_database_error()
                    .and_then(|d| d.code())
                    .map(|c| c == "23505")
                    .unwrap_or(false);
                if unique_violation {
                    Err(BridgeError::IdentifierCollision(format!(
                        "{}/{}/{}",
                        record.kind.as_str(),
                        record.system,
                        record.value
                    )))
                } else {
                    Err(db_err(e))
                }
            }
        }
    }

    async fn identifier_exists(
        &self,
        kind: IdentifierKind,
        system: &str,
        value: &str,
    ) -> Result<bool> {
        let row = sqlx::query(
            "SELECT 1 AS one FROM identifiers WHERE kind = $1 AND system = $2 AND value = $3",
        )
        .bind(kind.as_str())
        .bind(system)
        .bind(value)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.is_some())
    }

    async fn find_identifier_subject(
        &self,
        kind: IdentifierKind,
        value: &str,
    ) -> Result<Option<Uuid>> {
        let row = sqlx::query(
            "SELECT subject_id FROM identifiers WHERE kind = $1 AND value = $2 LIMIT 1",
        )
        .bind(kind.as_str())
        .bind(value)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(row.and_then(|r| r.try_get::<Option<Uuid>, _>("subject_id").ok().flatten()))
    }

    async fn upsert_node(&self, node: StructureNode) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO structure_nodes (id, kind, code, juridical_entity_id, data)
               VALUES ($1, $2, $3, $4, $5)
               ON CONFLICT (id) DO UPDATE
               SET kind = $2, code = $3, juridical_entity_id = $4, data = $5"#,
        )
        .bind(node.id)
        .bind(node.kind.as_str())
        .bind(&node.code)
        .bind(node.juridical_entity_id)
        .bind(to_json(&node)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_node(&self, id: Uuid) -> Result<Option<StructureNode>> {
        let row = sqlx::query("SELECT data FROM structure_nodes WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| from_data(&r)).transpose()
    }

    async fn find_nodes(
        &self,
        kind: NodeKind,
        code: &str,
        juridical_entity_id: Option<Uuid>,
    ) -> Result<Vec<StructureNode>> {
        let rows = match juridical_entity_id {
            Some(ej) => sqlx::query(
                r#"SELECT data FROM structure_nodes
                   WHERE kind = $1 AND code = $2 AND (juridical_entity_id = $3 OR id = $3)"#,
            )
            .bind(kind.as_str())
            .bind(code)
            .bind(ej)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?,
            None => sqlx::query("SELECT data FROM structure_nodes WHERE kind = $1 AND code = $2")
                .bind(kind.as_str())
                .bind(code)
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?,
        };
        rows.iter().map(from_data).collect()
    }

    async fn append_log(&self, entry: MessageLogEntry) -> Result<()> {
        let result = sqlx::query(
            r#"INSERT INTO message_log (id, control_id, correlation_id, status, endpoint_id, logged_at, data)
               VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(entry.id)
        .bind(&entry.control_id)
        .bind(&entry.correlation_id)
        .bind(status_str(entry.status))
        .bind(entry.endpoint_id)
        .bind(entry.timestamp)
        .bind(to_json(&entry)?)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let unique_violation = e
                    .as_database_error()
                    .and_then(|d| d.code())
                    .map(|c| c == "23505")
                    .unwrap_or(false);
                if unique_violation {
                    Err(BridgeError::DuplicateControlId(entry.control_id))
                } else {
                    Err(db_err(e))
                }
            }
        }
    }

    async fn set_log_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        diagnostics: Vec<Diagnostic>,
    ) -> Result<()> {
        let row = sqlx::query("SELECT data FROM message_log WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or_else(|| BridgeError::NotFound(format!("log entry {id}")))?;
        let mut entry: MessageLogEntry = from_data(&row)?;
        if entry.status != MessageStatus::Pending {
            return Err(BridgeError::Internal(format!(
                "log entry {id} already transitioned to {:?}",
                entry.status
            )));
        }
        entry.status = status;
        entry.diagnostics.extend(diagnostics);

        let result = sqlx::query(
            "UPDATE message_log SET status = $2, data = $3 WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(id)
        .bind(status_str(status))
        .bind(to_json(&entry)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(BridgeError::ConcurrentModification(format!(
                "log entry {id}"
            )));
        }
        Ok(())
    }

    async fn find_log_by_control_id(&self, control_id: &str) -> Result<Option<MessageLogEntry>> {
        let row = sqlx::query("SELECT data FROM message_log WHERE control_id = $1")
            .bind(control_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| from_data(&r)).transpose()
    }

    async fn logs_by_correlation(&self, correlation_id: &str) -> Result<Vec<MessageLogEntry>> {
        let rows = sqlx::query(
            "SELECT data FROM message_log WHERE correlation_id = $1 ORDER BY logged_at ASC",
        )
        .bind(correlation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;
        rows.iter().map(from_data).collect()
    }

    async fn insert_template(&self, template: ScenarioTemplate) -> Result<()> {
        let result = sqlx::query("INSERT INTO scenario_templates (key, data) VALUES ($1, $2)")
            .bind(&template.key)
            .bind(to_json(&template)?)
            .execute(&self.pool)
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let unique_violation = e
                    .as_database_error()
                    .and_then(|d| d.code())
                    .map(|c| c == "23505")
                    .unwrap_or(false);
                if unique_violation {
                    Err(BridgeError::Validation(format!(
                        "template key {:?} already exists",
                        template.key
                    )))
                } else {
                    Err(db_err(e))
                }
            }
        }
    }

    async fn get_template(&self, key: &str) -> Result<Option<ScenarioTemplate>> {
        let row = sqlx::query("SELECT data FROM scenario_templates WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| from_data(&r)).transpose()
    }

    async fn delete_template(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM scenario_templates WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_templates(&self) -> Result<Vec<ScenarioTemplate>> {
        let rows = sqlx::query("SELECT data FROM scenario_templates ORDER BY key ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.iter().map(from_data).collect()
    }

    async fn insert_run(&self, run: ScenarioRun) -> Result<()> {
        sqlx::query(
            "INSERT INTO scenario_runs (id, template_key, started_at, data) VALUES ($1, $2, $3, $4)",
        )
        .bind(run.id)
        .bind(&run.template_key)
        .bind(run.started_at)
        .bind(to_json(&run)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn update_run(&self, run: ScenarioRun) -> Result<()> {
        let result = sqlx::query("UPDATE scenario_runs SET data = $2 WHERE id = $1")
            .bind(run.id)
            .bind(to_json(&run)?)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(BridgeError::NotFound(format!("run {}", run.id)));
        }
        Ok(())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<ScenarioRun>> {
        let row = sqlx::query("SELECT data FROM scenario_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|r| from_data(&r)).transpose()
    }

    async fn list_runs(&self, template_key: Option<&str>) -> Result<Vec<ScenarioRun>> {
        let rows = match template_key {
            Some(key) => sqlx::query(
                "SELECT data FROM scenario_runs WHERE template_key = $1 ORDER BY started_at ASC",
            )
            .bind(key)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?,
            None => sqlx::query("SELECT data FROM scenario_runs ORDER BY started_at ASC")
                .fetch_all(&self.pool)
                .await
                .map_err(db_err)?,
        };
        rows.iter().map(from_data).collect()
    }

    async fn next_sequence(&self, scope: &str) -> Result<i64> {
        let row = sqlx::query(
            r#"INSERT INTO sequences (scope, value) VALUES ($1, 1)
               ON CONFLICT (scope) DO UPDATE SET value = sequences.value + 1
               RETURNING value"#,
        )
        .bind(scope)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;
        row.try_get::<i64, _>("value").map_err(db_err)
    }
}
