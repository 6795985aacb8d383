//! 복구에 필요한 영속 상태
//!
//! - `GlobalEventState`: 클러스터별 마지막 체크포인트 위치와 정상 종료 여부
//! - `SchemaEventState`: 미러에 적용 중인 DDL (Pending은 클러스터당 최대 하나)
//! - 토픽별 발행 offset
//! - 미러 스키마 스냅샷
//!
//! 각 쓰기는 개별적으로 원자적이면 됩니다. 레코드 사이의 부분 완료는 복구
//! 단계에서 정리합니다.

use crate::config::ConnectionConfig;
use crate::error::{CdcError, Result};
use crate::position::PositionData;
use crate::schema_tracker::SchemaDump;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use mysql_async::prelude::*;
use mysql_async::{Pool, Row};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaEventStatus {
    Pending,
    Completed,
}

impl SchemaEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaEventStatus::Pending => "Pending",
            SchemaEventStatus::Completed => "Completed",
        }
    }
}

impl TryFrom<&str> for SchemaEventStatus {
    type Error = CdcError;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "Pending" => Ok(SchemaEventStatus::Pending),
            "Completed" => Ok(SchemaEventStatus::Completed),
            other => Err(CdcError::BadSchemaEventState(other.to_string())),
        }
    }
}

impl fmt::Display for SchemaEventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 미러에 적용 중인 DDL 기록
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaEventState {
    pub id: u64,
    pub cluster_name: String,
    pub database: String,
    pub table_name: String,
    /// 저장된 그대로의 상태 문자열
    pub status: String,
    pub statement_text: String,
    /// DDL 적용 전 CREATE 문. 테이블이 없었으면 빈 문자열
    pub create_table_statement: String,
    /// DDL 직전 이벤트의 위치. 여기서 다시 읽으면 DDL이 다시 나온다
    pub position: PositionData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SchemaEventState {
    pub fn status(&self) -> Result<SchemaEventStatus> {
        SchemaEventStatus::try_from(self.status.as_str())
    }
}

/// 새 Pending 레코드
#[derive(Debug, Clone, PartialEq)]
pub struct NewSchemaEvent {
    pub cluster_name: String,
    pub database: String,
    pub table_name: String,
    pub statement_text: String,
    pub create_table_statement: String,
    pub position: PositionData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Schema,
    Data,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Schema => "schema",
            EventKind::Data => "data",
        }
    }
}

impl TryFrom<&str> for EventKind {
    type Error = CdcError;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "schema" => Ok(EventKind::Schema),
            "data" => Ok(EventKind::Data),
            other => Err(CdcError::StateStore(format!("unknown event kind: {}", other))),
        }
    }
}

/// 클러스터별 마지막 체크포인트
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalEventState {
    pub cluster_name: String,
    pub position: PositionData,
    pub event_kind: EventKind,
    pub is_clean_shutdown: bool,
    pub database: Option<String>,
    pub table_name: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn global_state(&self, cluster: &str) -> Result<Option<GlobalEventState>>;

    async fn upsert_global_state(&self, state: &GlobalEventState) -> Result<()>;

    async fn set_clean_shutdown(&self, cluster: &str, clean: bool) -> Result<()>;

    /// 가장 최근 스키마 이벤트 레코드 (상태와 무관)
    async fn latest_schema_event(&self, cluster: &str) -> Result<Option<SchemaEventState>>;

    async fn create_pending_schema_event(&self, event: NewSchemaEvent) -> Result<SchemaEventState>;

    async fn delete_schema_event(&self, id: u64) -> Result<()>;

    async fn data_checkpoints(&self, cluster: &str) -> Result<HashMap<String, u64>>;

    async fn upsert_data_checkpoints(&self, cluster: &str, offsets: &HashMap<String, u64>) -> Result<()>;

    async fn schema_dump(&self, cluster: &str) -> Result<Option<SchemaDump>>;

    async fn save_schema_dump(&self, cluster: &str, dump: &SchemaDump) -> Result<()>;

    async fn delete_schema_dump(&self, cluster: &str) -> Result<()>;
}

#[derive(Default)]
struct MemoryState {
    global: HashMap<String, GlobalEventState>,
    schema_events: Vec<SchemaEventState>,
    next_schema_event_id: u64,
    checkpoints: HashMap<String, HashMap<String, u64>>,
    dumps: HashMap<String, SchemaDump>,
}

/// 메모리 저장소 (dry run, 테스트)
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<MemoryState>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        MemoryStateStore::default()
    }

    /// 임의의 스키마 이벤트 레코드를 넣는다
    pub fn insert_schema_event(&self, mut event: SchemaEventState) -> u64 {
        let mut state = self.inner.lock();
        state.next_schema_event_id += 1;
        event.id = state.next_schema_event_id;
        state.schema_events.push(event);
        state.next_schema_event_id
    }

    pub fn schema_event_count(&self) -> usize {
        self.inner.lock().schema_events.len()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn global_state(&self, cluster: &str) -> Result<Option<GlobalEventState>> {
        Ok(self.inner.lock().global.get(cluster).cloned())
    }

    async fn upsert_global_state(&self, state: &GlobalEventState) -> Result<()> {
        self.inner
            .lock()
            .global
            .insert(state.cluster_name.clone(), state.clone());
        Ok(())
    }

    async fn set_clean_shutdown(&self, cluster: &str, clean: bool) -> Result<()> {
        if let Some(state) = self.inner.lock().global.get_mut(cluster) {
            state.is_clean_shutdown = clean;
            state.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn latest_schema_event(&self, cluster: &str) -> Result<Option<SchemaEventState>> {
        Ok(self
            .inner
            .lock()
            .schema_events
            .iter()
            .filter(|e| e.cluster_name == cluster)
            .max_by_key(|e| e.id)
            .cloned())
    }

    async fn create_pending_schema_event(&self, event: NewSchemaEvent) -> Result<SchemaEventState> {
        let mut state = self.inner.lock();
        if state
            .schema_events
            .iter()
            .any(|e| e.cluster_name == event.cluster_name && e.status == SchemaEventStatus::Pending.as_str())
        {
            return Err(CdcError::StateStore(format!(
                "a pending schema event already exists for {}",
                event.cluster_name
            )));
        }

        state.next_schema_event_id += 1;
        let now = Utc::now();
        let record = SchemaEventState {
            id: state.next_schema_event_id,
            cluster_name: event.cluster_name,
            database: event.database,
            table_name: event.table_name,
            status: SchemaEventStatus::Pending.as_str().to_string(),
            statement_text: event.statement_text,
            create_table_statement: event.create_table_statement,
            position: event.position,
            created_at: now,
            updated_at: now,
        };
        state.schema_events.push(record.clone());
        Ok(record)
    }

    async fn delete_schema_event(&self, id: u64) -> Result<()> {
        self.inner.lock().schema_events.retain(|e| e.id != id);
        Ok(())
    }

    async fn data_checkpoints(&self, cluster: &str) -> Result<HashMap<String, u64>> {
        Ok(self
            .inner
            .lock()
            .checkpoints
            .get(cluster)
            .cloned()
            .unwrap_or_default())
    }

    async fn upsert_data_checkpoints(&self, cluster: &str, offsets: &HashMap<String, u64>) -> Result<()> {
        let mut state = self.inner.lock();
        let entry = state.checkpoints.entry(cluster.to_string()).or_default();
        for (topic, offset) in offsets {
            entry.insert(topic.clone(), *offset);
        }
        Ok(())
    }

    async fn schema_dump(&self, cluster: &str) -> Result<Option<SchemaDump>> {
        Ok(self.inner.lock().dumps.get(cluster).cloned())
    }

    async fn save_schema_dump(&self, cluster: &str, dump: &SchemaDump) -> Result<()> {
        self.inner.lock().dumps.insert(cluster.to_string(), dump.clone());
        Ok(())
    }

    async fn delete_schema_dump(&self, cluster: &str) -> Result<()> {
        self.inner.lock().dumps.remove(cluster);
        Ok(())
    }
}

const STATE_TABLES: [&str; 4] = [
    "CREATE TABLE IF NOT EXISTS global_event_state (
        cluster_name VARCHAR(255) NOT NULL PRIMARY KEY,
        position TEXT NOT NULL,
        event_type VARCHAR(16) NOT NULL,
        is_clean_shutdown TINYINT(1) NOT NULL DEFAULT 0,
        database_name VARCHAR(255) NULL,
        table_name VARCHAR(255) NULL,
        time_updated BIGINT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS schema_event_state (
        id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
        cluster_name VARCHAR(255) NOT NULL,
        database_name VARCHAR(255) NOT NULL,
        table_name VARCHAR(255) NOT NULL,
        status VARCHAR(16) NOT NULL,
        position TEXT NOT NULL,
        statement_text MEDIUMTEXT NOT NULL,
        create_table_statement MEDIUMTEXT NOT NULL,
        time_created BIGINT NOT NULL,
        time_updated BIGINT NOT NULL,
        KEY idx_cluster_status (cluster_name, status)
    )",
    "CREATE TABLE IF NOT EXISTS data_event_checkpoint (
        cluster_name VARCHAR(255) NOT NULL,
        topic VARCHAR(255) NOT NULL,
        last_offset BIGINT UNSIGNED NOT NULL,
        time_updated BIGINT NOT NULL,
        PRIMARY KEY (cluster_name, topic)
    )",
    "CREATE TABLE IF NOT EXISTS mysql_dumps (
        cluster_name VARCHAR(255) NOT NULL PRIMARY KEY,
        dump LONGTEXT NOT NULL,
        time_updated BIGINT NOT NULL
    )",
];

/// MySQL 상태 저장소
pub struct MySqlStateStore {
    pool: Pool,
}

impl MySqlStateStore {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let store = MySqlStateStore {
            pool: Pool::new(config.build_opts()),
        };
        store.ensure_tables().await?;
        Ok(store)
    }

    async fn ensure_tables(&self) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        for ddl in STATE_TABLES {
            conn.query_drop(ddl).await?;
        }
        debug!("State tables ready");
        Ok(())
    }

    pub async fn disconnect(self) -> Result<()> {
        self.pool.disconnect().await?;
        Ok(())
    }
}

fn encode_position(position: &PositionData) -> Result<String> {
    Ok(serde_json::to_string(position)?)
}

fn decode_position(text: &str) -> Result<PositionData> {
    Ok(serde_json::from_str(text)?)
}

fn from_epoch(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).single().unwrap_or_default()
}

fn required<T: FromValue>(row: &Row, column: &str) -> Result<T> {
    row.get_opt::<T, &str>(column)
        .and_then(|value| value.ok())
        .ok_or_else(|| CdcError::StateStore(format!("missing or invalid column {}", column)))
}

fn optional<T: FromValue>(row: &Row, column: &str) -> Option<T> {
    row.get_opt::<T, &str>(column).and_then(|value| value.ok())
}

fn schema_event_from_row(row: &Row) -> Result<SchemaEventState> {
    Ok(SchemaEventState {
        id: required(row, "id")?,
        cluster_name: required(row, "cluster_name")?,
        database: required(row, "database_name")?,
        table_name: required(row, "table_name")?,
        status: required(row, "status")?,
        statement_text: required(row, "statement_text")?,
        create_table_statement: required(row, "create_table_statement")?,
        position: decode_position(&required::<String>(row, "position")?)?,
        created_at: from_epoch(required(row, "time_created")?),
        updated_at: from_epoch(required(row, "time_updated")?),
    })
}

#[async_trait]
impl StateStore for MySqlStateStore {
    async fn global_state(&self, cluster: &str) -> Result<Option<GlobalEventState>> {
        let mut conn = self.pool.get_conn().await?;
        let row: Option<Row> = conn
            .exec_first(
                "SELECT position, event_type, is_clean_shutdown, database_name, table_name, time_updated \
                 FROM global_event_state WHERE cluster_name = ?",
                (cluster,),
            )
            .await?;

        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };
        let event_type: String = required(&row, "event_type")?;
        Ok(Some(GlobalEventState {
            cluster_name: cluster.to_string(),
            position: decode_position(&required::<String>(&row, "position")?)?,
            event_kind: EventKind::try_from(event_type.as_str())?,
            is_clean_shutdown: required::<i64>(&row, "is_clean_shutdown")? != 0,
            database: optional(&row, "database_name"),
            table_name: optional(&row, "table_name"),
            updated_at: from_epoch(required(&row, "time_updated")?),
        }))
    }

    async fn upsert_global_state(&self, state: &GlobalEventState) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop(
            "INSERT INTO global_event_state \
             (cluster_name, position, event_type, is_clean_shutdown, database_name, table_name, time_updated) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE position = VALUES(position), event_type = VALUES(event_type), \
             is_clean_shutdown = VALUES(is_clean_shutdown), database_name = VALUES(database_name), \
             table_name = VALUES(table_name), time_updated = VALUES(time_updated)",
            (
                state.cluster_name.as_str(),
                encode_position(&state.position)?,
                state.event_kind.as_str(),
                state.is_clean_shutdown,
                state.database.as_deref(),
                state.table_name.as_deref(),
                state.updated_at.timestamp(),
            ),
        )
        .await?;
        Ok(())
    }

    async fn set_clean_shutdown(&self, cluster: &str, clean: bool) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop(
            "UPDATE global_event_state SET is_clean_shutdown = ?, time_updated = ? WHERE cluster_name = ?",
            (clean, Utc::now().timestamp(), cluster),
        )
        .await?;
        Ok(())
    }

    async fn latest_schema_event(&self, cluster: &str) -> Result<Option<SchemaEventState>> {
        let mut conn = self.pool.get_conn().await?;
        let row: Option<Row> = conn
            .exec_first(
                "SELECT * FROM schema_event_state WHERE cluster_name = ? ORDER BY id DESC LIMIT 1",
                (cluster,),
            )
            .await?;
        row.map(|row| schema_event_from_row(&row)).transpose()
    }

    async fn create_pending_schema_event(&self, event: NewSchemaEvent) -> Result<SchemaEventState> {
        let mut conn = self.pool.get_conn().await?;
        let mut tx = conn.start_transaction(mysql_async::TxOpts::default()).await?;

        let existing: Option<(u64,)> = tx
            .exec_first(
                "SELECT id FROM schema_event_state WHERE cluster_name = ? AND status = ? FOR UPDATE",
                (event.cluster_name.as_str(), SchemaEventStatus::Pending.as_str()),
            )
            .await?;
        if let Some((id,)) = existing {
            return Err(CdcError::StateStore(format!(
                "pending schema event {} already exists for {}",
                id, event.cluster_name
            )));
        }

        let now = Utc::now();
        tx.exec_drop(
            "INSERT INTO schema_event_state \
             (cluster_name, database_name, table_name, status, position, statement_text, \
              create_table_statement, time_created, time_updated) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                event.cluster_name.as_str(),
                event.database.as_str(),
                event.table_name.as_str(),
                SchemaEventStatus::Pending.as_str(),
                encode_position(&event.position)?,
                event.statement_text.as_str(),
                event.create_table_statement.as_str(),
                now.timestamp(),
                now.timestamp(),
            ),
        )
        .await?;
        let id = tx
            .last_insert_id()
            .ok_or_else(|| CdcError::StateStore("no id for schema event".to_string()))?;
        tx.commit().await?;

        let now = from_epoch(now.timestamp());
        Ok(SchemaEventState {
            id,
            cluster_name: event.cluster_name,
            database: event.database,
            table_name: event.table_name,
            status: SchemaEventStatus::Pending.as_str().to_string(),
            statement_text: event.statement_text,
            create_table_statement: event.create_table_statement,
            position: event.position,
            created_at: now,
            updated_at: now,
        })
    }

    async fn delete_schema_event(&self, id: u64) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop("DELETE FROM schema_event_state WHERE id = ?", (id,))
            .await?;
        Ok(())
    }

    async fn data_checkpoints(&self, cluster: &str) -> Result<HashMap<String, u64>> {
        let mut conn = self.pool.get_conn().await?;
        let rows: Vec<(String, u64)> = conn
            .exec(
                "SELECT topic, last_offset FROM data_event_checkpoint WHERE cluster_name = ?",
                (cluster,),
            )
            .await?;
        Ok(rows.into_iter().collect())
    }

    async fn upsert_data_checkpoints(&self, cluster: &str, offsets: &HashMap<String, u64>) -> Result<()> {
        if offsets.is_empty() {
            return Ok(());
        }
        let now = Utc::now().timestamp();
        let mut conn = self.pool.get_conn().await?;
        let mut tx = conn.start_transaction(mysql_async::TxOpts::default()).await?;
        tx.exec_batch(
            "INSERT INTO data_event_checkpoint (cluster_name, topic, last_offset, time_updated) \
             VALUES (?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE last_offset = VALUES(last_offset), time_updated = VALUES(time_updated)",
            offsets
                .iter()
                .map(|(topic, offset)| (cluster, topic.as_str(), *offset, now)),
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn schema_dump(&self, cluster: &str) -> Result<Option<SchemaDump>> {
        let mut conn = self.pool.get_conn().await?;
        let dump: Option<(String,)> = conn
            .exec_first("SELECT dump FROM mysql_dumps WHERE cluster_name = ?", (cluster,))
            .await?;
        dump.map(|(text,)| SchemaDump::from_json(&text)).transpose()
    }

    async fn save_schema_dump(&self, cluster: &str, dump: &SchemaDump) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop(
            "INSERT INTO mysql_dumps (cluster_name, dump, time_updated) VALUES (?, ?, ?) \
             ON DUPLICATE KEY UPDATE dump = VALUES(dump), time_updated = VALUES(time_updated)",
            (cluster, dump.to_json()?, Utc::now().timestamp()),
        )
        .await?;
        Ok(())
    }

    async fn delete_schema_dump(&self, cluster: &str) -> Result<()> {
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop("DELETE FROM mysql_dumps WHERE cluster_name = ?", (cluster,))
            .await?;
        Ok(())
    }
}
