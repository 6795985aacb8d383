//! MySQL 데이터베이스 연결 관리

use crate::config::ConnectionConfig;
use crate::error::{CdcError, Result};
use crate::gtid::GtidSet;
use crate::schema_tracker::MirrorConnection;
use crate::statement::{quote_identifier, TableName};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Row};
use tracing::{debug, info};

/// MySQL 연결 래퍼
pub struct MySqlConnection {
    conn: Conn,
    config: ConnectionConfig,
}

impl MySqlConnection {
    pub async fn connect(config: &ConnectionConfig) -> Result<Self> {
        let conn = Self::open(config).await?;
        Ok(MySqlConnection {
            conn,
            config: config.clone(),
        })
    }

    async fn open(config: &ConnectionConfig) -> Result<Conn> {
        let connect = Conn::new(config.build_opts());
        match tokio::time::timeout(config.timeout, connect).await {
            Ok(conn) => conn.map_err(|e| {
                CdcError::ConnectionError(format!(
                    "Failed to connect to MySQL {}:{}: {}",
                    config.hostname, config.port, e
                ))
            }),
            Err(_) => Err(CdcError::Timeout),
        }
    }

    /// 내부 연결 (락, 상태 저장소에서 사용)
    pub(crate) fn conn_mut(&mut self) -> &mut Conn {
        &mut self.conn
    }

    /// Binlog 상태 조회
    ///
    /// MySQL 8.4부터는 `SHOW MASTER STATUS`가 없어졌고, 그 이전 버전에는
    /// `SHOW BINARY LOG STATUS`가 없다.
    pub async fn get_binlog_status(&mut self) -> Result<BinlogStatus> {
        let status = match self.query_binlog_status("SHOW BINARY LOG STATUS").await {
            Ok(status) => status,
            Err(e) => {
                debug!("SHOW BINARY LOG STATUS failed ({}), trying SHOW MASTER STATUS", e);
                self.query_binlog_status("SHOW MASTER STATUS").await?
            }
        };

        status.ok_or_else(|| {
            CdcError::QueryError("No binlog status available (is log_bin enabled?)".to_string())
        })
    }

    async fn query_binlog_status(&mut self, query: &str) -> Result<Option<BinlogStatus>> {
        let row: Option<Row> = self.conn.query_first(query).await?;
        let row = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let file: String = column(&row, 0)
            .ok_or_else(|| CdcError::QueryError("binlog status without File".to_string()))?;
        let position: u64 = column(&row, 1)
            .ok_or_else(|| CdcError::QueryError("binlog status without Position".to_string()))?;
        let executed_gtid_set = match column::<String>(&row, 4) {
            Some(set) if !set.trim().is_empty() => GtidSet::parse(&set)?,
            _ => GtidSet::new(),
        };

        Ok(Some(BinlogStatus {
            file,
            position,
            executed_gtid_set,
        }))
    }

    /// GTID 모드 활성 여부 확인
    pub async fn is_gtid_mode_enabled(&mut self) -> Result<bool> {
        Ok(self
            .get_variable("gtid_mode")
            .await?
            .map(|mode| mode.eq_ignore_ascii_case("ON"))
            .unwrap_or(false))
    }

    /// 현재 실행된 GTID 집합 조회
    pub async fn get_executed_gtid_set(&mut self) -> Result<GtidSet> {
        let result: Option<(String,)> = self.conn.query_first("SELECT @@global.gtid_executed").await?;

        match result {
            Some((set,)) if !set.trim().is_empty() => GtidSet::parse(&set),
            _ => Ok(GtidSet::new()),
        }
    }

    /// 소스 서버의 UUID (GTID의 source id)
    pub async fn get_server_uuid(&mut self) -> Result<String> {
        let result: Option<(String,)> = self.conn.query_first("SELECT @@server_uuid").await?;
        result
            .map(|(uuid,)| uuid)
            .ok_or_else(|| CdcError::QueryError("server_uuid not available".to_string()))
    }

    /// 변수 조회
    pub async fn get_variable(&mut self, name: &str) -> Result<Option<String>> {
        let result: Option<(String, String)> = self
            .conn
            .exec_first("SHOW GLOBAL VARIABLES LIKE ?", (name,))
            .await?;

        Ok(result.map(|(_, v)| v))
    }

    /// Binlog 형식 확인 (ROW, STATEMENT, MIXED)
    pub async fn get_binlog_format(&mut self) -> Result<String> {
        self.get_variable("binlog_format")
            .await?
            .ok_or_else(|| CdcError::QueryError("Binlog format not found".to_string()))
    }

    /// 서버에 남아 있는 binlog 파일 목록
    pub async fn get_log_files(&mut self) -> Result<Vec<String>> {
        let rows: Vec<Row> = self.conn.query("SHOW BINARY LOGS").await?;
        Ok(rows.iter().filter_map(|row| column::<String>(row, 0)).collect())
    }

    /// 모든 데이터베이스 나열
    pub async fn get_databases(&mut self) -> Result<Vec<String>> {
        let result: Vec<String> = self.conn.query("SHOW DATABASES").await?;
        Ok(result)
    }

    /// 데이터베이스의 모든 테이블 나열
    pub async fn get_tables(&mut self, database: &str) -> Result<Vec<String>> {
        let query = format!("SHOW FULL TABLES FROM {} WHERE Table_type = 'BASE TABLE'", quote_identifier(database));
        let result: Vec<(String, String)> = self.conn.query(query).await?;
        Ok(result.into_iter().map(|(table, _)| table).collect())
    }

    pub async fn close(self) -> Result<()> {
        self.conn.disconnect().await?;
        Ok(())
    }
}

#[async_trait]
impl MirrorConnection for MySqlConnection {
    async fn use_database(&mut self, database: &str) -> Result<()> {
        self.conn
            .query_drop(format!("USE {}", quote_identifier(database)))
            .await?;
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.conn.query_drop(sql).await?;
        Ok(())
    }

    async fn table_exists(&mut self, table: &TableName) -> Result<bool> {
        let count: Option<(i64,)> = self
            .conn
            .exec_first(
                "SELECT COUNT(*) FROM information_schema.TABLES \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
                (table.database.as_str(), table.table.as_str()),
            )
            .await?;
        Ok(matches!(count, Some((n,)) if n > 0))
    }

    async fn show_create_table(&mut self, table: &TableName) -> Result<String> {
        let result: Option<(String, String)> = self
            .conn
            .query_first(format!("SHOW CREATE TABLE {}", table.quoted()))
            .await?;
        result
            .map(|(_, create)| create)
            .ok_or_else(|| CdcError::QueryError(format!("SHOW CREATE TABLE {} returned nothing", table)))
    }

    async fn list_databases(&mut self) -> Result<Vec<String>> {
        self.get_databases().await
    }

    async fn list_tables(&mut self, database: &str) -> Result<Vec<String>> {
        self.get_tables(database).await
    }

    async fn reconnect(&mut self) -> Result<()> {
        info!(
            "Reconnecting to {}:{}",
            self.config.hostname, self.config.port
        );
        self.conn = Self::open(&self.config).await?;
        Ok(())
    }
}

/// 변환에 실패하거나 NULL이면 `None`
fn column<T: FromValue>(row: &Row, index: usize) -> Option<T> {
    row.get_opt::<T, usize>(index).and_then(|value| value.ok())
}

/// Binlog 상태
#[derive(Debug, Clone)]
pub struct BinlogStatus {
    pub file: String,
    pub position: u64,
    pub executed_gtid_set: GtidSet,
}
