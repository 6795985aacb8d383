//! 미러 스키마 트래커
//!
//! 소스와 같은 구조를 유지하는 트래커 DB에 DDL을 적용하고, 테이블의
//! 현재 정의(`SHOW CREATE TABLE`)를 돌려줍니다. 모든 변경은 전용 연결
//! 하나에서 순서대로 실행됩니다.

use crate::config::RetryPolicy;
use crate::error::{CdcError, Result};
use crate::position::PositionData;
use crate::statement::{is_reserved_database, quote_identifier, TableName};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// 미러 스키마 연결
#[async_trait]
pub trait MirrorConnection: Send {
    async fn use_database(&mut self, database: &str) -> Result<()>;

    async fn execute(&mut self, sql: &str) -> Result<()>;

    async fn table_exists(&mut self, table: &TableName) -> Result<bool>;

    /// 테이블이 없으면 에러. 존재 확인은 호출하는 쪽에서 한다
    async fn show_create_table(&mut self, table: &TableName) -> Result<String>;

    async fn list_databases(&mut self) -> Result<Vec<String>>;

    async fn list_tables(&mut self, database: &str) -> Result<Vec<String>>;

    /// 끊긴 연결을 새로 연다
    async fn reconnect(&mut self) -> Result<()>;
}

/// 미러 스키마 전체 스냅샷
///
/// 순서대로 실행하면 스냅샷 시점의 스키마가 다시 만들어진다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaDump {
    pub databases: Vec<String>,
    pub statements: Vec<String>,
    /// 이 스냅샷을 남긴 스키마 이벤트의 위치
    #[serde(default)]
    pub position: Option<PositionData>,
}

impl SchemaDump {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// 스키마 트래커
pub struct SchemaTracker {
    conn: Box<dyn MirrorConnection>,
    retry: RetryPolicy,
}

impl SchemaTracker {
    pub fn new(conn: Box<dyn MirrorConnection>, retry: RetryPolicy) -> Self {
        SchemaTracker { conn, retry }
    }

    /// 미러 DB에 DDL 실행
    ///
    /// 연결이 끊긴 경우에만 `retry.max_attempts`번까지 다시 연결해서 재시도한다.
    pub async fn execute_ddl(&mut self, statement: &str, database: Option<&str>) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.try_execute(statement, database).await {
                Ok(()) => {
                    debug!("Applied to mirror: {}", statement);
                    return Ok(());
                }
                Err(e) if e.is_connection_loss() && attempt < self.retry.max_attempts => {
                    warn!(
                        "Mirror connection lost (attempt {}/{}): {}",
                        attempt, self.retry.max_attempts, e
                    );
                    tokio::time::sleep(self.retry.delay).await;
                    if let Err(e) = self.conn.reconnect().await {
                        warn!("Mirror reconnect failed: {}", e);
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_execute(&mut self, statement: &str, database: Option<&str>) -> Result<()> {
        if let Some(db) = database.filter(|db| !db.is_empty()) {
            self.conn.use_database(db).await?;
        }
        self.conn.execute(statement).await
    }

    /// 테이블의 현재 CREATE 문. 테이블이 없으면 `None`
    pub async fn describe_table(&mut self, table: &TableName) -> Result<Option<String>> {
        if !self.conn.table_exists(table).await? {
            return Ok(None);
        }
        self.conn.show_create_table(table).await.map(Some)
    }

    /// 시스템 DB를 제외한 모든 DB와 테이블의 스냅샷
    pub async fn dump(&mut self) -> Result<SchemaDump> {
        let mut dump = SchemaDump::default();

        let databases: Vec<String> = self
            .conn
            .list_databases()
            .await?
            .into_iter()
            .filter(|db| !is_reserved_database(db))
            .collect();

        for database in databases {
            let quoted = quote_identifier(&database);
            dump.statements.push(format!("DROP DATABASE IF EXISTS {}", quoted));
            dump.statements.push(format!("CREATE DATABASE {}", quoted));
            dump.statements.push(format!("USE {}", quoted));

            for table in self.conn.list_tables(&database).await? {
                let name = TableName::new(database.clone(), table);
                let create = self.conn.show_create_table(&name).await?;
                dump.statements.push(create);
            }
            dump.databases.push(database);
        }

        debug!(
            "Dumped mirror schema: {} databases, {} statements",
            dump.databases.len(),
            dump.statements.len()
        );
        Ok(dump)
    }

    /// 스냅샷으로 미러 스키마를 되돌린다
    ///
    /// 스냅샷 이후에 생긴 DB는 지운다.
    pub async fn restore(&mut self, dump: &SchemaDump) -> Result<()> {
        info!("Restoring mirror schema from dump ({} databases)", dump.databases.len());

        self.execute_ddl("SET FOREIGN_KEY_CHECKS=0", None).await?;

        let existing = self.conn.list_databases().await?;
        for database in existing {
            if is_reserved_database(&database) || dump.databases.contains(&database) {
                continue;
            }
            info!("Dropping database {} absent from dump", database);
            self.execute_ddl(
                &format!("DROP DATABASE IF EXISTS {}", quote_identifier(&database)),
                None,
            )
            .await?;
        }

        for statement in &dump.statements {
            self.execute_ddl(statement, None).await?;
        }

        self.execute_ddl("SET FOREIGN_KEY_CHECKS=1", None).await
    }

    /// 스냅샷의 CREATE 문으로 테이블을 다시 만든다
    pub async fn recreate_table(&mut self, table: &TableName, create_statement: &str) -> Result<()> {
        if create_statement.trim().is_empty() {
            return Err(CdcError::BadSchemaEventState(format!(
                "no snapshot to recreate {}",
                table
            )));
        }
        self.drop_table(table).await?;
        self.execute_ddl(create_statement, Some(&table.database)).await
    }

    pub async fn drop_table(&mut self, table: &TableName) -> Result<()> {
        self.execute_ddl(&format!("DROP TABLE IF EXISTS {}", table.quoted()), None)
            .await
    }
}
