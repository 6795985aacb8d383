//! 테스트용 가짜 구현
//!
//! - `FakeBinlog`: 파일 여러 개로 된 메모리 binlog와 그 커넥터
//! - `FakeMirror`: DDL을 해석해서 테이블 정의를 유지하는 미러
//! - `RecordingRegistry`, `RecordingSink`: 호출 기록

use crate::error::{CdcError, Result};
use crate::events::{CellValue, OperationType, RowImage, SourceEvent};
use crate::gtid::{Gtid, GtidSet};
use crate::position::{GtidPosition, LogCursor, Position, ResumeParameters, BINLOG_START_POS};
use crate::publisher::{Message, MessageSink};
use crate::registry::{LocalSchemaRegistry, RegisteredSchema, SchemaRegistration, SchemaRegistry};
use crate::schema_tracker::MirrorConnection;
use crate::source::{ReplicationConnector, ReplicationSource};
use crate::statement::{Statement, TableName};
use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const SOURCE_UUID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";

/// 가짜 이벤트 하나가 차지하는 바이트 수
const EVENT_SIZE: u64 = 100;

pub fn int_row(value: i64) -> RowImage {
    RowImage::insert(vec![CellValue::Int64(value)])
}

pub fn heartbeat_row(serial: u64, timestamp: i64) -> RowImage {
    let at = |ts: i64| CellValue::DateTime(DateTime::from_timestamp(ts, 0).unwrap());
    RowImage::update(
        vec![CellValue::UInt64(serial), at(timestamp - 1)],
        vec![CellValue::UInt64(serial), at(timestamp)],
    )
}

#[derive(Debug, Clone)]
struct FakeEntry {
    start: LogCursor,
    end: LogCursor,
    event: SourceEvent,
}

struct FakeLog {
    /// 파일 이름과 그 파일의 끝 위치
    files: Vec<(String, u64)>,
    entries: Vec<FakeEntry>,
}

impl FakeLog {
    fn end_cursor(&self) -> LogCursor {
        self.files
            .last()
            .map(|(name, end)| LogCursor::new(name.clone(), *end))
            .unwrap_or_else(|| LogCursor::new("mysql-bin.000001", BINLOG_START_POS))
    }

    fn start_index(&self, params: &ResumeParameters) -> Result<(usize, LogCursor)> {
        let index = match params {
            ResumeParameters::File { log_file, log_pos } => {
                let target = LogCursor::new(log_file.clone(), *log_pos);
                let index = self
                    .entries
                    .iter()
                    .position(|e| e.start >= target)
                    .unwrap_or(self.entries.len());
                return Ok((index, target));
            }
            ResumeParameters::Gtid { auto_position } => {
                let set = GtidSet::parse(auto_position)?;
                self.entries
                    .iter()
                    .position(|e| match &e.event {
                        SourceEvent::Gtid { gtid, .. } => set
                            .last_transaction(&gtid.source_id)
                            .map_or(true, |last| gtid.transaction_id >= last),
                        _ => false,
                    })
                    .unwrap_or(self.entries.len())
            }
        };

        let cursor = self
            .entries
            .get(index)
            .map(|e| e.start.clone())
            .unwrap_or_else(|| self.end_cursor());
        Ok((index, cursor))
    }
}

#[derive(Default)]
pub struct FakeBinlogBuilder {
    files: Vec<(String, u64)>,
    entries: Vec<FakeEntry>,
    bootstrap: Option<Position>,
}

impl FakeBinlogBuilder {
    pub fn file(mut self, name: &str) -> Self {
        self.files.push((name.to_string(), BINLOG_START_POS));
        self
    }

    fn push(mut self, make: impl FnOnce(LogCursor, LogCursor) -> SourceEvent) -> Self {
        if self.files.is_empty() {
            self = self.file("mysql-bin.000001");
        }
        let (name, pos) = match self.files.last_mut() {
            Some(file) => file,
            None => unreachable!(),
        };
        let start = LogCursor::new(name.clone(), *pos);
        *pos += EVENT_SIZE;
        let end = LogCursor::new(name.clone(), *pos);
        let event = make(start.clone(), end.clone());
        self.entries.push(FakeEntry { start, end, event });
        self
    }

    pub fn gtid(self, source_id: &str, transaction_id: u64) -> Self {
        let gtid = Gtid::new(source_id, transaction_id);
        self.push(|cursor, _| SourceEvent::Gtid { gtid, cursor })
    }

    pub fn query(self, database: &str, statement: &str) -> Self {
        let (database, statement) = (database.to_string(), statement.to_string());
        self.push(|start, end| SourceEvent::Query {
            database,
            statement,
            timestamp: 0,
            start,
            end,
        })
    }

    pub fn rows(self, database: &str, table: &str, kind: OperationType, rows: Vec<RowImage>) -> Self {
        let (database, table) = (database.to_string(), table.to_string());
        self.push(|start, end| SourceEvent::Rows {
            database,
            table,
            kind,
            rows,
            timestamp: 0,
            batch_start: start,
            end,
        })
    }

    /// 저장된 상태가 없을 때 시작할 위치 (기본값은 로그 끝)
    pub fn bootstrap(mut self, position: Position) -> Self {
        self.bootstrap = Some(position);
        self
    }

    pub fn build(self) -> FakeBinlog {
        FakeBinlog {
            log: Arc::new(FakeLog {
                files: self.files,
                entries: self.entries,
            }),
            bootstrap: self.bootstrap,
            opens: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[derive(Clone)]
pub struct FakeBinlog {
    log: Arc<FakeLog>,
    bootstrap: Option<Position>,
    opens: Arc<Mutex<Vec<(ResumeParameters, bool)>>>,
}

impl FakeBinlog {
    pub fn builder() -> FakeBinlogBuilder {
        FakeBinlogBuilder::default()
    }

    /// row 배치 이벤트의 시작 위치들
    pub fn batch_starts(&self) -> Vec<LogCursor> {
        self.log
            .entries
            .iter()
            .filter_map(|e| match &e.event {
                SourceEvent::Rows { batch_start, .. } => Some(batch_start.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn end_cursor(&self) -> LogCursor {
        self.log.end_cursor()
    }

    /// `open` 호출 기록 (인자, blocking)
    pub fn opens(&self) -> Vec<(ResumeParameters, bool)> {
        self.opens.lock().clone()
    }
}

#[async_trait]
impl ReplicationConnector for FakeBinlog {
    async fn open(&self, params: &ResumeParameters, blocking: bool) -> Result<Box<dyn ReplicationSource>> {
        self.opens.lock().push((params.clone(), blocking));
        let (index, cursor) = self.log.start_index(params)?;
        Ok(Box::new(FakeSource {
            log: self.log.clone(),
            index,
            cursor,
            blocking,
        }))
    }

    async fn log_files(&self) -> Result<Vec<String>> {
        Ok(self.log.files.iter().map(|(name, _)| name.clone()).collect())
    }

    async fn end_of_log(&self) -> Result<LogCursor> {
        Ok(self.log.end_cursor())
    }

    async fn current_position(&self, gtid_enabled: bool) -> Result<Position> {
        if let Some(position) = &self.bootstrap {
            return Ok(position.clone());
        }
        let last_gtid = self.log.entries.iter().rev().find_map(|e| match &e.event {
            SourceEvent::Gtid { gtid, .. } => Some(gtid.clone()),
            _ => None,
        });
        match last_gtid {
            Some(gtid) if gtid_enabled => Ok(Position::Gtid(GtidPosition::new(&gtid))),
            _ => {
                let end = self.log.end_cursor();
                Ok(Position::Log(crate::position::LogPosition::new(end.file, end.pos)))
            }
        }
    }
}

struct FakeSource {
    log: Arc<FakeLog>,
    index: usize,
    cursor: LogCursor,
    blocking: bool,
}

#[async_trait]
impl ReplicationSource for FakeSource {
    async fn next_event(&mut self) -> Result<Option<SourceEvent>> {
        match self.log.entries.get(self.index) {
            Some(entry) => {
                self.index += 1;
                self.cursor = entry.end.clone();
                Ok(Some(entry.event.clone()))
            }
            // 실제 서버처럼 로그 끝에서 새 이벤트를 기다린다
            None if self.blocking => {
                std::future::pending::<()>().await;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn cursor(&self) -> LogCursor {
        self.cursor.clone()
    }
}

#[derive(Default)]
struct MirrorState {
    databases: BTreeMap<String, BTreeMap<String, String>>,
    current: Option<String>,
    fail_next: usize,
    reconnects: usize,
    executed: Vec<String>,
}

impl MirrorState {
    fn tables_mut(&mut self, database: &str) -> Result<&mut BTreeMap<String, String>> {
        self.databases
            .get_mut(database)
            .ok_or_else(|| CdcError::QueryError(format!("Unknown database '{}'", database)))
    }

    fn take(&mut self, table: &TableName) -> Result<String> {
        self.tables_mut(&table.database)?
            .remove(&table.table)
            .ok_or_else(|| CdcError::QueryError(format!("Table '{}' doesn't exist", table)))
    }

    fn put(&mut self, table: &TableName, create: String) -> Result<()> {
        self.tables_mut(&table.database)?.insert(table.table.clone(), create);
        Ok(())
    }

    fn apply(&mut self, sql: &str) -> Result<()> {
        let trimmed = sql.trim();
        let upper = trimmed.to_ascii_uppercase();
        if upper.starts_with("SET ") {
            return Ok(());
        }
        if upper.starts_with("USE ") {
            let database = trimmed[4..].trim().trim_matches('`').to_string();
            self.tables_mut(&database)?;
            self.current = Some(database);
            return Ok(());
        }

        let current = self.current.clone().unwrap_or_default();
        match Statement::parse(trimmed)? {
            Statement::CreateDatabase { database } => {
                self.databases.entry(database).or_default();
            }
            Statement::DropDatabase { database } => {
                self.databases.remove(&database);
                if self.current.as_deref() == Some(database.as_str()) {
                    self.current = None;
                }
            }
            Statement::CreateTable { table, .. } => {
                let name = table.resolve(&current);
                self.tables_mut(&name.database)?
                    .entry(name.table)
                    .or_insert_with(|| trimmed.to_string());
            }
            Statement::AlterTable { table, renamed_to } => {
                let name = table.resolve(&current);
                let altered = format!("{}\n-- {}", self.take(&name)?, trimmed);
                let target = renamed_to.map(|t| t.resolve(&current)).unwrap_or(name);
                self.put(&target, altered)?;
            }
            Statement::DropTable { tables } => {
                let if_exists = upper.contains("IF EXISTS");
                for table in tables {
                    let name = table.resolve(&current);
                    if let Err(e) = self.take(&name) {
                        if !if_exists {
                            return Err(e);
                        }
                    }
                }
            }
            Statement::RenameTable { renames } => {
                for (from, to) in renames {
                    let create = self.take(&from.resolve(&current))?;
                    self.put(&to.resolve(&current), create)?;
                }
            }
            Statement::CreateIndex { table, .. } | Statement::DropIndex { table, .. } => {
                let name = table.resolve(&current);
                let altered = format!("{}\n-- {}", self.take(&name)?, trimmed);
                self.put(&name, altered)?;
            }
            Statement::AlterDatabase { .. } | Statement::Unsupported => {}
        }
        Ok(())
    }
}

/// DDL을 해석하는 미러
#[derive(Clone, Default)]
pub struct FakeMirror {
    state: Arc<Mutex<MirrorState>>,
}

impl FakeMirror {
    pub fn new() -> Self {
        FakeMirror::default()
    }

    /// 다음 `n`번의 execute를 연결 끊김으로 실패시킨다
    pub fn fail_next_executes(&self, n: usize) {
        self.state.lock().fail_next = n;
    }

    pub fn reconnects(&self) -> usize {
        self.state.lock().reconnects
    }

    pub fn has_database(&self, database: &str) -> bool {
        self.state.lock().databases.contains_key(database)
    }

    pub fn create_statement(&self, database: &str, table: &str) -> Option<String> {
        self.state
            .lock()
            .databases
            .get(database)
            .and_then(|tables| tables.get(table))
            .cloned()
    }

    pub fn with_table(&self, database: &str, table: &str, create: &str) {
        self.state
            .lock()
            .databases
            .entry(database.to_string())
            .or_default()
            .insert(table.to_string(), create.to_string());
    }

    pub fn with_database(&self, database: &str) {
        self.state.lock().databases.entry(database.to_string()).or_default();
    }

    pub fn drop_table(&self, database: &str, table: &str) {
        if let Some(tables) = self.state.lock().databases.get_mut(database) {
            tables.remove(table);
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.state.lock().executed.clone()
    }
}

#[async_trait]
impl MirrorConnection for FakeMirror {
    async fn use_database(&mut self, database: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.tables_mut(database)?;
        state.current = Some(database.to_string());
        Ok(())
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(CdcError::ConnectionLost("MySQL server has gone away".to_string()));
        }
        state.executed.push(sql.to_string());
        state.apply(sql)
    }

    async fn table_exists(&mut self, table: &TableName) -> Result<bool> {
        Ok(self.create_statement(&table.database, &table.table).is_some())
    }

    async fn show_create_table(&mut self, table: &TableName) -> Result<String> {
        self.create_statement(&table.database, &table.table)
            .ok_or_else(|| CdcError::QueryError(format!("Table '{}' doesn't exist", table)))
    }

    async fn list_databases(&mut self) -> Result<Vec<String>> {
        Ok(self.state.lock().databases.keys().cloned().collect())
    }

    async fn list_tables(&mut self, database: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock();
        Ok(state.tables_mut(database)?.keys().cloned().collect())
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.state.lock().reconnects += 1;
        Ok(())
    }
}

/// 등록 호출을 기록하는 레지스트리
#[derive(Clone)]
pub struct RecordingRegistry {
    inner: Arc<LocalSchemaRegistry>,
    calls: Arc<Mutex<Vec<SchemaRegistration>>>,
}

impl RecordingRegistry {
    pub fn new() -> Self {
        RecordingRegistry {
            inner: Arc::new(LocalSchemaRegistry::new("test").unwrap()),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn calls_for(&self, database: &str, table: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.database == database && c.table == table)
            .count()
    }

    pub fn calls(&self) -> Vec<SchemaRegistration> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SchemaRegistry for RecordingRegistry {
    async fn register_or_fetch(&self, request: &SchemaRegistration) -> Result<RegisteredSchema> {
        self.calls.lock().push(request.clone());
        self.inner.register_or_fetch(request).await
    }
}

/// 내보낸 메시지를 모아 두는 sink
#[derive(Clone, Default)]
pub struct RecordingSink {
    messages: Arc<Mutex<Vec<Message>>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }
}

impl MessageSink for RecordingSink {
    fn write(&mut self, message: &Message) -> Result<()> {
        self.messages.lock().push(message.clone());
        Ok(())
    }
}
