//! 스키마 이벤트 처리
//!
//! DDL을 미러에 적용하기 전에 스키마 덤프와 pending 레코드를 남겨서, 적용
//! 도중 죽더라도 재시작 시 이전 스키마로 되돌릴 수 있게 합니다.

use crate::config::ReplicationConfig;
use crate::data_handler::{Checkpointer, DataEventHandler};
use crate::error::{CdcError, Result};
use crate::events::SchemaEvent;
use crate::position::Position;
use crate::schema_cache::SchemaCache;
use crate::state::NewSchemaEvent;
use crate::statement::{is_reserved_database, Statement, TableName};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct SchemaEventHandler {
    config: Arc<ReplicationConfig>,
    checkpointer: Checkpointer,
}

impl SchemaEventHandler {
    pub fn new(config: Arc<ReplicationConfig>, checkpointer: Checkpointer) -> Self {
        SchemaEventHandler { config, checkpointer }
    }

    /// 문장 하나를 처리한다. 미러에 실제로 적용했으면 `true`
    ///
    /// `previous` 는 직전에 처리한 이벤트의 위치로, 적용 도중 죽었을 때 이
    /// DDL부터 다시 읽기 위한 재시작 위치가 된다.
    pub async fn handle(
        &self,
        cache: &mut SchemaCache,
        data: &mut DataEventHandler,
        event: &SchemaEvent,
        position: &Position,
        previous: &Position,
    ) -> Result<bool> {
        let statement = match Statement::parse(&event.statement) {
            Ok(statement) => statement,
            Err(CdcError::ReservedDatabase(db)) => {
                warn!("Skipping statement on reserved database {}: {}", db, event.statement);
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        if !statement.is_supported() {
            debug!("Skipping unsupported statement: {}", event.statement);
            return Ok(false);
        }
        if statement.database().is_none() && is_reserved_database(&event.database) {
            warn!(
                "Skipping statement on reserved database {}: {}",
                event.database, event.statement
            );
            return Ok(false);
        }

        info!("Applying {} in {}: {}", statement.kind(), event.database, event.statement);

        // 앞선 데이터 이벤트는 옛 스키마 기준이므로 먼저 내보낸다
        data.checkpoint(false).await?;

        let state = self.checkpointer.state();
        let cluster = self.config.cluster_name.as_str();
        let mut dump = cache.tracker_mut().dump().await?;
        dump.position = Some(position.to_persistable());
        state.save_schema_dump(cluster, &dump).await?;

        // 덤프를 먼저 지운다. pending 레코드가 남아 있는 동안은 재시작이
        // 이 DDL부터 다시 읽는다.
        let primary = statement.primary_table().map(|t| t.resolve(&event.database));
        match primary {
            Some(table) if statement.kind().is_table_statement() => {
                let pending = self
                    .apply_table_statement(cache, &statement, event, &table, position, previous)
                    .await?;
                state.delete_schema_dump(cluster).await?;
                state.delete_schema_event(pending).await?;
            }
            _ => {
                self.apply_database_statement(cache, &statement, event, position)
                    .await?;
                state.delete_schema_dump(cluster).await?;
            }
        }

        Ok(true)
    }

    async fn apply_table_statement(
        &self,
        cache: &mut SchemaCache,
        statement: &Statement,
        event: &SchemaEvent,
        table: &TableName,
        position: &Position,
        previous: &Position,
    ) -> Result<u64> {
        let state = self.checkpointer.state();
        let before = cache.tracker_mut().describe_table(table).await?;

        let pending = state
            .create_pending_schema_event(NewSchemaEvent {
                cluster_name: self.config.cluster_name.clone(),
                database: table.database.clone(),
                table_name: table.table.clone(),
                statement_text: event.statement.clone(),
                create_table_statement: before.clone().unwrap_or_default(),
                position: previous.to_persistable(),
            })
            .await?;

        cache
            .tracker_mut()
            .execute_ddl(&event.statement, Some(&event.database))
            .await?;

        // 이름이 바뀌거나 지워진 테이블은 캐시에서 빠지고 새 이름은 등록된다
        for affected in statement.affected_tables() {
            let name = affected.resolve(&event.database);
            let snapshot = if &name == table { before.clone() } else { None };
            if let Some(schema) = cache.register_after_ddl(&name, snapshot, &event.statement).await? {
                debug!("Registered schema {} for {}", schema.schema_id, name);
            }
        }

        self.checkpointer.checkpoint_schema(position, Some(table)).await?;
        Ok(pending.id)
    }

    async fn apply_database_statement(
        &self,
        cache: &mut SchemaCache,
        statement: &Statement,
        event: &SchemaEvent,
        position: &Position,
    ) -> Result<()> {
        // 이름 없는 ALTER DATABASE는 현재 DB 대상
        let session_database = match statement.database() {
            Some(_) => None,
            None => Some(event.database.as_str()),
        };
        cache
            .tracker_mut()
            .execute_ddl(&event.statement, session_database)
            .await?;

        if let Statement::DropDatabase { database } = statement {
            cache.invalidate_database(database);
        }

        self.checkpointer.checkpoint_schema(position, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::events::{DataEvent, OperationType};
    use crate::position::LogPosition;
    use crate::publisher::BufferedPublisher;
    use crate::schema_tracker::SchemaTracker;
    use crate::state::{EventKind, MemoryStateStore, SchemaEventStatus, StateStore};
    use crate::test_support::{int_row, FakeMirror, RecordingRegistry, RecordingSink};
    use std::collections::HashMap;
    use std::time::Duration;

    struct Fixture {
        handler: SchemaEventHandler,
        data: DataEventHandler,
        cache: SchemaCache,
        mirror: FakeMirror,
        registry: RecordingRegistry,
        sink: RecordingSink,
        state: Arc<MemoryStateStore>,
    }

    fn fixture() -> Fixture {
        let config = Arc::new(ReplicationConfig::default());
        let mirror = FakeMirror::new();
        mirror.with_database("shop");
        let registry = RecordingRegistry::new();
        let retry = RetryPolicy {
            max_attempts: 1,
            delay: Duration::from_millis(1),
        };
        let cache = SchemaCache::new(
            SchemaTracker::new(Box::new(mirror.clone()), retry),
            Arc::new(registry.clone()),
        );
        let state = Arc::new(MemoryStateStore::new());
        let checkpointer = Checkpointer::new(state.clone(), "primary");
        let sink = RecordingSink::default();
        let data = DataEventHandler::new(
            config.clone(),
            Box::new(BufferedPublisher::new(sink.clone(), HashMap::new())),
            checkpointer.clone(),
        );
        Fixture {
            handler: SchemaEventHandler::new(config, checkpointer),
            data,
            cache,
            mirror,
            registry,
            sink,
            state,
        }
    }

    fn ddl(statement: &str) -> SchemaEvent {
        SchemaEvent {
            database: "shop".to_string(),
            statement: statement.to_string(),
            timestamp: 0,
        }
    }

    fn position(pos: u64) -> Position {
        Position::Log(LogPosition::new("mysql-bin.000001", pos))
    }

    impl Fixture {
        async fn apply(&mut self, statement: &str, pos: u64) -> Result<bool> {
            self.handler
                .handle(
                    &mut self.cache,
                    &mut self.data,
                    &ddl(statement),
                    &position(pos),
                    &position(pos - 100),
                )
                .await
        }
    }

    #[tokio::test]
    async fn test_create_table_is_mirrored_and_registered() {
        let mut f = fixture();
        let create = "CREATE TABLE orders (id INT PRIMARY KEY, note TEXT)";

        assert!(f.apply(create, 200).await.unwrap());

        assert_eq!(f.mirror.create_statement("shop", "orders").as_deref(), Some(create));
        assert_eq!(f.registry.calls_for("shop", "orders"), 1);

        let global = f.state.global_state("primary").await.unwrap().unwrap();
        assert_eq!(global.event_kind, EventKind::Schema);
        assert_eq!(global.position, position(200).to_persistable());
        assert!(!global.is_clean_shutdown);

        assert_eq!(f.state.schema_event_count(), 0);
        assert!(f.state.schema_dump("primary").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unsupported_and_reserved_are_skipped() {
        let mut f = fixture();

        assert!(!f.apply("BEGIN", 200).await.unwrap());
        assert!(!f.apply("CREATE TABLE mysql.t (id INT)", 300).await.unwrap());
        assert!(f.mirror.executed().is_empty());
        assert!(f.state.global_state("primary").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_bad_identifier_is_fatal() {
        let mut f = fixture();
        let err = f.apply("ALTER TABLE `orders ADD x INT", 200).await.unwrap_err();
        assert!(matches!(err, CdcError::UnparseableIdentifier(_)));
    }

    #[tokio::test]
    async fn test_pending_event_left_on_failure() {
        let mut f = fixture();
        let create = "CREATE TABLE orders (id INT PRIMARY KEY)";
        f.apply(create, 200).await.unwrap();

        f.mirror.fail_next_executes(1);
        let err = f.apply("ALTER TABLE orders ADD note TEXT", 300).await.unwrap_err();
        assert!(err.is_connection_loss());

        let pending = f.state.latest_schema_event("primary").await.unwrap().unwrap();
        assert_eq!(pending.status().unwrap(), SchemaEventStatus::Pending);
        assert_eq!(pending.table_name, "orders");
        assert_eq!(pending.create_table_statement, create);
        assert_eq!(pending.position, position(200).to_persistable());
        let dump = f.state.schema_dump("primary").await.unwrap().unwrap();
        assert_eq!(dump.position, Some(position(300).to_persistable()));
    }

    #[tokio::test]
    async fn test_data_is_flushed_before_ddl() {
        let mut f = fixture();
        f.apply("CREATE TABLE orders (id INT PRIMARY KEY)", 200).await.unwrap();

        let row = DataEvent {
            database: "shop".to_string(),
            table: "orders".to_string(),
            kind: OperationType::Insert,
            row: int_row(1),
            timestamp: 0,
        };
        f.data.handle(&mut f.cache, &row, &position(300)).await.unwrap();
        assert!(f.sink.messages().is_empty());

        f.apply("ALTER TABLE orders ADD note TEXT", 400).await.unwrap();
        assert_eq!(f.sink.messages().len(), 1);
        assert_eq!(f.registry.calls_for("shop", "orders"), 2);
    }

    #[tokio::test]
    async fn test_rename_and_drop_database() {
        let mut f = fixture();
        f.apply("CREATE TABLE orders (id INT)", 200).await.unwrap();
        f.apply("RENAME TABLE orders TO orders_old", 300).await.unwrap();

        assert!(f.mirror.create_statement("shop", "orders").is_none());
        assert!(f.mirror.create_statement("shop", "orders_old").is_some());
        assert_eq!(f.registry.calls_for("shop", "orders_old"), 1);
        assert_eq!(f.cache.len(), 1);

        f.apply("DROP DATABASE shop", 400).await.unwrap();
        assert!(!f.mirror.has_database("shop"));
        assert!(f.cache.is_empty());
    }
}
