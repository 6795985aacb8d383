//! 복제 스트림 재시작
//!
//! 저장된 상태로부터 시작 위치를 정하고, 리더를 연 다음 필요한 복구를
//! 끝낸 상태로 넘겨줍니다.

use crate::config::ReplicationConfig;
use crate::data_handler::DataEventHandler;
use crate::error::Result;
use crate::position::Position;
use crate::positioned_reader::PositionedReader;
use crate::recovery::{pending_schema_event, RecoveryHandler};
use crate::schema_cache::SchemaCache;
use crate::source::ReplicationConnector;
use crate::state::StateStore;
use tracing::info;

pub struct ReplicationStreamRestarter<'a> {
    config: &'a ReplicationConfig,
    connector: &'a dyn ReplicationConnector,
    state: &'a dyn StateStore,
}

impl<'a> ReplicationStreamRestarter<'a> {
    pub fn new(
        config: &'a ReplicationConfig,
        connector: &'a dyn ReplicationConnector,
        state: &'a dyn StateStore,
    ) -> Self {
        ReplicationStreamRestarter {
            config,
            connector,
            state,
        }
    }

    /// 재시작 위치 우선순위: pending DDL 직전 위치, 마지막 체크포인트, 소스의 현재 위치
    ///
    /// 돌려주는 위치는 리더가 마지막으로 내보낸 이벤트의 위치(없으면 열린
    /// 위치)이며, 이후 처리에서 "직전 이벤트 위치"의 초기값으로 쓴다.
    pub async fn restart(
        &self,
        cache: &mut SchemaCache,
        data: &mut DataEventHandler,
    ) -> Result<(PositionedReader, Position)> {
        let cluster = self.config.cluster_name.as_str();
        let global = self.state.global_state(cluster).await?;
        let pending = pending_schema_event(self.state, cluster).await?;

        let position = match (&pending, &global) {
            (Some(pending), _) => {
                info!("Restarting before pending schema event {}", pending.id);
                Position::from_persisted(&pending.position)?
            }
            (None, Some(global)) => {
                info!(
                    "Restarting from last checkpoint ({}, clean shutdown: {})",
                    global.event_kind.as_str(),
                    global.is_clean_shutdown
                );
                Position::from_persisted(&global.position)?
            }
            (None, None) => {
                info!("No saved state for {}, starting from the current position", cluster);
                self.connector.current_position(self.config.gtid_enabled).await?
            }
        };
        info!("Opening replication stream at {:?}", position);

        let mut reader = PositionedReader::open(self.connector, &position, true, self.config).await?;

        let has_dump = self.state.schema_dump(cluster).await?.is_some();
        if global.is_some() || pending.is_some() || has_dump {
            RecoveryHandler::new(self.config, self.connector, self.state)
                .recover(&mut reader, global.as_ref(), pending, cache, data)
                .await?;
        }
        if global.is_some() {
            self.state.set_clean_shutdown(cluster, false).await?;
        }

        // 복구 중에 읽은 이벤트가 있으면 그 다음부터가 새 처리 구간이다
        let start = reader.last_position().cloned().unwrap_or(position);
        Ok((reader, start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::data_handler::Checkpointer;
    use crate::events::OperationType;
    use crate::gtid::Gtid;
    use crate::position::{GtidPosition, LogPosition, ResumeParameters};
    use crate::publisher::BufferedPublisher;
    use crate::schema_tracker::SchemaTracker;
    use crate::state::{EventKind, GlobalEventState, MemoryStateStore, NewSchemaEvent};
    use crate::test_support::{int_row, FakeBinlog, FakeMirror, RecordingRegistry, RecordingSink, SOURCE_UUID};
    use chrono::Utc;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn binlog() -> FakeBinlog {
        FakeBinlog::builder()
            .file("mysql-bin.000001")
            .gtid(SOURCE_UUID, 1)
            .query("shop", "CREATE TABLE orders (id INT PRIMARY KEY)")
            .gtid(SOURCE_UUID, 2)
            .query("shop", "BEGIN")
            .rows("shop", "orders", OperationType::Insert, vec![int_row(1)])
            .query("shop", "COMMIT")
            .build()
    }

    struct Fixture {
        config: ReplicationConfig,
        binlog: FakeBinlog,
        mirror: FakeMirror,
        state: Arc<MemoryStateStore>,
        cache: SchemaCache,
        data: DataEventHandler,
    }

    fn fixture(binlog: FakeBinlog) -> Fixture {
        let config = ReplicationConfig::default();
        let state = Arc::new(MemoryStateStore::new());
        let mirror = FakeMirror::new();
        let cache = SchemaCache::new(
            SchemaTracker::new(Box::new(mirror.clone()), RetryPolicy::default()),
            Arc::new(RecordingRegistry::new()),
        );
        let data = DataEventHandler::new(
            Arc::new(config.clone()),
            Box::new(BufferedPublisher::new(RecordingSink::default(), HashMap::new())),
            Checkpointer::new(state.clone(), "primary"),
        );
        Fixture {
            config,
            binlog,
            mirror,
            state,
            cache,
            data,
        }
    }

    impl Fixture {
        async fn restart(&mut self) -> Result<(PositionedReader, Position)> {
            ReplicationStreamRestarter::new(&self.config, &self.binlog, self.state.as_ref())
                .restart(&mut self.cache, &mut self.data)
                .await
        }
    }

    fn gtid_position(transaction_id: u64) -> Position {
        Position::Gtid(GtidPosition::new(&Gtid::new(SOURCE_UUID, transaction_id)))
    }

    #[tokio::test]
    async fn test_fresh_start_uses_current_position() {
        let mut f = fixture(binlog());

        let (_, position) = f.restart().await.unwrap();

        assert_eq!(position, gtid_position(2));
        let opens = f.binlog.opens();
        assert_eq!(opens.len(), 1);
        assert!(opens[0].1);
        assert_eq!(
            opens[0].0,
            ResumeParameters::Gtid {
                auto_position: format!("{}:1-3", SOURCE_UUID)
            }
        );
    }

    #[tokio::test]
    async fn test_resumes_from_checkpoint() {
        let mut f = fixture(binlog());
        f.state
            .upsert_global_state(&GlobalEventState {
                cluster_name: "primary".to_string(),
                position: gtid_position(1).to_persistable(),
                event_kind: EventKind::Schema,
                is_clean_shutdown: true,
                database: None,
                table_name: None,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let (mut reader, position) = f.restart().await.unwrap();

        assert_eq!(position, gtid_position(1));
        let next = reader.next().await.unwrap().unwrap();
        assert_eq!(next.position, Position::Gtid(GtidPosition::new(&Gtid::new(SOURCE_UUID, 2)).with_offset(0)));

        let global = f.state.global_state("primary").await.unwrap().unwrap();
        assert!(!global.is_clean_shutdown);
    }

    #[tokio::test]
    async fn test_unclean_restart_starts_after_recovered_events() {
        let mut f = fixture(binlog());
        f.mirror.with_table("shop", "orders", "CREATE TABLE orders (id INT PRIMARY KEY)");
        f.state
            .upsert_global_state(&GlobalEventState {
                cluster_name: "primary".to_string(),
                position: gtid_position(1).to_persistable(),
                event_kind: EventKind::Schema,
                is_clean_shutdown: false,
                database: None,
                table_name: None,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let (reader, position) = f.restart().await.unwrap();

        // BEGIN, row, COMMIT 모두 복구 중에 읽혔다
        assert_eq!(position, gtid_position(2));
        assert_eq!(reader.last_position(), Some(&gtid_position(2)));
        let global = f.state.global_state("primary").await.unwrap().unwrap();
        assert_eq!(
            global.position,
            Position::Gtid(GtidPosition::new(&Gtid::new(SOURCE_UUID, 2)).with_offset(1)).to_persistable()
        );
        assert!(reader.is_caught_up(&f.binlog.end_cursor()));
    }

    #[tokio::test]
    async fn test_pending_schema_event_wins() {
        let mut f = fixture(binlog());
        let checkpoint = Position::Log(LogPosition::new("mysql-bin.000001", 404));
        f.state
            .upsert_global_state(&GlobalEventState {
                cluster_name: "primary".to_string(),
                position: checkpoint.to_persistable(),
                event_kind: EventKind::Data,
                is_clean_shutdown: true,
                database: None,
                table_name: None,
                updated_at: Utc::now(),
            })
            .await
            .unwrap();
        f.state
            .create_pending_schema_event(NewSchemaEvent {
                cluster_name: "primary".to_string(),
                database: "shop".to_string(),
                table_name: "orders".to_string(),
                statement_text: "CREATE TABLE orders (id INT PRIMARY KEY)".to_string(),
                create_table_statement: String::new(),
                position: Position::Log(LogPosition::new("mysql-bin.000001", 4)).to_persistable(),
            })
            .await
            .unwrap();

        let (_, position) = f.restart().await.unwrap();

        assert_eq!(position, Position::Log(LogPosition::new("mysql-bin.000001", 4)));
        assert_eq!(f.state.schema_event_count(), 0);
    }
}
