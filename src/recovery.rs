//! 재시작 시 복구
//!
//! 1. 남아 있는 스키마 덤프가 있으면 미러를 덤프 시점으로 되돌린다. 덤프의
//!    DDL이 이미 체크포인트됐으면 덤프만 지운다.
//! 2. 적용 도중 죽은 DDL(pending 레코드)을 롤백한다.
//! 3. 비정상 종료였다면 마지막 체크포인트 이후 이벤트 중 아직 발행되지
//!    않은 것을 다시 발행한다.

use crate::config::ReplicationConfig;
use crate::data_handler::DataEventHandler;
use crate::error::{CdcError, Result};
use crate::events::ReplicationEvent;
use crate::positioned_reader::PositionedReader;
use crate::schema_cache::SchemaCache;
use crate::source::ReplicationConnector;
use crate::state::{GlobalEventState, SchemaEventState, SchemaEventStatus, StateStore};
use crate::statement::{Statement, StatementKind, TableName};
use tracing::{debug, info, warn};

/// 롤백이 필요한 스키마 이벤트. 완료된 레코드면 `None`
pub async fn pending_schema_event(state: &dyn StateStore, cluster: &str) -> Result<Option<SchemaEventState>> {
    match state.latest_schema_event(cluster).await? {
        Some(event) => match event.status()? {
            SchemaEventStatus::Pending => Ok(Some(event)),
            SchemaEventStatus::Completed => Ok(None),
        },
        None => Ok(None),
    }
}

enum Replay {
    Take,
    Skip,
    Stop,
}

pub struct RecoveryHandler<'a> {
    config: &'a ReplicationConfig,
    connector: &'a dyn ReplicationConnector,
    state: &'a dyn StateStore,
}

impl<'a> RecoveryHandler<'a> {
    pub fn new(
        config: &'a ReplicationConfig,
        connector: &'a dyn ReplicationConnector,
        state: &'a dyn StateStore,
    ) -> Self {
        RecoveryHandler {
            config,
            connector,
            state,
        }
    }

    pub async fn recover(
        &self,
        reader: &mut PositionedReader,
        global: Option<&GlobalEventState>,
        pending: Option<SchemaEventState>,
        cache: &mut SchemaCache,
        data: &mut DataEventHandler,
    ) -> Result<()> {
        let cluster = self.config.cluster_name.as_str();

        let dump = self.state.schema_dump(cluster).await?;
        if let Some(dump) = &dump {
            // pending 레코드 없이 체크포인트가 덤프의 DDL까지 왔으면 적용이 끝난 것
            let checkpointed = pending.is_none()
                && dump.position.is_some()
                && global.map_or(false, |g| dump.position.as_ref() == Some(&g.position));
            if checkpointed {
                info!("Schema dump belongs to an already checkpointed DDL, discarding it");
            } else {
                warn!("Found a schema dump from an interrupted DDL, restoring mirror");
                cache.tracker_mut().restore(dump).await?;
            }
        }

        if let Some(pending) = pending {
            self.rollback(cache, &pending).await?;
            self.state.delete_schema_event(pending.id).await?;
        }

        if dump.is_some() {
            self.state.delete_schema_dump(cluster).await?;
        }

        match global {
            Some(global) if !global.is_clean_shutdown => self.replay(reader, cache, data).await,
            _ => Ok(()),
        }
    }

    /// 미러를 DDL 적용 이전 상태로 되돌린다
    async fn rollback(&self, cache: &mut SchemaCache, pending: &SchemaEventState) -> Result<()> {
        let table = TableName::new(pending.database.clone(), pending.table_name.clone());
        info!("Rolling back pending schema event on {}: {}", table, pending.statement_text);

        let statement = Statement::parse(&pending.statement_text).map_err(|e| {
            CdcError::BadSchemaEventState(format!("{}: {}", pending.statement_text, e))
        })?;

        for target in statement.rename_targets() {
            let target = target.resolve(&pending.database);
            cache.tracker_mut().drop_table(&target).await?;
            cache.invalidate(&target);
        }

        let tracker = cache.tracker_mut();
        if statement.kind() == StatementKind::CreateTable || pending.create_table_statement.trim().is_empty() {
            tracker.drop_table(&table).await?;
        } else {
            tracker
                .recreate_table(&table, &pending.create_table_statement)
                .await?;
        }
        cache.invalidate(&table);
        Ok(())
    }

    /// 체크포인트 이후 데이터 이벤트를 모아 중복 없이 다시 발행한다
    async fn replay(
        &self,
        reader: &mut PositionedReader,
        cache: &mut SchemaCache,
        data: &mut DataEventHandler,
    ) -> Result<()> {
        let end = self.connector.end_of_log().await?;
        let mut messages = Vec::new();

        while messages.len() < self.config.recovery_queue_size {
            if reader.is_caught_up(&end) {
                break;
            }

            let action = match reader.peek().await? {
                None => break,
                Some(event) => match &event.event {
                    ReplicationEvent::Data(_) => Replay::Take,
                    ReplicationEvent::Schema(schema) => match Statement::parse(&schema.statement) {
                        Ok(statement) if !statement.is_supported() => Replay::Skip,
                        _ => Replay::Stop,
                    },
                },
            };

            match action {
                Replay::Stop => break,
                Replay::Skip => {
                    reader.next().await?;
                }
                Replay::Take => {
                    let event = match reader.next().await? {
                        Some(event) => event,
                        None => break,
                    };
                    if let ReplicationEvent::Data(row) = &event.event {
                        if data.is_heartbeat(row) {
                            continue;
                        }
                        messages.push(data.build_message(cache, row, &event.position).await?);
                    }
                }
            }
        }

        info!("Recovering {} events after unclean shutdown", messages.len());
        let checkpoints = self.state.data_checkpoints(&self.config.cluster_name).await?;
        data.publisher_mut().ensure_published(messages, &checkpoints).await?;
        data.checkpoint(false).await?;
        debug!("Recovery replay finished at {:?}", reader.cursor());
        Ok(())
    }
}
