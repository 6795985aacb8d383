//! 데이터 이벤트 처리
//!
//! row 변경을 메시지로 만들어 발행하고, 개수나 시간 기준으로 체크포인트를
//! 남깁니다.

use crate::config::ReplicationConfig;
use crate::error::Result;
use crate::events::DataEvent;
use crate::position::{Position, PositionData};
use crate::publisher::{Message, Publisher};
use crate::schema_cache::SchemaCache;
use crate::state::{EventKind, GlobalEventState, StateStore};
use crate::statement::TableName;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// 상태 저장소에 체크포인트를 쓴다
#[derive(Clone)]
pub struct Checkpointer {
    state: Arc<dyn StateStore>,
    cluster: String,
    /// 마지막으로 저장한 발행 위치
    persisted: Arc<Mutex<Option<PositionData>>>,
}

impl Checkpointer {
    pub fn new(state: Arc<dyn StateStore>, cluster: impl Into<String>) -> Self {
        Checkpointer {
            state,
            cluster: cluster.into(),
            persisted: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> &dyn StateStore {
        self.state.as_ref()
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// 발행기를 비우고 마지막 발행 위치와 토픽 offset을 저장한다
    ///
    /// 지난 저장 이후 새로 발행된 메시지가 없으면 위치는 그대로 둔다. 그 사이
    /// 스키마 체크포인트가 더 뒤의 위치를 썼을 수 있다.
    pub async fn checkpoint_published(
        &self,
        publisher: &mut dyn Publisher,
        clean_shutdown: bool,
        last_table: Option<&TableName>,
    ) -> Result<()> {
        publisher.flush().await?;
        let data = publisher.checkpoint_data();

        let fresh = data
            .position
            .filter(|position| self.persisted.lock().as_ref() != Some(position));

        if let Some(position) = fresh {
            self.state
                .upsert_global_state(&GlobalEventState {
                    cluster_name: self.cluster.clone(),
                    position: position.clone(),
                    event_kind: EventKind::Data,
                    is_clean_shutdown: clean_shutdown,
                    database: last_table.map(|t| t.database.clone()),
                    table_name: last_table.map(|t| t.table.clone()),
                    updated_at: Utc::now(),
                })
                .await?;
            *self.persisted.lock() = Some(position);
        } else if clean_shutdown {
            self.state.set_clean_shutdown(&self.cluster, true).await?;
        }

        self.state
            .upsert_data_checkpoints(&self.cluster, &data.topic_offsets)
            .await?;
        debug!("Checkpointed data events for {}", self.cluster);
        Ok(())
    }

    /// 스키마 이벤트 위치를 저장한다
    pub async fn checkpoint_schema(&self, position: &Position, table: Option<&TableName>) -> Result<()> {
        self.state
            .upsert_global_state(&GlobalEventState {
                cluster_name: self.cluster.clone(),
                position: position.to_persistable(),
                event_kind: EventKind::Schema,
                is_clean_shutdown: false,
                database: table.map(|t| t.database.clone()),
                table_name: table.map(|t| t.table.clone()),
                updated_at: Utc::now(),
            })
            .await
    }
}

pub struct DataEventHandler {
    config: Arc<ReplicationConfig>,
    publisher: Box<dyn Publisher>,
    checkpointer: Checkpointer,
    since_checkpoint: usize,
    last_checkpoint: Instant,
    last_table: Option<TableName>,
}

impl DataEventHandler {
    pub fn new(config: Arc<ReplicationConfig>, publisher: Box<dyn Publisher>, checkpointer: Checkpointer) -> Self {
        DataEventHandler {
            config,
            publisher,
            checkpointer,
            since_checkpoint: 0,
            last_checkpoint: Instant::now(),
            last_table: None,
        }
    }

    pub fn publisher_mut(&mut self) -> &mut dyn Publisher {
        self.publisher.as_mut()
    }

    pub fn checkpointer(&self) -> &Checkpointer {
        &self.checkpointer
    }

    pub fn is_heartbeat(&self, event: &DataEvent) -> bool {
        self.config.is_heartbeat_table(&event.database, &event.table)
    }

    /// 발행할 메시지. 스키마를 모르는 테이블이면 `UnknownTable`
    pub async fn build_message(
        &mut self,
        cache: &mut SchemaCache,
        event: &DataEvent,
        position: &Position,
    ) -> Result<Message> {
        let table = TableName::new(event.database.clone(), event.table.clone());
        let schema = cache.get(&table).await?;
        Ok(Message::from_data_event(
            &schema,
            event,
            position,
            self.config.publish_dry_run,
        ))
    }

    pub async fn handle(&mut self, cache: &mut SchemaCache, event: &DataEvent, position: &Position) -> Result<()> {
        if self.is_heartbeat(event) {
            trace!("Heartbeat row at {:?}", position);
            return Ok(());
        }

        let message = self.build_message(cache, event, position).await?;
        self.publisher.publish(message).await?;
        self.last_table = Some(TableName::new(event.database.clone(), event.table.clone()));
        self.since_checkpoint += 1;

        if self.since_checkpoint >= self.config.checkpoint_size {
            self.checkpoint(false).await?;
        }
        Ok(())
    }

    /// 마지막 체크포인트 이후 처리한 이벤트가 있고 주기가 지났으면 체크포인트
    pub async fn checkpoint_if_due(&mut self) -> Result<()> {
        if self.since_checkpoint > 0 && self.last_checkpoint.elapsed() >= self.config.checkpoint_interval {
            self.checkpoint(false).await?;
        }
        Ok(())
    }

    pub async fn checkpoint(&mut self, clean_shutdown: bool) -> Result<()> {
        self.checkpointer
            .checkpoint_published(self.publisher.as_mut(), clean_shutdown, self.last_table.as_ref())
            .await?;
        self.since_checkpoint = 0;
        self.last_checkpoint = Instant::now();
        Ok(())
    }
}
