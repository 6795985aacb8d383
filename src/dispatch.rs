//! 이벤트 디스패치 루프
//!
//! 리더는 백그라운드 태스크가 소유하고 크기 1 채널로 이벤트를 넘깁니다.
//! 메인 루프는 `poll_interval` 만큼만 기다리므로 이벤트가 없어도 주기
//! 체크포인트와 종료 신호를 확인할 수 있습니다.

use crate::config::ReplicationConfig;
use crate::data_handler::DataEventHandler;
use crate::error::{CdcError, Result};
use crate::events::{PositionedEvent, ReplicationEvent};
use crate::position::Position;
use crate::positioned_reader::PositionedReader;
use crate::schema_cache::SchemaCache;
use crate::schema_handler::SchemaEventHandler;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, info, warn};

type Fetched = Result<Option<PositionedEvent>>;

pub struct EventDispatcher {
    config: Arc<ReplicationConfig>,
    cache: SchemaCache,
    data: DataEventHandler,
    schema: SchemaEventHandler,
    running: Arc<AtomicBool>,
}

impl EventDispatcher {
    pub fn new(
        config: Arc<ReplicationConfig>,
        cache: SchemaCache,
        data: DataEventHandler,
        schema: SchemaEventHandler,
        running: Arc<AtomicBool>,
    ) -> Self {
        EventDispatcher {
            config,
            cache,
            data,
            schema,
            running,
        }
    }

    /// `running` 이 false가 되거나 스트림이 끝날 때까지 이벤트를 처리한다
    ///
    /// `start` 는 리더가 열린 위치다.
    pub async fn run(mut self, reader: PositionedReader, start: Position) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<Fetched>(1);
        let worker = tokio::spawn(fetch_events(reader, tx));

        let mut previous = start;
        let mut last_was_data = false;

        let result = loop {
            if !self.running.load(Ordering::SeqCst) {
                info!("Stop requested, leaving dispatch loop");
                break Ok(());
            }

            let fetched = match timeout(self.config.poll_interval, rx.recv()).await {
                Err(_) => {
                    if let Err(e) = self.data.checkpoint_if_due().await {
                        break Err(e);
                    }
                    continue;
                }
                Ok(None) => break Err(CdcError::ChannelClosed),
                Ok(Some(fetched)) => fetched,
            };

            let event = match fetched {
                Ok(Some(event)) => event,
                Ok(None) => {
                    info!("Replication stream ended");
                    break Ok(());
                }
                Err(e) => break Err(e),
            };

            match self.dispatch(&event, &previous).await {
                Ok(Some(is_data)) => last_was_data = is_data,
                Ok(None) => {}
                Err(e) => break Err(e),
            }
            previous = event.position;
        };

        worker.abort();

        match result {
            Ok(()) => {
                if last_was_data {
                    self.data.checkpoint(true).await?;
                }
                info!("Dispatch loop stopped");
                Ok(())
            }
            Err(e) => {
                error!("Dispatch loop failed: {}", e);
                Err(e)
            }
        }
    }

    /// 처리한 이벤트가 데이터였는지. 건너뛴 스키마 이벤트는 `None`
    async fn dispatch(&mut self, event: &PositionedEvent, previous: &Position) -> Result<Option<bool>> {
        match &event.event {
            ReplicationEvent::Data(row) => {
                self.data.handle(&mut self.cache, row, &event.position).await?;
                Ok(Some(true))
            }
            ReplicationEvent::Schema(schema) => {
                let applied = self
                    .schema
                    .handle(&mut self.cache, &mut self.data, schema, &event.position, previous)
                    .await?;
                Ok(applied.then_some(false))
            }
        }
    }
}

async fn fetch_events(mut reader: PositionedReader, tx: mpsc::Sender<Fetched>) {
    loop {
        let fetched = reader.next().await;
        let done = !matches!(fetched, Ok(Some(_)));
        if tx.send(fetched).await.is_err() || done {
            break;
        }
    }
}

/// SIGINT, SIGTERM을 받으면 `running` 을 내린다
pub fn spawn_signal_handler(running: Arc<AtomicBool>) {
    tokio::spawn(async move {
        wait_for_shutdown().await;
        warn!("Shutdown signal received");
        running.store(false, Ordering::SeqCst);
    });
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::data_handler::Checkpointer;
    use crate::events::OperationType;
    use crate::position::LogPosition;
    use crate::publisher::BufferedPublisher;
    use crate::restarter::ReplicationStreamRestarter;
    use crate::schema_tracker::SchemaTracker;
    use crate::state::{EventKind, MemoryStateStore, StateStore};
    use crate::test_support::{heartbeat_row, int_row, FakeBinlog, FakeMirror, RecordingRegistry, RecordingSink, SOURCE_UUID};
    use std::collections::HashMap;
    use std::time::Duration;

    const CREATE_ORDERS: &str = "CREATE TABLE orders (id INT PRIMARY KEY, note TEXT)";

    #[tokio::test]
    async fn test_create_table_then_rows_end_to_end() {
        let binlog = FakeBinlog::builder()
            .file("mysql-bin.000001")
            .gtid(SOURCE_UUID, 1)
            .query("shop", CREATE_ORDERS)
            .gtid(SOURCE_UUID, 2)
            .query("shop", "BEGIN")
            .rows("shop", "orders", OperationType::Insert, vec![int_row(1), int_row(2)])
            .query("shop", "COMMIT")
            .bootstrap(Position::Log(LogPosition::new("mysql-bin.000001", 4)))
            .build();

        let config = Arc::new(ReplicationConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        });
        let mirror = FakeMirror::new();
        mirror.with_database("shop");
        let registry = RecordingRegistry::new();
        let sink = RecordingSink::default();
        let state = Arc::new(MemoryStateStore::new());
        let checkpointer = Checkpointer::new(state.clone(), config.cluster_name.clone());

        let mut cache = SchemaCache::new(
            SchemaTracker::new(Box::new(mirror.clone()), RetryPolicy::default()),
            Arc::new(registry.clone()),
        );
        let mut data = DataEventHandler::new(
            config.clone(),
            Box::new(BufferedPublisher::new(sink.clone(), HashMap::new())),
            checkpointer.clone(),
        );

        let (reader, position) = ReplicationStreamRestarter::new(&config, &binlog, state.as_ref())
            .restart(&mut cache, &mut data)
            .await
            .unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let dispatcher = EventDispatcher::new(
            config.clone(),
            cache,
            data,
            SchemaEventHandler::new(config.clone(), checkpointer),
            running.clone(),
        );
        let handle = tokio::spawn(dispatcher.run(reader, position));

        let mut mirrored = None;
        for _ in 0..200 {
            mirrored = mirror.create_statement("shop", "orders");
            if mirrored.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(mirrored.as_deref(), Some(CREATE_ORDERS));

        // 남은 row 두 개가 처리될 시간을 준다
        tokio::time::sleep(Duration::from_millis(100)).await;
        running.store(false, Ordering::SeqCst);
        handle.await.unwrap().unwrap();

        assert_eq!(registry.calls_for("shop", "orders"), 1);
        assert_eq!(sink.messages().len(), 2);

        let global = state.global_state("primary").await.unwrap().unwrap();
        assert!(global.is_clean_shutdown);
        assert_eq!(global.position, sink.messages()[1].position);
    }

    #[tokio::test]
    async fn test_heartbeat_after_schema_change_keeps_schema_checkpoint() {
        let binlog = FakeBinlog::builder()
            .file("mysql-bin.000001")
            .gtid(SOURCE_UUID, 1)
            .query("shop", CREATE_ORDERS)
            .gtid(SOURCE_UUID, 2)
            .query("shop", "BEGIN")
            .rows("shop", "orders", OperationType::Insert, vec![int_row(1)])
            .query("shop", "COMMIT")
            .gtid(SOURCE_UUID, 3)
            .query("shop", "ALTER TABLE orders ADD note2 TEXT")
            .gtid(SOURCE_UUID, 4)
            .query("yelp_heartbeat", "BEGIN")
            .rows(
                "yelp_heartbeat",
                "replication_heartbeat",
                OperationType::Update,
                vec![heartbeat_row(1, 100)],
            )
            .query("yelp_heartbeat", "COMMIT")
            .bootstrap(Position::Log(LogPosition::new("mysql-bin.000001", 4)))
            .build();

        let config = Arc::new(ReplicationConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        });
        let mirror = FakeMirror::new();
        mirror.with_database("shop");
        let state = Arc::new(MemoryStateStore::new());
        let checkpointer = Checkpointer::new(state.clone(), config.cluster_name.clone());
        let mut cache = SchemaCache::new(
            SchemaTracker::new(Box::new(mirror.clone()), RetryPolicy::default()),
            Arc::new(RecordingRegistry::new()),
        );
        let mut data = DataEventHandler::new(
            config.clone(),
            Box::new(BufferedPublisher::new(RecordingSink::default(), HashMap::new())),
            checkpointer.clone(),
        );
        let (reader, position) = ReplicationStreamRestarter::new(&config, &binlog, state.as_ref())
            .restart(&mut cache, &mut data)
            .await
            .unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let dispatcher = EventDispatcher::new(
            config.clone(),
            cache,
            data,
            SchemaEventHandler::new(config.clone(), checkpointer),
            running.clone(),
        );
        let handle = tokio::spawn(dispatcher.run(reader, position));

        for _ in 0..200 {
            let altered = mirror
                .create_statement("shop", "orders")
                .map_or(false, |create| create.contains("note2"));
            if altered {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // 하트비트 row까지 처리될 시간을 준다
        tokio::time::sleep(Duration::from_millis(100)).await;

        let after_alter = state.global_state("primary").await.unwrap().unwrap();
        assert_eq!(after_alter.event_kind, EventKind::Schema);

        running.store(false, Ordering::SeqCst);
        handle.await.unwrap().unwrap();

        let global = state.global_state("primary").await.unwrap().unwrap();
        assert_eq!(global.position, after_alter.position);
        assert_eq!(global.event_kind, EventKind::Schema);
        assert!(global.is_clean_shutdown);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_loop() {
        let binlog = FakeBinlog::builder()
            .file("mysql-bin.000001")
            .rows("shop", "unknown", OperationType::Insert, vec![int_row(1)])
            .bootstrap(Position::Log(LogPosition::new("mysql-bin.000001", 4)))
            .build();
        let config = Arc::new(ReplicationConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        });
        let state = Arc::new(MemoryStateStore::new());
        let checkpointer = Checkpointer::new(state.clone(), "primary");
        let mut cache = SchemaCache::new(
            SchemaTracker::new(Box::new(FakeMirror::new()), RetryPolicy::default()),
            Arc::new(RecordingRegistry::new()),
        );
        let mut data = DataEventHandler::new(
            config.clone(),
            Box::new(BufferedPublisher::new(RecordingSink::default(), HashMap::new())),
            checkpointer.clone(),
        );
        let (reader, position) = ReplicationStreamRestarter::new(&config, &binlog, state.as_ref())
            .restart(&mut cache, &mut data)
            .await
            .unwrap();

        let dispatcher = EventDispatcher::new(
            config.clone(),
            cache,
            data,
            SchemaEventHandler::new(config, checkpointer),
            Arc::new(AtomicBool::new(true)),
        );
        let err = dispatcher.run(reader, position).await.unwrap_err();
        assert!(matches!(err, CdcError::UnknownTable(_)));
    }
}
