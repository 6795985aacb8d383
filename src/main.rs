/// MySQL CDC 복제 프로세스
///
/// 설정 파일(`CDC_CONFIG`, 기본 `cdc.toml`)과 환경 변수로 소스, 미러, 상태
/// DB를 지정하고 종료 신호를 받을 때까지 복제합니다.
use mysql_cdc::data_handler::{Checkpointer, DataEventHandler};
use mysql_cdc::dispatch::{self, EventDispatcher};
use mysql_cdc::lock::MySqlClusterLock;
use mysql_cdc::publisher::{LogSink, LoggingPublisher};
use mysql_cdc::registry::LocalSchemaRegistry;
use mysql_cdc::restarter::ReplicationStreamRestarter;
use mysql_cdc::schema_cache::SchemaCache;
use mysql_cdc::schema_handler::SchemaEventHandler;
use mysql_cdc::schema_tracker::SchemaTracker;
use mysql_cdc::source::MySqlReplicationConnector;
use mysql_cdc::state::{MemoryStateStore, MySqlStateStore, StateStore};
use mysql_cdc::{MySqlConnection, ReplicationConfig};
use std::env;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = env::var("CDC_CONFIG").unwrap_or_else(|_| "cdc.toml".to_string());
    let config = ReplicationConfig::from_file(&path)?.with_env_overrides();
    config.validate()?;

    info!("Starting replication for cluster {}", config.cluster_name);
    info!(
        "Source {}:{}, mirror {}:{}",
        config.source.hostname, config.source.port, config.tracker.hostname, config.tracker.port
    );

    if let Err(e) = run(Arc::new(config)).await {
        error!("Replication stopped: {}", e);
        return Err(e.into());
    }

    info!("Replication stopped cleanly");
    Ok(())
}

async fn run(config: Arc<ReplicationConfig>) -> mysql_cdc::Result<()> {
    let lock_target = config.state.clone().unwrap_or_else(|| config.tracker.clone());
    let lock = MySqlClusterLock::acquire(&lock_target, &config.cluster_name).await?;

    let state: Arc<dyn StateStore> = match &config.state {
        Some(state_config) => Arc::new(MySqlStateStore::connect(state_config).await?),
        None => {
            warn!("No state database configured, checkpoints are kept in memory");
            Arc::new(MemoryStateStore::new())
        }
    };

    let connector = MySqlReplicationConnector::new(config.source.clone());
    let mirror = MySqlConnection::connect(&config.tracker).await?;
    let registry = Arc::new(LocalSchemaRegistry::new(config.topic_namespace.clone())?);
    let mut cache = SchemaCache::new(SchemaTracker::new(Box::new(mirror), config.ddl_retry), registry);

    let checkpointer = Checkpointer::new(state.clone(), config.cluster_name.clone());
    let offsets = state.data_checkpoints(&config.cluster_name).await?;
    let mut data = DataEventHandler::new(
        config.clone(),
        Box::new(LoggingPublisher::new(LogSink, offsets)),
        checkpointer.clone(),
    );

    let (reader, position) = ReplicationStreamRestarter::new(&config, &connector, state.as_ref())
        .restart(&mut cache, &mut data)
        .await?;

    let running = Arc::new(AtomicBool::new(true));
    dispatch::spawn_signal_handler(running.clone());

    let dispatcher = EventDispatcher::new(
        config.clone(),
        cache,
        data,
        SchemaEventHandler::new(config.clone(), checkpointer),
        running,
    );
    let result = dispatcher.run(reader, position).await;

    if let Err(e) = lock.release().await {
        warn!("Failed to release cluster lock: {}", e);
    }
    result
}
