/// 하트비트 row의 복제 위치 찾기
///
/// 다른 소스로 옮겨 갈 때 마지막으로 처리한 하트비트 `(serial, timestamp)`가
/// 새 소스의 어느 위치에 있는지 찾아 저장 가능한 위치로 출력합니다.
///
/// HEARTBEAT_SERIAL=42 HEARTBEAT_TIMESTAMP=1700000000 cargo run --bin locate_heartbeat
use mysql_cdc::heartbeat::HeartbeatLocator;
use mysql_cdc::position::HeartbeatMark;
use mysql_cdc::source::MySqlReplicationConnector;
use mysql_cdc::{CdcError, Position, ReplicationConfig};
use std::env;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn required<T: std::str::FromStr>(name: &str) -> Result<T, CdcError> {
    let raw = env::var(name).map_err(|_| CdcError::Config(format!("{} 환경 변수가 필요합니다", name)))?;
    raw.parse()
        .map_err(|_| CdcError::Config(format!("{} 값이 올바르지 않습니다: {}", name, raw)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let path = env::var("CDC_CONFIG").unwrap_or_else(|_| "cdc.toml".to_string());
    let config = ReplicationConfig::from_file(&path)?.with_env_overrides();
    config.validate()?;

    let target = HeartbeatMark {
        serial: required("HEARTBEAT_SERIAL")?,
        timestamp: required("HEARTBEAT_TIMESTAMP")?,
    };
    info!(
        "Searching {}:{} for heartbeat serial={} timestamp={}",
        config.source.hostname, config.source.port, target.serial, target.timestamp
    );

    let connector = MySqlReplicationConnector::new(config.source.clone());
    match HeartbeatLocator::new(&connector, &config).locate(target).await? {
        Some(position) => {
            let persisted = Position::Log(position).to_persistable();
            println!("{}", serde_json::to_string(&persisted)?);
        }
        None => warn!("Heartbeat not found, nothing to resume from"),
    }
    Ok(())
}
