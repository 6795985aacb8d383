//! 복제 스트림 소스 추상화
//!
//! 리더 파이프라인과 하트비트 검색은 이 트레이트들만 보고 동작합니다.
//! 실제 구현은 `BinlogClient`와 `MySqlConnection`이고, 테스트는 메모리 상의
//! 가짜 binlog를 씁니다.

use crate::binlog_client::BinlogClient;
use crate::config::ConnectionConfig;
use crate::connection::MySqlConnection;
use crate::error::Result;
use crate::events::SourceEvent;
use crate::position::{GtidPosition, LogCursor, LogPosition, Position, ResumeParameters};
use async_trait::async_trait;
use tracing::info;

/// 열린 복제 스트림
#[async_trait]
pub trait ReplicationSource: Send {
    /// 다음 이벤트. non-blocking 스트림이 로그 끝에 닿으면 `None`
    async fn next_event(&mut self) -> Result<Option<SourceEvent>>;

    /// 다음으로 읽을 이벤트의 위치
    fn cursor(&self) -> LogCursor;
}

/// 복제 스트림을 여는 쪽
#[async_trait]
pub trait ReplicationConnector: Send + Sync {
    async fn open(
        &self,
        params: &ResumeParameters,
        blocking: bool,
    ) -> Result<Box<dyn ReplicationSource>>;

    /// 서버에 남아 있는 binlog 파일 이름 (오래된 순)
    async fn log_files(&self) -> Result<Vec<String>>;

    /// 현재 열려 있는 마지막 로그 파일과 그 안의 끝 위치
    async fn end_of_log(&self) -> Result<LogCursor>;

    /// 저장된 상태가 없을 때 꼬리 읽기를 시작할 위치
    async fn current_position(&self, gtid_enabled: bool) -> Result<Position>;
}

/// MySQL 소스 서버용 커넥터
pub struct MySqlReplicationConnector {
    config: ConnectionConfig,
}

impl MySqlReplicationConnector {
    pub fn new(config: ConnectionConfig) -> Self {
        MySqlReplicationConnector { config }
    }
}

#[async_trait]
impl ReplicationConnector for MySqlReplicationConnector {
    async fn open(
        &self,
        params: &ResumeParameters,
        blocking: bool,
    ) -> Result<Box<dyn ReplicationSource>> {
        let client = BinlogClient::open(&self.config, params, blocking).await?;
        Ok(Box::new(client))
    }

    async fn log_files(&self) -> Result<Vec<String>> {
        let mut conn = MySqlConnection::connect(&self.config).await?;
        conn.get_log_files().await
    }

    async fn end_of_log(&self) -> Result<LogCursor> {
        let mut conn = MySqlConnection::connect(&self.config).await?;
        let status = conn.get_binlog_status().await?;
        Ok(LogCursor::new(status.file, status.position))
    }

    async fn current_position(&self, gtid_enabled: bool) -> Result<Position> {
        let mut conn = MySqlConnection::connect(&self.config).await?;

        if gtid_enabled {
            let server_uuid = conn.get_server_uuid().await?;
            let executed = conn.get_executed_gtid_set().await?;
            if let Some(last) = executed.last_transaction(&server_uuid) {
                info!("Starting from source gtid_executed {}:{}", server_uuid, last);
                return Ok(Position::Gtid(GtidPosition {
                    source_id: server_uuid,
                    transaction_id: last,
                    row_offset: None,
                }));
            }
        }

        let status = conn.get_binlog_status().await?;
        info!("Starting from source log status {}:{}", status.file, status.position);
        Ok(Position::Log(LogPosition::new(status.file, status.position)))
    }
}
