//! CDC 관련 에러 타입
//!
//! 에러는 세 가지로 처리됩니다:
//! - 재시도: 미러 스키마 연결 끊김 (`ConnectionLost`)
//! - 건너뛰기: 지원하지 않는 DDL (에러가 아니라 `Statement::Unsupported`)
//! - 프로세스 종료: 그 외 전부. 재시작 후 복구 핸들러가 상태를 맞춥니다.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("MySQL 연결이 끊어졌습니다: {0}")]
    ConnectionLost(String),

    #[error("Binlog 파싱 에러: {0}")]
    BinlogParseError(String),

    #[error("유효하지 않은 이벤트: {0}")]
    InvalidEvent(String),

    #[error("GTID 처리 에러: {0}")]
    GtidError(String),

    #[error("유효하지 않은 위치 정보: {0}")]
    InvalidPosition(String),

    #[error("식별자를 파싱할 수 없습니다: {0}")]
    UnparseableIdentifier(String),

    #[error("시스템 데이터베이스에 대한 DDL은 처리하지 않습니다: {0}")]
    ReservedDatabase(String),

    #[error("스키마 이벤트 상태가 손상되었습니다: {0}")]
    BadSchemaEventState(String),

    #[error("클러스터 락을 획득하지 못했습니다: {0}")]
    LockNotAcquired(String),

    #[error("미러 스키마에 테이블이 없습니다: {0}")]
    UnknownTable(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("상태 저장소 에러: {0}")]
    StateStore(String),

    #[error("메시지 발행 에러: {0}")]
    Publish(String),

    #[error("스키마 레지스트리 에러: {0}")]
    Registry(String),

    #[error("설정 에러: {0}")]
    Config(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("프로토콜 에러: {0}")]
    ProtocolError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Timeout 에러")]
    Timeout,

    #[error("채널이 닫혔습니다")]
    ChannelClosed,

    #[error("예상치 못한 에러: {0}")]
    Other(String),
}

impl CdcError {
    /// 연결을 다시 얻으면 재시도할 수 있는 에러인지 여부
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, CdcError::ConnectionLost(_))
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

/// MySQL 서버가 연결을 끊었을 때 돌려주는 클라이언트 에러 코드
/// (CR_SERVER_GONE_ERROR, CR_SERVER_LOST)
const SERVER_GONE_CODES: [u16; 2] = [2006, 2013];

impl From<mysql_async::Error> for CdcError {
    fn from(err: mysql_async::Error) -> Self {
        match err {
            mysql_async::Error::Io(e) => CdcError::ConnectionLost(e.to_string()),
            mysql_async::Error::Driver(
                ref e @ (mysql_async::DriverError::ConnectionClosed
                | mysql_async::DriverError::PoolDisconnected),
            ) => CdcError::ConnectionLost(e.to_string()),
            mysql_async::Error::Server(ref e) if SERVER_GONE_CODES.contains(&e.code) => {
                CdcError::ConnectionLost(err.to_string())
            }
            other => CdcError::QueryError(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_loss_is_retryable() {
        assert!(CdcError::ConnectionLost("gone".to_string()).is_connection_loss());
        assert!(!CdcError::QueryError("syntax".to_string()).is_connection_loss());
        assert!(!CdcError::BadSchemaEventState("Garbage".to_string()).is_connection_loss());
    }

    #[test]
    fn test_io_error_conversion() {
        let err: CdcError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert!(matches!(err, CdcError::IoError(_)));
    }
}
