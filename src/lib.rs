//! MySQL Binlog CDC (Change Data Capture) 핵심 구현
//!
//! 이 라이브러리는 MySQL 바이너리 로그를 읽어 row 변경을 발행하고, DDL을
//! 미러 스키마에 따라 적용합니다.
//! 주요 기능:
//! - Binlog 프로토콜 파싱과 복제 연결
//! - GTID / 파일 위치 기반 재시작 지점 관리
//! - DDL 분류와 미러 스키마 추적
//! - 체크포인트와 비정상 종료 후 복구

pub mod auth;
pub mod binlog;
pub mod binlog_client;
pub mod config;
pub mod connection;
pub mod data_handler;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod gtid;
pub mod heartbeat;
pub mod lock;
pub mod position;
pub mod positioned_reader;
pub mod protocol;
pub mod publisher;
pub mod recovery;
pub mod registry;
pub mod restarter;
pub mod schema_cache;
pub mod schema_handler;
pub mod schema_tracker;
pub mod source;
pub mod state;
pub mod statement;
pub mod stream_reader;
pub mod tokenizer;

#[cfg(test)]
mod test_support;

pub use binlog_client::BinlogClient;
pub use config::{ConnectionConfig, ReplicationConfig};
pub use connection::MySqlConnection;
pub use dispatch::EventDispatcher;
pub use error::{CdcError, Result};
pub use events::{EventType, PositionedEvent, ReplicationEvent};
pub use gtid::GtidSet;
pub use position::Position;
pub use restarter::ReplicationStreamRestarter;
pub use statement::Statement;
