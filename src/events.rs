//! MySQL Binlog 이벤트 타입 및 데이터 구조 정의
//!
//! 두 계층으로 나뉩니다.
//! - wire 계층: binlog 패킷에서 바로 파싱한 이벤트 (`BinlogEventData`)
//! - 파이프라인 계층: 복제 연결이 내보내는 `SourceEvent`, 저수준 리더가 row
//!   단위로 펼친 `StreamEvent`, 위치가 붙은 `PositionedEvent`

use crate::gtid::Gtid;
use crate::position::{LogCursor, Position};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MySQL Binlog 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum EventType {
    /// 알 수 없는 이벤트
    Unknown = 0,
    /// 쿼리 이벤트 (DDL, BEGIN)
    QueryEvent = 2,
    StopEvent = 3,
    /// 로테이션 이벤트 (새 binlog 파일)
    RotateEvent = 4,
    FormatDescriptionEvent = 15,
    /// 트랜잭션 커밋
    XidEvent = 16,
    /// 테이블 맵 이벤트 (스키마 정보)
    TableMapEvent = 19,
    WriteRowsEventV1 = 23,
    UpdateRowsEventV1 = 24,
    DeleteRowsEventV1 = 25,
    HeartbeatLogEvent = 27,
    /// WRITE_ROWS 이벤트 (INSERT)
    WriteRowsEvent = 30,
    /// UPDATE_ROWS 이벤트 (UPDATE)
    UpdateRowsEvent = 31,
    /// DELETE_ROWS 이벤트 (DELETE)
    DeleteRowsEvent = 32,
    /// GTID 이벤트 (Global Transaction ID)
    GtidEvent = 33,
    /// 익명 GTID 이벤트
    AnonymousGtidEvent = 34,
    PreviousGtidsEvent = 35,
    /// Rows Query 이벤트 (원본 쿼리)
    RowsQueryEvent = 36,
}

impl EventType {
    pub fn from_u8(val: u8) -> Self {
        match val {
            2 => EventType::QueryEvent,
            3 => EventType::StopEvent,
            4 => EventType::RotateEvent,
            15 => EventType::FormatDescriptionEvent,
            16 => EventType::XidEvent,
            19 => EventType::TableMapEvent,
            23 => EventType::WriteRowsEventV1,
            24 => EventType::UpdateRowsEventV1,
            25 => EventType::DeleteRowsEventV1,
            27 => EventType::HeartbeatLogEvent,
            30 => EventType::WriteRowsEvent,
            31 => EventType::UpdateRowsEvent,
            32 => EventType::DeleteRowsEvent,
            33 => EventType::GtidEvent,
            34 => EventType::AnonymousGtidEvent,
            35 => EventType::PreviousGtidsEvent,
            36 => EventType::RowsQueryEvent,
            _ => EventType::Unknown,
        }
    }

    /// row 이벤트면 연산 종류
    pub fn row_kind(&self) -> Option<OperationType> {
        match self {
            EventType::WriteRowsEvent | EventType::WriteRowsEventV1 => Some(OperationType::Insert),
            EventType::UpdateRowsEvent | EventType::UpdateRowsEventV1 => Some(OperationType::Update),
            EventType::DeleteRowsEvent | EventType::DeleteRowsEventV1 => Some(OperationType::Delete),
            _ => None,
        }
    }

    /// v2 row 이벤트는 post-header 뒤에 extra data 블록이 있다
    pub fn has_extra_row_data(&self) -> bool {
        matches!(
            self,
            EventType::WriteRowsEvent | EventType::UpdateRowsEvent | EventType::DeleteRowsEvent
        )
    }
}

/// Binlog 이벤트 헤더
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHeader {
    /// 이벤트 타입스탬프 (초 단위)
    pub timestamp: u32,
    /// 이벤트 타입
    pub event_type: EventType,
    /// MySQL 서버 ID
    pub server_id: u32,
    /// 이벤트 길이 (바이트)
    pub event_length: u32,
    /// 다음 이벤트 위치
    pub next_pos: u32,
    /// 이벤트 플래그
    pub flags: u16,
}

/// MySQL 컬럼 타입 코드
pub mod column_type {
    pub const DECIMAL: u8 = 0;
    pub const TINY: u8 = 1;
    pub const SHORT: u8 = 2;
    pub const LONG: u8 = 3;
    pub const FLOAT: u8 = 4;
    pub const DOUBLE: u8 = 5;
    pub const NULL: u8 = 6;
    pub const TIMESTAMP: u8 = 7;
    pub const LONGLONG: u8 = 8;
    pub const INT24: u8 = 9;
    pub const DATE: u8 = 10;
    pub const TIME: u8 = 11;
    pub const DATETIME: u8 = 12;
    pub const YEAR: u8 = 13;
    pub const NEWDATE: u8 = 14;
    pub const VARCHAR: u8 = 15;
    pub const BIT: u8 = 16;
    pub const TIMESTAMP2: u8 = 17;
    pub const DATETIME2: u8 = 18;
    pub const TIME2: u8 = 19;
    pub const JSON: u8 = 245;
    pub const NEWDECIMAL: u8 = 246;
    pub const ENUM: u8 = 247;
    pub const SET: u8 = 248;
    pub const TINY_BLOB: u8 = 249;
    pub const MEDIUM_BLOB: u8 = 250;
    pub const LONG_BLOB: u8 = 251;
    pub const BLOB: u8 = 252;
    pub const VAR_STRING: u8 = 253;
    pub const STRING: u8 = 254;
    pub const GEOMETRY: u8 = 255;
}

/// 테이블 맵 정보 (컬럼 메타데이터)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableMapData {
    /// 테이블 ID
    pub table_id: u64,
    /// 데이터베이스명
    pub database: String,
    /// 테이블명
    pub table: String,
    /// 컬럼 타입들
    pub column_types: Vec<u8>,
    /// 컬럼별 타입 메타데이터 (길이, 정밀도, fsp 등)
    pub column_meta: Vec<u16>,
    /// nullable 비트맵
    pub nullable_bitmap: Vec<u8>,
}

/// 한 row의 변경 전후 이미지
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowImage {
    /// UPDATE/DELETE의 변경 전 값
    pub before: Option<Vec<CellValue>>,
    /// INSERT/UPDATE의 변경 후 값
    pub after: Option<Vec<CellValue>>,
}

impl RowImage {
    pub fn insert(values: Vec<CellValue>) -> Self {
        RowImage {
            before: None,
            after: Some(values),
        }
    }

    pub fn update(before: Vec<CellValue>, after: Vec<CellValue>) -> Self {
        RowImage {
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn delete(values: Vec<CellValue>) -> Self {
        RowImage {
            before: Some(values),
            after: None,
        }
    }

    /// 현재 값 (INSERT/UPDATE는 after, DELETE는 before)
    pub fn current(&self) -> Option<&[CellValue]> {
        self.after.as_deref().or(self.before.as_deref())
    }
}

/// WRITE/UPDATE/DELETE_ROWS 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowsEventData {
    /// 테이블 ID
    pub table_id: u64,
    /// 플래그
    pub flags: u16,
    pub kind: OperationType,
    /// 컬럼 개수
    pub column_count: u64,
    /// 행 데이터들
    pub rows: Vec<RowImage>,
}

/// 셀 값 (다양한 MySQL 타입 지원)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    /// TIMESTAMP (UTC epoch)
    DateTime(DateTime<Utc>),
    /// DATETIME (시간대 없음)
    LocalDateTime(NaiveDateTime),
    Date(String),
    Time(String),
    Decimal(String),
    Json(serde_json::Value),
}

impl CellValue {
    pub fn as_string(&self) -> Option<String> {
        match self {
            CellValue::String(s)
            | CellValue::Date(s)
            | CellValue::Time(s)
            | CellValue::Decimal(s) => Some(s.clone()),
            CellValue::Null => None,
            CellValue::DateTime(dt) => Some(dt.to_rfc3339()),
            CellValue::LocalDateTime(dt) => Some(dt.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
            CellValue::Bytes(b) => Some(String::from_utf8_lossy(b).to_string()),
            other => other.as_i64().map(|i| i.to_string()),
        }
    }

    /// 정수형 값
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            CellValue::Int8(v) => Some(v as i64),
            CellValue::Int16(v) => Some(v as i64),
            CellValue::Int32(v) => Some(v as i64),
            CellValue::Int64(v) => Some(v),
            CellValue::UInt8(v) => Some(v as i64),
            CellValue::UInt16(v) => Some(v as i64),
            CellValue::UInt32(v) => Some(v as i64),
            CellValue::UInt64(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    /// epoch 초 (하트비트 timestamp 컬럼용)
    pub fn as_epoch_seconds(&self) -> Option<i64> {
        match self {
            CellValue::DateTime(dt) => Some(dt.timestamp()),
            CellValue::LocalDateTime(dt) => Some(dt.and_utc().timestamp()),
            other => other.as_i64(),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Null => Value::Null,
            CellValue::Float(f) => serde_json::Number::from_f64(*f as f64)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::Double(d) => serde_json::Number::from_f64(*d)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::UInt64(u) => Value::from(*u),
            CellValue::Json(v) => v.clone(),
            other => match other.as_i64() {
                Some(i) => Value::from(i),
                None => other.as_string().map(Value::from).unwrap_or(Value::Null),
            },
        }
    }
}

/// GTID 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GtidEventData {
    pub gtid: Gtid,
    /// 커밋 플래그
    pub committed: bool,
}

/// 쿼리 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEventData {
    /// 스레드 ID
    pub thread_id: u32,
    /// 실행 시간 (초)
    pub exec_time: u32,
    pub error_code: u16,
    /// 데이터베이스명
    pub database: String,
    /// 쿼리 문자열
    pub query: String,
}

/// 회전 이벤트 데이터
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RotateEventData {
    /// 새 바이너리 로그 파일명
    pub next_binlog_name: String,
    /// 새 파일의 시작 위치
    pub position: u64,
}

/// 모든 Binlog 이벤트를 포함하는 열거형
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum BinlogEventData {
    TableMap(TableMapData),
    Rows(RowsEventData),
    Query(QueryEventData),
    Rotate(RotateEventData),
    Gtid(GtidEventData),
    Xid(u64),
    /// 복제 흐름에 영향이 없는 이벤트
    Ignored,
}

/// 변경 연산 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    Insert,
    Update,
    Delete,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "INSERT",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
        }
    }
}

/// 복제 연결이 내보내는 이벤트
///
/// 테이블 맵, XID, rotate 같은 내부 이벤트는 연결 안에서 소비됩니다.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// 트랜잭션 시작 마커
    Gtid { gtid: Gtid, cursor: LogCursor },
    Query {
        database: String,
        statement: String,
        timestamp: u32,
        /// 이벤트 시작 위치
        start: LogCursor,
        /// 다음 이벤트 위치
        end: LogCursor,
    },
    Rows {
        database: String,
        table: String,
        kind: OperationType,
        rows: Vec<RowImage>,
        timestamp: u32,
        /// 배치의 테이블 맵 이벤트 위치 (재시작 기준점)
        batch_start: LogCursor,
        end: LogCursor,
    },
}

/// 저수준 리더가 배치를 row 단위로 펼친 이벤트
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TransactionMarker { gtid: Gtid, cursor: LogCursor },
    Query(QueryEvent),
    Row(RowEvent),
}

impl StreamEvent {
    pub fn is_transaction_marker(&self) -> bool {
        matches!(self, StreamEvent::TransactionMarker { .. })
    }

    pub fn is_query(&self) -> bool {
        matches!(self, StreamEvent::Query(_))
    }

    pub fn is_row(&self) -> bool {
        matches!(self, StreamEvent::Row(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryEvent {
    pub database: String,
    pub statement: String,
    pub timestamp: u32,
    pub start: LogCursor,
    pub end: LogCursor,
}

impl QueryEvent {
    /// 트랜잭션 시작 (`BEGIN`) 여부
    pub fn is_begin(&self) -> bool {
        self.statement.trim().eq_ignore_ascii_case("BEGIN")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RowEvent {
    pub database: String,
    pub table: String,
    pub kind: OperationType,
    pub row: RowImage,
    /// 배치 안에서의 순서 (0부터)
    pub row_index: usize,
    pub batch_start: LogCursor,
    pub timestamp: u32,
}

/// 핸들러로 전달되는 이벤트
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationEvent {
    Schema(SchemaEvent),
    Data(DataEvent),
}

impl ReplicationEvent {
    pub fn is_data(&self) -> bool {
        matches!(self, ReplicationEvent::Data(_))
    }
}

/// DDL (또는 BEGIN 등 쿼리) 이벤트
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaEvent {
    pub database: String,
    pub statement: String,
    pub timestamp: u32,
}

/// row 하나의 변경
#[derive(Debug, Clone, PartialEq)]
pub struct DataEvent {
    pub database: String,
    pub table: String,
    pub kind: OperationType,
    pub row: RowImage,
    pub timestamp: u32,
}

/// 재시작 위치가 붙은 이벤트
#[derive(Debug, Clone, PartialEq)]
pub struct PositionedEvent {
    pub event: ReplicationEvent,
    pub position: Position,
}
