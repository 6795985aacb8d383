//! 복제 스트림 재시작 위치 (Position)
//!
//! 두 가지 모드가 있습니다.
//! - GTID: `source_id:transaction_id` (+ 배치 내 row offset)
//! - 파일: `mysql-bin.000003` 파일의 바이트 위치 (+ row offset, 하트비트)
//!
//! 저장 형식은 두 모드가 같은 스키마를 쓸 수 있도록 단순한 key-value 맵입니다.
//!
//! GTID 재시작 구간:
//! - resume: `S:1-(N+1)` : 트랜잭션 N은 끝났고 N+1부터 요청
//! - reopen: `S:1-N` : row offset이 있으면 트랜잭션 N을 다시 받아서
//!   이미 처리한 row를 버린다

use crate::error::{CdcError, Result};
use crate::gtid::Gtid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

/// 저장용 위치 맵
pub type PositionData = BTreeMap<String, Value>;

const KEY_GTID: &str = "gtid";
const KEY_OFFSET: &str = "offset";
const KEY_LOG_FILE: &str = "log_file";
const KEY_LOG_POS: &str = "log_pos";
const KEY_HB_SERIAL: &str = "hb_serial";
const KEY_HB_TIMESTAMP: &str = "hb_timestamp";

/// MySQL binlog은 4 바이트 매직 헤더 다음부터 이벤트가 시작된다
pub const BINLOG_START_POS: u64 = 4;

/// Binlog 파일 위치 (커넥션 커서)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogCursor {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub file: String,
    /// 바이트 위치
    pub pos: u64,
}

impl LogCursor {
    pub fn new(file: impl Into<String>, pos: u64) -> Self {
        LogCursor {
            file: file.into(),
            pos,
        }
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        file_sequence(&self.file)
    }
}

/// `mysql-bin.000123` -> 123
pub fn file_sequence(file: &str) -> Option<u64> {
    file.rsplit('.').next().and_then(|s| s.parse().ok())
}

impl PartialOrd for LogCursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogCursor {
    fn cmp(&self, other: &Self) -> Ordering {
        let by_file = match (self.file_sequence(), other.file_sequence()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.file.cmp(&other.file),
        };
        by_file.then(self.pos.cmp(&other.pos))
    }
}

impl fmt::Display for LogCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.pos)
    }
}

/// GTID 기반 위치
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GtidPosition {
    pub source_id: String,
    /// 이벤트가 속한 트랜잭션 번호
    pub transaction_id: u64,
    /// 현재 트랜잭션에서 이미 처리한 row 수
    pub row_offset: Option<u64>,
}

impl GtidPosition {
    pub fn new(gtid: &Gtid) -> Self {
        GtidPosition {
            source_id: gtid.source_id.clone(),
            transaction_id: gtid.transaction_id,
            row_offset: None,
        }
    }

    pub fn with_offset(mut self, row_offset: u64) -> Self {
        self.row_offset = Some(row_offset);
        self
    }

    pub fn gtid(&self) -> Gtid {
        Gtid::new(self.source_id.clone(), self.transaction_id)
    }

    /// 트랜잭션이 끝난 뒤 이어받을 구간: `S:1-(N+1)`
    pub fn resume_interval(&self) -> String {
        format!("{}:1-{}", self.source_id, self.transaction_id + 1)
    }

    /// 같은 트랜잭션을 다시 받을 구간: `S:1-N`
    pub fn reopen_interval(&self) -> String {
        format!("{}:1-{}", self.source_id, self.transaction_id)
    }
}

/// 파일/바이트 위치 기반 위치
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    pub log_file: String,
    pub log_pos: u64,
    /// `log_pos`에서 시작하는 배치에서 이미 처리한 row 수
    pub row_offset: Option<u64>,
    pub heartbeat_serial: Option<u64>,
    pub heartbeat_timestamp: Option<i64>,
}

impl LogPosition {
    pub fn new(log_file: impl Into<String>, log_pos: u64) -> Self {
        LogPosition {
            log_file: log_file.into(),
            log_pos,
            row_offset: None,
            heartbeat_serial: None,
            heartbeat_timestamp: None,
        }
    }

    pub fn with_offset(mut self, row_offset: u64) -> Self {
        self.row_offset = Some(row_offset);
        self
    }

    pub fn with_heartbeat(mut self, heartbeat: Option<HeartbeatMark>) -> Self {
        if let Some(mark) = heartbeat {
            self.heartbeat_serial = Some(mark.serial);
            self.heartbeat_timestamp = Some(mark.timestamp);
        }
        self
    }

    pub fn cursor(&self) -> LogCursor {
        LogCursor::new(self.log_file.clone(), self.log_pos)
    }
}

/// 가장 최근에 본 하트비트 row
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HeartbeatMark {
    /// 비교 순서: timestamp, serial
    pub timestamp: i64,
    pub serial: u64,
}

/// 복제 스트림의 재시작 지점
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
    Gtid(GtidPosition),
    Log(LogPosition),
}

/// 복제 연결을 다시 열 때 필요한 인자
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumeParameters {
    /// COM_BINLOG_DUMP_GTID
    Gtid { auto_position: String },
    /// COM_BINLOG_DUMP
    File { log_file: String, log_pos: u64 },
}

impl ResumeParameters {
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        match self {
            ResumeParameters::Gtid { auto_position } => {
                map.insert("auto_position".to_string(), auto_position.clone());
            }
            ResumeParameters::File { log_file, log_pos } => {
                map.insert(KEY_LOG_FILE.to_string(), log_file.clone());
                map.insert(KEY_LOG_POS.to_string(), log_pos.to_string());
            }
        }
        map
    }
}

impl Position {
    pub fn row_offset(&self) -> Option<u64> {
        match self {
            Position::Gtid(p) => p.row_offset,
            Position::Log(p) => p.row_offset,
        }
    }

    pub fn is_gtid(&self) -> bool {
        matches!(self, Position::Gtid(_))
    }

    pub fn to_persistable(&self) -> PositionData {
        let mut map = PositionData::new();
        match self {
            Position::Gtid(p) => {
                map.insert(KEY_GTID.to_string(), Value::from(p.gtid().to_string()));
                if let Some(offset) = p.row_offset {
                    map.insert(KEY_OFFSET.to_string(), Value::from(offset));
                }
            }
            Position::Log(p) => {
                map.insert(KEY_LOG_FILE.to_string(), Value::from(p.log_file.clone()));
                map.insert(KEY_LOG_POS.to_string(), Value::from(p.log_pos));
                if let Some(offset) = p.row_offset {
                    map.insert(KEY_OFFSET.to_string(), Value::from(offset));
                }
                if let Some(serial) = p.heartbeat_serial {
                    map.insert(KEY_HB_SERIAL.to_string(), Value::from(serial));
                }
                if let Some(ts) = p.heartbeat_timestamp {
                    map.insert(KEY_HB_TIMESTAMP.to_string(), Value::from(ts));
                }
            }
        }
        map
    }

    pub fn from_persisted(map: &PositionData) -> Result<Self> {
        let offset = optional_u64(map, KEY_OFFSET)?;

        if let Some(gtid) = map.get(KEY_GTID) {
            let gtid: Gtid = gtid
                .as_str()
                .ok_or_else(|| CdcError::InvalidPosition(format!("gtid is not a string: {}", gtid)))?
                .parse()
                .map_err(|e| CdcError::InvalidPosition(format!("{}", e)))?;
            let mut position = GtidPosition::new(&gtid);
            position.row_offset = offset;
            return Ok(Position::Gtid(position));
        }

        if let (Some(file), Some(pos)) = (map.get(KEY_LOG_FILE), map.get(KEY_LOG_POS)) {
            let log_file = file
                .as_str()
                .filter(|f| !f.is_empty())
                .ok_or_else(|| CdcError::InvalidPosition(format!("invalid log_file: {}", file)))?;
            let log_pos = pos
                .as_u64()
                .ok_or_else(|| CdcError::InvalidPosition(format!("invalid log_pos: {}", pos)))?;
            let heartbeat_timestamp = match map.get(KEY_HB_TIMESTAMP) {
                None => None,
                Some(v) => Some(v.as_i64().ok_or_else(|| {
                    CdcError::InvalidPosition(format!("invalid hb_timestamp: {}", v))
                })?),
            };

            return Ok(Position::Log(LogPosition {
                log_file: log_file.to_string(),
                log_pos,
                row_offset: offset,
                heartbeat_serial: optional_u64(map, KEY_HB_SERIAL)?,
                heartbeat_timestamp,
            }));
        }

        Err(CdcError::InvalidPosition(format!(
            "neither gtid nor log file position: {}",
            Value::Object(map.clone().into_iter().collect())
        )))
    }

    /// 복제 연결을 이 위치에서 다시 열기 위한 인자
    pub fn to_resume_parameters(&self) -> ResumeParameters {
        match self {
            Position::Gtid(p) => {
                let auto_position = if p.row_offset.is_some() {
                    p.reopen_interval()
                } else {
                    p.resume_interval()
                };
                ResumeParameters::Gtid { auto_position }
            }
            Position::Log(p) => ResumeParameters::File {
                log_file: p.log_file.clone(),
                log_pos: p.log_pos,
            },
        }
    }
}

fn optional_u64(map: &PositionData, key: &str) -> Result<Option<u64>> {
    match map.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| CdcError::InvalidPosition(format!("invalid {}: {}", key, v))),
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Position::Gtid(p) => match p.row_offset {
                Some(offset) => write!(f, "gtid {} (+{} rows)", p.gtid(), offset),
                None => write!(f, "gtid {}", p.gtid()),
            },
            Position::Log(p) => match p.row_offset {
                Some(offset) => write!(f, "{}:{} (+{} rows)", p.log_file, p.log_pos, offset),
                None => write!(f, "{}:{}", p.log_file, p.log_pos),
            },
        }
    }
}
