//! 하트비트 위치 검색
//!
//! 소스는 주기적으로 하트비트 테이블에 `(serial, timestamp)` row를 씁니다.
//! 특정 하트비트가 기록된 복제 위치를 찾기 위해 로그 파일 단위로 이진
//! 탐색을 한 뒤, 찾은 파일부터 선형으로 훑습니다.

use crate::config::ReplicationConfig;
use crate::error::Result;
use crate::events::{RowEvent, RowImage, StreamEvent};
use crate::position::{HeartbeatMark, LogCursor, LogPosition, Position, BINLOG_START_POS};
use crate::source::ReplicationConnector;
use crate::stream_reader::StreamReader;
use tracing::{debug, info};

/// 하트비트 row에서 `(serial, timestamp)`를 꺼낸다
///
/// 첫 컬럼이 serial, 두 번째 컬럼이 timestamp다.
pub fn heartbeat_mark(row: &RowImage) -> Option<HeartbeatMark> {
    let values = row.current()?;
    let serial = values.first()?.as_i64().and_then(|s| u64::try_from(s).ok())?;
    let timestamp = values.get(1)?.as_epoch_seconds()?;
    Some(HeartbeatMark { timestamp, serial })
}

pub struct HeartbeatLocator<'a> {
    connector: &'a dyn ReplicationConnector,
    config: &'a ReplicationConfig,
}

impl<'a> HeartbeatLocator<'a> {
    pub fn new(connector: &'a dyn ReplicationConnector, config: &'a ReplicationConfig) -> Self {
        HeartbeatLocator { connector, config }
    }

    /// `target` 하트비트 row의 위치. 로그 어디에도 없으면 `None`
    pub async fn locate(&self, target: HeartbeatMark) -> Result<Option<LogPosition>> {
        let files = self.connector.log_files().await?;
        if files.is_empty() {
            return Ok(None);
        }
        let end = self.connector.end_of_log().await?;

        let mut low = 0;
        let mut high = files.len() - 1;
        while low < high {
            let mid = (low + high + 1) / 2;
            match self.first_heartbeat_from(&files[mid], &end).await? {
                Some((mark, file)) if mark <= target => {
                    // 스트림은 파일 경계를 넘어 읽으므로 찾은 파일이 하한이 된다
                    let found = files.iter().position(|f| *f == file).unwrap_or(mid);
                    low = found.clamp(mid, high);
                }
                _ => high = mid - 1,
            }
        }

        debug!("Heartbeat {:?} is at or after {}", target, files[low]);
        let found = self.scan_for(&files[low], target, &end).await?;
        match &found {
            Some(position) => info!(
                "Located heartbeat serial={} at {}:{}",
                target.serial, position.log_file, position.log_pos
            ),
            None => info!("Heartbeat serial={} not found in the log", target.serial),
        }
        Ok(found)
    }

    async fn open_at(&self, file: &str) -> Result<StreamReader> {
        let position = Position::Log(LogPosition::new(file, BINLOG_START_POS));
        StreamReader::open(self.connector, &position, false).await
    }

    /// `file`부터 읽어서 처음 만나는 하트비트와 그 파일
    async fn first_heartbeat_from(
        &self,
        file: &str,
        end: &LogCursor,
    ) -> Result<Option<(HeartbeatMark, String)>> {
        let mut reader = self.open_at(file).await?;
        while let Some(row) = self.next_heartbeat(&mut reader, end).await? {
            if let Some(mark) = heartbeat_mark(&row.row) {
                return Ok(Some((mark, row.batch_start.file)));
            }
        }
        Ok(None)
    }

    async fn scan_for(
        &self,
        file: &str,
        target: HeartbeatMark,
        end: &LogCursor,
    ) -> Result<Option<LogPosition>> {
        let mut reader = self.open_at(file).await?;
        while let Some(row) = self.next_heartbeat(&mut reader, end).await? {
            let mark = match heartbeat_mark(&row.row) {
                Some(mark) => mark,
                None => continue,
            };
            if mark == target {
                return Ok(Some(
                    LogPosition::new(row.batch_start.file, row.batch_start.pos)
                        .with_offset(row.row_index as u64 + 1)
                        .with_heartbeat(Some(mark)),
                ));
            }
            if mark > target {
                return Ok(None);
            }
        }
        Ok(None)
    }

    /// 다음 하트비트 테이블 row. 로그 끝(`end`)에 닿으면 `None`
    async fn next_heartbeat(&self, reader: &mut StreamReader, end: &LogCursor) -> Result<Option<RowEvent>> {
        while !reader.is_caught_up(end) {
            match reader.pop().await? {
                Some(StreamEvent::Row(row))
                    if self.config.is_heartbeat_table(&row.database, &row.table) =>
                {
                    return Ok(Some(row))
                }
                Some(_) => continue,
                None => break,
            }
        }
        Ok(None)
    }
}
