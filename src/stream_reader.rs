//! 저수준 스트림 리더
//!
//! 복제 소스에서 이벤트를 하나씩 읽어 FIFO에 쌓고, row 배치 이벤트는
//! row 하나당 이벤트 하나로 펼칩니다. `peek`은 소비하지 않고, `pop`은
//! 소비합니다. 둘 다 FIFO가 비어 있으면 소스에서 채웁니다.

use crate::error::{CdcError, Result};
use crate::events::{QueryEvent, RowEvent, SourceEvent, StreamEvent};
use crate::position::{LogCursor, Position};
use crate::source::{ReplicationConnector, ReplicationSource};
use std::collections::VecDeque;
use tracing::debug;

pub struct StreamReader {
    source: Box<dyn ReplicationSource>,
    buffer: VecDeque<StreamEvent>,
    /// 마지막 row 배치의 시작 위치와 다음 row 번호
    ///
    /// 한 테이블 맵 묶음 뒤에 rows 이벤트가 여러 개 오면 row 번호를 이어서 센다.
    last_batch: Option<(LogCursor, usize)>,
    end_of_stream: bool,
}

impl StreamReader {
    pub fn new(source: Box<dyn ReplicationSource>) -> Self {
        StreamReader {
            source,
            buffer: VecDeque::new(),
            last_batch: None,
            end_of_stream: false,
        }
    }

    /// `position`에서 스트림을 열고, row offset이 있으면 이미 처리한 row를 건너뛴다
    pub async fn open(
        connector: &dyn ReplicationConnector,
        position: &Position,
        blocking: bool,
    ) -> Result<Self> {
        let params = position.to_resume_parameters();
        let source = connector.open(&params, blocking).await?;
        let mut reader = StreamReader::new(source);

        if let Some(row_offset) = position.row_offset() {
            reader.seek(row_offset, !position.is_gtid()).await?;
        }
        Ok(reader)
    }

    /// 다음 이벤트를 소비하지 않고 본다
    pub async fn peek(&mut self) -> Result<Option<&StreamEvent>> {
        if self.buffer.is_empty() {
            self.refill().await?;
        }
        Ok(self.buffer.front())
    }

    pub async fn pop(&mut self) -> Result<Option<StreamEvent>> {
        if self.buffer.is_empty() {
            self.refill().await?;
        }
        Ok(self.buffer.pop_front())
    }

    /// 소스 이벤트 하나를 읽어 FIFO에 넣는다. 이미 끝난 스트림이면 아무것도 하지 않는다
    async fn refill(&mut self) -> Result<()> {
        while self.buffer.is_empty() && !self.end_of_stream {
            match self.source.next_event().await? {
                Some(event) => self.push_source_event(event),
                None => self.end_of_stream = true,
            }
        }
        Ok(())
    }

    fn push_source_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Gtid { gtid, cursor } => {
                self.buffer.push_back(StreamEvent::TransactionMarker { gtid, cursor });
            }
            SourceEvent::Query {
                database,
                statement,
                timestamp,
                start,
                end,
            } => {
                self.buffer.push_back(StreamEvent::Query(QueryEvent {
                    database,
                    statement,
                    timestamp,
                    start,
                    end,
                }));
            }
            SourceEvent::Rows {
                database,
                table,
                kind,
                rows,
                timestamp,
                batch_start,
                ..
            } => {
                let first_index = match &self.last_batch {
                    Some((start, next)) if *start == batch_start => *next,
                    _ => 0,
                };
                let count = rows.len();

                for (i, row) in rows.into_iter().enumerate() {
                    self.buffer.push_back(StreamEvent::Row(RowEvent {
                        database: database.clone(),
                        table: table.clone(),
                        kind,
                        row,
                        row_index: first_index + i,
                        batch_start: batch_start.clone(),
                        timestamp,
                    }));
                }
                self.last_batch = Some((batch_start, first_index + count));
            }
        }
    }

    /// 트랜잭션 마커와 쿼리 마커를 하나씩 건너뛴 뒤 row를 정확히 `row_offset`개 버린다
    ///
    /// `same_batch`이면 건너뛰는 row가 모두 한 배치에 있어야 한다.
    pub async fn seek(&mut self, row_offset: u64, same_batch: bool) -> Result<()> {
        if matches!(self.peek().await?, Some(StreamEvent::TransactionMarker { .. })) {
            self.pop().await?;
        }
        if matches!(self.peek().await?, Some(StreamEvent::Query(_))) {
            self.pop().await?;
        }

        let mut batch: Option<LogCursor> = None;
        for skipped in 0..row_offset {
            let row = match self.pop().await? {
                Some(StreamEvent::Row(row)) => row,
                other => {
                    return Err(CdcError::InvalidPosition(format!(
                        "row offset {} exceeds the rows available: stopped after {} rows at {}",
                        row_offset,
                        skipped,
                        describe(other.as_ref())
                    )))
                }
            };

            if same_batch {
                match &batch {
                    None => batch = Some(row.batch_start.clone()),
                    Some(start) if *start != row.batch_start => {
                        return Err(CdcError::InvalidPosition(format!(
                            "row offset {} exceeds the rows of batch {}: stopped after {} rows",
                            row_offset, start, skipped
                        )))
                    }
                    Some(_) => {}
                }
            }
        }

        if row_offset > 0 {
            debug!("Skipped {} already processed rows", row_offset);
        }
        Ok(())
    }

    /// 다음으로 읽을 소스 위치
    pub fn cursor(&self) -> LogCursor {
        self.source.cursor()
    }

    /// 버퍼가 비었고 소스 커서가 `end` 이상이면 따라잡은 것
    pub fn is_caught_up(&self, end: &LogCursor) -> bool {
        self.buffer.is_empty() && (self.end_of_stream || self.source.cursor() >= *end)
    }
}

fn describe(event: Option<&StreamEvent>) -> String {
    match event {
        None => "end of stream".to_string(),
        Some(StreamEvent::TransactionMarker { gtid, .. }) => format!("transaction marker {}", gtid),
        Some(StreamEvent::Query(query)) => format!("query at {}", query.start),
        Some(StreamEvent::Row(row)) => format!("row of batch {}", row.batch_start),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OperationType;
    use crate::position::{GtidPosition, LogPosition};
    use crate::test_support::{int_row, FakeBinlog, SOURCE_UUID};

    fn three_row_binlog() -> FakeBinlog {
        FakeBinlog::builder()
            .file("mysql-bin.000001")
            .gtid(SOURCE_UUID, 7)
            .query("shop", "BEGIN")
            .rows("shop", "orders", OperationType::Insert, vec![int_row(10), int_row(11), int_row(12)])
            .query("shop", "COMMIT")
            .build()
    }

    #[tokio::test]
    async fn test_rows_are_flattened() {
        let binlog = three_row_binlog();
        let position = Position::Log(LogPosition::new("mysql-bin.000001", 4));
        let mut reader = StreamReader::open(&binlog, &position, false).await.unwrap();

        assert!(reader.pop().await.unwrap().unwrap().is_transaction_marker());
        assert!(reader.pop().await.unwrap().unwrap().is_query());
        for expected in 0..3 {
            match reader.pop().await.unwrap() {
                Some(StreamEvent::Row(row)) => assert_eq!(row.row_index, expected),
                other => panic!("expected row, got {:?}", other),
            }
        }
        assert!(reader.pop().await.unwrap().unwrap().is_query());
        assert!(reader.pop().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_peek_does_not_consume() {
        let binlog = three_row_binlog();
        let position = Position::Log(LogPosition::new("mysql-bin.000001", 4));
        let mut reader = StreamReader::open(&binlog, &position, false).await.unwrap();

        assert!(reader.peek().await.unwrap().unwrap().is_transaction_marker());
        assert!(reader.peek().await.unwrap().unwrap().is_transaction_marker());
        assert!(reader.pop().await.unwrap().unwrap().is_transaction_marker());
    }

    #[tokio::test]
    async fn test_resume_with_row_offset() {
        let binlog = three_row_binlog();
        let gtid = crate::gtid::Gtid::new(SOURCE_UUID, 7);
        let position = Position::Gtid(GtidPosition::new(&gtid).with_offset(2));
        let mut reader = StreamReader::open(&binlog, &position, false).await.unwrap();

        // 마커와 BEGIN은 조용히 소비된다
        match reader.pop().await.unwrap() {
            Some(StreamEvent::Row(row)) => {
                assert_eq!(row.row_index, 2);
                assert_eq!(row.row.after.as_ref().unwrap()[0].as_i64(), Some(12));
            }
            other => panic!("expected row, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_file_mode_resume_inside_batch() {
        let binlog = three_row_binlog();
        let batch_start = binlog.batch_starts()[0].clone();
        let position = Position::Log(LogPosition::new(batch_start.file, batch_start.pos).with_offset(1));
        let mut reader = StreamReader::open(&binlog, &position, false).await.unwrap();

        match reader.pop().await.unwrap() {
            Some(StreamEvent::Row(row)) => assert_eq!(row.row_index, 1),
            other => panic!("expected row, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offset_beyond_batch_is_fatal() {
        let binlog = three_row_binlog();
        let gtid = crate::gtid::Gtid::new(SOURCE_UUID, 7);
        let position = Position::Gtid(GtidPosition::new(&gtid).with_offset(4));
        let err = StreamReader::open(&binlog, &position, false).await.err().unwrap();
        assert!(matches!(err, CdcError::InvalidPosition(_)));
    }

    #[tokio::test]
    async fn test_caught_up() {
        let binlog = three_row_binlog();
        let end = binlog.end_cursor();
        let position = Position::Log(LogPosition::new("mysql-bin.000001", 4));
        let mut reader = StreamReader::open(&binlog, &position, false).await.unwrap();

        assert!(!reader.is_caught_up(&end));
        while reader.pop().await.unwrap().is_some() {}
        assert!(reader.is_caught_up(&end));
    }
}
