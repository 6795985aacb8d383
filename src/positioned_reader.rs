//! 위치 태깅 리더
//!
//! 저수준 리더가 펼친 이벤트마다 "이 이벤트까지 처리했다면 저장할 위치"를
//! 붙입니다. 트랜잭션 마커를 만나면 GTID 모드로 태깅하고, 마커가 없는
//! 소스에서는 파일/위치로 태깅합니다.

use crate::config::ReplicationConfig;
use crate::error::Result;
use crate::events::{
    DataEvent, PositionedEvent, QueryEvent, ReplicationEvent, RowEvent, SchemaEvent, StreamEvent,
};
use crate::gtid::Gtid;
use crate::heartbeat::heartbeat_mark;
use crate::position::{GtidPosition, HeartbeatMark, LogCursor, LogPosition, Position};
use crate::source::ReplicationConnector;
use crate::stream_reader::StreamReader;
use tracing::trace;

pub struct PositionedReader {
    reader: StreamReader,
    current_gtid: Option<Gtid>,
    /// 현재 트랜잭션에서 내보낸 row 수
    rows_in_transaction: u64,
    heartbeat: Option<HeartbeatMark>,
    heartbeat_database: String,
    heartbeat_table: String,
    peeked: Option<PositionedEvent>,
    /// `next`로 마지막에 내보낸 이벤트의 위치
    last_position: Option<Position>,
}

impl PositionedReader {
    pub async fn open(
        connector: &dyn ReplicationConnector,
        position: &Position,
        blocking: bool,
        config: &ReplicationConfig,
    ) -> Result<Self> {
        let reader = StreamReader::open(connector, position, blocking).await?;
        Ok(Self::new(reader, position, config))
    }

    /// 이미 `position`으로 열린 저수준 리더를 감싼다
    pub fn new(reader: StreamReader, position: &Position, config: &ReplicationConfig) -> Self {
        let (current_gtid, rows_in_transaction, heartbeat) = match position {
            Position::Gtid(p) => (Some(p.gtid()), p.row_offset.unwrap_or(0), None),
            Position::Log(p) => {
                let heartbeat = match (p.heartbeat_serial, p.heartbeat_timestamp) {
                    (Some(serial), Some(timestamp)) => Some(HeartbeatMark { timestamp, serial }),
                    _ => None,
                };
                (None, 0, heartbeat)
            }
        };

        PositionedReader {
            reader,
            current_gtid,
            rows_in_transaction,
            heartbeat,
            heartbeat_database: config.heartbeat_database.clone(),
            heartbeat_table: config.heartbeat_table.clone(),
            peeked: None,
            last_position: None,
        }
    }

    pub async fn peek(&mut self) -> Result<Option<&PositionedEvent>> {
        if self.peeked.is_none() {
            self.peeked = self.read().await?;
        }
        Ok(self.peeked.as_ref())
    }

    pub async fn next(&mut self) -> Result<Option<PositionedEvent>> {
        let event = match self.peeked.take() {
            Some(event) => Some(event),
            None => self.read().await?,
        };
        if let Some(event) = &event {
            self.last_position = Some(event.position.clone());
        }
        Ok(event)
    }

    pub fn last_position(&self) -> Option<&Position> {
        self.last_position.as_ref()
    }

    async fn read(&mut self) -> Result<Option<PositionedEvent>> {
        loop {
            let event = match self.reader.pop().await? {
                Some(event) => event,
                None => return Ok(None),
            };

            let positioned = match event {
                StreamEvent::TransactionMarker { gtid, .. } => {
                    trace!("Transaction {}", gtid);
                    self.current_gtid = Some(gtid);
                    self.rows_in_transaction = 0;
                    continue;
                }
                StreamEvent::Query(query) => self.tag_query(query),
                StreamEvent::Row(row) => self.tag_row(row),
            };
            return Ok(Some(positioned));
        }
    }

    fn tag_query(&mut self, query: QueryEvent) -> PositionedEvent {
        let begin = query.is_begin();
        let position = match &self.current_gtid {
            Some(gtid) => {
                let position = GtidPosition::new(gtid);
                Position::Gtid(if begin { position.with_offset(0) } else { position })
            }
            None if begin => Position::Log(
                LogPosition::new(query.start.file.clone(), query.start.pos)
                    .with_offset(0)
                    .with_heartbeat(self.heartbeat),
            ),
            None => Position::Log(
                LogPosition::new(query.end.file.clone(), query.end.pos).with_heartbeat(self.heartbeat),
            ),
        };

        PositionedEvent {
            event: ReplicationEvent::Schema(SchemaEvent {
                database: query.database,
                statement: query.statement,
                timestamp: query.timestamp,
            }),
            position,
        }
    }

    fn tag_row(&mut self, row: RowEvent) -> PositionedEvent {
        if row.database == self.heartbeat_database && row.table == self.heartbeat_table {
            if let Some(mark) = heartbeat_mark(&row.row) {
                self.heartbeat = Some(mark);
            }
        }

        self.rows_in_transaction += 1;
        let position = match &self.current_gtid {
            Some(gtid) => Position::Gtid(GtidPosition::new(gtid).with_offset(self.rows_in_transaction)),
            None => Position::Log(
                LogPosition::new(row.batch_start.file.clone(), row.batch_start.pos)
                    .with_offset(row.row_index as u64 + 1)
                    .with_heartbeat(self.heartbeat),
            ),
        };

        PositionedEvent {
            event: ReplicationEvent::Data(DataEvent {
                database: row.database,
                table: row.table,
                kind: row.kind,
                row: row.row,
                timestamp: row.timestamp,
            }),
            position,
        }
    }

    pub fn cursor(&self) -> LogCursor {
        self.reader.cursor()
    }

    pub fn is_caught_up(&self, end: &LogCursor) -> bool {
        self.peeked.is_none() && self.reader.is_caught_up(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OperationType;
    use crate::test_support::{heartbeat_row, int_row, FakeBinlog, SOURCE_UUID};

    fn config() -> ReplicationConfig {
        ReplicationConfig::default()
    }

    #[tokio::test]
    async fn test_gtid_tagging() {
        let binlog = FakeBinlog::builder()
            .file("mysql-bin.000001")
            .gtid(SOURCE_UUID, 3)
            .query("shop", "BEGIN")
            .rows("shop", "orders", OperationType::Insert, vec![int_row(1), int_row(2)])
            .query("shop", "COMMIT")
            .gtid(SOURCE_UUID, 4)
            .query("shop", "ALTER TABLE orders ADD COLUMN note TEXT")
            .build();

        let start = Position::Log(LogPosition::new("mysql-bin.000001", 4));
        let mut reader = PositionedReader::open(&binlog, &start, false, &config()).await.unwrap();

        let mut positions = Vec::new();
        while let Some(event) = reader.next().await.unwrap() {
            positions.push(event.position);
        }

        let txn3 = GtidPosition::new(&Gtid::new(SOURCE_UUID, 3));
        let txn4 = GtidPosition::new(&Gtid::new(SOURCE_UUID, 4));
        assert_eq!(
            positions,
            vec![
                Position::Gtid(txn3.clone().with_offset(0)),
                Position::Gtid(txn3.clone().with_offset(1)),
                Position::Gtid(txn3.clone().with_offset(2)),
                Position::Gtid(txn3),
                Position::Gtid(txn4),
            ]
        );
    }

    #[tokio::test]
    async fn test_last_position_follows_next_not_peek() {
        let binlog = FakeBinlog::builder()
            .file("mysql-bin.000001")
            .gtid(SOURCE_UUID, 7)
            .query("shop", "DROP TABLE orders")
            .build();
        let start = Position::Log(LogPosition::new("mysql-bin.000001", 4));
        let mut reader = PositionedReader::open(&binlog, &start, false, &config()).await.unwrap();

        assert!(reader.peek().await.unwrap().is_some());
        assert_eq!(reader.last_position(), None);

        let ddl = reader.next().await.unwrap().unwrap();
        assert_eq!(reader.last_position(), Some(&ddl.position));
        assert!(reader.next().await.unwrap().is_none());
        assert_eq!(reader.last_position(), Some(&ddl.position));
    }

    #[tokio::test]
    async fn test_file_tagging_without_markers() {
        let binlog = FakeBinlog::builder()
            .file("mysql-bin.000001")
            .rows("shop", "orders", OperationType::Insert, vec![int_row(1), int_row(2)])
            .query("shop", "DROP TABLE orders")
            .build();
        let batch_start = binlog.batch_starts()[0].clone();

        let start = Position::Log(LogPosition::new("mysql-bin.000001", 4));
        let mut reader = PositionedReader::open(&binlog, &start, false, &config()).await.unwrap();

        let first = reader.next().await.unwrap().unwrap();
        assert_eq!(
            first.position,
            Position::Log(LogPosition::new(batch_start.file.clone(), batch_start.pos).with_offset(1))
        );
        let second = reader.next().await.unwrap().unwrap();
        assert_eq!(second.position.row_offset(), Some(2));

        let ddl = reader.next().await.unwrap().unwrap();
        match ddl.position {
            Position::Log(p) => {
                assert_eq!(p.row_offset, None);
                assert_eq!(p.cursor(), binlog.end_cursor());
            }
            other => panic!("expected file position, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_heartbeat_marks_later_positions() {
        let config = config();
        let binlog = FakeBinlog::builder()
            .file("mysql-bin.000001")
            .rows(
                &config.heartbeat_database,
                &config.heartbeat_table,
                OperationType::Update,
                vec![heartbeat_row(9, 1_700_000_000)],
            )
            .rows("shop", "orders", OperationType::Insert, vec![int_row(1)])
            .build();

        let start = Position::Log(LogPosition::new("mysql-bin.000001", 4));
        let mut reader = PositionedReader::open(&binlog, &start, false, &config).await.unwrap();

        reader.next().await.unwrap().unwrap();
        let data = reader.next().await.unwrap().unwrap();
        match data.position {
            Position::Log(p) => {
                assert_eq!(p.heartbeat_serial, Some(9));
                assert_eq!(p.heartbeat_timestamp, Some(1_700_000_000));
            }
            other => panic!("expected file position, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_peek_then_next() {
        let binlog = FakeBinlog::builder()
            .file("mysql-bin.000001")
            .query("shop", "CREATE TABLE t (id INT)")
            .build();
        let start = Position::Log(LogPosition::new("mysql-bin.000001", 4));
        let mut reader = PositionedReader::open(&binlog, &start, false, &config()).await.unwrap();

        assert!(!reader.peek().await.unwrap().unwrap().event.is_data());
        assert!(!reader.is_caught_up(&binlog.end_cursor()));
        assert!(reader.next().await.unwrap().is_some());
        assert!(reader.next().await.unwrap().is_none());
    }
}
