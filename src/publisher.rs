//! 메시지 발행
//!
//! 발행 클라이언트 경계(`Publisher`)와 프로세스 안에서 동작하는 버퍼링
//! 구현입니다. 메시지는 `flush`에서 한꺼번에 내보내고, 토픽별 offset과
//! 마지막으로 발행된 위치를 기억합니다.

use crate::error::Result;
use crate::events::{CellValue, DataEvent, OperationType};
use crate::position::{Position, PositionData};
use crate::registry::RegisteredSchema;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::{debug, info};

/// 하위 시스템으로 보내는 변경 메시지
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub topic: String,
    pub schema_id: u64,
    pub kind: OperationType,
    pub key_fields: Vec<String>,
    pub payload: Value,
    /// UPDATE의 변경 전 값
    pub previous_payload: Option<Value>,
    pub position: PositionData,
    pub timestamp: u32,
    pub dry_run: bool,
}

impl Message {
    pub fn from_data_event(
        schema: &RegisteredSchema,
        event: &DataEvent,
        position: &Position,
        dry_run: bool,
    ) -> Self {
        let (payload, previous_payload) = match event.kind {
            OperationType::Insert => (event.row.after.as_deref(), None),
            OperationType::Update => (event.row.after.as_deref(), event.row.before.as_deref()),
            OperationType::Delete => (event.row.before.as_deref(), None),
        };

        Message {
            topic: schema.topic.clone(),
            schema_id: schema.schema_id,
            kind: event.kind,
            key_fields: schema.primary_keys.clone(),
            payload: payload.map(|values| row_object(&schema.columns, values)).unwrap_or(Value::Null),
            previous_payload: previous_payload.map(|values| row_object(&schema.columns, values)),
            position: position.to_persistable(),
            timestamp: event.timestamp,
            dry_run,
        }
    }
}

/// 컬럼 이름을 키로 하는 JSON 객체. 이름을 모르는 컬럼은 `col_<n>`
fn row_object(columns: &[String], values: &[CellValue]) -> Value {
    let mut object = Map::new();
    for (i, value) in values.iter().enumerate() {
        let name = columns.get(i).cloned().unwrap_or_else(|| format!("col_{}", i));
        object.insert(name, value.to_json());
    }
    Value::Object(object)
}

/// 체크포인트에 쓸 발행 상태
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CheckpointData {
    /// 마지막으로 발행이 확인된 메시지의 위치
    pub position: Option<PositionData>,
    /// 토픽별 발행된 메시지 수
    pub topic_offsets: HashMap<String, u64>,
}

#[async_trait]
pub trait Publisher: Send {
    async fn publish(&mut self, message: Message) -> Result<()>;

    /// 버퍼의 모든 메시지가 확인될 때까지 기다린다
    async fn flush(&mut self) -> Result<()>;

    /// `flush` 직후의 값이 체크포인트가 된다
    fn checkpoint_data(&self) -> CheckpointData;

    /// 복구용 재발행. 체크포인트 이후 이미 발행된 메시지는 건너뛴다
    async fn ensure_published(
        &mut self,
        messages: Vec<Message>,
        checkpoint_offsets: &HashMap<String, u64>,
    ) -> Result<()>;
}

/// 버퍼링 발행기가 메시지를 내보내는 곳
pub trait MessageSink: Send {
    fn write(&mut self, message: &Message) -> Result<()>;
}

/// JSON 로그 라인으로 내보낸다
#[derive(Debug, Default)]
pub struct LogSink;

impl MessageSink for LogSink {
    fn write(&mut self, message: &Message) -> Result<()> {
        info!(target: "mysql_cdc::publish", "{}", serde_json::to_string(message)?);
        Ok(())
    }
}

pub struct BufferedPublisher<S> {
    sink: S,
    buffer: Vec<Message>,
    offsets: HashMap<String, u64>,
    position: Option<PositionData>,
}

pub type LoggingPublisher = BufferedPublisher<LogSink>;

impl<S: MessageSink> BufferedPublisher<S> {
    /// `offsets`는 이미 발행된 토픽별 메시지 수
    pub fn new(sink: S, offsets: HashMap<String, u64>) -> Self {
        BufferedPublisher {
            sink,
            buffer: Vec::new(),
            offsets,
            position: None,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[async_trait]
impl<S: MessageSink> Publisher for BufferedPublisher<S> {
    async fn publish(&mut self, message: Message) -> Result<()> {
        self.buffer.push(message);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let messages = std::mem::take(&mut self.buffer);
        let count = messages.len();
        for message in messages {
            self.sink.write(&message)?;
            *self.offsets.entry(message.topic).or_insert(0) += 1;
            self.position = Some(message.position);
        }
        debug!("Flushed {} messages", count);
        Ok(())
    }

    fn checkpoint_data(&self) -> CheckpointData {
        CheckpointData {
            position: self.position.clone(),
            topic_offsets: self.offsets.clone(),
        }
    }

    async fn ensure_published(
        &mut self,
        messages: Vec<Message>,
        checkpoint_offsets: &HashMap<String, u64>,
    ) -> Result<()> {
        self.flush().await?;

        let mut already_published: HashMap<String, u64> = self
            .offsets
            .iter()
            .map(|(topic, current)| {
                let checkpoint = checkpoint_offsets.get(topic).copied().unwrap_or(0);
                (topic.clone(), current.saturating_sub(checkpoint))
            })
            .collect();

        let mut skipped = 0;
        for message in messages {
            match already_published.get_mut(&message.topic) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    skipped += 1;
                    self.position = Some(message.position);
                }
                _ => self.buffer.push(message),
            }
        }

        if skipped > 0 {
            info!("Skipped {} messages already published before the crash", skipped);
        }
        self.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RowImage;
    use crate::position::LogPosition;
    use crate::test_support::RecordingSink;

    fn schema(topic: &str) -> RegisteredSchema {
        RegisteredSchema {
            schema_id: 1,
            topic: topic.to_string(),
            primary_keys: vec!["id".to_string()],
            columns: vec!["id".to_string(), "name".to_string()],
        }
    }

    fn message(topic: &str, id: i64, pos: u64) -> Message {
        let event = DataEvent {
            database: "shop".to_string(),
            table: "orders".to_string(),
            kind: OperationType::Insert,
            row: RowImage::insert(vec![CellValue::Int64(id), CellValue::String("x".to_string())]),
            timestamp: 0,
        };
        let position = Position::Log(LogPosition::new("mysql-bin.000001", pos).with_offset(1));
        Message::from_data_event(&schema(topic), &event, &position, false)
    }

    #[test]
    fn test_message_payload() {
        let event = DataEvent {
            database: "shop".to_string(),
            table: "orders".to_string(),
            kind: OperationType::Update,
            row: RowImage::update(
                vec![CellValue::Int64(1), CellValue::String("old".to_string())],
                vec![CellValue::Int64(1), CellValue::String("new".to_string()), CellValue::Null],
            ),
            timestamp: 5,
        };
        let position = Position::Log(LogPosition::new("mysql-bin.000001", 4));
        let message = Message::from_data_event(&schema("t"), &event, &position, true);

        assert_eq!(message.payload["name"], "new");
        assert_eq!(message.payload["col_2"], Value::Null);
        assert_eq!(message.previous_payload.as_ref().unwrap()["name"], "old");
        assert_eq!(message.key_fields, vec!["id"]);
        assert!(message.dry_run);
    }

    #[tokio::test]
    async fn test_flush_tracks_offsets_and_position() {
        let sink = RecordingSink::default();
        let mut publisher = BufferedPublisher::new(sink.clone(), HashMap::new());

        publisher.publish(message("a", 1, 100)).await.unwrap();
        publisher.publish(message("a", 2, 200)).await.unwrap();
        assert!(sink.messages().is_empty());

        publisher.flush().await.unwrap();
        let data = publisher.checkpoint_data();
        assert_eq!(sink.messages().len(), 2);
        assert_eq!(data.topic_offsets.get("a"), Some(&2));
        assert_eq!(data.position, Some(message("a", 2, 200).position));
    }

    #[tokio::test]
    async fn test_ensure_published_skips_already_sent() {
        let sink = RecordingSink::default();
        // 하위 시스템에는 토픽 a가 5개, 체크포인트는 3개에서 멈췄다
        let offsets = HashMap::from([("a".to_string(), 5)]);
        let checkpoint = HashMap::from([("a".to_string(), 3)]);
        let mut publisher = BufferedPublisher::new(sink.clone(), offsets);

        let replay = vec![
            message("a", 4, 100),
            message("a", 5, 200),
            message("a", 6, 300),
            message("b", 1, 400),
        ];
        publisher.ensure_published(replay, &checkpoint).await.unwrap();

        let sent: Vec<String> = sink.messages().iter().map(|m| m.topic.clone()).collect();
        assert_eq!(sent, vec!["a", "b"]);
        assert_eq!(sink.messages()[0].payload["id"], 6);
        assert_eq!(publisher.checkpoint_data().topic_offsets.get("a"), Some(&6));
    }
}
