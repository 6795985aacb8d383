//! 테이블 스키마 캐시
//!
//! 프로세스당 하나를 만들어 데이터 처리, 스키마 처리, 복구에 `&mut`로
//! 넘깁니다. 미러 트래커도 이 캐시가 소유합니다.

use crate::error::{CdcError, Result};
use crate::registry::{RegisteredSchema, SchemaRegistration, SchemaRegistry};
use crate::schema_tracker::SchemaTracker;
use crate::statement::TableName;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

pub struct SchemaCache {
    tracker: SchemaTracker,
    registry: Arc<dyn SchemaRegistry>,
    entries: HashMap<TableName, RegisteredSchema>,
}

impl SchemaCache {
    pub fn new(tracker: SchemaTracker, registry: Arc<dyn SchemaRegistry>) -> Self {
        SchemaCache {
            tracker,
            registry,
            entries: HashMap::new(),
        }
    }

    pub fn tracker_mut(&mut self) -> &mut SchemaTracker {
        &mut self.tracker
    }

    /// 캐시에 없으면 미러의 현재 정의로 등록한다. 미러에 없는 테이블은 에러
    pub async fn get(&mut self, table: &TableName) -> Result<RegisteredSchema> {
        if let Some(schema) = self.entries.get(table) {
            return Ok(schema.clone());
        }

        let create = self
            .tracker
            .describe_table(table)
            .await?
            .ok_or_else(|| CdcError::UnknownTable(table.to_string()))?;
        let schema = self
            .registry
            .register_or_fetch(&SchemaRegistration::current(&table.database, &table.table, create))
            .await?;

        debug!("Cached schema {} for {}", schema.schema_id, table);
        self.entries.insert(table.clone(), schema.clone());
        Ok(schema)
    }

    /// DDL 적용 후의 정의로 등록하고 캐시를 갱신한다
    ///
    /// 테이블이 더 이상 없으면 캐시에서 빼고 `None`.
    pub async fn register_after_ddl(
        &mut self,
        table: &TableName,
        before_create: Option<String>,
        ddl: &str,
    ) -> Result<Option<RegisteredSchema>> {
        let after_create = match self.tracker.describe_table(table).await? {
            Some(create) => create,
            None => {
                self.invalidate(table);
                return Ok(None);
            }
        };

        let schema = self
            .registry
            .register_or_fetch(&SchemaRegistration {
                database: table.database.clone(),
                table: table.table.clone(),
                before_create,
                after_create: Some(after_create),
                ddl: Some(ddl.to_string()),
            })
            .await?;
        self.entries.insert(table.clone(), schema.clone());
        Ok(Some(schema))
    }

    pub fn invalidate(&mut self, table: &TableName) {
        if self.entries.remove(table).is_some() {
            debug!("Invalidated cached schema for {}", table);
        }
    }

    pub fn invalidate_database(&mut self, database: &str) {
        self.entries.retain(|table, _| table.database != database);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
